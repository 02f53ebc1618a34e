//! JSON file persistence with advisory locking.
//!
//! Records are small JSON documents rewritten in full. A sibling lock file
//! (`.<name>.lock`) serialises read-modify-write sections between
//! concurrent CLI invocations.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CapsuleError, Result};

/// Exclusive advisory lock held for the lifetime of the guard.
#[derive(Debug)]
pub struct StoreLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl StoreLock {
    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Returns the lock file guarding `path`.
#[must_use]
pub fn lock_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "store".into(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.lock"))
}

/// Takes an exclusive lock on the record at `path`, blocking until granted.
///
/// # Errors
///
/// Returns an error if the lock file cannot be created or locked.
pub fn lock_exclusive(path: &Path) -> Result<StoreLock> {
    let lock = lock_path(path);
    ensure_parent(&lock)?;
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock)
        .map_err(|e| CapsuleError::io(&lock, e))?;
    let guard = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
        CapsuleError::io(&lock, std::io::Error::from_raw_os_error(errno as i32))
    })?;
    tracing::trace!(path = %lock.display(), "store lock acquired");
    Ok(StoreLock {
        _lock: guard,
        path: lock,
    })
}

/// Reads a JSON document, returning `None` if the file does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CapsuleError::io(path, e)),
    }
}

/// Writes a JSON document, creating parent directories as needed.
///
/// The document is written to a temporary sibling and renamed into place
/// so readers never observe a truncated file.
///
/// # Errors
///
/// Returns an error if serialization, the write, or the rename fails.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp",
        path.file_name()
            .map_or_else(|| "store".into(), |n| n.to_string_lossy().into_owned())
    ));
    {
        let mut file = File::create(&tmp).map_err(|e| CapsuleError::io(&tmp, e))?;
        file.write_all(&bytes).map_err(|e| CapsuleError::io(&tmp, e))?;
        file.sync_all().map_err(|e| CapsuleError::io(&tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| CapsuleError::io(path, e))?;
    Ok(())
}

/// Creates the parent directory of `path` if it is missing.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CapsuleError::io(parent, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn lock_path_is_hidden_sibling() {
        let p = lock_path(Path::new("/a/b/subnet.json"));
        assert_eq!(p, Path::new("/a/b/.subnet.json.lock"));
    }

    #[test]
    fn read_missing_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let value: Option<BTreeMap<String, u32>> =
            read_json(&dir.path().join("missing.json")).expect("read");
        assert!(value.is_none());
    }

    #[test]
    fn write_creates_parents_and_reads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("deep/nested/doc.json");
        let mut doc = BTreeMap::new();
        let _ = doc.insert("a".to_string(), 1_u32);
        write_json(&path, &doc).expect("write");

        let back: BTreeMap<String, u32> = read_json(&path).expect("read").expect("present");
        assert_eq!(back, doc);
    }

    #[test]
    fn lock_can_be_reacquired_after_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("doc.json");
        {
            let guard = lock_exclusive(&path).expect("first lock");
            assert!(guard.path().exists());
        }
        let _guard = lock_exclusive(&path).expect("second lock");
    }

    #[test]
    fn malformed_document_is_serialization_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{not json").expect("write");
        let err = read_json::<BTreeMap<String, u32>>(&path).expect_err("must fail");
        assert!(matches!(err, CapsuleError::Serialization { .. }));
    }
}
