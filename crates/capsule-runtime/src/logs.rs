//! Container log access.
//!
//! Detached containers write stdout and stderr to `container.log` next to
//! their record; this module only reads it back.

use std::io::{BufRead, BufReader};
use std::path::Path;

use capsule_common::error::{CapsuleError, Result};

/// Reads a container log.
///
/// Returns an empty string if the log file does not exist yet.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_logs(path: &Path) -> Result<String> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(CapsuleError::io(path, e)),
    }
}

/// Returns the last `lines` lines of a container log.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn tail_logs(path: &Path, lines: usize) -> Result<String> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(CapsuleError::io(path, e)),
    };
    let mut window = std::collections::VecDeque::with_capacity(lines);
    for line in BufReader::new(file).split(b'\n') {
        let line = line.map_err(|e| CapsuleError::io(path, e))?;
        if lines == 0 {
            continue;
        }
        if window.len() == lines {
            let _ = window.pop_front();
        }
        window.push_back(String::from_utf8_lossy(&line).into_owned());
    }
    let mut out = window.into_iter().collect::<Vec<_>>().join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let content = read_logs(&dir.path().join("container.log")).expect("read");
        assert!(content.is_empty());
        assert!(tail_logs(&dir.path().join("container.log"), 5).expect("tail").is_empty());
    }

    #[test]
    fn read_returns_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("container.log");
        std::fs::write(&path, "line one\nline two\n").expect("write");
        assert_eq!(read_logs(&path).expect("read"), "line one\nline two\n");
    }

    #[test]
    fn tail_keeps_last_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("container.log");
        std::fs::write(&path, "a\nb\nc\nd\n").expect("write");
        assert_eq!(tail_logs(&path, 2).expect("tail"), "c\nd\n");
        assert_eq!(tail_logs(&path, 10).expect("tail"), "a\nb\nc\nd\n");
        assert!(tail_logs(&path, 0).expect("tail").is_empty());
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("container.log");
        std::fs::write(&path, [b'o', b'k', 0xff, b'\n']).expect("write");
        assert!(read_logs(&path).expect("read").starts_with("ok"));
    }
}
