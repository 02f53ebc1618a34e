//! Container root filesystems.
//!
//! The engine only needs a directory to use as the container root and a
//! way to dispose of it again; [`WorkspaceProvider`] is that seam.
//! [`OverlayWorkspace`] stacks a per-container writable layer on an image
//! extracted once from `<root>/images/<image>.tar` (or `.tar.gz`).

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use capsule_common::error::{CapsuleError, Result};
use capsule_core::filesystem::mount::{bind_mount, unmount};
use capsule_core::filesystem::overlayfs::{OverlayConfig, mount_overlay, unmount_overlay};

/// A `host:container` bind mount request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Directory on the host.
    pub host: PathBuf,
    /// Mount point inside the container, relative to its root.
    pub container: PathBuf,
}

impl VolumeSpec {
    /// Parses `host:container`. Returns `None` (with a warning) for an
    /// empty or malformed spec.
    #[must_use]
    pub fn parse(spec: &str) -> Option<Self> {
        if spec.is_empty() {
            return None;
        }
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [host, container] if !host.is_empty() && !container.is_empty() => Some(Self {
                host: PathBuf::from(host),
                container: PathBuf::from(container.trim_start_matches('/')),
            }),
            _ => {
                tracing::warn!(volume = %spec, "ignoring malformed volume spec");
                None
            }
        }
    }
}

impl fmt::Display for VolumeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:/{}", self.host.display(), self.container.display())
    }
}

/// Prepares and disposes of container root filesystems.
pub trait WorkspaceProvider: fmt::Debug {
    /// Builds the root for container `name` from `image` and returns it.
    ///
    /// # Errors
    ///
    /// Returns an error if the image is missing or any mount fails.
    fn create(&self, name: &str, image: &str, volume: Option<&VolumeSpec>) -> Result<PathBuf>;

    /// Unmounts and deletes everything [`Self::create`] made for `name`.
    /// Safe to call for a partially created workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be removed.
    fn remove(&self, name: &str, volume: Option<&VolumeSpec>) -> Result<()>;
}

/// `OverlayFS` workspaces under one root directory.
#[derive(Debug, Clone)]
pub struct OverlayWorkspace {
    root: PathBuf,
}

impl OverlayWorkspace {
    /// Creates a provider rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding image archives and their extracted trees.
    #[must_use]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Merged mount point of container `name`.
    #[must_use]
    pub fn mount_point(&self, name: &str) -> PathBuf {
        self.root.join("mnt").join(name)
    }

    /// Writable layer of container `name`.
    #[must_use]
    pub fn write_layer(&self, name: &str) -> PathBuf {
        self.root.join("writeLayer").join(name)
    }

    /// Overlay work directory of container `name`.
    #[must_use]
    pub fn work_dir(&self, name: &str) -> PathBuf {
        self.root.join("work").join(name)
    }

    /// Returns the read-only image tree, extracting the archive on first use.
    ///
    /// Extraction goes to a scratch directory that is renamed into place,
    /// so an interrupted extraction is never mistaken for a complete one.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::NotFound`] if no archive exists for `image`,
    /// or an I/O error if extraction fails.
    pub fn read_only_layer(&self, image: &str) -> Result<PathBuf> {
        if image.is_empty() || image.contains('/') || image.starts_with('.') {
            return Err(CapsuleError::Config {
                message: format!("invalid image name {image:?}"),
            });
        }
        let images = self.images_dir();
        let tree = images.join(image);
        if tree.is_dir() {
            return Ok(tree);
        }

        let archive = [format!("{image}.tar"), format!("{image}.tar.gz"), format!("{image}.tgz")]
            .into_iter()
            .map(|file| images.join(file))
            .find(|p| p.is_file())
            .ok_or_else(|| CapsuleError::NotFound {
                kind: "image",
                id: image.to_string(),
            })?;

        let scratch = images.join(format!(".{image}.extract"));
        if scratch.exists() {
            std::fs::remove_dir_all(&scratch).map_err(|e| CapsuleError::io(&scratch, e))?;
        }
        extract_archive(&archive, &scratch)?;
        std::fs::rename(&scratch, &tree).map_err(|e| CapsuleError::io(&tree, e))?;
        tracing::info!(image, archive = %archive.display(), "image extracted");
        Ok(tree)
    }
}

impl WorkspaceProvider for OverlayWorkspace {
    fn create(&self, name: &str, image: &str, volume: Option<&VolumeSpec>) -> Result<PathBuf> {
        let lower = self.read_only_layer(image)?;
        let merged = self.mount_point(name);
        let config = OverlayConfig {
            lower_dirs: vec![lower],
            upper_dir: self.write_layer(name),
            work_dir: self.work_dir(name),
            merged_dir: merged.clone(),
        };
        mount_overlay(&config)?;

        if let Some(volume) = volume {
            let target = merged.join(&volume.container);
            if let Err(e) = bind_mount(&volume.host, &target) {
                let _ = self.remove(name, None);
                return Err(e);
            }
            tracing::info!(container = %name, volume = %volume, "volume mounted");
        }
        tracing::info!(container = %name, root = %merged.display(), "workspace ready");
        Ok(merged)
    }

    fn remove(&self, name: &str, volume: Option<&VolumeSpec>) -> Result<()> {
        let merged = self.mount_point(name);
        let mut still_mounted = false;
        if let Some(volume) = volume {
            let target = merged.join(&volume.container);
            if target.exists() {
                if let Err(e) = unmount(&target) {
                    tracing::warn!(container = %name, error = %e, "volume unmount failed");
                    still_mounted = true;
                }
            }
        }
        if merged.exists() {
            if let Err(e) = unmount_overlay(&merged) {
                tracing::warn!(container = %name, error = %e, "overlay unmount failed");
                still_mounted = true;
            }
        }
        // Deleting through a live mount would reach the host volume or image.
        if still_mounted {
            return Err(CapsuleError::InvalidState {
                message: format!(
                    "workspace of {name} is still mounted at {}; left in place",
                    merged.display()
                ),
            });
        }
        for dir in [merged, self.write_layer(name), self.work_dir(name)] {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CapsuleError::io(&dir, e)),
            }
        }
        tracing::info!(container = %name, "workspace removed");
        Ok(())
    }
}

/// Unpacks a plain or gzip-compressed tar archive into `target`.
///
/// # Errors
///
/// Returns an I/O error if the archive cannot be opened or unpacked.
pub fn extract_archive(archive: &Path, target: &Path) -> Result<()> {
    std::fs::create_dir_all(target).map_err(|e| CapsuleError::io(target, e))?;
    let file = File::open(archive).map_err(|e| CapsuleError::io(archive, e))?;
    let unpacked = if is_gzip(archive) {
        tar::Archive::new(flate2::read::GzDecoder::new(file)).unpack(target)
    } else {
        tar::Archive::new(file).unpack(target)
    };
    unpacked.map_err(|e| CapsuleError::io(target, e))
}

fn is_gzip(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("tgz"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_image(images: &Path, name: &str) {
        std::fs::create_dir_all(images).expect("mkdir");
        let file = File::create(images.join(format!("{name}.tar"))).expect("create");
        let mut builder = tar::Builder::new(file);
        let data = b"#!/bin/sh\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "bin/init.sh", &data[..])
            .expect("append");
        builder.finish().expect("finish");
    }

    #[test]
    fn volume_spec_parses() {
        let spec = VolumeSpec::parse("/srv/data:/data").expect("spec");
        assert_eq!(spec.host, Path::new("/srv/data"));
        assert_eq!(spec.container, Path::new("data"));
        assert_eq!(spec.to_string(), "/srv/data:/data");
    }

    #[test]
    fn malformed_volume_specs_are_skipped() {
        for bad in ["", "/only", ":/data", "/a:", "/a:/b:/c"] {
            assert_eq!(VolumeSpec::parse(bad), None, "{bad:?}");
        }
    }

    #[test]
    fn image_is_extracted_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = OverlayWorkspace::new(dir.path());
        write_image(&ws.images_dir(), "busybox");

        let tree = ws.read_only_layer("busybox").expect("extract");
        assert_eq!(tree, dir.path().join("images/busybox"));
        assert!(tree.join("bin/init.sh").is_file());

        std::fs::remove_file(ws.images_dir().join("busybox.tar")).expect("rm");
        assert_eq!(ws.read_only_layer("busybox").expect("cached"), tree);
        assert!(!ws.images_dir().join(".busybox.extract").exists());
    }

    #[test]
    fn gzip_images_are_supported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = OverlayWorkspace::new(dir.path());
        let images = ws.images_dir();
        std::fs::create_dir_all(&images).expect("mkdir");
        let file = File::create(images.join("alpine.tar.gz")).expect("create");
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "etc/hostname", &b"x\n"[..])
            .expect("append");
        let _ = builder
            .into_inner()
            .expect("tar")
            .finish()
            .expect("gzip");

        let tree = ws.read_only_layer("alpine").expect("extract");
        assert!(tree.join("etc/hostname").is_file());
    }

    #[test]
    fn missing_image_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = OverlayWorkspace::new(dir.path());
        assert!(ws.read_only_layer("nope").expect_err("missing").is_not_found());
        assert!(matches!(
            ws.read_only_layer("../etc"),
            Err(CapsuleError::Config { .. })
        ));
    }

    #[test]
    fn remove_tolerates_partial_workspace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = OverlayWorkspace::new(dir.path());
        std::fs::create_dir_all(ws.write_layer("web").join("etc")).expect("mkdir");
        ws.remove("web", None).expect("remove");
        assert!(!ws.write_layer("web").exists());
        ws.remove("web", None).expect("idempotent");
    }

    #[test]
    fn failed_unmount_keeps_workspace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = OverlayWorkspace::new(dir.path());
        let data = ws.mount_point("web").join("data");
        std::fs::create_dir_all(&data).expect("mkdir");
        std::fs::write(data.join("keep.txt"), "host data").expect("write");
        std::fs::create_dir_all(ws.write_layer("web")).expect("mkdir");
        let volume = VolumeSpec::parse("/srv/data:/data").expect("spec");

        // Nothing is mounted here, so both unmounts fail.
        let err = ws.remove("web", Some(&volume)).expect_err("still mounted");
        assert!(matches!(err, CapsuleError::InvalidState { .. }));
        assert_eq!(
            std::fs::read_to_string(data.join("keep.txt")).expect("read"),
            "host data"
        );
        assert!(ws.write_layer("web").exists());
    }

    #[test]
    fn paths_follow_layout() {
        let ws = OverlayWorkspace::new("/var/lib/capsule");
        assert_eq!(ws.mount_point("web"), Path::new("/var/lib/capsule/mnt/web"));
        assert_eq!(
            ws.write_layer("web"),
            Path::new("/var/lib/capsule/writeLayer/web")
        );
    }
}
