//! Filesystem seam used by the deduplicator.
//!
//! This trait abstracts over the local filesystem so tests can simulate
//! files living on different volumes without mounting anything.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Device + inode pair. Two paths with equal identities are the same file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    /// Volume the file lives on.
    pub device: u64,
    /// Inode (or file index) within the volume.
    pub inode: u64,
}

/// Stat result the deduplicator needs.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub identity: FileIdentity,
    pub is_symlink: bool,
    pub is_file: bool,
    pub len: u64,
}

/// Filesystem operations used by a dedup pass.
pub trait FileSystem: Send + Sync {
    /// Stat without following symlinks.
    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// Replace `target` with a hardlink to `canonical`.
    ///
    /// The replacement must be atomic: on failure `target` still holds its
    /// original content.
    fn replace_with_hardlink(&self, canonical: &Path, target: &Path) -> io::Result<()>;
}

/// The real, local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

#[cfg(unix)]
fn identity_of(meta: &fs::Metadata) -> FileIdentity {
    use std::os::unix::fs::MetadataExt;
    FileIdentity {
        device: meta.dev(),
        inode: meta.ino(),
    }
}

#[cfg(not(unix))]
fn identity_of(_meta: &fs::Metadata) -> FileIdentity {
    // No stable inode API; every file looks distinct and linking decides.
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    FileIdentity {
        device: 0,
        inode: NEXT.fetch_add(1, Ordering::Relaxed),
    }
}

/// Hidden sibling used as the staging name for a new link.
pub fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.dedup-tmp"))
}

impl FileSystem for LocalFs {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = fs::symlink_metadata(path)?;
        Ok(FileStat {
            identity: identity_of(&meta),
            is_symlink: meta.file_type().is_symlink(),
            is_file: meta.is_file(),
            len: meta.len(),
        })
    }

    fn replace_with_hardlink(&self, canonical: &Path, target: &Path) -> io::Result<()> {
        let staging = staging_path(target);
        if staging.exists() {
            warn!(path = %staging.display(), "Removing leftover staging link");
            fs::remove_file(&staging)?;
        }
        fs::hard_link(canonical, &staging)?;
        if let Err(e) = fs::rename(&staging, target) {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
        debug!(
            canonical = %canonical.display(),
            target = %target.display(),
            "Replaced duplicate with hardlink"
        );
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_replace_with_hardlink_shares_inode() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.jpg");
        let b = tmp.path().join("b.jpg");
        fs::write(&a, b"same").unwrap();
        fs::write(&b, b"same").unwrap();

        let fs_ops = LocalFs;
        assert_ne!(fs_ops.stat(&a).unwrap().identity, fs_ops.stat(&b).unwrap().identity);

        fs_ops.replace_with_hardlink(&a, &b).unwrap();
        assert_eq!(fs_ops.stat(&a).unwrap().identity, fs_ops.stat(&b).unwrap().identity);
        assert!(!staging_path(&b).exists());
    }

    #[test]
    fn test_failed_link_keeps_target() {
        let tmp = TempDir::new().unwrap();
        let b = tmp.path().join("b.jpg");
        fs::write(&b, b"original").unwrap();

        let err = LocalFs.replace_with_hardlink(&tmp.path().join("missing.jpg"), &b);
        assert!(err.is_err());
        assert_eq!(fs::read(&b).unwrap(), b"original");
    }

    #[test]
    fn test_stat_reports_symlink() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.jpg");
        fs::write(&a, b"x").unwrap();
        let link = tmp.path().join("link.jpg");
        std::os::unix::fs::symlink(&a, &link).unwrap();

        assert!(LocalFs.stat(&link).unwrap().is_symlink);
        assert!(!LocalFs.stat(&a).unwrap().is_symlink);
    }
}
