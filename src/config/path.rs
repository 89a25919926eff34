//! Path resolution helpers for configuration files.
//!
//! Supports absolute paths, paths relative to the config file, and "~" home
//! directory expansion.

use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::{Result, SlideError};

/// Resolve a path from a config file.
///
/// Resolution rules:
/// 1. Paths starting with `~`: expanded to home directory
/// 2. Absolute paths: used as-is
/// 3. Relative paths: resolved relative to `base_dir`
pub fn resolve_path(path: &Path, base_dir: &Path) -> Result<PathBuf> {
    trace!(
        path = %path.display(),
        base_dir = %base_dir.display(),
        "Resolving path"
    );

    let path_str = path.to_string_lossy();

    if path_str == "~" || path_str.starts_with("~/") {
        let home = home_dir()?;
        let rest = path_str.strip_prefix("~/").unwrap_or("");
        let resolved = if rest.is_empty() {
            home
        } else {
            home.join(rest)
        };
        debug!(
            original = %path.display(),
            resolved = %resolved.display(),
            "Expanded home directory path"
        );
        return Ok(resolved);
    }

    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    let resolved = base_dir.join(path);
    debug!(
        original = %path.display(),
        resolved = %resolved.display(),
        "Resolved relative path"
    );
    Ok(resolved)
}

/// Resolve the user's home directory (cross-platform).
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| {
        SlideError::ConfigInvalid("Could not determine home directory".to_string())
    })
}

/// Resolve `path` against `root` unless it is already absolute.
pub fn under_root(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_path() {
        let base = Path::new("/etc/slideshow");
        let resolved = resolve_path(Path::new("/srv/gallery"), base).unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/gallery"));
    }

    #[test]
    fn test_relative_path() {
        let base = Path::new("/etc/slideshow");
        let resolved = resolve_path(Path::new("gallery"), base).unwrap();
        assert_eq!(resolved, PathBuf::from("/etc/slideshow/gallery"));
    }

    #[test]
    fn test_home_expansion() {
        let resolved = resolve_path(Path::new("~/Pictures"), Path::new("/x")).unwrap();
        let home = home_dir().unwrap();
        assert!(resolved.starts_with(&home));
        assert!(resolved.ends_with("Pictures"));
    }

    #[test]
    fn test_under_root() {
        let root = Path::new("/srv/gallery");
        assert_eq!(
            under_root(root, Path::new("uploaded_raw")),
            PathBuf::from("/srv/gallery/uploaded_raw")
        );
        assert_eq!(under_root(root, Path::new("/tmp/raw")), PathBuf::from("/tmp/raw"));
    }
}
