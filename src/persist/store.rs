//! Directory-backed snapshot store.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use super::snapshot::{decode, encode, write_atomic, SnapshotEntity};
use crate::error::{Result, ResultExt};

/// Extension used for every snapshot file.
pub const SNAPSHOT_EXT: &str = "snap";

/// One file per logical entity, named `<name>.snap`, inside a single directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("cannot create storage directory {}", dir.display()))?;
        debug!("Snapshot store ready");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot file for `name`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{SNAPSHOT_EXT}"))
    }

    /// Load an entity; `Ok(None)` when no snapshot exists yet.
    pub fn load<T: SnapshotEntity>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path_for(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        decode(&path, &bytes).map(Some)
    }

    /// Load an entity, falling back to `T::default()` on a missing or
    /// unreadable snapshot. Unreadable snapshots are logged and left on disk
    /// until the next save replaces them.
    pub fn load_or_default<T: SnapshotEntity + Default>(&self, name: &str) -> T {
        match self.load(name) {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(e) => {
                warn!(name, error = %e, "Discarding unreadable snapshot");
                T::default()
            }
        }
    }

    /// Atomically replace the snapshot for `name`.
    pub fn save<T: SnapshotEntity>(&self, name: &str, value: &T) -> Result<()> {
        let bytes = encode(value)?;
        write_atomic(&self.path_for(name), &bytes)
    }

    /// Remove a snapshot. Returns whether a file was deleted.
    pub fn remove(&self, name: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all snapshots starting with `prefix`, sorted.
    pub fn names_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if stem.starts_with(prefix) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
