//! Temporary galleries for tests.
//!
//! A [`Gallery`] owns a temp directory holding `gallery/` (the media root)
//! and `storage/` (snapshots and the lock file). Everything is removed when
//! the gallery is dropped.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{Rgb, RgbImage};
use slideshow::config::Settings;
use slideshow::media::{CollectionIndex, IndexFilter, SharedIndex};
use slideshow::persist::SnapshotStore;
use tempfile::TempDir;

pub struct Gallery {
    pub dir: TempDir,
}

impl Default for Gallery {
    fn default() -> Self {
        Self::new()
    }
}

impl Gallery {
    /// Empty media root and storage directory.
    ///
    /// # Panics
    ///
    /// Panics if the temp directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        fs::create_dir_all(dir.path().join("gallery")).expect("Failed to create gallery");
        fs::create_dir_all(dir.path().join("storage")).expect("Failed to create storage");
        Self { dir }
    }

    #[must_use]
    pub fn root(&self) -> PathBuf {
        self.dir.path().join("gallery")
    }

    #[must_use]
    pub fn storage(&self) -> PathBuf {
        self.dir.path().join("storage")
    }

    #[must_use]
    pub fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    /// Write `bytes` to `rel` under the media root, creating folders.
    pub fn add(&self, rel: &str, bytes: &[u8]) -> PathBuf {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().expect("file has a parent")).expect("Failed to create folder");
        fs::write(&path, bytes).unwrap_or_else(|_| panic!("Failed to write {path:?}"));
        path
    }

    /// Files whose content is their own relative path, so all differ.
    pub fn add_unique(&self, rels: &[&str]) {
        for rel in rels {
            self.add(rel, rel.as_bytes());
        }
    }

    /// Solid-color PNG of the given size.
    pub fn add_image(&self, rel: &str, width: u32, height: u32) -> PathBuf {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().expect("file has a parent")).expect("Failed to create folder");
        RgbImage::from_pixel(width, height, Rgb([200, 40, 90]))
            .save(&path)
            .unwrap_or_else(|_| panic!("Failed to save image at {path:?}"));
        path
    }

    pub fn remove(&self, rel: &str) {
        fs::remove_file(self.path(rel)).unwrap_or_else(|_| panic!("Failed to remove {rel}"));
    }

    /// Settings pointing at this gallery, with a short idle window.
    #[must_use]
    pub fn settings(&self) -> Settings {
        Settings {
            media_root: self.root(),
            storage_dir: self.storage(),
            idle_seconds: 1,
            converter_throttle_seconds: 0,
            ..Settings::default()
        }
    }

    #[must_use]
    pub fn store(&self) -> SnapshotStore {
        SnapshotStore::open(self.storage()).expect("Failed to open snapshot store")
    }

    /// Fresh index of the media root.
    #[must_use]
    pub fn index(&self) -> CollectionIndex {
        CollectionIndex::refresh(&self.root(), &IndexFilter::from_settings(&self.settings()))
            .expect("Failed to index gallery")
    }

    #[must_use]
    pub fn shared_index(&self) -> SharedIndex {
        SharedIndex::new(self.index())
    }

    /// Rescan into an existing shared index.
    pub fn refresh(&self, shared: &SharedIndex) -> Arc<CollectionIndex> {
        shared.replace(self.index());
        shared.current()
    }
}

/// True when both paths are the same inode.
#[cfg(unix)]
#[must_use]
pub fn same_inode(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    let (a, b) = (fs::metadata(a).expect("stat a"), fs::metadata(b).expect("stat b"));
    a.dev() == b.dev() && a.ino() == b.ino()
}
