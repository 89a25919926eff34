//! Media collections.
//!
//! - [`MediaKey`]: stable relative-path identifier of a media item
//! - [`MediaKind`]: image or video, decided by extension
//! - [`CollectionIndex`]: one scan of the media root, grouped per directory
//! - [`SharedIndex`]: the current index, swapped wholesale on refresh

mod index;
mod kind;

pub use index::{CollectionEntry, CollectionIndex, CollectionInfo, IndexFilter, ScanError};
pub use kind::{normalize_collection_id, MediaKey, MediaKind, ROOT_COLLECTION};

use std::sync::{Arc, RwLock};

/// Current index shared between request handlers and background workers.
///
/// Readers get a cheap `Arc` clone and never block a refresh for longer than
/// the pointer swap.
#[derive(Debug, Clone)]
pub struct SharedIndex {
    inner: Arc<RwLock<Arc<CollectionIndex>>>,
}

impl SharedIndex {
    pub fn new(index: CollectionIndex) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(index))),
        }
    }

    /// Snapshot of the current index.
    pub fn current(&self) -> Arc<CollectionIndex> {
        Arc::clone(&self.inner.read().expect("index lock poisoned"))
    }

    /// Replace the current index.
    pub fn replace(&self, index: CollectionIndex) {
        *self.inner.write().expect("index lock poisoned") = Arc::new(index);
    }
}
