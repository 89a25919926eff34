//! Persisted queue of raw uploads waiting for conversion.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::media::{MediaKey, MediaKind};
use crate::persist::{SnapshotEntity, SnapshotStore};

/// Snapshot name of the queue inside the storage directory.
pub const SNAPSHOT_NAME: &str = "conversion_queue";

/// Starts allowed before an item that never finishes is parked as failed.
pub const MAX_ATTEMPTS: u32 = 3;

/// A raw file waiting for conversion, relative to the raw holding area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub relative_path: String,
    pub kind: MediaKind,
    pub attempts: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueSnapshot {
    items: Vec<QueueItem>,
    failed: BTreeSet<String>,
}

impl SnapshotEntity for QueueSnapshot {
    const VERSION: u16 = 1;
}

#[derive(Debug)]
pub struct ConversionQueue {
    store: SnapshotStore,
    raw_dir: PathBuf,
    state: QueueSnapshot,
}

impl ConversionQueue {
    /// Load the queue and drop items whose raw file is gone.
    pub fn open(store: SnapshotStore, raw_dir: impl Into<PathBuf>) -> Result<Self> {
        let state = store.load_or_default::<QueueSnapshot>(SNAPSHOT_NAME);
        let mut queue = Self {
            store,
            raw_dir: raw_dir.into(),
            state,
        };
        if queue.remove_missing() {
            queue.save()?;
        }
        Ok(queue)
    }

    pub fn raw_dir(&self) -> &Path {
        &self.raw_dir
    }

    pub fn absolute_path(&self, item: &QueueItem) -> PathBuf {
        self.raw_dir.join(&item.relative_path)
    }

    fn save(&self) -> Result<()> {
        self.store.save(SNAPSHOT_NAME, &self.state)
    }

    fn remove_missing(&mut self) -> bool {
        let before = self.state.items.len();
        let raw_dir = &self.raw_dir;
        self.state.items.retain(|item| raw_dir.join(&item.relative_path).is_file());
        let removed = before - self.state.items.len();
        if removed > 0 {
            debug!(removed, "Dropped vanished raw files from conversion queue");
        }
        removed > 0
    }

    /// Sync with the raw holding area: drop vanished items, append new raw
    /// media files in path order. Failed files are never re-added here.
    ///
    /// Returns the number of newly queued files.
    #[instrument(skip_all, fields(raw_dir = %self.raw_dir.display()))]
    pub fn refresh_from_disk(&mut self) -> Result<usize> {
        let removed = self.remove_missing();
        if !self.raw_dir.is_dir() {
            if removed {
                self.save()?;
            }
            return Ok(0);
        }

        let mut known: HashSet<String> = self.state.items.iter().map(|i| i.relative_path.clone()).collect();
        let mut added = Vec::new();
        let walker = WalkDir::new(&self.raw_dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

        for item in walker {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable raw entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(kind) = MediaKind::from_path(entry.path()) else {
                continue;
            };
            let Some(rel) = entry
                .path()
                .strip_prefix(&self.raw_dir)
                .ok()
                .and_then(MediaKey::from_relative)
            else {
                continue;
            };
            let rel = rel.as_str().to_string();
            if self.state.failed.contains(&rel) || !known.insert(rel.clone()) {
                continue;
            }
            added.push(QueueItem {
                relative_path: rel,
                kind,
                attempts: 0,
            });
        }

        let count = added.len();
        if count > 0 || removed {
            self.state.items.extend(added);
            self.save()?;
        }
        if count > 0 {
            info!(added = count, pending = self.state.items.len(), "Queued raw uploads");
        }
        Ok(count)
    }

    /// Start work on the head of the queue.
    ///
    /// The item stays queued with its attempt counted until [`Self::complete`]
    /// or [`Self::mark_failed`], so a crash mid-conversion is visible after a
    /// restart. A head that was already started [`MAX_ATTEMPTS`] times without
    /// finishing is parked as failed instead.
    pub fn begin_next(&mut self) -> Result<Option<QueueItem>> {
        let mut parked = false;
        while self
            .state
            .items
            .first()
            .is_some_and(|head| head.attempts >= MAX_ATTEMPTS)
        {
            let head = self.state.items.remove(0);
            warn!(file = %head.relative_path, attempts = head.attempts, "Conversion never finished, parking as failed");
            self.state.failed.insert(head.relative_path);
            parked = true;
        }

        if self.state.items.is_empty() {
            if parked {
                self.save()?;
            }
            return Ok(None);
        }
        let head = &mut self.state.items[0];
        head.attempts += 1;
        let item = head.clone();
        self.save()?;
        Ok(Some(item))
    }

    /// Drop a converted item.
    pub fn complete(&mut self, item: &QueueItem) -> Result<()> {
        if self.take(item) {
            self.save()?;
        }
        Ok(())
    }

    /// Park a file until [`Self::retry_failed`].
    pub fn mark_failed(&mut self, item: &QueueItem) -> Result<()> {
        self.take(item);
        self.state.failed.insert(item.relative_path.clone());
        self.save()
    }

    fn take(&mut self, item: &QueueItem) -> bool {
        let before = self.state.items.len();
        self.state.items.retain(|queued| queued.relative_path != item.relative_path);
        before != self.state.items.len()
    }

    /// Forget failures so the next refresh queues those files again.
    pub fn retry_failed(&mut self) -> Result<usize> {
        let count = self.state.failed.len();
        if count > 0 {
            self.state.failed.clear();
            self.save()?;
            info!(count, "Failed conversions released for retry");
        }
        Ok(count)
    }

    pub fn pending(&self) -> &[QueueItem] {
        &self.state.items
    }

    pub fn failed(&self) -> &BTreeSet<String> {
        &self.state.failed
    }

    pub fn len(&self) -> usize {
        self.state.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.items.is_empty()
    }
}
