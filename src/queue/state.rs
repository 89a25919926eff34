//! Playback order of one device and the rules for rebuilding it.

use std::collections::{BTreeSet, HashSet};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::settings::DeviceSettings;
use crate::media::MediaKey;
use crate::persist::SnapshotEntity;

/// Ordered keys still to play plus the position of the next one.
///
/// Keys are unique. `cursor` points at the next key to hand out and is
/// never past `order.len()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceQueueState {
    pub order: Vec<MediaKey>,
    pub cursor: usize,
    /// Selection the order was built from; `None` is every collection.
    pub selection: Option<BTreeSet<String>>,
}

impl DeviceQueueState {
    /// Replace the order wholesale and start from the top.
    ///
    /// Sequential devices get `candidates` as given; others get a shuffle.
    pub fn regenerate<R: Rng + ?Sized>(
        &mut self,
        candidates: Vec<MediaKey>,
        selection: Option<BTreeSet<String>>,
        sequential: bool,
        rng: &mut R,
    ) {
        let mut order = dedup_keys(candidates);
        if !sequential {
            order.shuffle(rng);
        }
        self.order = order;
        self.cursor = 0;
        self.selection = selection;
        trace!(len = self.order.len(), sequential, "Queue regenerated");
    }

    /// Bring the order in line with the current candidates.
    ///
    /// Sequential: keys no longer offered are dropped, the cursor keeps
    /// pointing at the same upcoming key, and new keys are appended at the
    /// tail in candidate order. Shuffle: same as [`Self::regenerate`].
    pub fn merge<R: Rng + ?Sized>(&mut self, candidates: Vec<MediaKey>, sequential: bool, rng: &mut R) {
        if !sequential {
            let selection = self.selection.take();
            self.regenerate(candidates, selection, false, rng);
            return;
        }

        let candidates = dedup_keys(candidates);
        let offered: HashSet<&MediaKey> = candidates.iter().collect();
        let mut kept = Vec::with_capacity(candidates.len());
        let mut cursor = 0;
        for (i, key) in self.order.iter().enumerate() {
            if offered.contains(key) {
                if i < self.cursor {
                    cursor += 1;
                }
                kept.push(key.clone());
            }
        }

        let present: HashSet<MediaKey> = kept.iter().cloned().collect();
        let appended = candidates.iter().filter(|k| !present.contains(*k)).count();
        kept.extend(candidates.into_iter().filter(|k| !present.contains(k)));

        trace!(
            dropped = self.order.len() + appended - kept.len(),
            appended,
            cursor,
            "Queue merged"
        );
        self.order = kept;
        self.cursor = cursor;
    }

    /// Key at the cursor without moving it.
    pub fn peek(&self) -> Option<&MediaKey> {
        self.order.get(self.cursor)
    }

    /// Hand out the key at the cursor and move past it.
    pub fn advance(&mut self) -> Option<MediaKey> {
        let key = self.order.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(key)
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.order.len()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.cursor = 0;
        self.selection = None;
    }
}

fn dedup_keys(keys: Vec<MediaKey>) -> Vec<MediaKey> {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.into_iter().filter(|k| seen.insert(k.clone())).collect()
}

/// Everything persisted for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub settings: DeviceSettings,
    pub queue: DeviceQueueState,
    /// Set once the device is deleted; a record marked so is never saved again.
    #[serde(skip)]
    pub deleted: bool,
}

impl SnapshotEntity for DeviceRecord {
    const VERSION: u16 = 1;
}
