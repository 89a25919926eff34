//! Device Queue Manager: one persisted, independently locked queue per device.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use super::settings::{normalize_selection, DeviceSettings, SettingsUpdate};
use super::state::DeviceRecord;
use crate::config::{Settings, MIN_PHOTO_SECONDS};
use crate::durations::DurationCache;
use crate::error::{Result, SlideError};
use crate::media::{CollectionEntry, CollectionIndex, MediaKey, SharedIndex};
use crate::persist::{SnapshotEntity, SnapshotStore};

/// Prefix of per-device snapshot names.
pub const DEVICE_PREFIX: &str = "device_";

/// Snapshot name of the default collection selection.
pub const DEFAULTS_SNAPSHOT: &str = "default_collections";

const MAX_DEVICE_ID_LEN: usize = 128;

#[derive(Debug, Default, Serialize, Deserialize)]
struct DefaultCollections {
    collections: BTreeSet<String>,
}

impl SnapshotEntity for DefaultCollections {
    const VERSION: u16 = 1;
}

/// Next item for a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextItem {
    pub entry: CollectionEntry,
    /// Seconds until the page should refresh.
    pub display_seconds: u32,
    /// 1-based position of this item in the current queue.
    pub position: usize,
    pub total: usize,
    pub show_counters: bool,
    pub show_names: bool,
}

/// Result of [`DeviceQueueManager::get_next`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum NextMedia {
    Ready(NextItem),
    /// Nothing playable for this device; show a placeholder.
    NoMediaAvailable,
}

impl NextMedia {
    pub fn item(&self) -> Option<&NextItem> {
        match self {
            Self::Ready(item) => Some(item),
            Self::NoMediaAvailable => None,
        }
    }

    pub fn key(&self) -> Option<&MediaKey> {
        self.item().map(|i| &i.entry.key)
    }
}

/// Rejects ids that could escape the storage directory or collide.
pub fn validate_device_id(device_id: &str) -> Result<()> {
    let reason = if device_id.is_empty() {
        Some("must not be empty")
    } else if device_id.len() > MAX_DEVICE_ID_LEN {
        Some("too long")
    } else if !device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        || device_id.starts_with('.')
    {
        Some("only ASCII letters, digits, '-', '_' and '.' are allowed")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(SlideError::InvalidDeviceId {
            device_id: device_id.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

fn snapshot_name(device_id: &str) -> String {
    format!("{DEVICE_PREFIX}{device_id}")
}

/// Keys offered by a selection, in discovery order.
fn candidates(index: &CollectionIndex, selection: Option<&BTreeSet<String>>) -> Vec<MediaKey> {
    match selection {
        Some(ids) => index.keys_for(ids),
        None => index.iter().map(|e| e.key.clone()).collect(),
    }
}

type DeviceHandle = Arc<Mutex<DeviceRecord>>;

pub struct DeviceQueueManager {
    store: SnapshotStore,
    index: SharedIndex,
    durations: Option<Arc<DurationCache>>,
    devices: DashMap<String, DeviceHandle>,
    defaults: RwLock<BTreeSet<String>>,
    default_photo_seconds: u32,
    video_padding_seconds: u32,
}

impl std::fmt::Debug for DeviceQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceQueueManager")
            .field("store", &self.store)
            .field("loaded_devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}

impl DeviceQueueManager {
    /// Open the manager over `store`, loading the default selection.
    pub fn new(store: SnapshotStore, index: SharedIndex) -> Self {
        let defaults = store
            .load_or_default::<DefaultCollections>(DEFAULTS_SNAPSHOT)
            .collections;
        debug!(defaults = defaults.len(), "Device queue manager ready");
        Self {
            store,
            index,
            durations: None,
            devices: DashMap::new(),
            defaults: RwLock::new(defaults),
            default_photo_seconds: 15,
            video_padding_seconds: 3,
        }
    }

    pub fn with_durations(mut self, durations: Arc<DurationCache>) -> Self {
        self.durations = Some(durations);
        self
    }

    /// Take photo time and video padding from `settings`.
    pub fn with_timing(mut self, settings: &Settings) -> Self {
        self.default_photo_seconds = settings.default_photo_seconds.max(MIN_PHOTO_SECONDS);
        self.video_padding_seconds = settings.video_padding_seconds;
        self
    }

    fn lock(handle: &DeviceHandle) -> MutexGuard<'_, DeviceRecord> {
        handle.lock().expect("device queue lock poisoned")
    }

    fn save(&self, record: &DeviceRecord) -> Result<()> {
        if record.deleted {
            debug!(device_id = %record.device_id, "Device was deleted, not saving");
            return Ok(());
        }
        self.store.save(&snapshot_name(&record.device_id), record)
    }

    /// Loaded or freshly created state for a device.
    fn handle(&self, device_id: &str) -> Result<DeviceHandle> {
        validate_device_id(device_id)?;
        if let Some(handle) = self.devices.get(device_id) {
            return Ok(Arc::clone(handle.value()));
        }

        let (record, fresh) = match self.store.load::<DeviceRecord>(&snapshot_name(device_id)) {
            Ok(Some(record)) => (record, false),
            Ok(None) => (self.fresh_record(device_id), true),
            Err(e) => {
                warn!(device_id, error = %e, "Unreadable device snapshot, starting over");
                (self.fresh_record(device_id), true)
            }
        };
        let candidate = Arc::new(Mutex::new(record));
        let handle = self
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::clone(&candidate))
            .clone();

        if fresh && Arc::ptr_eq(&handle, &candidate) {
            let record = Self::lock(&handle);
            self.save(&record)?;
            info!(device_id, queued = record.queue.len(), "New device registered");
        }
        Ok(handle)
    }

    fn fresh_record(&self, device_id: &str) -> DeviceRecord {
        let mut record = DeviceRecord {
            device_id: device_id.to_string(),
            settings: DeviceSettings::with_photo_seconds(self.default_photo_seconds),
            ..DeviceRecord::default()
        };
        let index = self.index.current();
        self.regenerate(&mut record, &index);
        record
    }

    /// Selection actually in force: the device's own, else the defaults,
    /// where an empty default set means every collection.
    fn resolve_selection(&self, settings: &DeviceSettings) -> Option<BTreeSet<String>> {
        if let Some(own) = &settings.active_collections {
            return Some(own.clone());
        }
        let defaults = self.defaults.read().expect("defaults lock poisoned");
        if defaults.is_empty() {
            None
        } else {
            Some(defaults.clone())
        }
    }

    fn regenerate(&self, record: &mut DeviceRecord, index: &CollectionIndex) {
        let selection = self.resolve_selection(&record.settings);
        let keys = candidates(index, selection.as_ref());
        let sequential = record.settings.sequential_mode;
        record
            .queue
            .regenerate(keys, selection, sequential, &mut rand::rng());
    }

    /// Apply the index to a queue: regenerate when the selection changed,
    /// otherwise merge.
    fn rebuild_record(&self, record: &mut DeviceRecord, index: &CollectionIndex) {
        let selection = self.resolve_selection(&record.settings);
        if selection != record.queue.selection {
            debug!(device_id = %record.device_id, "Selection changed, regenerating queue");
            self.regenerate(record, index);
            return;
        }
        let keys = candidates(index, selection.as_ref());
        let sequential = record.settings.sequential_mode;
        record.queue.merge(keys, sequential, &mut rand::rng());
    }

    fn check_known(index: &CollectionIndex, selection: &BTreeSet<String>) -> Result<()> {
        match selection.iter().find(|id| !index.has_collection(id)) {
            Some(unknown) => Err(SlideError::UnknownCollection {
                name: unknown.clone(),
            }),
            None => Ok(()),
        }
    }

    /// May run ffprobe, so never call this with a device lock held.
    fn display_seconds(&self, photo_seconds: u32, entry: &CollectionEntry) -> u32 {
        if entry.kind.is_video() {
            let duration = self
                .durations
                .as_ref()
                .map_or(0, |cache| cache.seconds_for(entry));
            duration.saturating_add(self.video_padding_seconds)
        } else {
            photo_seconds.max(MIN_PHOTO_SECONDS)
        }
    }

    /// Hand out the next playable item and persist the advanced cursor.
    ///
    /// Vanished keys and, for photo-only devices, videos are skipped. When the
    /// queue runs out it is regenerated once; if that yields nothing playable
    /// the result is [`NextMedia::NoMediaAvailable`].
    #[instrument(skip(self))]
    pub fn get_next(&self, device_id: &str) -> Result<NextMedia> {
        let handle = self.handle(device_id)?;
        let mut record = Self::lock(&handle);
        let index = self.index.current();
        let only_photo = record.settings.only_photo;

        let mut regenerated = false;
        let mut dirty = false;
        let found = loop {
            if record.queue.is_exhausted() {
                if regenerated {
                    break None;
                }
                self.regenerate(&mut record, &index);
                regenerated = true;
                dirty = true;
                if record.queue.is_empty() {
                    break None;
                }
            }
            let Some(key) = record.queue.advance() else {
                continue;
            };
            dirty = true;
            match index.get(&key) {
                Some(entry) if only_photo && entry.kind.is_video() => {
                    trace!(key = %key, "Skipping video for photo-only device");
                }
                Some(entry) => break Some(entry.clone()),
                None => trace!(key = %key, "Skipping vanished key"),
            }
        };

        if dirty {
            self.save(&record)?;
        }
        let Some(entry) = found else {
            debug!(device_id, "No media available");
            return Ok(NextMedia::NoMediaAvailable);
        };

        let mut item = NextItem {
            display_seconds: 0,
            position: record.queue.cursor,
            total: record.queue.len(),
            show_counters: record.settings.show_counters,
            show_names: record.settings.show_names,
            entry,
        };
        let photo_seconds = record.settings.photo_seconds;
        drop(record);
        item.display_seconds = self.display_seconds(photo_seconds, &item.entry);
        debug!(
            device_id,
            key = %item.entry.key,
            position = item.position,
            total = item.total,
            "Next media"
        );
        Ok(NextMedia::Ready(item))
    }

    /// Key the next [`Self::get_next`] starts from, without advancing.
    pub fn peek(&self, device_id: &str) -> Result<Option<MediaKey>> {
        let handle = self.handle(device_id)?;
        let record = Self::lock(&handle);
        Ok(record.queue.peek().cloned())
    }

    /// Choose the device's collections (`None` follows the defaults) and
    /// regenerate its queue.
    #[instrument(skip(self))]
    pub fn set_collections(&self, device_id: &str, selection: Option<BTreeSet<String>>) -> Result<()> {
        let selection = selection.map(normalize_selection);
        let index = self.index.current();
        if let Some(ids) = &selection {
            Self::check_known(&index, ids)?;
        }
        let handle = self.handle(device_id)?;
        let mut record = Self::lock(&handle);
        record.settings.active_collections = selection;
        record.queue.clear();
        self.regenerate(&mut record, &index);
        self.save(&record)?;
        info!(device_id, queued = record.queue.len(), "Device collections updated");
        Ok(())
    }

    /// Re-apply the current index to one device's queue.
    #[instrument(skip(self))]
    pub fn rebuild(&self, device_id: &str) -> Result<()> {
        let handle = self.handle(device_id)?;
        let mut record = Self::lock(&handle);
        let index = self.index.current();
        self.rebuild_record(&mut record, &index);
        self.save(&record)
    }

    /// Rebuild every known device. Failures are logged per device.
    pub fn rebuild_all(&self) -> Result<usize> {
        let mut rebuilt = 0;
        for device_id in self.device_ids()? {
            match self.rebuild(&device_id) {
                Ok(()) => rebuilt += 1,
                Err(e) => warn!(device_id, error = %e, "Unable to rebuild device queue"),
            }
        }
        info!(devices = rebuilt, "Device queues rebuilt");
        Ok(rebuilt)
    }

    pub fn settings(&self, device_id: &str) -> Result<DeviceSettings> {
        let handle = self.handle(device_id)?;
        let record = Self::lock(&handle);
        Ok(record.settings.clone())
    }

    /// Apply a settings change and persist it. Changing the mode or the
    /// selection regenerates the queue.
    #[instrument(skip(self, update))]
    pub fn update_settings(&self, device_id: &str, update: SettingsUpdate) -> Result<DeviceSettings> {
        let index = self.index.current();
        if let Some(Some(ids)) = &update.active_collections {
            Self::check_known(&index, &normalize_selection(ids))?;
        }
        let handle = self.handle(device_id)?;
        let mut record = Self::lock(&handle);
        let applied = update.apply(&mut record.settings);
        if applied.rebuild {
            self.regenerate(&mut record, &index);
        }
        if applied.changed {
            self.save(&record)?;
            debug!(device_id, rebuild = applied.rebuild, "Device settings updated");
        }
        Ok(record.settings.clone())
    }

    /// Throw away the queue and start over.
    pub fn clear_queue(&self, device_id: &str) -> Result<()> {
        let handle = self.handle(device_id)?;
        let mut record = Self::lock(&handle);
        record.queue.clear();
        let index = self.index.current();
        self.regenerate(&mut record, &index);
        self.save(&record)?;
        info!(device_id, "Device queue cleared");
        Ok(())
    }

    /// Forget a device entirely. Returns whether anything existed.
    pub fn delete_device(&self, device_id: &str) -> Result<bool> {
        validate_device_id(device_id)?;
        let loaded = match self.devices.remove(device_id) {
            Some((_, handle)) => {
                let mut record = Self::lock(&handle);
                record.deleted = true;
                self.store.remove(&snapshot_name(device_id))?;
                true
            }
            None => false,
        };
        let removed = self.store.remove(&snapshot_name(device_id))? || loaded;
        if removed {
            info!(device_id, "Device deleted");
        }
        Ok(removed)
    }

    /// Ids of loaded and persisted devices, sorted.
    pub fn device_ids(&self) -> Result<Vec<String>> {
        let mut ids: BTreeSet<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        for name in self.store.names_with_prefix(DEVICE_PREFIX)? {
            if let Some(id) = name.strip_prefix(DEVICE_PREFIX) {
                ids.insert(id.to_string());
            }
        }
        Ok(ids.into_iter().collect())
    }

    pub fn default_collections(&self) -> BTreeSet<String> {
        self.defaults.read().expect("defaults lock poisoned").clone()
    }

    /// Replace the default selection and rebuild devices that follow it.
    /// An empty set means every collection.
    #[instrument(skip(self))]
    pub fn set_default_collections(&self, selection: BTreeSet<String>) -> Result<()> {
        let selection = normalize_selection(selection);
        Self::check_known(&self.index.current(), &selection)?;
        self.store.save(
            DEFAULTS_SNAPSHOT,
            &DefaultCollections {
                collections: selection.clone(),
            },
        )?;
        *self.defaults.write().expect("defaults lock poisoned") = selection;
        info!("Default collections updated");
        self.rebuild_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durations::DurationProbe;
    use crate::media::IndexFilter;
    use std::fs;
    use std::path::Path;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, rel.as_bytes()).unwrap();
    }

    fn manager(tmp: &TempDir) -> (DeviceQueueManager, SharedIndex) {
        let media = tmp.path().join("gallery");
        let index = SharedIndex::new(CollectionIndex::refresh(&media, &IndexFilter::default()).unwrap());
        let store = SnapshotStore::open(tmp.path().join("storage")).unwrap();
        (DeviceQueueManager::new(store, index.clone()), index)
    }

    fn gallery(files: &[&str]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("gallery")).unwrap();
        for f in files {
            touch(&tmp.path().join("gallery"), f);
        }
        tmp
    }

    #[test]
    fn test_device_id_validation() {
        assert!(validate_device_id("kitchen-tablet_01").is_ok());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("../etc").is_err());
        assert!(validate_device_id("a/b").is_err());
        assert!(validate_device_id(&"x".repeat(200)).is_err());
    }

    #[test]
    fn test_sequential_device_plays_in_discovery_order_and_wraps() {
        let tmp = gallery(&["a/1.jpg", "a/2.jpg", "b/3.jpg"]);
        let (mgr, _) = manager(&tmp);
        mgr.update_settings(
            "ipad",
            SettingsUpdate {
                sequential_mode: Some(true),
                ..SettingsUpdate::default()
            },
        )
        .unwrap();

        let played: Vec<_> = (0..4)
            .map(|_| mgr.get_next("ipad").unwrap().key().unwrap().to_string())
            .collect();
        assert_eq!(played, vec!["a/1.jpg", "a/2.jpg", "b/3.jpg", "a/1.jpg"]);
    }

    #[test]
    fn test_zero_collections_is_no_media() {
        let tmp = gallery(&["a/1.jpg"]);
        let (mgr, _) = manager(&tmp);
        mgr.set_collections("ipad", Some(BTreeSet::new())).unwrap();
        assert_eq!(mgr.get_next("ipad").unwrap(), NextMedia::NoMediaAvailable);
    }

    #[test]
    fn test_photo_only_skips_videos() {
        let tmp = gallery(&["a/1.mp4", "a/2.jpg", "a/3.mov"]);
        let (mgr, _) = manager(&tmp);
        mgr.update_settings(
            "ipad",
            SettingsUpdate {
                only_photo: Some(true),
                ..SettingsUpdate::default()
            },
        )
        .unwrap();
        for _ in 0..5 {
            assert_eq!(mgr.get_next("ipad").unwrap().key().unwrap().as_str(), "a/2.jpg");
        }

        let tmp = gallery(&["a/1.mp4"]);
        let (mgr, _) = manager(&tmp);
        mgr.update_settings(
            "ipad",
            SettingsUpdate {
                only_photo: Some(true),
                ..SettingsUpdate::default()
            },
        )
        .unwrap();
        assert_eq!(mgr.get_next("ipad").unwrap(), NextMedia::NoMediaAvailable);
    }

    #[test]
    fn test_unknown_collection_rejected() {
        let tmp = gallery(&["a/1.jpg"]);
        let (mgr, _) = manager(&tmp);
        let err = mgr
            .set_collections("ipad", Some(["nope".to_string()].into()))
            .unwrap_err();
        assert!(matches!(err, SlideError::UnknownCollection { .. }));
    }

    #[test]
    fn test_display_seconds() {
        let tmp = gallery(&["a/1.jpg"]);
        let (mgr, _) = manager(&tmp);
        mgr.update_settings(
            "ipad",
            SettingsUpdate {
                photo_seconds: Some(30),
                show_counters: Some(true),
                ..SettingsUpdate::default()
            },
        )
        .unwrap();
        let item = mgr.get_next("ipad").unwrap().item().cloned().unwrap();
        assert_eq!(item.display_seconds, 30);
        assert_eq!((item.position, item.total), (1, 1));
        assert!(item.show_counters);
    }

    #[test]
    fn test_delete_device() {
        let tmp = gallery(&["a/1.jpg"]);
        let (mgr, _) = manager(&tmp);
        mgr.get_next("ipad").unwrap();
        assert_eq!(mgr.device_ids().unwrap(), vec!["ipad".to_string()]);
        assert!(mgr.delete_device("ipad").unwrap());
        assert!(mgr.device_ids().unwrap().is_empty());
        assert!(!mgr.delete_device("ipad").unwrap());
    }

    #[test]
    fn test_deleted_device_is_not_saved_by_a_stale_handle() {
        let tmp = gallery(&["a/1.jpg"]);
        let (mgr, _) = manager(&tmp);
        let stale = mgr.handle("ipad").unwrap();

        assert!(mgr.delete_device("ipad").unwrap());
        {
            let mut record = DeviceQueueManager::lock(&stale);
            let _ = record.queue.advance();
            mgr.save(&record).unwrap();
        }
        assert!(mgr.device_ids().unwrap().is_empty());
        assert!(mgr.store.load::<DeviceRecord>(&snapshot_name("ipad")).unwrap().is_none());

        // A later request starts a fresh device.
        assert!(mgr.get_next("ipad").unwrap().item().is_some());
        assert_eq!(mgr.device_ids().unwrap(), vec!["ipad".to_string()]);
    }

    struct GatedLookup {
        entered: mpsc::Sender<()>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl DurationProbe for GatedLookup {
        fn probe(&self, _path: &Path) -> std::io::Result<Duration> {
            let _ = self.entered.send(());
            let _ = self
                .release
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(30));
            Ok(Duration::from_secs(20))
        }
    }

    #[test]
    fn test_slow_duration_lookup_does_not_block_the_device() {
        let tmp = gallery(&["a/1.mp4"]);
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let lookup = Arc::new(GatedLookup {
            entered: entered_tx,
            release: Mutex::new(release_rx),
        });
        let store = SnapshotStore::open(tmp.path().join("storage")).unwrap();
        let (mgr, _) = manager(&tmp);
        let mgr = mgr.with_durations(Arc::new(DurationCache::open(store, lookup)));

        std::thread::scope(|scope| {
            let playing = scope.spawn(|| mgr.get_next("tv").unwrap());
            entered_rx.recv_timeout(Duration::from_secs(30)).unwrap();

            let (done_tx, done_rx) = mpsc::channel();
            let mgr_ref = &mgr;
            scope.spawn(move || {
                let _ = done_tx.send(mgr_ref.settings("tv").is_ok());
            });
            let answered = done_rx.recv_timeout(Duration::from_secs(10));
            release_tx.send(()).unwrap();

            assert_eq!(answered, Ok(true), "device lock was held during the duration lookup");
            let item = playing.join().unwrap().item().cloned().unwrap();
            assert_eq!(item.display_seconds, 23);
        });
    }
}
