//! Coordinator that wires the index, dedup, conversion and device queues.
//!
//! Change signals flow one way: a changed collection refreshes the index,
//! marks the collection dirty for dedup and, unless the lock file is held,
//! rebuilds device queues. Uploads into the raw holding area only wake the
//! converter watchdog; its completion hook refreshes the index afterwards.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::Settings;
use crate::convert::{BatchOutcome, BatchReport, ConverterPipeline, ConverterWatchdog, MediaTranscoder, Transcoder};
use crate::dedup::{run_locked, DedupReport, DedupScheduler, Deduplicator};
use crate::durations::{DurationCache, DurationProbe, FfprobeProbe};
use crate::error::{Result, SlideError};
use crate::fsops::{FileSystem, LocalFs};
use crate::lock::LockFile;
use crate::media::{normalize_collection_id, CollectionIndex, IndexFilter, SharedIndex};
use crate::persist::SnapshotStore;
use crate::queue::{DeviceQueueManager, NextMedia};

/// What happened to a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Deleted,
    Modified,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Deleted => "deleted",
            Self::Modified => "modified",
        })
    }
}

impl FromStr for ChangeKind {
    type Err = SlideError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" | "create" => Ok(Self::Created),
            "deleted" | "delete" | "removed" => Ok(Self::Deleted),
            "modified" | "modify" | "changed" => Ok(Self::Modified),
            other => Err(SlideError::Other(format!("unknown change kind: {other}"))),
        }
    }
}

/// Replaceable external collaborators.
pub struct Collaborators {
    pub fs: Arc<dyn FileSystem>,
    pub transcoder: Arc<dyn Transcoder>,
    pub probe: Arc<dyn DurationProbe>,
}

impl Default for Collaborators {
    fn default() -> Self {
        let probe: Arc<dyn DurationProbe> = Arc::new(FfprobeProbe::default());
        Self {
            fs: Arc::new(LocalFs),
            transcoder: Arc::new(MediaTranscoder::new(PathBuf::from("ffmpeg"), Arc::clone(&probe))),
            probe,
        }
    }
}

/// Parts shared with the converter completion hook.
struct Core {
    settings: Settings,
    filter: IndexFilter,
    index: SharedIndex,
    queues: DeviceQueueManager,
    durations: Arc<DurationCache>,
    lock: LockFile,
}

impl Core {
    fn refresh_index(&self) -> Result<Arc<CollectionIndex>> {
        let index = CollectionIndex::refresh(&self.settings.media_root, &self.filter)?;
        self.index.replace(index);
        Ok(self.index.current())
    }

    fn rebuild_queues(&self) {
        if let Err(e) = self.queues.rebuild_all() {
            warn!(error = %e, "Unable to rebuild device queues");
        }
    }

    fn after_batch(&self, report: &BatchReport) {
        if report.converted == 0 {
            return;
        }
        match self.refresh_index() {
            Ok(index) => {
                self.durations.prune(&index);
                self.rebuild_queues();
            }
            Err(e) => warn!(error = %e, "Index refresh after conversion failed"),
        }
    }
}

/// The running slideshow core.
pub struct Slideshow {
    core: Arc<Core>,
    store: SnapshotStore,
    dedup: Deduplicator,
    converter: Arc<ConverterPipeline>,
    raw_collection: Option<String>,
    scheduler: Option<DedupScheduler>,
    watchdog: Option<ConverterWatchdog>,
}

impl fmt::Debug for Slideshow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slideshow")
            .field("media_root", &self.core.settings.media_root)
            .field("storage", &self.store)
            .field("background", &self.scheduler.is_some())
            .finish_non_exhaustive()
    }
}

impl Slideshow {
    /// Open with the real filesystem, ffmpeg and ffprobe.
    pub fn open(settings: Settings) -> Result<Self> {
        Self::open_with(settings, Collaborators::default())
    }

    /// Validate settings, scan the media root and load persisted state.
    #[instrument(skip_all, fields(media_root = %settings.media_root.display()))]
    pub fn open_with(settings: Settings, collaborators: Collaborators) -> Result<Self> {
        settings.validate()?;
        let store = SnapshotStore::open(&settings.storage_dir)?;
        let filter = IndexFilter::from_settings(&settings);
        let index = SharedIndex::new(CollectionIndex::refresh(&settings.media_root, &filter)?);

        let durations = Arc::new(DurationCache::open(store.clone(), collaborators.probe));
        let queues = DeviceQueueManager::new(store.clone(), index.clone())
            .with_durations(Arc::clone(&durations))
            .with_timing(&settings);
        let converter = Arc::new(ConverterPipeline::from_settings(
            &settings,
            store.clone(),
            collaborators.transcoder,
        )?);
        let lock = LockFile::new(settings.lock_path(), settings.lock_stale_after());
        let raw_collection = raw_collection_id(&settings);

        let core = Arc::new(Core {
            settings,
            filter,
            index,
            queues,
            durations,
            lock,
        });
        let hook_core = Arc::clone(&core);
        converter.set_completion_hook(Arc::new(move |report: &BatchReport| hook_core.after_batch(report)));

        info!(
            collections = core.index.current().collection_ids().len(),
            media = core.index.current().len(),
            "Slideshow core opened"
        );
        Ok(Self {
            core,
            store,
            dedup: Deduplicator::new(collaborators.fs),
            converter,
            raw_collection,
            scheduler: None,
            watchdog: None,
        })
    }

    /// Start the dedup scheduler and converter watchdog on the current
    /// tokio runtime. Every collection is marked dirty and pending uploads
    /// are picked up right away.
    pub fn start_background(&mut self) {
        if self.scheduler.is_some() {
            return;
        }
        let settings = &self.core.settings;
        let scheduler = DedupScheduler::spawn(
            self.dedup.clone(),
            self.core.index.clone(),
            self.core.lock.clone(),
            settings.idle_window(),
        );
        scheduler.mark_all();
        self.scheduler = Some(scheduler);
        self.watchdog = Some(ConverterWatchdog::spawn(
            Arc::clone(&self.converter),
            settings.converter_throttle(),
            true,
        ));
    }

    pub fn settings(&self) -> &Settings {
        &self.core.settings
    }

    pub fn index(&self) -> Arc<CollectionIndex> {
        self.core.index.current()
    }

    pub fn queues(&self) -> &DeviceQueueManager {
        &self.core.queues
    }

    pub fn converter(&self) -> &Arc<ConverterPipeline> {
        &self.converter
    }

    pub fn scheduler(&self) -> Option<&DedupScheduler> {
        self.scheduler.as_ref()
    }

    /// Next item for a device.
    pub fn next_for(&self, device_id: &str) -> Result<NextMedia> {
        self.core.queues.get_next(device_id)
    }

    /// Rescan the media root and rebuild every device queue.
    pub fn refresh(&self) -> Result<Arc<CollectionIndex>> {
        let index = self.core.refresh_index()?;
        self.core.durations.prune(&index);
        self.core.rebuild_queues();
        Ok(index)
    }

    /// React to a change signal for one collection.
    #[instrument(skip(self))]
    pub fn handle_change(&self, collection: &str, kind: ChangeKind) -> Result<()> {
        let id = normalize_collection_id(collection);
        if self.is_raw_area(&id) {
            debug!("Upload signal");
            if let Some(watchdog) = &self.watchdog {
                watchdog.signal();
            }
            return Ok(());
        }

        let index = self.core.refresh_index()?;
        if kind == ChangeKind::Deleted {
            self.core.durations.prune(&index);
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.mark_dirty(&id);
        }
        if self.core.lock.is_held() {
            debug!("Lock held, queue rebuild skipped while files are in flux");
            return Ok(());
        }
        self.core.rebuild_queues();
        Ok(())
    }

    fn is_raw_area(&self, id: &str) -> bool {
        self.raw_collection
            .as_deref()
            .is_some_and(|raw| id == raw || id.starts_with(&format!("{raw}/")))
    }

    /// One dedup pass over every collection, in the foreground.
    ///
    /// Returns `Ok(None)` when the lock file is held elsewhere.
    pub fn dedup_now(&self) -> Result<Option<DedupReport>> {
        let index = self.core.refresh_index()?;
        let all: BTreeSet<String> = index.collection_ids().into_iter().collect();
        run_locked(&self.dedup, &index, &all, &self.core.lock, &CancellationToken::new())
    }

    /// One conversion batch, in the foreground.
    pub fn convert_now(&self, retry_failed: bool) -> Result<BatchOutcome> {
        if retry_failed {
            let released = self.converter.retry_failed()?;
            info!(released, "Failed uploads released for retry");
        }
        self.converter.run_batch()
    }

    /// Stop background workers. A pass in flight finishes its file first.
    pub async fn shutdown(&mut self) {
        self.converter.request_stop();
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.shutdown().await;
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown().await;
        }
        info!("Slideshow core stopped");
    }
}

/// Collection id of the raw holding area when it lives under the media root.
fn raw_collection_id(settings: &Settings) -> Option<String> {
    let raw = settings.raw_dir_path();
    let rel = raw.strip_prefix(&settings.media_root).ok()?;
    let id = normalize_collection_id(rel.to_str()?);
    (!rel.as_os_str().is_empty()).then_some(id)
}
