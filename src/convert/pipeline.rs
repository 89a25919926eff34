//! Batch conversion of the raw holding area into the library.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::job::{ConversionJob, JobStatus};
use super::progress::{ConversionStatus, PipelineStatus, StatusBoard};
use super::queue::{ConversionQueue, QueueItem};
use super::transcoder::{output_file_name, unique_destination, Transcoder};
use crate::config::Settings;
use crate::error::{Result, SlideError};
use crate::lock::{LockAttempt, LockFile, LockPayload};
use crate::media::MediaKind;
use crate::persist::SnapshotStore;

/// Holder name written into the lock file.
pub const LOCK_HOLDER: &str = "converter";

/// Called after every finished batch, outside the lock.
pub type CompletionHook = Arc<dyn Fn(&BatchReport) + Send + Sync>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub jobs: Vec<ConversionJob>,
    pub converted: usize,
    pub failed: usize,
    pub cancelled: bool,
}

#[derive(Debug)]
pub enum BatchOutcome {
    Finished(BatchReport),
    /// Nothing waiting in the raw holding area.
    Empty,
    /// Another pass holds the lock file.
    Busy(Option<LockPayload>),
}

/// What [`ConverterPipeline::start`] did.
#[derive(Debug)]
pub enum StartOutcome {
    Started { pending: usize, handle: JoinHandle<()> },
    AlreadyRunning,
    NothingToConvert,
}

struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ConverterPipeline {
    converted_dir: PathBuf,
    lock: LockFile,
    queue: Mutex<ConversionQueue>,
    transcoder: Arc<dyn Transcoder>,
    board: StatusBoard,
    running: AtomicBool,
    restart: AtomicBool,
    stop: Mutex<CancellationToken>,
    hook: Mutex<Option<CompletionHook>>,
}

impl std::fmt::Debug for ConverterPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverterPipeline")
            .field("converted_dir", &self.converted_dir)
            .field("lock", &self.lock)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl ConverterPipeline {
    pub fn new(
        store: SnapshotStore,
        raw_dir: impl Into<PathBuf>,
        converted_dir: impl Into<PathBuf>,
        lock: LockFile,
        transcoder: Arc<dyn Transcoder>,
    ) -> Result<Self> {
        Ok(Self {
            converted_dir: converted_dir.into(),
            lock,
            queue: Mutex::new(ConversionQueue::open(store, raw_dir)?),
            transcoder,
            board: StatusBoard::new(),
            running: AtomicBool::new(false),
            restart: AtomicBool::new(false),
            stop: Mutex::new(CancellationToken::new()),
            hook: Mutex::new(None),
        })
    }

    /// Pipeline wired to the directories and lock file named in `settings`.
    pub fn from_settings(
        settings: &Settings,
        store: SnapshotStore,
        transcoder: Arc<dyn Transcoder>,
    ) -> Result<Self> {
        Self::new(
            store,
            settings.raw_dir_path(),
            settings.converted_dir_path(),
            LockFile::new(settings.lock_path(), settings.lock_stale_after()),
            transcoder,
        )
    }

    fn queue(&self) -> MutexGuard<'_, ConversionQueue> {
        self.queue.lock().expect("conversion queue lock poisoned")
    }

    fn stop_token(&self) -> CancellationToken {
        self.stop.lock().expect("stop token lock poisoned").clone()
    }

    pub fn set_completion_hook(&self, hook: CompletionHook) {
        *self.hook.lock().expect("hook lock poisoned") = Some(hook);
    }

    pub fn status(&self) -> ConversionStatus {
        self.board.snapshot()
    }

    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    /// Pick up new raw files. Returns how many were queued.
    pub fn enqueue_new_files(&self) -> Result<usize> {
        self.queue().refresh_from_disk()
    }

    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    pub fn failed(&self) -> Vec<String> {
        self.queue().failed().iter().cloned().collect()
    }

    /// Release failed files so the next batch tries them again.
    pub fn retry_failed(&self) -> Result<usize> {
        let mut queue = self.queue();
        let released = queue.retry_failed()?;
        queue.refresh_from_disk()?;
        Ok(released)
    }

    /// True while this process converts or anyone holds the lock file.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) || self.lock.is_held()
    }

    /// Ask a running batch to stop after the current file.
    pub fn request_stop(&self) {
        self.stop_token().cancel();
    }

    /// Stop after the current file and start over with a fresh queue scan.
    /// Returns false when no batch is running here.
    pub fn request_restart(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        self.restart.store(true, Ordering::SeqCst);
        self.board.set_status(PipelineStatus::Restarting);
        self.request_stop();
        info!("Converter restart requested");
        true
    }

    /// Start a batch on the blocking pool unless one is running or nothing waits.
    pub fn start(self: &Arc<Self>) -> Result<StartOutcome> {
        if self.is_running() {
            return Ok(StartOutcome::AlreadyRunning);
        }
        self.enqueue_new_files()?;
        let pending = self.pending();
        if pending == 0 {
            self.board.begin(PipelineStatus::Idle, 0);
            return Ok(StartOutcome::NothingToConvert);
        }

        self.board.begin(PipelineStatus::Scheduled, pending);
        let pipeline = Arc::clone(self);
        let handle = tokio::task::spawn_blocking(move || {
            loop {
                match pipeline.run_batch() {
                    Ok(BatchOutcome::Finished(_)) if pipeline.restart.swap(false, Ordering::SeqCst) => {
                        info!("Converter restarting");
                    }
                    Ok(_) => break,
                    Err(e) => {
                        warn!(error = %e, "Conversion batch failed");
                        pipeline.board.finish(PipelineStatus::Failed);
                        break;
                    }
                }
            }
        });
        info!(pending, "Conversion started");
        Ok(StartOutcome::Started { pending, handle })
    }

    /// Convert everything pending, one file at a time, under the lock file.
    ///
    /// A failing file is recorded and parked; the batch moves on. The stop
    /// token is honoured between files.
    #[instrument(skip_all)]
    pub fn run_batch(&self) -> Result<BatchOutcome> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SlideError::ConversionRunning);
        }
        let _running = RunningFlag(&self.running);
        *self.stop.lock().expect("stop token lock poisoned") = CancellationToken::new();

        let guard = match self.lock.try_acquire(LOCK_HOLDER)? {
            LockAttempt::Acquired(guard) => guard,
            LockAttempt::Busy(holder) => {
                info!(?holder, "Lock held elsewhere, conversion deferred");
                self.board.set_status(PipelineStatus::Idle);
                return Ok(BatchOutcome::Busy(holder));
            }
        };

        self.enqueue_new_files()?;
        let total = self.pending();
        if total == 0 {
            self.board.begin(PipelineStatus::Idle, 0);
            return Ok(BatchOutcome::Empty);
        }
        self.board.begin(PipelineStatus::Running, total);
        info!(total, "Conversion batch started");

        let cancel = self.stop_token();
        let mut report = BatchReport::default();
        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let Some(item) = self.queue().begin_next()? else {
                break;
            };
            let job = self.convert_item(&item);
            match job.status {
                JobStatus::Done => {
                    report.converted += 1;
                    self.queue().complete(&item)?;
                }
                _ => {
                    report.failed += 1;
                    self.queue().mark_failed(&item)?;
                }
            }
            self.board.file_finished();
            report.jobs.push(job);

            let waiting = {
                let mut queue = self.queue();
                queue.refresh_from_disk()?;
                queue.len()
            };
            self.board.grow(report.jobs.len() + waiting);
        }
        drop(guard);

        let status = if report.cancelled && self.restart.load(Ordering::SeqCst) {
            PipelineStatus::Restarting
        } else if report.converted == 0 && report.failed > 0 {
            PipelineStatus::Failed
        } else if report.cancelled {
            PipelineStatus::Idle
        } else {
            PipelineStatus::Done
        };
        self.board.finish(status);
        info!(
            converted = report.converted,
            failed = report.failed,
            cancelled = report.cancelled,
            status = %status,
            "Conversion batch finished"
        );

        let hook = self.hook.lock().expect("hook lock poisoned").clone();
        if let Some(hook) = hook {
            hook(&report);
        }
        Ok(BatchOutcome::Finished(report))
    }

    /// Convert a single raw file outside the queue, under the lock file.
    pub fn convert(&self, path: &Path) -> Result<ConversionJob> {
        let kind = MediaKind::from_path(path).ok_or_else(|| SlideError::ConversionFailed {
            file: path.display().to_string(),
            reason: "not a supported media file".to_string(),
        })?;
        let _guard = self.lock.acquire(LOCK_HOLDER)?;
        Ok(self.convert_path(path, kind))
    }

    fn convert_item(&self, item: &QueueItem) -> ConversionJob {
        let source = self.queue().absolute_path(item);
        self.convert_path(&source, item.kind)
    }

    #[instrument(skip_all, fields(source = %source.display(), kind = %kind))]
    fn convert_path(&self, source: &Path, kind: MediaKind) -> ConversionJob {
        let mut job = ConversionJob::new(source, kind);
        job.start();
        let name = job.file_name();
        self.board.file_started(&name);

        let taken = self.transcoder.capture_time(kind, source).unwrap_or_else(|| {
            fs::metadata(source)
                .and_then(|m| m.modified())
                .map_or_else(|_| Local::now(), DateTime::from)
        });
        if let Err(e) = fs::create_dir_all(&self.converted_dir) {
            let message = format!("cannot create {}: {e}", self.converted_dir.display());
            warn!(file = %name, error = %message, "Conversion failed");
            self.board.record_error(&name, &message);
            job.fail(message);
            return job;
        }
        let destination = unique_destination(&self.converted_dir, &output_file_name(source, taken, kind));

        let started = Instant::now();
        let progress = |percent: f32| {
            let eta = (percent > 0.0).then(|| {
                let elapsed = started.elapsed().as_secs_f32();
                (elapsed * (100.0 - percent) / percent).round() as u64
            });
            self.board.file_progress(percent, eta);
        };

        match self.transcoder.transcode(kind, source, &destination, &progress) {
            Ok(()) => {
                if let Err(e) = fs::remove_file(source) {
                    warn!(source = %source.display(), error = %e, "Converted, but raw file could not be removed");
                }
                info!(
                    file = %name,
                    output = %destination.display(),
                    elapsed_ms = started.elapsed().as_millis(),
                    "Converted"
                );
                job.finish(destination);
            }
            Err(e) => {
                let message = e.to_string();
                warn!(file = %name, error = %message, "Conversion failed");
                self.board.record_error(&name, &message);
                job.fail(message);
            }
        }
        debug!(status = %job.status, "Job finished");
        job
    }
}
