//! Converter status snapshot shared with whoever renders progress.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

/// Errors kept in the status snapshot.
pub const MAX_ERRORS: usize = 10;

/// Overall converter state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Idle,
    Scheduled,
    Running,
    Restarting,
    Done,
    Failed,
}

impl PipelineStatus {
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Scheduled | Self::Running | Self::Restarting)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Progress of the file being converted right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentFile {
    pub name: String,
    pub percent: f32,
    pub eta_seconds: Option<u64>,
}

/// One recorded conversion failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionError {
    pub timestamp: DateTime<Utc>,
    pub filename: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversionStatus {
    pub status: PipelineStatus,
    pub total: usize,
    pub processed: usize,
    pub remaining: usize,
    pub percent: f32,
    pub current: Option<CurrentFile>,
    pub errors: Vec<ConversionError>,
    pub last_update: Option<DateTime<Utc>>,
}

impl ConversionStatus {
    fn recompute(&mut self) {
        self.remaining = self.total.saturating_sub(self.processed);
        self.percent = if self.total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let pct = self.processed as f32 / self.total as f32 * 100.0;
            pct
        };
        self.last_update = Some(Utc::now());
    }
}

/// Publishes [`ConversionStatus`] updates to any number of watchers.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    tx: watch::Sender<ConversionStatus>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConversionStatus::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> ConversionStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversionStatus> {
        self.tx.subscribe()
    }

    fn update(&self, f: impl FnOnce(&mut ConversionStatus)) {
        self.tx.send_modify(|status| {
            f(status);
            status.recompute();
        });
    }

    pub fn set_status(&self, status: PipelineStatus) {
        self.update(|s| s.status = status);
    }

    /// Start a batch of `total` files. Earlier errors are kept.
    pub fn begin(&self, status: PipelineStatus, total: usize) {
        self.update(|s| {
            s.status = status;
            s.total = total;
            s.processed = 0;
            s.current = None;
        });
    }

    /// More files showed up while the batch runs.
    pub fn grow(&self, total: usize) {
        self.update(|s| s.total = s.total.max(total));
    }

    pub fn file_started(&self, name: &str) {
        self.update(|s| {
            s.current = Some(CurrentFile {
                name: name.to_string(),
                percent: 0.0,
                eta_seconds: None,
            });
        });
    }

    pub fn file_progress(&self, percent: f32, eta_seconds: Option<u64>) {
        self.update(|s| {
            if let Some(current) = s.current.as_mut() {
                current.percent = percent.clamp(0.0, 100.0);
                current.eta_seconds = eta_seconds;
            }
        });
    }

    pub fn file_finished(&self) {
        self.update(|s| {
            s.processed += 1;
            s.current = None;
        });
    }

    /// Record a failure, keeping the most recent [`MAX_ERRORS`].
    pub fn record_error(&self, filename: &str, message: &str) {
        self.update(|s| {
            s.errors.push(ConversionError {
                timestamp: Utc::now(),
                filename: filename.to_string(),
                message: message.to_string(),
            });
            if s.errors.len() > MAX_ERRORS {
                let excess = s.errors.len() - MAX_ERRORS;
                s.errors.drain(..excess);
            }
        });
    }

    pub fn finish(&self, status: PipelineStatus) {
        self.update(|s| {
            s.status = status;
            s.current = None;
        });
    }
}
