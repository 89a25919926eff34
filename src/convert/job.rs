//! A single file conversion and its one-way status.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::media::MediaKind;

/// Where a job is in its life. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Failed) | (Self::Running, Self::Done | Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionJob {
    pub source_path: PathBuf,
    pub kind: MediaKind,
    pub status: JobStatus,
    pub percent_complete: f32,
    pub output_path: Option<PathBuf>,
    pub error_message: Option<String>,
}

impl ConversionJob {
    pub fn new(source_path: impl Into<PathBuf>, kind: MediaKind) -> Self {
        Self {
            source_path: source_path.into(),
            kind,
            status: JobStatus::Pending,
            percent_complete: 0.0,
            output_path: None,
            error_message: None,
        }
    }

    fn advance(&mut self, next: JobStatus) -> bool {
        if self.status.can_become(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    pub fn start(&mut self) -> bool {
        self.advance(JobStatus::Running)
    }

    /// Record progress while running; values are clamped to 0..=100.
    pub fn set_percent(&mut self, percent: f32) {
        if self.status == JobStatus::Running {
            self.percent_complete = percent.clamp(0.0, 100.0);
        }
    }

    pub fn finish(&mut self, output: PathBuf) -> bool {
        let moved = self.advance(JobStatus::Done);
        if moved {
            self.percent_complete = 100.0;
            self.output_path = Some(output);
        }
        moved
    }

    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        let moved = self.advance(JobStatus::Failed);
        if moved {
            self.error_message = Some(message.into());
        }
        moved
    }

    /// Display name of the source file.
    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
