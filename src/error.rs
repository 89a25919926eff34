//! Error types for slideshow operations.

use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for slideshow operations.
#[derive(Error, Debug)]
pub enum SlideError {
    // Media index errors
    #[error("Media root not found: {path}")]
    MediaRootNotFound { path: PathBuf },

    #[error("Media root is not a directory: {path}")]
    MediaRootNotDirectory { path: PathBuf },

    // Device errors
    #[error("Invalid device id {device_id:?}: {reason}")]
    InvalidDeviceId { device_id: String, reason: String },

    #[error("Unknown collection: {name}")]
    UnknownCollection { name: String },

    // Snapshot errors
    #[error("Snapshot {path} is corrupt: {reason}")]
    SnapshotCorrupt { path: PathBuf, reason: String },

    #[error("Snapshot {path} has schema version {found}, expected {expected}")]
    SnapshotVersion {
        path: PathBuf,
        found: u16,
        expected: u16,
    },

    #[error("Snapshot encoding failed: {0}")]
    SnapshotEncode(#[from] rmp_serde::encode::Error),

    #[error("Snapshot decoding failed: {0}")]
    SnapshotDecode(#[from] rmp_serde::decode::Error),

    // Lock errors
    #[error("Lock file {path} is held by pid {pid} since {started}")]
    LockHeld {
        path: PathBuf,
        pid: u32,
        started: String,
    },

    // Conversion errors
    #[error("Conversion of {file} failed: {reason}")]
    ConversionFailed { file: String, reason: String },

    #[error("Conversion is already running")]
    ConversionRunning,

    #[error("Transcoding failed: {0}")]
    Transcode(#[from] crate::convert::TranscodeError),

    // Configuration errors
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("Configuration parse error: {0}")]
    ConfigParse(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl SlideError {
    /// Returns true if the error is recoverable by the user.
    pub const fn is_user_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MediaRootNotFound { .. }
                | Self::MediaRootNotDirectory { .. }
                | Self::InvalidDeviceId { .. }
                | Self::UnknownCollection { .. }
                | Self::LockHeld { .. }
                | Self::ConfigNotFound { .. }
                | Self::ConfigInvalid(_)
        )
    }

    /// Returns a suggestion for how to fix the error.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::MediaRootNotFound { .. } => Some("Set --media-dir or media_root in the config file"),
            Self::UnknownCollection { .. } => Some("Run: slideshow scan"),
            Self::LockHeld { .. } => Some("Wait for the running pass to finish, or remove a stale lock file"),
            Self::SnapshotVersion { .. } | Self::SnapshotCorrupt { .. } => {
                Some("Delete the snapshot file to start from a fresh state")
            }
            Self::ConfigNotFound { .. } => Some("Pass --config with an existing TOML file"),
            _ => None,
        }
    }
}

/// Convenience type alias for Results using SlideError.
pub type Result<T> = std::result::Result<T, SlideError>;

/// Extension trait for adding context to errors.
pub trait ResultExt<T> {
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| SlideError::Other(format!("{}: {e}", f().into())))
    }
}
