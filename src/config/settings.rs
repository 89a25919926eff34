//! Runtime settings consumed by the core.
//!
//! Settings come from an optional TOML file; every field has a default so an
//! empty file (or no file at all) is valid. Relative paths in the file are
//! resolved against the file's directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::path::{resolve_path, under_root};
use crate::error::{Result, SlideError};

/// Idle window used when `debug` is enabled.
pub const DEBUG_IDLE_SECONDS: u64 = 10;

/// Lower bound for a device's photo display time.
pub const MIN_PHOTO_SECONDS: u32 = 5;

/// Core settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Root directory holding all collections.
    pub media_root: PathBuf,
    /// Directory for snapshots and the lock file.
    pub storage_dir: PathBuf,
    /// Quiet period required before a dedup pass runs.
    pub idle_seconds: u64,
    /// Shortens the idle window to [`DEBUG_IDLE_SECONDS`].
    pub debug: bool,
    /// Filename suffix of generated video preview frames.
    pub preview_suffix: String,
    /// Raw upload holding area (relative to `media_root` unless absolute).
    pub raw_dir: PathBuf,
    /// Destination for converted uploads (relative to `media_root` unless absolute).
    pub converted_dir: PathBuf,
    /// Lock file (relative to `storage_dir` unless absolute).
    pub lock_file: PathBuf,
    /// Age after which a leftover lock file is reclaimed.
    pub lock_stale_seconds: u64,
    /// Debounce window for raw-area change signals.
    pub converter_throttle_seconds: u64,
    /// Photo display time for devices that never changed it.
    pub default_photo_seconds: u32,
    /// Added to a video's duration before the page refreshes.
    pub video_padding_seconds: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            media_root: PathBuf::from("gallery"),
            storage_dir: PathBuf::from("storage"),
            idle_seconds: 900,
            debug: false,
            preview_suffix: "_background.jpg".to_string(),
            raw_dir: PathBuf::from("uploaded_raw"),
            converted_dir: PathBuf::from("uploaded"),
            lock_file: PathBuf::from("convert.lock"),
            lock_stale_seconds: 6 * 60 * 60,
            converter_throttle_seconds: 10,
            default_photo_seconds: 15,
            video_padding_seconds: 3,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SlideError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }
        let text = std::fs::read_to_string(path)?;
        let mut settings = Self::from_toml_str(&text)?;

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        settings.media_root = resolve_path(&settings.media_root, base)?;
        settings.storage_dir = resolve_path(&settings.storage_dir, base)?;

        info!(
            media_root = %settings.media_root.display(),
            storage_dir = %settings.storage_dir.display(),
            "Loaded settings"
        );
        Ok(settings)
    }

    /// Parse settings from TOML text without resolving paths.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SlideError::ConfigParse(e.to_string()))
    }

    /// Apply command-line overrides on top of file settings.
    pub fn with_overrides(
        mut self,
        media_root: Option<PathBuf>,
        storage_dir: Option<PathBuf>,
        debug: bool,
    ) -> Self {
        if let Some(root) = media_root {
            debug!(media_root = %root.display(), "Overriding media root");
            self.media_root = root;
        }
        if let Some(dir) = storage_dir {
            debug!(storage_dir = %dir.display(), "Overriding storage dir");
            self.storage_dir = dir;
        }
        self.debug |= debug;
        self
    }

    /// Check invariants the core relies on.
    pub fn validate(&self) -> Result<()> {
        if self.idle_seconds == 0 {
            return Err(SlideError::ConfigInvalid(
                "idle_seconds must be greater than zero".to_string(),
            ));
        }
        if !self.media_root.exists() {
            return Err(SlideError::MediaRootNotFound {
                path: self.media_root.clone(),
            });
        }
        if !self.media_root.is_dir() {
            return Err(SlideError::MediaRootNotDirectory {
                path: self.media_root.clone(),
            });
        }
        if self.default_photo_seconds < MIN_PHOTO_SECONDS {
            return Err(SlideError::ConfigInvalid(format!(
                "default_photo_seconds must be at least {MIN_PHOTO_SECONDS}"
            )));
        }
        Ok(())
    }

    /// Effective idle quiescence window.
    pub fn idle_window(&self) -> Duration {
        if self.debug {
            Duration::from_secs(self.idle_seconds.min(DEBUG_IDLE_SECONDS))
        } else {
            Duration::from_secs(self.idle_seconds)
        }
    }

    /// Absolute raw upload holding area.
    pub fn raw_dir_path(&self) -> PathBuf {
        under_root(&self.media_root, &self.raw_dir)
    }

    /// Absolute destination for converted media.
    pub fn converted_dir_path(&self) -> PathBuf {
        under_root(&self.media_root, &self.converted_dir)
    }

    /// Absolute lock file location.
    pub fn lock_path(&self) -> PathBuf {
        under_root(&self.storage_dir, &self.lock_file)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_seconds)
    }

    pub fn converter_throttle(&self) -> Duration {
        Duration::from_secs(self.converter_throttle_seconds)
    }
}
