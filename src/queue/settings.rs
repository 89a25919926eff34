//! Per-device playback settings.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::MIN_PHOTO_SECONDS;
use crate::media::normalize_collection_id;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Friendly label shown in admin listings.
    pub name: String,
    /// Seconds a photo stays on screen; never below [`MIN_PHOTO_SECONDS`].
    pub photo_seconds: u32,
    pub only_photo: bool,
    /// Append new media at the tail instead of shuffling.
    pub sequential_mode: bool,
    pub show_counters: bool,
    pub show_names: bool,
    pub modern_mode: bool,
    pub video_background: bool,
    pub user_agent: String,
    pub ip_address: String,
    /// `None` follows the default selection.
    pub active_collections: Option<BTreeSet<String>>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            photo_seconds: 15,
            only_photo: false,
            sequential_mode: false,
            show_counters: false,
            show_names: false,
            modern_mode: false,
            video_background: false,
            user_agent: String::new(),
            ip_address: String::new(),
            active_collections: None,
        }
    }
}

impl DeviceSettings {
    /// Defaults with the configured photo time.
    pub fn with_photo_seconds(photo_seconds: u32) -> Self {
        Self {
            photo_seconds: photo_seconds.max(MIN_PHOTO_SECONDS),
            ..Self::default()
        }
    }
}

/// Normalize and dedupe a user-supplied collection selection.
pub fn normalize_selection<I, S>(ids: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    ids.into_iter()
        .map(|id| normalize_collection_id(id.as_ref()))
        .collect()
}

/// Partial settings change. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsUpdate {
    pub name: Option<String>,
    pub photo_seconds: Option<u32>,
    pub only_photo: Option<bool>,
    pub sequential_mode: Option<bool>,
    pub show_counters: Option<bool>,
    pub show_names: Option<bool>,
    pub modern_mode: Option<bool>,
    pub video_background: Option<bool>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    /// `Some(None)` switches the device back to the default selection.
    pub active_collections: Option<Option<BTreeSet<String>>>,
}

/// Effect of applying a [`SettingsUpdate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub changed: bool,
    /// Queue must be regenerated.
    pub rebuild: bool,
}

fn set<T: PartialEq>(slot: &mut T, value: Option<T>) -> bool {
    match value {
        Some(v) if *slot != v => {
            *slot = v;
            true
        }
        _ => false,
    }
}

impl SettingsUpdate {
    /// Record how a client reached the server.
    pub fn client(user_agent: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            user_agent: Some(user_agent.into()),
            ip_address: Some(ip_address.into()),
            ..Self::default()
        }
    }

    pub fn apply(self, settings: &mut DeviceSettings) -> Applied {
        let mut changed = false;
        changed |= set(&mut settings.name, self.name);
        changed |= set(
            &mut settings.photo_seconds,
            self.photo_seconds.map(|s| s.max(MIN_PHOTO_SECONDS)),
        );
        changed |= set(&mut settings.only_photo, self.only_photo);
        changed |= set(&mut settings.show_counters, self.show_counters);
        changed |= set(&mut settings.show_names, self.show_names);
        changed |= set(&mut settings.modern_mode, self.modern_mode);
        changed |= set(&mut settings.video_background, self.video_background);
        changed |= set(&mut settings.user_agent, self.user_agent);
        changed |= set(&mut settings.ip_address, self.ip_address);

        let mode = set(&mut settings.sequential_mode, self.sequential_mode);
        let selection = set(
            &mut settings.active_collections,
            self.active_collections.map(|s| s.map(normalize_selection)),
        );
        Applied {
            changed: changed || mode || selection,
            rebuild: mode || selection,
        }
    }
}
