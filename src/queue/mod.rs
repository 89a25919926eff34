//! Per-device playback queues.
//!
//! Each device owns a [`DeviceRecord`] (settings plus queue) guarded by its
//! own lock and persisted after every change, so unrelated devices never
//! wait on each other and a restart resumes at the persisted cursor.

pub mod manager;
pub mod settings;
pub mod state;

pub use manager::{
    validate_device_id, DeviceQueueManager, NextItem, NextMedia, DEFAULTS_SNAPSHOT, DEVICE_PREFIX,
};
pub use settings::{normalize_selection, Applied, DeviceSettings, SettingsUpdate};
pub use state::{DeviceQueueState, DeviceRecord};
