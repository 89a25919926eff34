//! Configuration module.
//!
//! Loads [`Settings`] from an optional TOML file and resolves the paths the
//! core works with (media root, storage directory, raw holding area, lock file).

mod path;
mod settings;

pub use path::{home_dir, resolve_path, under_root};
pub use settings::{Settings, DEBUG_IDLE_SECONDS, MIN_PHOTO_SECONDS};
