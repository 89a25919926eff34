//! Slideshow core library.
//!
//! Serves photo and video slideshows to many devices at once. Each device
//! gets its own persisted playback queue; a background deduplicator
//! hardlinks identical files across collections; a converter normalizes
//! uploads into the library.
//!
//! # Modules
//!
//! - `media`: collection index over the media root
//! - `queue`: per-device settings and playback queues
//! - `dedup`: content-hash dedup pass and its idle scheduler
//! - `convert`: upload conversion pipeline and watchdog
//! - `persist`: versioned snapshot files with atomic replace
//! - `service`: coordinator wiring the above to change signals
#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod convert;
pub mod dedup;
pub mod durations;
pub mod error;
pub mod fsops;
pub mod hasher;
pub mod lock;
pub mod logging;
pub mod media;
pub mod persist;
pub mod queue;
pub mod service;

pub use error::{Result, SlideError};
pub use service::{ChangeKind, Slideshow};
