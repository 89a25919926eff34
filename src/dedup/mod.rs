//! Content deduplication with hardlinks.
//!
//! [`Deduplicator::run_once`] does the work; [`DedupScheduler`] decides when,
//! batching change signals behind an idle window and the shared lock file.

mod pass;
mod scheduler;

pub use pass::{DedupReport, Deduplicator};
pub use scheduler::{run_locked, DedupScheduler, SchedulerState, LOCK_HOLDER};
