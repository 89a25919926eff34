//! Snapshot storage for durable state.
//!
//! Every durable entity lives in its own file so a bad write can only ever
//! affect one entity, and every write goes through a temp file + rename.
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── convert.lock               # present while files under the media root are rewritten
//! ├── default_collections.snap   # collection selection for devices without their own
//! ├── durations.snap             # video duration cache keyed by path
//! ├── conversion_queue.snap      # pending + failed raw uploads
//! └── device_<id>.snap           # settings + queue + cursor, one per device
//! ```

mod snapshot;
mod store;

pub use snapshot::{decode, encode, write_atomic, SnapshotEntity, MAGIC};
pub use store::{SnapshotStore, SNAPSHOT_EXT};
