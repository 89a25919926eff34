//! Versioned binary snapshot format.
//!
//! ```text
//! +--------+---------+------------------------------+
//! | "SLSN" | u16 LE  | MessagePack payload (named)  |
//! | magic  | version |                              |
//! +--------+---------+------------------------------+
//! ```
//!
//! The version belongs to the entity type, so each entity can evolve its
//! schema independently. A mismatched version is reported, never coerced.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::trace;

use crate::error::{Result, SlideError};

/// File magic for every snapshot.
pub const MAGIC: &[u8; 4] = b"SLSN";

const HEADER_LEN: usize = MAGIC.len() + 2;

/// A durable entity with an explicit schema version.
pub trait SnapshotEntity: Serialize + DeserializeOwned {
    /// Bumped whenever the serialized shape changes incompatibly.
    const VERSION: u16;
}

/// Encode an entity into snapshot bytes.
pub fn encode<T: SnapshotEntity>(value: &T) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(value)?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&T::VERSION.to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode snapshot bytes read from `path`.
pub fn decode<T: SnapshotEntity>(path: &Path, bytes: &[u8]) -> Result<T> {
    if bytes.len() < HEADER_LEN {
        return Err(SlideError::SnapshotCorrupt {
            path: path.to_path_buf(),
            reason: format!("truncated header ({} bytes)", bytes.len()),
        });
    }
    let (magic, rest) = bytes.split_at(MAGIC.len());
    if magic != MAGIC {
        return Err(SlideError::SnapshotCorrupt {
            path: path.to_path_buf(),
            reason: "bad magic".to_string(),
        });
    }
    let found = u16::from_le_bytes([rest[0], rest[1]]);
    if found != T::VERSION {
        return Err(SlideError::SnapshotVersion {
            path: path.to_path_buf(),
            found,
            expected: T::VERSION,
        });
    }
    Ok(rmp_serde::from_slice(&rest[2..])?)
}

/// Write `bytes` to `path` via a temp file in the same directory and a rename.
///
/// Readers observe either the previous content or the new content, never a
/// partial write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| SlideError::Io(e.error))?;

    trace!(path = %path.display(), len = bytes.len(), "Snapshot written");
    Ok(())
}
