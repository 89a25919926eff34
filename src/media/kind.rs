//! Media keys, kinds and collection identifiers.

use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

/// Collection id of the media root itself.
pub const ROOT_COLLECTION: &str = "/";

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "tif", "tiff", "heic",
];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "m4v"];

/// Kind of a media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classify a path by its extension; `None` for non-media files.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else {
            None
        }
    }

    pub const fn is_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => f.write_str("image"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Stable identifier of a media item: its `/`-separated path relative to
/// the media root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaKey(String);

impl MediaKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build a key from a path relative to the media root.
    ///
    /// Returns `None` for paths that are not plain relative UTF-8 paths.
    pub fn from_relative(path: &Path) -> Option<Self> {
        let mut parts = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(Self(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of the collection (directory) holding this item.
    pub fn collection_id(&self) -> String {
        match self.0.rsplit_once('/') {
            Some((parent, _)) => normalize_collection_id(parent),
            None => ROOT_COLLECTION.to_string(),
        }
    }

    /// Final path component.
    pub fn file_name(&self) -> &str {
        self.0.rsplit_once('/').map_or(self.0.as_str(), |(_, name)| name)
    }
}

impl fmt::Display for MediaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MediaKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Normalize a user-supplied collection id.
///
/// Empty input and bare slashes map to [`ROOT_COLLECTION`]; other ids lose
/// surrounding whitespace and slashes.
pub fn normalize_collection_id(id: &str) -> String {
    let cleaned = id.trim().trim_matches('/');
    if cleaned.is_empty() {
        ROOT_COLLECTION.to_string()
    } else {
        cleaned.to_string()
    }
}
