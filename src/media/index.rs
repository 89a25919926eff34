//! Collection Index: scans the media root into collections of entries.
//!
//! Every directory under the media root is a collection holding the media
//! files directly inside it. The index is rebuilt wholesale on every refresh
//! and never touches the filesystem beyond reading it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;

use super::kind::{normalize_collection_id, MediaKey, MediaKind, ROOT_COLLECTION};
use crate::config::{under_root, Settings};

/// A single media file as seen by the last refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionEntry {
    pub key: MediaKey,
    pub absolute_path: PathBuf,
    pub kind: MediaKind,
    pub size_bytes: u64,
    pub mtime: DateTime<Utc>,
}

/// Summary of one collection, for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionInfo {
    pub id: String,
    pub display_name: String,
    pub display_path: String,
    pub depth: usize,
    pub files_count: usize,
}

#[derive(Debug, Clone)]
struct Collection {
    info: CollectionInfo,
    entries: Vec<CollectionEntry>,
}

/// What the index leaves out.
#[derive(Debug, Clone, Default)]
pub struct IndexFilter {
    /// Generated video preview frames end with this suffix.
    pub preview_suffix: String,
    /// Raw upload holding area; nothing below it is indexed.
    pub raw_dir: Option<PathBuf>,
}

impl IndexFilter {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            preview_suffix: settings.preview_suffix.clone(),
            raw_dir: Some(under_root(&settings.media_root, &settings.raw_dir)),
        }
    }

    /// True for generated preview frames.
    pub fn is_preview(&self, path: &Path) -> bool {
        !self.preview_suffix.is_empty()
            && path
                .to_str()
                .is_some_and(|p| p.ends_with(self.preview_suffix.as_str()))
    }
}

/// Errors that abort a refresh. Per-entry problems are skipped, not raised.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The media root does not exist.
    #[error("media root not found: {0}")]
    RootNotFound(PathBuf),

    /// The media root is not a directory.
    #[error("media root is not a directory: {0}")]
    NotADirectory(PathBuf),
}

impl From<ScanError> for crate::error::SlideError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::RootNotFound(path) => Self::MediaRootNotFound { path },
            ScanError::NotADirectory(path) => Self::MediaRootNotDirectory { path },
        }
    }
}

/// Immutable result of one scan.
#[derive(Debug, Clone)]
pub struct CollectionIndex {
    root: PathBuf,
    collections: Vec<Collection>,
    by_id: HashMap<String, usize>,
    by_key: HashMap<MediaKey, (usize, usize)>,
    skipped: Vec<(PathBuf, String)>,
    photos: usize,
    videos: usize,
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| n.starts_with('.'))
}

fn canonical_or_self(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

impl CollectionIndex {
    /// An index with no collections.
    pub fn empty(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            collections: Vec::new(),
            by_id: HashMap::new(),
            by_key: HashMap::new(),
            skipped: Vec::new(),
            photos: 0,
            videos: 0,
        }
    }

    /// Scan `media_root` and build a fresh index.
    ///
    /// Hidden entries, preview frames and the raw holding area are excluded.
    /// Unreadable entries are logged and listed in [`Self::skipped`].
    #[instrument(skip_all, fields(root = %media_root.display()))]
    pub fn refresh(media_root: &Path, filter: &IndexFilter) -> Result<Self, ScanError> {
        if !media_root.exists() {
            return Err(ScanError::RootNotFound(media_root.to_path_buf()));
        }
        if !media_root.is_dir() {
            return Err(ScanError::NotADirectory(media_root.to_path_buf()));
        }

        let root = canonical_or_self(media_root);
        let raw_dir = filter.raw_dir.as_deref().map(canonical_or_self);
        let mut index = Self::empty(root.clone());
        let mut entries_by_dir: HashMap<String, Vec<CollectionEntry>> = HashMap::new();
        let mut dirs: BTreeSet<String> = BTreeSet::new();

        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 {
                    return true;
                }
                if is_hidden(e.file_name()) {
                    trace!(path = %e.path().display(), "Skipping hidden entry");
                    return false;
                }
                if let Some(raw) = &raw_dir {
                    if e.path().starts_with(raw) {
                        trace!(path = %e.path().display(), "Skipping raw holding area");
                        return false;
                    }
                }
                true
            });

        for item in walker {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    warn!(path = %path.display(), error = %e, "Skipping inaccessible entry");
                    index.skipped.push((path, e.to_string()));
                    continue;
                }
            };

            let Ok(rel) = entry.path().strip_prefix(&root) else {
                continue;
            };

            if entry.file_type().is_dir() {
                let id = if rel.as_os_str().is_empty() {
                    ROOT_COLLECTION.to_string()
                } else {
                    match MediaKey::from_relative(rel) {
                        Some(key) => normalize_collection_id(key.as_str()),
                        None => {
                            warn!(path = %entry.path().display(), "Skipping non UTF-8 directory");
                            continue;
                        }
                    }
                };
                dirs.insert(id);
                continue;
            }

            let path = entry.path();
            let Some(kind) = MediaKind::from_path(path) else {
                continue;
            };
            if filter.is_preview(path) {
                trace!(path = %path.display(), "Skipping preview frame");
                continue;
            }
            let Some(key) = MediaKey::from_relative(rel) else {
                warn!(path = %path.display(), "Skipping non UTF-8 file name");
                continue;
            };

            // Follows symlinks so linked media stays playable.
            let metadata = match std::fs::metadata(path) {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                    index.skipped.push((path.to_path_buf(), e.to_string()));
                    continue;
                }
            };
            let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

            entries_by_dir
                .entry(key.collection_id())
                .or_default()
                .push(CollectionEntry {
                    key,
                    absolute_path: path.to_path_buf(),
                    kind,
                    size_bytes: metadata.len(),
                    mtime: DateTime::<Utc>::from(mtime),
                });
        }

        for id in dirs {
            let mut entries = entries_by_dir.remove(&id).unwrap_or_default();
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            index.push_collection(id, entries);
        }
        index
            .collections
            .sort_by(|a, b| a.info.display_path.cmp(&b.info.display_path));
        index.rebuild_lookups();

        info!(
            collections = index.collections.len(),
            photos = index.photos,
            videos = index.videos,
            skipped = index.skipped.len(),
            "Collection index refreshed"
        );
        Ok(index)
    }

    fn push_collection(&mut self, id: String, entries: Vec<CollectionEntry>) {
        let depth = if id == ROOT_COLLECTION {
            0
        } else {
            id.split('/').count()
        };
        let display_name = if id == ROOT_COLLECTION {
            ROOT_COLLECTION.to_string()
        } else {
            id.rsplit('/').next().unwrap_or(&id).to_string()
        };
        let display_path = if id == ROOT_COLLECTION {
            ROOT_COLLECTION.to_string()
        } else {
            format!("/{id}")
        };
        self.collections.push(Collection {
            info: CollectionInfo {
                id,
                display_name,
                display_path,
                depth,
                files_count: entries.len(),
            },
            entries,
        });
    }

    fn rebuild_lookups(&mut self) {
        self.by_id.clear();
        self.by_key.clear();
        self.photos = 0;
        self.videos = 0;
        for (ci, collection) in self.collections.iter().enumerate() {
            self.by_id.insert(collection.info.id.clone(), ci);
            for (ei, entry) in collection.entries.iter().enumerate() {
                self.by_key.insert(entry.key.clone(), (ci, ei));
                match entry.kind {
                    MediaKind::Image => self.photos += 1,
                    MediaKind::Video => self.videos += 1,
                }
            }
        }
        debug!(keys = self.by_key.len(), "Index lookups rebuilt");
    }

    /// Canonical media root this index was built from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Collection summaries, ordered by display path (root first).
    pub fn infos(&self) -> Vec<CollectionInfo> {
        self.collections.iter().map(|c| c.info.clone()).collect()
    }

    /// Collection ids in discovery order.
    pub fn collection_ids(&self) -> Vec<String> {
        self.collections.iter().map(|c| c.info.id.clone()).collect()
    }

    pub fn has_collection(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Entries of one collection, ordered by key.
    pub fn entries(&self, id: &str) -> &[CollectionEntry] {
        self.by_id
            .get(id)
            .map_or(&[], |&ci| self.collections[ci].entries.as_slice())
    }

    /// Every entry, collection by collection, in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &CollectionEntry> {
        self.collections.iter().flat_map(|c| c.entries.iter())
    }

    pub fn get(&self, key: &MediaKey) -> Option<&CollectionEntry> {
        self.by_key
            .get(key)
            .map(|&(ci, ei)| &self.collections[ci].entries[ei])
    }

    pub fn contains(&self, key: &MediaKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Deduplicated keys of the given collections in discovery order
    /// (collection display path, then key). Unknown ids are ignored.
    pub fn keys_for(&self, ids: &BTreeSet<String>) -> Vec<MediaKey> {
        let mut seen = HashSet::new();
        self.collections
            .iter()
            .filter(|c| ids.contains(&c.info.id))
            .flat_map(|c| c.entries.iter())
            .filter(|e| seen.insert(e.key.clone()))
            .map(|e| e.key.clone())
            .collect()
    }

    /// Entries that could not be read during the last refresh.
    pub fn skipped(&self) -> &[(PathBuf, String)] {
        &self.skipped
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub const fn photo_count(&self) -> usize {
        self.photos
    }

    pub const fn video_count(&self) -> usize {
        self.videos
    }
}
