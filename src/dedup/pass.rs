//! One dedup pass: hash candidate files and hardlink duplicates.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::fsops::{FileIdentity, FileSystem, LocalFs};
use crate::hasher::{hash_file, ContentDigest};
use crate::media::CollectionIndex;

/// Counters for one pass. Logged as a single summary line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupReport {
    /// Index entries considered.
    pub scanned: usize,
    /// Files hashed.
    pub hashed: usize,
    /// Files found to duplicate an earlier canonical file.
    pub duplicates: usize,
    /// Duplicates replaced by a hardlink.
    pub replaced: usize,
    /// Files already sharing an inode with an earlier file.
    pub already_linked: usize,
    /// Duplicates left alone because they live on another volume.
    pub cross_fs_skipped: usize,
    pub symlinks_skipped: usize,
    pub hash_failed: usize,
    pub link_failed: usize,
    pub stat_failed: usize,
    /// The pass stopped early on request.
    pub cancelled: bool,
}

impl DedupReport {
    /// True when the pass changed nothing on disk.
    pub const fn is_noop(&self) -> bool {
        self.replaced == 0
    }
}

/// A distinct inode and every indexed path pointing at it.
#[derive(Debug)]
struct Candidate {
    identity: FileIdentity,
    paths: Vec<PathBuf>,
    dirty: bool,
}

/// Runs dedup passes over a [`CollectionIndex`].
#[derive(Clone)]
pub struct Deduplicator {
    fs: Arc<dyn FileSystem>,
}

impl std::fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator").finish_non_exhaustive()
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(Arc::new(LocalFs))
    }
}

impl Deduplicator {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    /// Deduplicate files of the `dirty` collections against the whole index.
    ///
    /// Only size groups holding at least one dirty file are hashed. Within a
    /// content group the earliest file in discovery order is canonical and
    /// every later file on the same volume is replaced by a hardlink to it.
    /// Per-file failures are counted and logged; the pass carries on. The
    /// token is checked between files, never inside one.
    #[instrument(skip_all, fields(dirty = dirty.len()))]
    pub fn run_once(
        &self,
        index: &CollectionIndex,
        dirty: &BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> DedupReport {
        let mut report = DedupReport::default();
        let by_size = self.collect_candidates(index, dirty, &mut report);

        'groups: for (size, group) in by_size {
            if group.len() < 2 || !group.iter().any(|c| c.dirty) {
                continue;
            }

            let mut by_digest: BTreeMap<ContentDigest, Vec<Candidate>> = BTreeMap::new();
            let mut order: Vec<ContentDigest> = Vec::new();
            for candidate in group {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'groups;
                }
                let path = &candidate.paths[0];
                match hash_file(path) {
                    Ok(digest) => {
                        report.hashed += 1;
                        let slot = by_digest.entry(digest).or_default();
                        if slot.is_empty() {
                            order.push(digest);
                        }
                        slot.push(candidate);
                    }
                    Err(e) => {
                        report.hash_failed += 1;
                        warn!(path = %path.display(), error = %e, "Unable to hash file");
                    }
                }
            }

            for digest in order {
                let Some(members) = by_digest.remove(&digest) else {
                    continue;
                };
                if members.len() < 2 {
                    continue;
                }
                debug!(size, digest = %digest, copies = members.len(), "Duplicate content group");
                if !self.link_group(&members, cancel, &mut report) {
                    break 'groups;
                }
            }
        }

        info!(
            scanned = report.scanned,
            hashed = report.hashed,
            duplicates = report.duplicates,
            replaced = report.replaced,
            already_linked = report.already_linked,
            cross_fs_skipped = report.cross_fs_skipped,
            symlinks_skipped = report.symlinks_skipped,
            hash_failed = report.hash_failed,
            link_failed = report.link_failed,
            stat_failed = report.stat_failed,
            cancelled = report.cancelled,
            "Dedup pass finished"
        );
        report
    }

    /// Stat every indexed file and group distinct inodes by size, keeping
    /// discovery order inside each group.
    fn collect_candidates(
        &self,
        index: &CollectionIndex,
        dirty: &BTreeSet<String>,
        report: &mut DedupReport,
    ) -> BTreeMap<u64, Vec<Candidate>> {
        let mut by_size: BTreeMap<u64, Vec<Candidate>> = BTreeMap::new();
        let mut seen: HashMap<FileIdentity, (u64, usize)> = HashMap::new();

        for entry in index.iter() {
            report.scanned += 1;
            let path = &entry.absolute_path;
            let stat = match self.fs.stat(path) {
                Ok(stat) => stat,
                Err(e) => {
                    report.stat_failed += 1;
                    warn!(path = %path.display(), error = %e, "Unable to stat file");
                    continue;
                }
            };
            if stat.is_symlink {
                report.symlinks_skipped += 1;
                continue;
            }
            if !stat.is_file {
                continue;
            }

            let is_dirty = dirty.contains(&entry.key.collection_id());
            if let Some(&(size, slot)) = seen.get(&stat.identity) {
                report.already_linked += 1;
                if let Some(candidate) = by_size.get_mut(&size).and_then(|g| g.get_mut(slot)) {
                    candidate.paths.push(path.clone());
                    candidate.dirty |= is_dirty;
                }
                continue;
            }

            let group = by_size.entry(stat.len).or_default();
            seen.insert(stat.identity, (stat.len, group.len()));
            group.push(Candidate {
                identity: stat.identity,
                paths: vec![path.clone()],
                dirty: is_dirty,
            });
        }
        by_size
    }

    /// Link every member after the first to the first. Returns false when
    /// the pass was cancelled.
    fn link_group(
        &self,
        members: &[Candidate],
        cancel: &CancellationToken,
        report: &mut DedupReport,
    ) -> bool {
        let canonical = &members[0];
        let canonical_path = &canonical.paths[0];

        for other in &members[1..] {
            for path in &other.paths {
                report.duplicates += 1;
                if other.identity.device != canonical.identity.device {
                    report.cross_fs_skipped += 1;
                    warn!(
                        canonical = %canonical_path.display(),
                        duplicate = %path.display(),
                        "Duplicate lives on another filesystem, not linking"
                    );
                    continue;
                }
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    return false;
                }
                match self.fs.replace_with_hardlink(canonical_path, path) {
                    Ok(()) => {
                        report.replaced += 1;
                        info!(
                            canonical = %canonical_path.display(),
                            duplicate = %path.display(),
                            "Linked duplicate"
                        );
                    }
                    Err(e) => {
                        report.link_failed += 1;
                        warn!(
                            canonical = %canonical_path.display(),
                            duplicate = %path.display(),
                            error = %e,
                            "Unable to link duplicate"
                        );
                    }
                }
            }
        }
        true
    }
}
