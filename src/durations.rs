//! Persisted cache of video durations.
//!
//! Probing a video is slow, so the result is kept per media key together with
//! the file's modification time. A changed mtime invalidates the entry.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::media::{CollectionEntry, CollectionIndex};
use crate::persist::{SnapshotEntity, SnapshotStore};

/// Snapshot name of the cache inside the storage directory.
pub const SNAPSHOT_NAME: &str = "durations";

/// Longest a single ffprobe run may take before it is killed.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Reads metadata from a video file.
pub trait DurationProbe: Send + Sync {
    fn probe(&self, path: &Path) -> io::Result<Duration>;

    /// Recording time from the container tags, if present.
    fn creation_time(&self, _path: &Path) -> Option<DateTime<Utc>> {
        None
    }
}

/// Probe backed by the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    program: PathBuf,
    timeout: Duration,
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::with_program("ffprobe")
    }
}

impl FfprobeProbe {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: PROBE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Print one format entry with no key or section wrappers.
    fn show_entry(&self, entry: &str, path: &Path) -> io::Result<String> {
        let mut command = Command::new(&self.program);
        command
            .args(["-v", "error", "-show_entries", entry, "-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path);
        let output = output_within(command, self.timeout)?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "ffprobe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl DurationProbe for FfprobeProbe {
    fn probe(&self, path: &Path) -> io::Result<Duration> {
        parse_seconds(&self.show_entry("format=duration", path)?)
    }

    fn creation_time(&self, path: &Path) -> Option<DateTime<Utc>> {
        match self.show_entry("format_tags=creation_time", path) {
            Ok(text) => parse_creation_time(&text),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No container creation time");
                None
            }
        }
    }
}

/// Run `command` to completion, killing it once `timeout` has passed.
///
/// Output is collected after exit, so this suits tools that print little.
fn output_within(mut command: Command, timeout: Duration) -> io::Result<Output> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let deadline = Instant::now() + timeout;
    loop {
        if child.try_wait()?.is_some() {
            return child.wait_with_output();
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("gave up after {}s", timeout.as_secs_f32()),
            ));
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

/// ISO 8601 tag value; a missing offset means UTC.
fn parse_creation_time(text: &str) -> Option<DateTime<Utc>> {
    let text = text.lines().map(str::trim).find(|line| !line.is_empty())?;
    if let Ok(stamped) = DateTime::parse_from_rfc3339(text) {
        return Some(stamped.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}

fn parse_seconds(text: &str) -> io::Result<Duration> {
    let seconds: f64 = text
        .trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad duration {text:?}: {e}")))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad duration {seconds}"),
        ));
    }
    Ok(Duration::from_secs_f64(seconds))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CachedDuration {
    mtime: DateTime<Utc>,
    seconds: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DurationSnapshot {
    entries: BTreeMap<String, CachedDuration>,
}

impl SnapshotEntity for DurationSnapshot {
    const VERSION: u16 = 1;
}

/// Duration cache shared by all devices.
pub struct DurationCache {
    store: SnapshotStore,
    probe: Arc<dyn DurationProbe>,
    entries: Mutex<DurationSnapshot>,
}

impl std::fmt::Debug for DurationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurationCache")
            .field("store", &self.store)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl DurationCache {
    /// Load the cache from `store`; an unreadable snapshot starts empty.
    pub fn open(store: SnapshotStore, probe: Arc<dyn DurationProbe>) -> Self {
        let entries = store.load_or_default::<DurationSnapshot>(SNAPSHOT_NAME);
        debug!(entries = entries.entries.len(), "Duration cache loaded");
        Self {
            store,
            probe,
            entries: Mutex::new(entries),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DurationSnapshot> {
        self.entries.lock().expect("duration cache lock poisoned")
    }

    /// Whole seconds of play time for a video entry. Images are 0.
    ///
    /// A failed probe yields 0 and is not cached, so the next call retries.
    pub fn seconds_for(&self, entry: &CollectionEntry) -> u32 {
        if !entry.kind.is_video() {
            return 0;
        }
        let key = entry.key.as_str();
        if let Some(cached) = self.lock().entries.get(key) {
            if cached.mtime == entry.mtime {
                return cached.seconds;
            }
        }

        let seconds = match self.probe.probe(&entry.absolute_path) {
            Ok(duration) => u32::try_from(duration.as_secs()).unwrap_or(u32::MAX),
            Err(e) => {
                warn!(key, error = %e, "Unable to probe video duration");
                return 0;
            }
        };

        let mut snapshot = self.lock();
        snapshot.entries.insert(
            key.to_string(),
            CachedDuration {
                mtime: entry.mtime,
                seconds,
            },
        );
        if let Err(e) = self.store.save(SNAPSHOT_NAME, &*snapshot) {
            warn!(error = %e, "Unable to persist duration cache");
        }
        debug!(key, seconds, "Video duration cached");
        seconds
    }

    /// Drop entries for keys the index no longer has.
    pub fn prune(&self, index: &CollectionIndex) -> usize {
        let mut snapshot = self.lock();
        let before = snapshot.entries.len();
        snapshot
            .entries
            .retain(|key, _| index.contains(&crate::media::MediaKey::new(key.as_str())));
        let removed = before - snapshot.entries.len();
        if removed > 0 {
            if let Err(e) = self.store.save(SNAPSHOT_NAME, &*snapshot) {
                warn!(error = %e, "Unable to persist duration cache");
            }
            debug!(removed, "Pruned duration cache");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
