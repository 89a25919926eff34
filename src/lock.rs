//! On-disk lock file guarding passes that rewrite files under the media root.
//!
//! The lock is a sentinel file created with exclusive-create semantics and a
//! small JSON payload naming the holder. It works across processes (a manual
//! conversion run and the long-running service) as well as within one.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SlideError};

/// An unreadable lock younger than this may still be mid-write by its owner.
const UNREADABLE_GRACE: Duration = Duration::from_secs(5);

/// Content of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPayload {
    pub pid: u32,
    pub holder: String,
    pub started: DateTime<Utc>,
}

/// Outcome of a non-blocking acquire.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(LockGuard),
    /// Someone else holds the lock; `None` when the payload is not yet readable.
    Busy(Option<LockPayload>),
}

impl LockAttempt {
    pub const fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Removes the lock file when dropped.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Lock released"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "Lock file vanished before release");
            }
            Err(e) => warn!(path = %self.path.display(), error = %e, "Unable to remove lock file"),
        }
    }
}

/// Lock file location plus staleness policy.
#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
    stale_after: Duration,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock without waiting.
    ///
    /// A stale lock is moved aside and the acquire retried. A lock is stale when
    /// its holder pid no longer exists, when it is older than the configured
    /// timeout, or when it is unreadable past a short grace period.
    pub fn try_acquire(&self, holder: &str) -> Result<LockAttempt> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..3 {
            match OpenOptions::new().write(true).create_new(true).open(&self.path) {
                Ok(mut file) => {
                    let payload = LockPayload {
                        pid: std::process::id(),
                        holder: holder.to_string(),
                        started: Utc::now(),
                    };
                    let body = serde_json::to_vec(&payload)
                        .map_err(|e| SlideError::Other(format!("lock payload: {e}")))?;
                    file.write_all(&body)?;
                    file.sync_all()?;
                    info!(path = %self.path.display(), holder, "Lock acquired");
                    return Ok(LockAttempt::Acquired(LockGuard {
                        path: self.path.clone(),
                    }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let seen = match fs::read(&self.path) {
                        Ok(body) => body,
                        Err(e) if e.kind() == ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    };
                    let payload = serde_json::from_slice::<LockPayload>(&seen).ok();
                    if !self.is_stale(payload.as_ref()) {
                        debug!(path = %self.path.display(), ?payload, "Lock busy");
                        return Ok(LockAttempt::Busy(payload));
                    }
                    warn!(path = %self.path.display(), ?payload, "Reclaiming stale lock file");
                    if !self.reclaim(&seen)? {
                        debug!(path = %self.path.display(), "Lock changed hands while reclaiming");
                        return Ok(LockAttempt::Busy(self.holder()));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(LockAttempt::Busy(self.holder()))
    }

    /// Move a stale lock out of the way, but only if it still holds `seen`.
    ///
    /// The file is renamed aside first so a lock written by another process
    /// after our read is never deleted. Returns `false` when the file we moved
    /// was not the one judged stale; it is then put back.
    fn reclaim(&self, seen: &[u8]) -> Result<bool> {
        let tombstone = self.tombstone_path();
        match fs::rename(&self.path, &tombstone) {
            Ok(()) => {}
            // Another process reclaimed it first; the create can be retried.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let taken = fs::read(&tombstone);
        if taken.as_deref().is_ok_and(|body| body == seen) {
            fs::remove_file(&tombstone)?;
            return Ok(true);
        }

        match fs::hard_link(&tombstone, &self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!(path = %self.path.display(), "Lock recreated before a moved lock could be restored");
            }
            Err(e) => {
                let _ = fs::remove_file(&tombstone);
                return Err(e.into());
            }
        }
        fs::remove_file(&tombstone)?;
        Ok(false)
    }

    fn tombstone_path(&self) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let name = self
            .path
            .file_name()
            .map_or_else(|| "lock".into(), |n| n.to_string_lossy());
        self.path.with_file_name(format!(
            ".{name}.{}-{}.stale",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    /// Take the lock or fail with [`SlideError::LockHeld`].
    pub fn acquire(&self, holder: &str) -> Result<LockGuard> {
        match self.try_acquire(holder)? {
            LockAttempt::Acquired(guard) => Ok(guard),
            LockAttempt::Busy(payload) => Err(SlideError::LockHeld {
                path: self.path.clone(),
                pid: payload.as_ref().map_or(0, |p| p.pid),
                started: payload.map_or_else(|| "unknown".to_string(), |p| p.started.to_rfc3339()),
            }),
        }
    }

    /// Current holder, if the file exists and parses.
    pub fn holder(&self) -> Option<LockPayload> {
        let body = fs::read(&self.path).ok()?;
        serde_json::from_slice(&body).ok()
    }

    /// True when a live (non-stale) lock file exists.
    pub fn is_held(&self) -> bool {
        self.path.exists() && !self.is_stale(self.holder().as_ref())
    }

    fn is_stale(&self, payload: Option<&LockPayload>) -> bool {
        match payload {
            Some(p) => {
                if pid_alive(p.pid) == Some(false) {
                    debug!(pid = p.pid, holder = %p.holder, "Lock holder is gone");
                    return true;
                }
                let age = Utc::now().signed_duration_since(p.started);
                age.to_std().is_ok_and(|age| age > self.stale_after)
            }
            None => fs::metadata(&self.path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .is_some_and(|age| age > UNREADABLE_GRACE),
        }
    }
}

/// Whether a process with this pid exists. `None` when that cannot be told.
#[cfg(unix)]
fn pid_alive(pid: u32) -> Option<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).ok().filter(|&raw| raw > 0)?;
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => Some(true),
        Err(Errno::ESRCH) => Some(false),
        Err(_) => None,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> Option<bool> {
    None
}
