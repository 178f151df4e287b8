//! Host-wide mutual exclusion backed by an atomic directory rename.
//!
//! The lock directory exists exactly while someone holds the lock. Its only
//! child is a `<lock-id>.json` marker naming the holder, used for status output
//! and for reclaiming locks abandoned by crashed or killed processes. A holder
//! stages its marker in a private directory and renames that directory into
//! place, so the lock never appears without a marker.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::LockTimeoutError;
use crate::io::atomic::read_json;
use crate::io::config::LockConfig;
use crate::io::process::pid_alive;

/// Contents of the holder marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub lock_id: String,
    pub owner: String,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
}

/// Handle to the lock directory.
#[derive(Debug, Clone)]
pub struct LockDir {
    dir: PathBuf,
    poll_interval: Duration,
    stale_after: Duration,
}

impl LockDir {
    pub fn new(dir: impl Into<PathBuf>, config: &LockConfig) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            stale_after: Duration::from_secs(config.stale_after_secs),
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Acquire the lock, polling until `timeout` elapses.
    ///
    /// Fails with [`LockTimeoutError`] (downcastable from the returned error) when
    /// the lock is still held after `timeout`. Never waits longer than that.
    #[instrument(skip_all, fields(owner = %owner, timeout_ms = timeout.as_millis() as u64))]
    pub fn acquire(&self, owner: &str, timeout: Duration) -> Result<LockGuard> {
        let start = Instant::now();
        let deadline = start + timeout;
        if let Some(parent) = self.dir.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock parent {}", parent.display()))?;
        }
        let lock_id = generate_lock_id();
        let staging = self.sibling(&format!("{lock_id}.tmp"));
        let outcome = self.acquire_loop(owner, &lock_id, &staging, start, deadline);
        if outcome.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        outcome
    }

    fn acquire_loop(
        &self,
        owner: &str,
        lock_id: &str,
        staging: &Path,
        start: Instant,
        deadline: Instant,
    ) -> Result<LockGuard> {
        loop {
            if let Some(guard) = self.try_publish(owner, lock_id, staging)? {
                return Ok(guard);
            }
            if self.reclaim_if_stale()? {
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(lock_dir = %self.dir.display(), "lock acquisition timed out");
                return Err(LockTimeoutError {
                    lock_dir: self.dir.clone(),
                    waited_ms: now.duration_since(start).as_millis() as u64,
                }
                .into());
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// Run `f` while holding the lock. The lock is released even if `f` fails.
    pub fn with_lock<T>(
        &self,
        owner: &str,
        timeout: Duration,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let guard = self.acquire(owner, timeout)?;
        let out = f();
        let released = guard.release();
        let out = out?;
        released?;
        Ok(out)
    }

    /// Current holder, if the lock is held and its marker is readable.
    pub fn holder(&self) -> Result<Option<LockInfo>> {
        let Some(marker) = self.marker_path()? else {
            return Ok(None);
        };
        match read_json::<LockInfo>(&marker) {
            Ok(info) => Ok(Some(info)),
            Err(err) if !marker.exists() => {
                debug!(err = %err, "lock released while reading marker");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Stage a fresh marker and rename the staging directory into place.
    ///
    /// `Ok(None)` means another holder's directory is in the way.
    fn try_publish(&self, owner: &str, lock_id: &str, staging: &Path) -> Result<Option<LockGuard>> {
        let info = LockInfo {
            lock_id: lock_id.to_string(),
            owner: owner.to_string(),
            pid: std::process::id(),
            created_at: Utc::now(),
        };
        fs::create_dir_all(staging)
            .with_context(|| format!("create lock staging dir {}", staging.display()))?;
        let marker_name = format!("{lock_id}.json");
        let body = serde_json::to_string(&info).context("serialize lock marker")?;
        fs::write(staging.join(&marker_name), body)
            .with_context(|| format!("write lock marker in {}", staging.display()))?;

        // Renaming onto an empty directory replaces it, which only happens while a
        // previous holder is between removing its marker and its directory.
        match fs::rename(staging, &self.dir) {
            Ok(()) => {
                debug!(lock_id = %info.lock_id, "lock acquired");
                Ok(Some(LockGuard {
                    dir: self.dir.clone(),
                    marker: self.dir.join(marker_name),
                    info,
                    released: false,
                }))
            }
            Err(_) if self.dir.exists() => Ok(None),
            Err(err) => Err(err).with_context(|| format!("publish lock dir {}", self.dir.display())),
        }
    }

    fn marker_path(&self) -> Result<Option<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read lock dir {}", self.dir.display()));
            }
        };
        for entry in entries {
            let entry = entry.context("read lock dir entry")?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// True if the holder's process is gone or it has held the lock past `stale_after`.
    fn is_abandoned(&self, info: &LockInfo) -> bool {
        if !pid_alive(info.pid) {
            return true;
        }
        let age = (Utc::now() - info.created_at).to_std().unwrap_or_default();
        age >= self.stale_after
    }

    /// Reclaim an abandoned lock. Returns true if the caller should retry at once.
    ///
    /// The stale marker that was read is moved to a tombstone first. Only one
    /// waiter can win that rename; the others see `NotFound` and keep polling,
    /// so a lock published in the meantime is never removed.
    fn reclaim_if_stale(&self) -> Result<bool> {
        let Some(marker) = self.marker_path()? else {
            // Empty directory: a holder is mid-release or died there. `remove_dir`
            // refuses a directory that gained a marker in the meantime.
            return Ok(fs::remove_dir(&self.dir).is_ok() || !self.dir.exists());
        };
        let info = match read_json::<LockInfo>(&marker) {
            Ok(info) => info,
            Err(err) => {
                debug!(err = %err, "lock marker unreadable; waiting");
                return Ok(false);
            }
        };
        if !self.is_abandoned(&info) {
            return Ok(false);
        }
        let tombstone = self.sibling(&format!("{}.reclaimed-{}", info.lock_id, random_suffix(6)));
        match fs::rename(&marker, &tombstone) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(err).with_context(|| format!("retire stale marker {}", marker.display()));
            }
        }
        warn!(
            lock_dir = %self.dir.display(),
            holder = %info.owner,
            pid = info.pid,
            "reclaimed abandoned lock"
        );
        let _ = fs::remove_file(&tombstone);
        let _ = fs::remove_dir(&self.dir);
        Ok(true)
    }

    /// Path next to the lock directory, hidden and prefixed with its name.
    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "lock".to_string());
        self.dir.with_file_name(format!(".{name}.{suffix}"))
    }
}

/// Proof of lock ownership. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    dir: PathBuf,
    marker: PathBuf,
    info: LockInfo,
    released: bool,
}

impl LockGuard {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Release explicitly, surfacing I/O errors that `Drop` can only log.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        release_dir(&self.dir, &self.marker)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = release_dir(&self.dir, &self.marker) {
            warn!(err = %err, lock_dir = %self.dir.display(), "failed to release lock");
        }
    }
}

fn release_dir(dir: &Path, marker: &Path) -> Result<()> {
    // A missing marker means the lock was reclaimed as stale; the directory is no longer ours.
    match fs::remove_file(marker) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(marker = %marker.display(), "lock marker missing on release");
            return Ok(());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("remove lock marker {}", marker.display()));
        }
    }
    // The next holder may already have published its directory over ours.
    if let Err(err) = fs::remove_dir(dir) {
        debug!(err = %err, lock_dir = %dir.display(), "lock dir not removed on release");
    }
    Ok(())
}

fn generate_lock_id() -> String {
    format!("{}-{}", std::process::id(), random_suffix(8))
}

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(len)
        .collect::<String>()
        .to_lowercase()
}
