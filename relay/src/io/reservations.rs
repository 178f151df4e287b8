//! Time-boxed file reservations in `<cache>/reservations.json`.
//!
//! A reservation claims a set of glob patterns for one owner. Exclusive
//! reservations held by different owners never overlap; shared reservations may
//! overlap other shared ones. A conflicting request is refused whole and
//! returns `None`. Expiry is enforced lazily on every read and eagerly by a
//! sweeper thread scheduled at the TTL.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::glob::{any_overlap, patterns_overlap};
use crate::io::atomic::{read_json_or_default, write_json_atomic};
use crate::io::lock::LockDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub owner: String,
    pub patterns: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_ms: u64,
    #[serde(default = "exclusive_default")]
    pub exclusive: bool,
}

fn exclusive_default() -> bool {
    true
}

impl Reservation {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Another owner's request for `patterns` conflicts unless both sides are shared.
    fn blocks(&self, owner: &str, patterns: &[String], exclusive: bool) -> bool {
        self.owner != owner && (self.exclusive || exclusive) && any_overlap(patterns, &self.patterns)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ReservationFile {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

impl ReservationFile {
    fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.reservations.len();
        self.reservations.retain(|r| r.is_active_at(now));
        before - self.reservations.len()
    }
}

/// Options for [`ReservationStore::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveOptions {
    pub owner: String,
    /// Falls back to the store's default TTL.
    pub ttl: Option<Duration>,
    /// Exclusive by default; shared reservations only conflict with exclusive ones.
    pub exclusive: bool,
}

impl ReserveOptions {
    pub fn owner(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ttl: None,
            exclusive: true,
        }
    }

    pub fn shared(mut self) -> Self {
        self.exclusive = false;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ReservationStore {
    path: PathBuf,
    lock: LockDir,
    lock_timeout: Duration,
    default_ttl: Duration,
    sweep: bool,
}

impl ReservationStore {
    pub fn new(
        path: impl Into<PathBuf>,
        lock: LockDir,
        lock_timeout: Duration,
        default_ttl: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            lock,
            lock_timeout,
            default_ttl,
            sweep: true,
        }
    }

    /// Disable the eager sweeper; expiry then relies on lazy pruning only.
    pub fn without_sweeper(mut self) -> Self {
        self.sweep = false;
        self
    }

    /// Reserve `patterns` for `opts.owner`.
    ///
    /// Returns `Ok(None)` if any pattern overlaps an active reservation held by
    /// another owner, unless both are shared; nothing is written in that case. Lock contention beyond
    /// the configured timeout is an error.
    #[instrument(skip_all, fields(owner = %opts.owner, patterns = patterns.len(), exclusive = opts.exclusive))]
    pub fn reserve<S: AsRef<str>>(
        &self,
        patterns: &[S],
        opts: &ReserveOptions,
    ) -> Result<Option<Reservation>> {
        let patterns: Vec<String> = patterns
            .iter()
            .map(|p| p.as_ref().trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if patterns.is_empty() {
            return Err(anyhow!("reserve requires at least one pattern"));
        }
        let ttl = opts.ttl.unwrap_or(self.default_ttl);
        if ttl.is_zero() {
            return Err(anyhow!("reservation ttl must be > 0"));
        }

        let reservation = self.mutate("reservations:reserve", |file, now| {
            if let Some(conflict) = file
                .reservations
                .iter()
                .find(|r| r.blocks(&opts.owner, &patterns, opts.exclusive))
            {
                info!(
                    holder = %conflict.owner,
                    reservation_id = %conflict.id,
                    "reservation conflict"
                );
                return Ok((None, false));
            }
            let expires_at = now
                + chrono::Duration::from_std(ttl).map_err(|e| anyhow!("ttl out of range: {e}"))?;
            let reservation = Reservation {
                id: generate_reservation_id(),
                owner: opts.owner.clone(),
                patterns: patterns.clone(),
                created_at: now,
                expires_at,
                ttl_ms: ttl.as_millis() as u64,
                exclusive: opts.exclusive,
            };
            file.reservations.push(reservation.clone());
            Ok((Some(reservation), true))
        })?;

        if let Some(reservation) = reservation.as_ref() {
            info!(reservation_id = %reservation.id, ttl_ms = reservation.ttl_ms, "reserved");
            if self.sweep {
                self.schedule_expiry(reservation.id.clone(), ttl);
            }
        }
        Ok(reservation)
    }

    /// Release every reservation that covers any of `patterns`. Returns how many were removed.
    #[instrument(skip_all, fields(patterns = patterns.len()))]
    pub fn release<S: AsRef<str>>(&self, patterns: &[S]) -> Result<usize> {
        self.remove_where("reservations:release", |r| {
            patterns
                .iter()
                .any(|p| r.patterns.iter().any(|held| held == p.as_ref().trim()))
        })
    }

    #[instrument(skip_all, fields(owner = %owner))]
    pub fn release_by_owner(&self, owner: &str) -> Result<usize> {
        self.remove_where("reservations:release_by_owner", |r| r.owner == owner)
    }

    #[instrument(skip_all, fields(reservation_id = %id))]
    pub fn release_by_id(&self, id: &str) -> Result<bool> {
        Ok(self.remove_where("reservations:release_by_id", |r| r.id == id)? > 0)
    }

    /// Remove every reservation regardless of owner or expiry.
    #[instrument(skip_all)]
    pub fn force_clear(&self) -> Result<usize> {
        let removed = self.remove_where("reservations:force_clear", |_| true)?;
        warn!(removed, "force-cleared reservations");
        Ok(removed)
    }

    /// Active reservations. Expired entries are filtered out even if still on disk.
    pub fn status(&self) -> Result<Vec<Reservation>> {
        let now = Utc::now();
        let file: ReservationFile = read_json_or_default(&self.path)?;
        Ok(file
            .reservations
            .into_iter()
            .filter(|r| r.is_active_at(now))
            .collect())
    }

    /// The active reservation covering `path`, if any.
    pub fn is_reserved(&self, path: &str) -> Result<Option<Reservation>> {
        Ok(self
            .status()?
            .into_iter()
            .find(|r| r.patterns.iter().any(|p| patterns_overlap(p, path))))
    }

    fn remove_where(&self, lock_owner: &str, pred: impl Fn(&Reservation) -> bool) -> Result<usize> {
        let removed = self.mutate(lock_owner, |file, _now| {
            let before = file.reservations.len();
            file.reservations.retain(|r| !pred(r));
            let removed = before - file.reservations.len();
            Ok((removed, removed > 0))
        })?;
        debug!(removed, "reservations removed");
        Ok(removed)
    }

    /// Locked read-modify-write. `f` returns a value and whether the file changed.
    fn mutate<T>(
        &self,
        lock_owner: &str,
        f: impl FnOnce(&mut ReservationFile, DateTime<Utc>) -> Result<(T, bool)>,
    ) -> Result<T> {
        self.lock.with_lock(lock_owner, self.lock_timeout, || {
            let now = Utc::now();
            let mut file: ReservationFile = read_json_or_default(&self.path)?;
            let pruned = file.prune_expired(now);
            let (out, changed) = f(&mut file, now)?;
            if changed || pruned > 0 {
                write_json_atomic(&self.path, &file)?;
            }
            Ok(out)
        })
    }

    fn schedule_expiry(&self, id: String, ttl: Duration) {
        let store = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("relay-expire-{id}"))
            .spawn(move || {
                thread::sleep(ttl);
                if !store.path.parent().is_some_and(Path::exists) {
                    return;
                }
                match store.release_by_id(&id) {
                    Ok(true) => debug!(reservation_id = %id, "reservation expired"),
                    Ok(false) => {}
                    Err(err) => warn!(err = %err, reservation_id = %id, "expiry sweep failed"),
                }
            });
        if let Err(err) = spawned {
            warn!(err = %err, "could not start expiry sweeper; relying on lazy expiry");
        }
    }
}

fn generate_reservation_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(10)
        .collect::<String>()
        .to_lowercase();
    format!("res-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::LockConfig;
    use std::sync::{Arc, Barrier};

    fn store(root: &std::path::Path) -> ReservationStore {
        let lock = LockDir::new(root.join("lock"), &LockConfig::default());
        ReservationStore::new(
            root.join("reservations.json"),
            lock,
            Duration::from_secs(5),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn overlapping_request_from_other_owner_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());

        let first = store
            .reserve(&["src/a.js"], &ReserveOptions::owner("worker-1"))
            .expect("reserve")
            .expect("granted");
        let second = store
            .reserve(&["src/a.js", "src/b.js"], &ReserveOptions::owner("worker-2"))
            .expect("reserve");
        assert!(second.is_none());

        let active = store.status().expect("status");
        assert_eq!(active, vec![first]);
        assert!(store.is_reserved("src/b.js").expect("query").is_none());
    }

    #[test]
    fn disjoint_and_same_owner_requests_coexist() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let a = ReserveOptions::owner("worker-1");
        store.reserve(&["src/**/*.ts"], &a).expect("reserve").expect("granted");
        store
            .reserve(&["docs/*.md"], &ReserveOptions::owner("worker-2"))
            .expect("reserve")
            .expect("disjoint granted");
        store
            .reserve(&["src/ui/button.ts"], &a)
            .expect("reserve")
            .expect("own extension granted");
        assert_eq!(store.status().expect("status").len(), 3);
        assert_eq!(
            store.is_reserved("src/ui/x.ts").expect("query").map(|r| r.owner),
            Some("worker-1".to_string())
        );
    }

    #[test]
    fn shared_reservations_only_conflict_with_exclusive_ones() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store
            .reserve(&["docs/**"], &ReserveOptions::owner("reader-1").shared())
            .expect("reserve")
            .expect("granted");
        let second = store
            .reserve(&["docs/guide.md"], &ReserveOptions::owner("reader-2").shared())
            .expect("reserve")
            .expect("shared alongside shared");
        assert!(!second.exclusive);
        assert!(
            store
                .reserve(&["docs/guide.md"], &ReserveOptions::owner("writer"))
                .expect("reserve")
                .is_none()
        );

        store
            .reserve(&["src/lib.rs"], &ReserveOptions::owner("writer"))
            .expect("reserve")
            .expect("granted");
        assert!(
            store
                .reserve(&["src/*.rs"], &ReserveOptions::owner("reader-1").shared())
                .expect("reserve")
                .is_none()
        );
        assert_eq!(store.status().expect("status").len(), 3);
    }

    #[test]
    fn records_without_exclusive_flag_load_as_exclusive() {
        let raw = r#"{"reservations":[{"id":"res-1","owner":"o","patterns":["a/*"],
            "created_at":"2026-01-01T00:00:00Z","expires_at":"2026-01-01T01:00:00Z","ttl_ms":3600000}]}"#;
        let file: ReservationFile = serde_json::from_str(raw).expect("parse");
        assert!(file.reservations[0].exclusive);
    }

    #[test]
    fn expired_reservation_is_not_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path()).without_sweeper();
        let opts = ReserveOptions::owner("worker-1").with_ttl(Duration::from_millis(30));
        store.reserve(&["src/a.js"], &opts).expect("reserve").expect("granted");
        assert!(store.is_reserved("src/a.js").expect("query").is_some());

        thread::sleep(Duration::from_millis(60));
        assert!(store.is_reserved("src/a.js").expect("query").is_none());
        store
            .reserve(&["src/a.js"], &ReserveOptions::owner("worker-2"))
            .expect("reserve")
            .expect("expired claim no longer conflicts");
    }

    #[test]
    fn sweeper_removes_entry_from_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let opts = ReserveOptions::owner("worker-1").with_ttl(Duration::from_millis(20));
        store.reserve(&["lib/x.rs"], &opts).expect("reserve").expect("granted");

        thread::sleep(Duration::from_millis(300));
        let file: ReservationFile =
            read_json_or_default(&temp.path().join("reservations.json")).expect("read");
        assert!(file.reservations.is_empty());
    }

    #[test]
    fn release_variants() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let r1 = store
            .reserve(&["a/*"], &ReserveOptions::owner("o1"))
            .expect("reserve")
            .expect("granted");
        store.reserve(&["b/*"], &ReserveOptions::owner("o2")).expect("reserve");
        store.reserve(&["c/*"], &ReserveOptions::owner("o2")).expect("reserve");
        store.reserve(&["d/*"], &ReserveOptions::owner("o3")).expect("reserve");

        assert!(store.release_by_id(&r1.id).expect("by id"));
        assert!(!store.release_by_id(&r1.id).expect("by id again"));
        assert_eq!(store.release_by_owner("o2").expect("by owner"), 2);
        assert_eq!(store.release(&["d/*"]).expect("by pattern"), 1);
        store.reserve(&["e/*"], &ReserveOptions::owner("o4")).expect("reserve");
        assert_eq!(store.force_clear().expect("clear"), 1);
        assert!(store.status().expect("status").is_empty());
    }

    #[test]
    fn concurrent_overlapping_requests_have_one_winner() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path()).without_sweeper();
        let barrier = Arc::new(Barrier::new(5));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .reserve(&["src/shared.rs"], &ReserveOptions::owner(format!("w{i}")))
                        .expect("reserve")
                        .is_some()
                })
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 1);
        assert_eq!(store.status().expect("status").len(), 1);
    }

    #[test]
    fn empty_pattern_list_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let empty: [&str; 0] = [];
        assert!(
            store(temp.path())
                .reserve(&empty, &ReserveOptions::owner("o"))
                .is_err()
        );
    }
}
