//! Shared task/claim map in `<cache>/state.json`.
//!
//! Every mutation is a read-modify-write under the global lock, published with
//! an atomic rename. Readers that only need a snapshot skip the lock: the last
//! published file is always complete.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::io::atomic::{read_json_or_default, write_json_atomic};
use crate::io::lock::LockDir;
use crate::io::process::pid_alive;

/// Prefix of claim owners written by a relay process; the pid follows it.
pub const RELAY_OWNER_PREFIX: &str = "relay:";

/// Claim owner for the relay running in this process.
pub fn process_owner() -> String {
    format!("{RELAY_OWNER_PREFIX}{}", std::process::id())
}

/// True when `owner` names a relay process on this host that no longer runs.
fn owner_is_dead(owner: &str) -> bool {
    owner
        .strip_prefix(RELAY_OWNER_PREFIX)
        .and_then(|pid| pid.parse::<u32>().ok())
        .is_some_and(|pid| pid != std::process::id() && !pid_alive(pid))
}

pub const STATE_VERSION: u32 = 1;

/// Contents of `state.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedState {
    pub tasks: BTreeMap<String, TrackedTask>,
    pub claims: BTreeMap<String, Claim>,
    pub mode: String,
    pub version: u32,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            tasks: BTreeMap::new(),
            claims: BTreeMap::new(),
            mode: "relay".to_string(),
            version: STATE_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTask {
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub workflow: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub owner: String,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    lock: LockDir,
    lock_timeout: Duration,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, lock: LockDir, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock,
            lock_timeout,
        }
    }

    /// Last published state, read without taking the lock.
    pub fn load_snapshot(&self) -> Result<SharedState> {
        read_json_or_default(&self.path)
    }

    /// Register a task; re-adding an existing task keeps its original entry.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn add_task(&self, task_id: &str, workflow: Option<&str>) -> Result<()> {
        self.mutate("state:add_task", |state| {
            state
                .tasks
                .entry(task_id.to_string())
                .or_insert_with(|| TrackedTask {
                    added_at: Utc::now(),
                    workflow: workflow.map(str::to_string),
                });
            Ok(())
        })
    }

    /// Claim a task for `owner`.
    ///
    /// Returns `false` when another owner already holds the claim. Claiming a
    /// task you already hold succeeds, and so does taking over a claim left by
    /// a relay process that has since died.
    #[instrument(skip_all, fields(task_id = %task_id, owner = %owner))]
    pub fn claim_task(&self, task_id: &str, owner: &str) -> Result<bool> {
        self.mutate("state:claim_task", |state| {
            if let Some(existing) = state.claims.get(task_id)
                && existing.owner != owner
            {
                if !owner_is_dead(&existing.owner) {
                    debug!(holder = %existing.owner, "task already claimed");
                    return Ok(false);
                }
                warn!(holder = %existing.owner, "taking over claim of dead relay process");
            }
            state.claims.insert(
                task_id.to_string(),
                Claim {
                    owner: owner.to_string(),
                    claimed_at: Utc::now(),
                },
            );
            info!("task claimed");
            Ok(true)
        })
    }

    /// Drop `owner`'s claim on a task. Returns `false` if `owner` did not hold it.
    #[instrument(skip_all, fields(task_id = %task_id, owner = %owner))]
    pub fn release_task(&self, task_id: &str, owner: &str) -> Result<bool> {
        self.mutate("state:release_task", |state| {
            match state.claims.get(task_id) {
                Some(claim) if claim.owner == owner => {
                    state.claims.remove(task_id);
                    debug!("claim released");
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    pub fn claim_holder(&self, task_id: &str) -> Result<Option<Claim>> {
        Ok(self.load_snapshot()?.claims.get(task_id).cloned())
    }

    fn mutate<T>(
        &self,
        lock_owner: &str,
        f: impl FnOnce(&mut SharedState) -> Result<T>,
    ) -> Result<T> {
        self.lock.with_lock(lock_owner, self.lock_timeout, || {
            let mut state: SharedState = read_json_or_default(&self.path)?;
            let out = f(&mut state)?;
            state.version = STATE_VERSION;
            write_json_atomic(&self.path, &state)?;
            Ok(out)
        })
    }
}
