//! Per-iteration records under `<cache>/runs/<task>/<iter>/`.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{FailureAction, GateReport, WorkerExit};
use crate::io::atomic::write_json_atomic;
use crate::io::paths::CachePaths;

/// Failure handling recorded for an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub action: FailureAction,
    pub fingerprint: String,
    pub fix_task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationMeta {
    pub task_id: String,
    pub iter: u32,
    pub stage: String,
    pub agent: String,
    /// Attempt number of `stage` for this task, counting this one.
    pub attempt: u32,
    pub rebase: Option<String>,
    pub worker: Option<WorkerExit>,
    pub failure: Option<FailureRecord>,
    /// State the relay moved to after this iteration.
    pub next_state: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub gates_path: PathBuf,
}

impl IterationPaths {
    pub fn new(paths: &CachePaths, task_id: &str, iter: u32) -> Self {
        let dir = paths.iteration_dir(task_id, iter);
        Self {
            meta_path: dir.join("meta.json"),
            gates_path: dir.join("gates.json"),
            dir,
        }
    }
}

/// Write `meta.json` and, when gates ran, `gates.json`.
pub fn write_iteration(
    paths: &CachePaths,
    meta: &IterationMeta,
    gates: Option<&GateReport>,
) -> Result<IterationPaths> {
    let iteration = IterationPaths::new(paths, &meta.task_id, meta.iter);
    fs::create_dir_all(&iteration.dir)
        .with_context(|| format!("create iteration dir {}", iteration.dir.display()))?;
    write_json_atomic(&iteration.meta_path, meta)?;
    if let Some(report) = gates {
        write_json_atomic(&iteration.gates_path, report)?;
    }
    Ok(iteration)
}
