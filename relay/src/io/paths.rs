//! Canonical on-disk layout of the relay cache directory.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// All engine-owned paths under the cache directory.
///
/// ```text
/// <cache>/
///   state.json          shared task/claim map
///   reservations.json   active file reservations
///   metrics.json        gate timing/outcome ring buffers
///   tasks/<id>.json     one record per task (file task store)
///   lock/               exists only while the lock is held (renamed into place)
///   runs/<task>/<iter>/ per-iteration meta
///   runs/<task>/error_report.json  why the last run stopped short
///   logs/<task>/        worker stdout/stderr
/// ```
#[derive(Debug, Clone)]
pub struct CachePaths {
    pub root: PathBuf,
    pub state_path: PathBuf,
    pub reservations_path: PathBuf,
    pub metrics_path: PathBuf,
    pub tasks_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl CachePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            state_path: root.join("state.json"),
            reservations_path: root.join("reservations.json"),
            metrics_path: root.join("metrics.json"),
            tasks_dir: root.join("tasks"),
            lock_dir: root.join("lock"),
            runs_dir: root.join("runs"),
            logs_dir: root.join("logs"),
            root,
        }
    }

    /// Create the directory skeleton. Failing here is fatal for the run.
    ///
    /// `lock/` is not created here: its existence is the mutex.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.root, &self.tasks_dir, &self.runs_dir, &self.logs_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("create cache directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn task_path(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(format!("{}.json", sanitize(task_id)))
    }

    pub fn worker_log_path(&self, task_id: &str, iter: u32, stage: &str) -> PathBuf {
        self.logs_dir
            .join(sanitize(task_id))
            .join(format!("{iter:03}-{}.log", sanitize(stage)))
    }

    pub fn error_report_path(&self, task_id: &str) -> PathBuf {
        self.runs_dir.join(sanitize(task_id)).join("error_report.json")
    }

    pub fn iteration_dir(&self, task_id: &str, iter: u32) -> PathBuf {
        self.runs_dir.join(sanitize(task_id)).join(iter.to_string())
    }
}

/// Make an identifier safe to use as a single path component.
pub fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = CachePaths::new(temp.path());
        assert!(paths.state_path.ends_with("state.json"));
        assert!(paths.task_path("bd-42").ends_with("tasks/bd-42.json"));
        assert!(
            paths
                .worker_log_path("bd-42", 3, "code")
                .ends_with("logs/bd-42/003-code.log")
        );
        assert!(paths.iteration_dir("bd-42", 7).ends_with("runs/bd-42/7"));
    }

    #[test]
    fn ensure_creates_skeleton() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = CachePaths::new(temp.path().join("cache"));
        paths.ensure().expect("ensure");
        assert!(paths.tasks_dir.is_dir());
        assert!(!paths.lock_dir.exists());
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize("a/b c"), "a_b_c");
        assert_eq!(sanitize("bd-1.2_x"), "bd-1.2_x");
    }
}
