//! Test-only fakes and fixtures for the relay.
//!
//! Scripted collaborators return predetermined results in order and record
//! how they were called, so tests can drive the state machine without
//! spawning agents or touching a real mainline.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::task::{TaskMetadata, TaskRecord, TaskStatus};
use crate::core::types::{GateResult, WorkerExit};
use crate::integrate::{Integrator, MergeOutcome, RebaseCheck, RebaseOutcome};
use crate::io::config::{LockConfig, RelayConfig};
use crate::io::gates::{Gate, GateInput, GateRegistry};
use crate::io::lock::LockDir;
use crate::io::metrics::NoopMetrics;
use crate::io::paths::CachePaths;
use crate::io::shutdown::Shutdown;
use crate::io::task_store::{FileTaskStore, TaskStore};
use crate::io::worker::{WorkerRequest, WorkerSpawner};
use crate::relay::{Relay, RelayDeps};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An open task with default metadata.
pub fn task_record(id: &str) -> TaskRecord {
    TaskRecord {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
        status: TaskStatus::Open,
        notes: None,
        blocked_by: Vec::new(),
        metadata: TaskMetadata::default(),
    }
}

type SpawnHook = Box<dyn Fn(&WorkerRequest) + Send + Sync>;

/// Worker that replays a queue of exits, one per spawn.
#[derive(Default)]
pub struct ScriptedWorker {
    exits: Mutex<VecDeque<WorkerExit>>,
    requests: Mutex<Vec<WorkerRequest>>,
    on_spawn: Option<SpawnHook>,
}

impl ScriptedWorker {
    pub fn new(exits: Vec<WorkerExit>) -> Self {
        Self {
            exits: Mutex::new(exits.into()),
            ..Self::default()
        }
    }

    /// Run `hook` inside every spawn, standing in for what a worker does while it runs.
    pub fn with_hook(mut self, hook: impl Fn(&WorkerRequest) + Send + Sync + 'static) -> Self {
        self.on_spawn = Some(Box::new(hook));
        self
    }

    /// Stages the worker was spawned for, in order.
    pub fn stages(&self) -> Vec<String> {
        locked(&self.requests)
            .iter()
            .map(|r| r.stage.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<WorkerRequest> {
        locked(&self.requests).clone()
    }

    /// Panics if scripted exits were left unused.
    pub fn assert_drained(&self) {
        let left = locked(&self.exits).len();
        assert_eq!(left, 0, "{left} scripted worker exit(s) not consumed");
    }
}

impl WorkerSpawner for ScriptedWorker {
    fn spawn(&self, request: &WorkerRequest) -> Result<WorkerExit> {
        locked(&self.requests).push(request.clone());
        if let Some(hook) = &self.on_spawn {
            hook(request);
        }
        locked(&self.exits)
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted exit left for stage '{}'", request.stage))
    }
}

#[derive(Debug, Clone)]
enum GateBehavior {
    Pass,
    Fail(String),
    Error(String),
    Panic,
    /// Pops one outcome per run; passes once the script runs out.
    Sequence(Arc<Mutex<VecDeque<bool>>>),
}

/// Gate with a fixed (or scripted) verdict.
#[derive(Debug, Clone)]
pub struct ScriptedGate {
    name: String,
    behavior: GateBehavior,
    delay: Duration,
    runs: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ScriptedGate {
    fn with_behavior(name: &str, behavior: GateBehavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            delay: Duration::ZERO,
            runs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn passing(name: &str) -> Self {
        Self::with_behavior(name, GateBehavior::Pass)
    }

    pub fn failing(name: &str, reason: &str) -> Self {
        Self::with_behavior(name, GateBehavior::Fail(reason.to_string()))
    }

    pub fn erroring(name: &str, message: &str) -> Self {
        Self::with_behavior(name, GateBehavior::Error(message.to_string()))
    }

    pub fn panicking(name: &str) -> Self {
        Self::with_behavior(name, GateBehavior::Panic)
    }

    /// Verdicts per run, in order (`true` = pass).
    pub fn sequence(name: &str, verdicts: &[bool]) -> Self {
        let queue = verdicts.iter().copied().collect();
        Self::with_behavior(name, GateBehavior::Sequence(Arc::new(Mutex::new(queue))))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// File lists the gate was run against, shared across clones.
    pub fn runs(&self) -> Vec<Vec<String>> {
        locked(&self.runs).clone()
    }
}

impl Gate for ScriptedGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, input: &GateInput) -> Result<GateResult> {
        locked(&self.runs).push(input.files.clone());
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        match &self.behavior {
            GateBehavior::Pass => Ok(GateResult::pass(&self.name, "scripted pass")),
            GateBehavior::Fail(reason) => Ok(GateResult::fail(&self.name, reason.clone())),
            GateBehavior::Error(message) => Err(anyhow!("{message}")),
            GateBehavior::Panic => panic!("scripted gate '{}' panicked", self.name),
            GateBehavior::Sequence(queue) => {
                if locked(queue).pop_front().unwrap_or(true) {
                    Ok(GateResult::pass(&self.name, "scripted pass"))
                } else {
                    Ok(GateResult::fail(&self.name, "scripted failure"))
                }
            }
        }
    }
}

/// Integrator with scripted rebase/merge outcomes and a call log.
#[derive(Debug)]
pub struct ScriptedIntegrator {
    rebases: Mutex<VecDeque<RebaseOutcome>>,
    merges_cleanly: bool,
    merge_error: Option<String>,
    touched: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl Default for ScriptedIntegrator {
    fn default() -> Self {
        Self {
            rebases: Mutex::new(VecDeque::new()),
            merges_cleanly: true,
            merge_error: None,
            touched: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedIntegrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files reported as touched by the task branch.
    pub fn with_touched(mut self, files: &[&str]) -> Self {
        self.touched = files.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Make the next pre-stage check report the mainline ahead, then rebase with `outcome`.
    pub fn with_rebase(self, outcome: RebaseOutcome) -> Self {
        locked(&self.rebases).push_back(outcome);
        self
    }

    /// Report conflicts at the terminal conflict check.
    pub fn with_conflicts(mut self) -> Self {
        self.merges_cleanly = false;
        self
    }

    pub fn with_merge_failure(mut self, error: &str) -> Self {
        self.merge_error = Some(error.to_string());
        self
    }

    /// Names of the integrator operations called, in order.
    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }

    fn log(&self, call: &str) {
        locked(&self.calls).push(call.to_string());
    }
}

impl Integrator for ScriptedIntegrator {
    fn prepare_branch(&self, _branch: &str) -> Result<()> {
        self.log("prepare_branch");
        Ok(())
    }

    fn check_needs_rebase(&self, _branch: &str) -> Result<RebaseCheck> {
        let pending = !locked(&self.rebases).is_empty();
        Ok(RebaseCheck {
            needs_rebase: pending,
            commits_behind: u32::from(pending),
        })
    }

    fn perform_rebase(&self, _branch: &str) -> Result<RebaseOutcome> {
        self.log("perform_rebase");
        locked(&self.rebases)
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted rebase outcome"))
    }

    fn abort_rebase(&self) -> Result<()> {
        self.log("abort_rebase");
        Ok(())
    }

    fn check_for_conflicts(&self, _branch: &str) -> Result<bool> {
        self.log("check_for_conflicts");
        Ok(self.merges_cleanly)
    }

    fn perform_squash_merge(&self, _task_id: &str, _branch: &str) -> Result<MergeOutcome> {
        self.log("perform_squash_merge");
        Ok(match &self.merge_error {
            Some(error) => MergeOutcome {
                success: false,
                commit: None,
                error: Some(error.clone()),
            },
            None => MergeOutcome {
                success: true,
                commit: Some("0123abc".to_string()),
                error: None,
            },
        })
    }

    fn cleanup_task_branch(&self, _branch: &str) -> Result<()> {
        self.log("cleanup_task_branch");
        Ok(())
    }

    fn commit_work(&self, _branch: &str, _message: &str) -> Result<Option<String>> {
        self.log("commit_work");
        Ok(None)
    }

    fn touched_files(&self, _branch: &str) -> Result<Vec<String>> {
        Ok(self.touched.clone())
    }
}

/// Temporary cache directory with a file task store and fast lock settings.
pub struct TestCache {
    temp: TempDir,
    pub paths: CachePaths,
    pub store: FileTaskStore,
}

impl TestCache {
    /// Panics if the temp directory cannot be created.
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = Self::base_config();
        let paths = CachePaths::new(config.cache_dir_in(temp.path()));
        paths.ensure().expect("cache skeleton");
        let store = FileTaskStore::new(paths.clone(), Self::lock_for(&paths), config.lock_timeout());
        Self { temp, paths, store }
    }

    /// Repository root the cache lives under.
    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn lock(&self) -> LockDir {
        Self::lock_for(&self.paths)
    }

    /// Config pointing at this cache, with quick timeouts for tests.
    pub fn config(&self) -> RelayConfig {
        let mut config = Self::base_config();
        config.cache_dir = self.paths.root.clone();
        config
    }

    pub fn put(&self, task: TaskRecord) {
        self.store.put(&task).expect("put task");
    }

    /// Panics if the task is missing.
    pub fn task(&self, id: &str) -> TaskRecord {
        self.store.show(id).expect("show").expect("task exists")
    }

    /// Relay over this cache's task store.
    pub fn relay(
        &self,
        config: RelayConfig,
        worker: Arc<ScriptedWorker>,
        integrator: Arc<ScriptedIntegrator>,
        gates: Vec<ScriptedGate>,
    ) -> Relay {
        self.relay_with_shutdown(config, worker, integrator, gates, Shutdown::new())
    }

    pub fn relay_with_shutdown(
        &self,
        config: RelayConfig,
        worker: Arc<ScriptedWorker>,
        integrator: Arc<ScriptedIntegrator>,
        gates: Vec<ScriptedGate>,
        shutdown: Shutdown,
    ) -> Relay {
        let mut registry = GateRegistry::new();
        for gate in gates {
            registry.register(Arc::new(gate));
        }
        let deps = RelayDeps {
            store: Arc::new(self.store.clone()),
            worker,
            integrator,
            gates: registry,
            metrics: Arc::new(NoopMetrics),
            shutdown,
        };
        Relay::new(config, self.root(), deps).with_owner("test-relay")
    }

    fn base_config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.lock.timeout_ms = 2_000;
        config.lock.poll_interval_ms = 5;
        config.gates.timeout_secs = 5;
        config
    }

    fn lock_for(paths: &CachePaths) -> LockDir {
        let lock = LockConfig {
            timeout_ms: 2_000,
            poll_interval_ms: 5,
            ..LockConfig::default()
        };
        LockDir::new(&paths.lock_dir, &lock)
    }
}

impl Default for TestCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Throwaway git repository on branch `main` with one commit.
pub struct TestRepo {
    temp: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        init_git_repo(temp.path())?;
        Ok(Self { temp })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        let path = self.temp.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Stage everything and commit.
    pub fn commit_all(&self, message: &str) -> Result<()> {
        git(self.path(), &["add", "-A"])?;
        git(self.path(), &["commit", "-q", "-m", message])?;
        Ok(())
    }

    pub fn git(&self, args: &[&str]) -> Result<String> {
        git(self.path(), args)
    }
}

/// `git init` on `main` with a local identity and an initial commit.
pub fn init_git_repo(root: &Path) -> Result<()> {
    git(root, &["init", "-q", "-b", "main"])?;
    git(root, &["config", "user.email", "relay@example.com"])?;
    git(root, &["config", "user.name", "Relay Test"])?;
    git(root, &["config", "commit.gpgsign", "false"])?;
    fs::write(root.join("README.md"), "# test repo\n").context("write README")?;
    fs::write(root.join(".gitignore"), ".relay-cache/\n").context("write .gitignore")?;
    git(root, &["add", "-A"])?;
    git(root, &["commit", "-q", "-m", "initial"])?;
    Ok(())
}

fn git(root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
