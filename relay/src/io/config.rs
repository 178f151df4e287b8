//! Relay configuration stored in `.relay/config.toml`.
//!
//! Every policy value the engine uses (iteration ceiling, retry budgets, gate
//! and lock timeouts, reservation TTL) comes from here, with safe defaults when
//! the file or a field is missing. `RELAY_*` environment variables override the
//! file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::workflow::WorkflowDefinition;
use crate::io::atomic::write_atomic;

/// Shortest accepted `lock.stale_after_secs`; lock holders never legitimately hold that long.
pub const MIN_STALE_AFTER_SECS: u64 = 10;

/// Relay configuration (TOML).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Cache directory, relative to the project root unless absolute.
    pub cache_dir: PathBuf,
    /// Hard ceiling on state transitions per relay run.
    pub max_iterations: u32,
    /// Retry budget for stages that do not set their own.
    pub default_retry_budget: u32,
    pub lock: LockConfig,
    pub reservations: ReservationConfig,
    pub gates: GatesConfig,
    pub worker: WorkerConfig,
    pub integration: IntegrationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// How long callers wait for the global lock before failing.
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Locks older than this are treated as abandoned and reclaimed.
    pub stale_after_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReservationConfig {
    pub default_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatesConfig {
    /// Per-gate timeout.
    pub timeout_secs: u64,
    /// Run gates concurrently; `false` runs them one after another.
    pub parallel: bool,
    pub lint: ToolGateConfig,
    pub mutation: MutationGateConfig,
    pub tdd: TddGateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolGateConfig {
    /// Command to run; touched files are appended as arguments.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MutationGateConfig {
    pub command: Vec<String>,
    /// Minimum mutation score (percent) required to pass.
    pub threshold: f64,
    /// Flag that scopes the run to the touched files, passed comma-joined.
    /// Empty runs the tool over the whole project.
    pub files_flag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TddGateConfig {
    /// Path fragments that identify test files.
    pub test_markers: Vec<String>,
    /// Extensions considered source code; other touched files are ignored.
    pub source_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker command; task id, agent type and workflow name are appended as flags.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate worker logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IntegrationConfig {
    pub enabled: bool,
    /// Shared mainline branch that task branches rebase onto and merge into.
    pub mainline: String,
    /// Remote to fetch the mainline from; `None` compares against the local branch.
    pub remote: Option<String>,
    pub branch_prefix: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".relay-cache"),
            max_iterations: 20,
            default_retry_budget: 3,
            lock: LockConfig::default(),
            reservations: ReservationConfig::default(),
            gates: GatesConfig::default(),
            worker: WorkerConfig::default(),
            integration: IntegrationConfig::default(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            poll_interval_ms: 25,
            stale_after_secs: 300,
        }
    }
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3_600,
        }
    }
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            parallel: true,
            lint: ToolGateConfig::default(),
            mutation: MutationGateConfig::default(),
            tdd: TddGateConfig::default(),
        }
    }
}

impl Default for ToolGateConfig {
    fn default() -> Self {
        Self {
            command: vec!["npx".to_string(), "eslint".to_string()],
        }
    }
}

impl Default for MutationGateConfig {
    fn default() -> Self {
        Self {
            command: vec!["npx".to_string(), "stryker".to_string(), "run".to_string()],
            threshold: 80.0,
            files_flag: "--mutate".to_string(),
        }
    }
}

impl Default for TddGateConfig {
    fn default() -> Self {
        Self {
            test_markers: [".test.", ".spec.", "_test.", "test_", "/tests/", "/__tests__/"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            source_extensions: ["js", "jsx", "ts", "tsx", "py", "rs", "go"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec!["droid".to_string(), "exec".to_string()],
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mainline: "main".to_string(),
            remote: None,
            branch_prefix: "relay/".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.lock.timeout_ms == 0 || self.lock.poll_interval_ms == 0 {
            return Err(anyhow!("lock.timeout_ms and lock.poll_interval_ms must be > 0"));
        }
        if self.lock.stale_after_secs < MIN_STALE_AFTER_SECS {
            return Err(anyhow!(
                "lock.stale_after_secs must be at least {MIN_STALE_AFTER_SECS}"
            ));
        }
        if self.reservations.default_ttl_secs == 0 {
            return Err(anyhow!("reservations.default_ttl_secs must be > 0"));
        }
        if self.gates.timeout_secs == 0 {
            return Err(anyhow!("gates.timeout_secs must be > 0"));
        }
        if !(0.0..=100.0).contains(&self.gates.mutation.threshold) {
            return Err(anyhow!("gates.mutation.threshold must be within 0..=100"));
        }
        if self.worker.timeout_secs == 0 {
            return Err(anyhow!("worker.timeout_secs must be > 0"));
        }
        if self.worker.output_limit_bytes == 0 {
            return Err(anyhow!("worker.output_limit_bytes must be > 0"));
        }
        if self.worker.command.is_empty() || self.worker.command[0].trim().is_empty() {
            return Err(anyhow!("worker.command must be a non-empty array"));
        }
        if self.integration.mainline.trim().is_empty() {
            return Err(anyhow!("integration.mainline must not be empty"));
        }
        Ok(())
    }

    /// Apply `RELAY_*` overrides using `lookup` (normally `std::env::var`).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("RELAY_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_env(&lookup, "RELAY_MAX_ITERATIONS")? {
            self.max_iterations = v;
        }
        if let Some(v) = parse_env(&lookup, "RELAY_RETRY_BUDGET")? {
            self.default_retry_budget = v;
        }
        if let Some(v) = parse_env(&lookup, "RELAY_GATE_TIMEOUT_SECS")? {
            self.gates.timeout_secs = v;
        }
        if let Some(v) = parse_env(&lookup, "RELAY_RESERVATION_TTL_SECS")? {
            self.reservations.default_ttl_secs = v;
        }
        if let Some(v) = parse_env(&lookup, "RELAY_LOCK_TIMEOUT_MS")? {
            self.lock.timeout_ms = v;
        }
        Ok(())
    }

    /// Cache directory resolved against the project root.
    pub fn cache_dir_in(&self, root: &Path) -> PathBuf {
        if self.cache_dir.is_absolute() {
            self.cache_dir.clone()
        } else {
            root.join(&self.cache_dir)
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock.timeout_ms)
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gates.timeout_secs)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.timeout_secs)
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservations.default_ttl_secs)
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow!("invalid {key}={raw:?}: {err}")),
    }
}

/// Default config location under a repository root.
pub fn default_config_path(root: &Path) -> PathBuf {
    root.join(".relay").join("config.toml")
}

/// Load config from a TOML file, then apply environment overrides.
///
/// If the file is missing, starts from `RelayConfig::default()`.
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    let mut cfg = read_config_file(path)?;
    cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<RelayConfig> {
    if !path.exists() {
        return Ok(RelayConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RelayConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Load a workflow definition (`.toml` or `.json`, by extension) and validate it.
///
/// Validation errors keep their [`crate::error::WorkflowConfigError`] type under the context.
pub fn load_workflow(path: &Path) -> Result<WorkflowDefinition> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let workflow: WorkflowDefinition = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?,
        Some("json") => {
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
        }
        _ => {
            return Err(anyhow!(
                "unsupported workflow file {} (expected .toml or .json)",
                path.display()
            ));
        }
    };
    workflow
        .validate()
        .with_context(|| format!("invalid workflow {}", path.display()))?;
    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = read_config_file(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RelayConfig::default());
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn write_then_read_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = RelayConfig {
            max_iterations: 7,
            ..RelayConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        assert_eq!(read_config_file(&path).expect("read"), cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_iterations = 5\n[gates]\nparallel = false\n").expect("write");
        let cfg = read_config_file(&path).expect("read");
        assert_eq!(cfg.max_iterations, 5);
        assert!(!cfg.gates.parallel);
        assert_eq!(cfg.gates.timeout_secs, 300);
        assert_eq!(cfg.default_retry_budget, 3);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("RELAY_MAX_ITERATIONS", "9"),
            ("RELAY_RESERVATION_TTL_SECS", "60"),
            ("RELAY_CACHE_DIR", "/var/relay"),
        ]
        .into_iter()
        .collect();
        let mut cfg = RelayConfig::default();
        cfg.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .expect("apply");
        assert_eq!(cfg.max_iterations, 9);
        assert_eq!(cfg.reservation_ttl(), Duration::from_secs(60));
        assert_eq!(cfg.cache_dir_in(Path::new("/repo")), PathBuf::from("/var/relay"));
    }

    #[test]
    fn invalid_env_value_is_rejected() {
        let mut cfg = RelayConfig::default();
        let err = cfg
            .apply_env_overrides(|key| (key == "RELAY_LOCK_TIMEOUT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("RELAY_LOCK_TIMEOUT_MS"));
    }

    #[test]
    fn validate_rejects_zero_iterations() {
        let cfg = RelayConfig {
            max_iterations: 0,
            ..RelayConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_short_stale_window() {
        let mut cfg = RelayConfig::default();
        cfg.lock.stale_after_secs = 0;
        assert!(cfg.validate().is_err());
        cfg.lock.stale_after_secs = MIN_STALE_AFTER_SECS;
        cfg.validate().expect("floor is accepted");
    }

    #[test]
    fn gate_tool_sections_default_when_omitted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[gates.mutation]\nthreshold = 60.0\n").expect("write");
        let cfg = read_config_file(&path).expect("read");
        assert_eq!(cfg.gates.mutation.threshold, 60.0);
        assert_eq!(cfg.gates.lint.command, vec!["npx", "eslint"]);

        fs::write(&path, "[gates.lint]\n").expect("write");
        let cfg = read_config_file(&path).expect("read");
        assert_eq!(cfg.gates.lint, ToolGateConfig::default());
    }

    #[test]
    fn loads_json_and_toml_workflows() {
        let temp = tempfile::tempdir().expect("tempdir");
        let json = temp.path().join("feature.json");
        fs::write(
            &json,
            r#"{"name":"feature","start":"code","transitions":{
                "code":{"onSuccess":"complete","onFail":"human_escalation","gates":[]}}}"#,
        )
        .expect("write json");
        assert_eq!(load_workflow(&json).expect("json").name, "feature");

        let toml_path = temp.path().join("feature.toml");
        fs::write(
            &toml_path,
            "start = \"code\"\n[transitions.code]\nonSuccess = \"complete\"\nonFail = \"code\"\ngates = [\"lint\"]\n",
        )
        .expect("write toml");
        let workflow = load_workflow(&toml_path).expect("toml");
        assert_eq!(workflow.transition("code").expect("code").gates, vec!["lint"]);
    }

    #[test]
    fn invalid_workflow_keeps_typed_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("broken.json");
        fs::write(
            &path,
            r#"{"start":"code","transitions":{"code":{"onSuccess":"review","onFail":"code"}}}"#,
        )
        .expect("write");
        let err = load_workflow(&path).unwrap_err();
        assert!(err.downcast_ref::<crate::error::WorkflowConfigError>().is_some());
    }
}
