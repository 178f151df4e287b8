//! Verification gates and the name → gate table.
//!
//! A gate looks at the files a worker touched and returns a [`GateResult`].
//! Tool-backed gates parse their tool's output through a typed report in their
//! own module; a tool that is not installed yields a passing, skipped result.

pub mod lint;
pub mod mutation;
pub mod tdd;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::debug;

use crate::core::types::GateResult;
use crate::io::config::GatesConfig;
use crate::io::process::{CommandOutput, is_spawn_not_found, run_command_with_timeout};

/// In-memory cap on gate tool output.
const TOOL_OUTPUT_LIMIT: usize = 256 * 1024;

/// What a gate gets to look at.
#[derive(Debug, Clone)]
pub struct GateInput {
    pub task_id: String,
    pub stage: String,
    pub workdir: PathBuf,
    /// Paths relative to `workdir`.
    pub files: Vec<String>,
    /// Upper bound for any tool the gate runs.
    pub timeout: Duration,
}

pub trait Gate: Send + Sync {
    fn name(&self) -> &str;

    /// Evaluate the gate. `Err` is converted into a failing result by the gatekeeper.
    fn run(&self, input: &GateInput) -> Result<GateResult>;
}

/// Fixed table of gates by name.
#[derive(Clone, Default)]
pub struct GateRegistry {
    gates: BTreeMap<String, Arc<dyn Gate>>,
}

impl std::fmt::Debug for GateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateRegistry")
            .field("gates", &self.gates.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `tdd`, `mutation` and `lint` gates.
    pub fn with_builtins(config: &GatesConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(tdd::TddGate::new(&config.tdd)));
        registry.register(Arc::new(mutation::MutationGate::new(&config.mutation)));
        registry.register(Arc::new(lint::LintGate::new(&config.lint)));
        registry
    }

    /// Add or replace a gate under its own name.
    pub fn register(&mut self, gate: Arc<dyn Gate>) {
        self.gates.insert(gate.name().to_string(), gate);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Gate>> {
        self.gates.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.gates.keys().cloned().collect()
    }
}

/// Outcome of running a gate's external tool.
#[derive(Debug)]
pub(crate) enum ToolRun {
    /// The tool is not installed; carries a human-readable reason.
    Missing(String),
    Finished(CommandOutput),
}

/// Run `command` (plus `extra_args`) in the gate's workdir.
pub(crate) fn run_tool(
    gate: &str,
    command: &[String],
    extra_args: &[String],
    input: &GateInput,
) -> Result<ToolRun> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("{gate} gate has no command configured"))?;
    let mut cmd = Command::new(program);
    cmd.args(args).args(extra_args).current_dir(&input.workdir);

    let output = match run_command_with_timeout(cmd, input.timeout, TOOL_OUTPUT_LIMIT) {
        Ok(output) => output,
        Err(err) if is_spawn_not_found(&err) => {
            return Ok(ToolRun::Missing(format!("{program} is not installed")));
        }
        Err(err) => return Err(err),
    };
    if output.timed_out {
        return Err(anyhow!(
            "{gate} tool timed out after {}s",
            input.timeout.as_secs()
        ));
    }
    if reports_missing_tool(output.status.code(), &output.combined_text()) {
        debug!(gate, "tool reported as unavailable");
        return Ok(ToolRun::Missing(format!(
            "{} is not available",
            command.join(" ")
        )));
    }
    Ok(ToolRun::Finished(output))
}

/// Shells and package runners report a missing tool through exit code 127 or stock phrases.
fn reports_missing_tool(exit_code: Option<i32>, text: &str) -> bool {
    if exit_code == Some(0) {
        return false;
    }
    exit_code == Some(127)
        || text.contains("command not found")
        || text.contains("could not determine executable to run")
        || text.contains("No such file or directory (os error 2)")
}
