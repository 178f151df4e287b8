//! Worker process spawning.
//!
//! The [`WorkerSpawner`] trait decouples the relay loop from the actual agent
//! backend. Tests use scripted workers that return predetermined exits without
//! spawning processes.
//!
//! Workers that reserve files of their own (`relay reserve`) must use the task
//! id as the reservation owner. The relay releases everything held under that
//! owner when the task's claim ends, and the owner is passed to the worker as
//! `RELAY_RESERVATION_OWNER`.

use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::types::WorkerExit;
use crate::io::config::WorkerConfig;
use crate::io::process::{run_command_logged, tail_text};
use crate::io::shutdown::Shutdown;

/// Characters of log tail carried back as the failure message.
const MESSAGE_TAIL_CHARS: usize = 2_000;

/// Parameters for one worker invocation.
///
/// `task_id` doubles as the reservation owner for anything the worker reserves.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub task_id: String,
    pub agent: String,
    pub workflow: String,
    pub stage: String,
    pub iteration: u32,
    /// Working directory for the worker process.
    pub workdir: PathBuf,
    /// Combined stdout/stderr log for this invocation.
    pub log_path: PathBuf,
    pub timeout: Duration,
}

/// Abstraction over worker backends.
///
/// `Err` means the worker could not be started at all; a worker that ran and
/// failed is an `Ok(WorkerExit)` with a non-zero code, signal, or timeout.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, request: &WorkerRequest) -> Result<WorkerExit>;
}

/// Spawns the configured worker command as a child process.
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    command: Vec<String>,
    output_limit_bytes: usize,
    shutdown: Option<Shutdown>,
}

impl ProcessWorker {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            command: config.command.clone(),
            output_limit_bytes: config.output_limit_bytes,
            shutdown: None,
        }
    }

    /// Kill the running worker once `shutdown` is requested.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn build_command(&self, request: &WorkerRequest) -> Result<Command> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("worker command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--agent")
            .arg(&request.agent)
            .arg("--task")
            .arg(&request.task_id)
            .current_dir(&request.workdir)
            .env("RELAY_TASK_ID", &request.task_id)
            .env("RELAY_RESERVATION_OWNER", &request.task_id)
            .env("RELAY_AGENT_TYPE", &request.agent)
            .env("RELAY_WORKFLOW", &request.workflow)
            .env("RELAY_STAGE", &request.stage)
            .env("RELAY_ITERATION", request.iteration.to_string());
        Ok(cmd)
    }
}

impl WorkerSpawner for ProcessWorker {
    #[instrument(skip_all, fields(task_id = %request.task_id, stage = %request.stage, agent = %request.agent))]
    fn spawn(&self, request: &WorkerRequest) -> Result<WorkerExit> {
        info!(timeout_secs = request.timeout.as_secs(), "starting worker");
        let cmd = self.build_command(request)?;
        let output = run_command_logged(
            cmd,
            request.timeout,
            self.output_limit_bytes,
            &request.log_path,
            self.shutdown.as_ref(),
        )
        .with_context(|| format!("run worker for stage {}", request.stage))?;

        let message = tail_text(&output.combined_text(), MESSAGE_TAIL_CHARS);
        if output.interrupted {
            warn!("worker interrupted by shutdown");
            return Ok(WorkerExit {
                exit_code: None,
                signal: exit_signal(&output.status),
                timed_out: false,
                message: format!("worker interrupted by shutdown\n{message}"),
            });
        }
        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "worker timed out");
            return Ok(WorkerExit::timeout(format!(
                "worker timed out after {}s\n{message}",
                request.timeout.as_secs()
            )));
        }
        let exit = WorkerExit {
            exit_code: output.status.code(),
            signal: exit_signal(&output.status),
            timed_out: false,
            message,
        };
        if exit.succeeded() {
            info!("worker finished");
        } else {
            warn!(exit_code = ?exit.exit_code, signal = ?exit.signal, "worker failed");
        }
        Ok(exit)
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
