//! The relay state machine: drives one task through its workflow.
//!
//! Each iteration rebases the task branch if the mainline moved, runs the
//! current state's worker, checks its gates, and follows `onSuccess` or
//! `onFail`. Failures go through [`crate::dedup`]; reaching `complete` runs the
//! irreversible-action guard and the squash merge. Every way out of the loop
//! leaves the task with a status and a note explaining it, and runs that stop
//! short of a merge also leave an error report.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::guard::{MergeDecision, check_irreversible};
use crate::core::task::{RebaseState, RebaseStatus, TaskMetadata, TaskRecord, TaskStatus, TaskUpdate};
use crate::core::types::{FailureAction, WorkerExit};
use crate::core::workflow::{COMPLETE, HUMAN_ESCALATION, WorkflowDefinition};
use crate::dedup::{FailureInput, gate_error_class, handle_failure};
use crate::error::{TaskClaimedError, TaskNotFoundError};
use crate::gatekeeper::{GateOptions, Gatekeeper};
use crate::integrate::{Integrator, RebaseOutcome};
use crate::io::config::RelayConfig;
use crate::io::error_report::{
    AttemptedSolution, ErrorDetail, ErrorReport, Severity, clear_error_report, write_error_report,
};
use crate::io::gates::{GateInput, GateRegistry};
use crate::io::iteration_log::{FailureRecord, IterationMeta, write_iteration};
use crate::io::lock::LockDir;
use crate::io::metrics::MetricsSink;
use crate::io::paths::CachePaths;
use crate::io::reservations::ReservationStore;
use crate::io::shutdown::Shutdown;
use crate::io::state_store::{StateStore, process_owner};
use crate::io::task_store::TaskStore;
use crate::io::worker::{WorkerRequest, WorkerSpawner};

/// Collaborators the relay drives.
pub struct RelayDeps {
    pub store: Arc<dyn TaskStore>,
    pub worker: Arc<dyn WorkerSpawner>,
    pub integrator: Arc<dyn Integrator>,
    pub gates: GateRegistry,
    pub metrics: Arc<dyn MetricsSink>,
    /// Checked between iterations; a requested shutdown leaves the task open.
    pub shutdown: Shutdown,
}

/// How a relay run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalState {
    Complete,
    HumanEscalation,
    Blocked,
    MaxIterationsExceeded,
    /// Stopped by a shutdown request; the task was reopened.
    Interrupted,
}

impl FinalState {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalState::Complete => "complete",
            FinalState::HumanEscalation => "human_escalation",
            FinalState::Blocked => "blocked",
            FinalState::MaxIterationsExceeded => "max_iterations_exceeded",
            FinalState::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayOutcome {
    pub task_id: String,
    pub final_state: FinalState,
    /// Task status written when the run ended.
    pub status: TaskStatus,
    pub iterations: u32,
    pub reason: String,
    /// True when the run stopped on a rebase or merge conflict.
    #[serde(default)]
    pub conflict: bool,
}

/// Why an integration step stopped the run.
struct Halt {
    reason: String,
    conflict: bool,
}

impl Halt {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            conflict: false,
        }
    }

    fn conflict(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            conflict: true,
        }
    }
}

pub struct Relay {
    config: RelayConfig,
    workdir: PathBuf,
    paths: CachePaths,
    owner: String,
    store: Arc<dyn TaskStore>,
    worker: Arc<dyn WorkerSpawner>,
    integrator: Arc<dyn Integrator>,
    gatekeeper: Gatekeeper,
    state: StateStore,
    reservations: ReservationStore,
    shutdown: Shutdown,
}

impl Relay {
    pub fn new(config: RelayConfig, workdir: impl Into<PathBuf>, deps: RelayDeps) -> Self {
        let workdir = workdir.into();
        let paths = CachePaths::new(config.cache_dir_in(&workdir));
        let lock = LockDir::new(&paths.lock_dir, &config.lock);
        let state = StateStore::new(&paths.state_path, lock.clone(), config.lock_timeout());
        let reservations = ReservationStore::new(
            &paths.reservations_path,
            lock,
            config.lock_timeout(),
            config.reservation_ttl(),
        );
        Self {
            owner: process_owner(),
            gatekeeper: Gatekeeper::new(deps.gates, deps.metrics),
            store: deps.store,
            worker: deps.worker,
            integrator: deps.integrator,
            shutdown: deps.shutdown,
            config,
            workdir,
            paths,
            state,
            reservations,
        }
    }

    /// Claim owner recorded in `state.json` while a task runs.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Drive `task_id` through `workflow` until it reaches a terminal outcome.
    ///
    /// Errors are reserved for conditions the loop cannot report on the task
    /// itself: an invalid workflow, an unusable cache directory, a missing task,
    /// a claim held by another relay, or lock contention.
    #[instrument(skip_all, fields(task_id = %task_id, workflow = %workflow.name))]
    pub fn run(&self, task_id: &str, workflow: &WorkflowDefinition) -> Result<RelayOutcome> {
        workflow
            .validate()
            .with_context(|| format!("invalid workflow '{}'", workflow.name))?;
        self.paths.ensure()?;
        let task = self
            .store
            .show(task_id)?
            .ok_or_else(|| TaskNotFoundError(task_id.to_string()))?;

        self.state.add_task(task_id, Some(&workflow.name))?;
        let _claim = self.claim(task_id)?;

        let branch = self.branch_for(&task);
        let mut attempts = Vec::new();
        let outcome = match self.integrator.prepare_branch(&branch) {
            Ok(()) => {
                info!(branch = %branch, start = %workflow.start, "relay started");
                self.drive(task_id, &branch, workflow, &mut attempts)?
            }
            Err(err) => {
                let halt = Halt::new(format!("could not prepare branch {branch}: {err:#}"));
                self.block(task_id, 0, halt)?
            }
        };
        self.file_report(&outcome, &branch, attempts);
        Ok(outcome)
    }

    fn drive(
        &self,
        task_id: &str,
        branch: &str,
        workflow: &WorkflowDefinition,
        attempts: &mut Vec<AttemptedSolution>,
    ) -> Result<RelayOutcome> {
        let mut current = workflow.start.clone();
        let mut iterations = 0u32;
        loop {
            if self.shutdown.is_requested() {
                return self.interrupt(task_id, iterations, &current);
            }
            if iterations >= self.config.max_iterations {
                warn!(iterations, state = %current, "iteration ceiling reached");
                let reason = format!(
                    "max_iterations_exceeded: stopped after {iterations} iteration(s) in state '{current}'"
                );
                self.set_status(task_id, TaskStatus::Blocked, &reason)?;
                return Ok(RelayOutcome {
                    task_id: task_id.to_string(),
                    final_state: FinalState::MaxIterationsExceeded,
                    status: TaskStatus::Blocked,
                    iterations,
                    reason,
                    conflict: false,
                });
            }
            iterations += 1;

            let step = self.step(task_id, branch, workflow, &current, iterations, attempts)?;
            match step {
                Step::Halted(halt) => return self.block(task_id, iterations, halt),
                Step::Interrupted => return self.interrupt(task_id, iterations, &current),
                Step::Escalated(reason) => {
                    return Ok(RelayOutcome {
                        task_id: task_id.to_string(),
                        final_state: FinalState::HumanEscalation,
                        status: TaskStatus::HumanEscalation,
                        iterations,
                        reason,
                        conflict: false,
                    });
                }
                Step::Next(next) if next == COMPLETE => {
                    return self.complete(task_id, branch, iterations);
                }
                Step::Next(next) if next == HUMAN_ESCALATION => {
                    let reason = format!("workflow routed state '{current}' to human escalation");
                    self.set_status(task_id, TaskStatus::Blocked, &reason)?;
                    info!(state = %current, "routed to human escalation");
                    return Ok(RelayOutcome {
                        task_id: task_id.to_string(),
                        final_state: FinalState::HumanEscalation,
                        status: TaskStatus::Blocked,
                        iterations,
                        reason,
                        conflict: false,
                    });
                }
                Step::Next(next) => {
                    info!(from = %current, to = %next, "transition");
                    current = next;
                }
            }
        }
    }

    /// One iteration of `state`: rebase, worker, gates, failure handling.
    #[instrument(skip_all, fields(state = %state, iter))]
    fn step(
        &self,
        task_id: &str,
        branch: &str,
        workflow: &WorkflowDefinition,
        state: &str,
        iter: u32,
        attempts: &mut Vec<AttemptedSolution>,
    ) -> Result<Step> {
        let transition = workflow
            .transition(state)
            .ok_or_else(|| anyhow!("state '{state}' is not defined in workflow '{}'", workflow.name))?;
        let started_at = Utc::now();
        let started = Instant::now();
        let task = self
            .store
            .show(task_id)?
            .ok_or_else(|| TaskNotFoundError(task_id.to_string()))?;

        let rebase = match self.reactive_rebase(branch) {
            Ok(status) => status,
            Err((status, halt)) => {
                self.edit_metadata(task_id, &mut |m| m.rebase_status = Some(status.clone()))?;
                return Ok(Step::Halted(halt));
            }
        };
        let rebase_note = rebase_note(&rebase);

        // Counted before the worker starts so a crash mid-stage still consumes budget.
        let mut attempt = task.metadata.attempts_for(state).saturating_add(1);
        self.edit_metadata(task_id, &mut |m| {
            m.rebase_status = Some(rebase.clone());
            attempt = m.bump_attempts(state);
        })?;
        self.update_soft(
            task_id,
            &TaskUpdate {
                status: Some(TaskStatus::InProgress),
                notes: None,
            },
        )?;

        let agent = transition.agent(state);
        let request = WorkerRequest {
            task_id: task_id.to_string(),
            agent: agent.to_string(),
            workflow: workflow.name.clone(),
            stage: state.to_string(),
            iteration: iter,
            workdir: self.workdir.clone(),
            log_path: self.paths.worker_log_path(task_id, iter, state),
            timeout: transition.timeout(self.config.worker_timeout()),
        };
        let exit = match self.worker.spawn(&request) {
            Ok(exit) => exit,
            Err(err) => {
                warn!(err = %err, agent, "worker could not be started");
                WorkerExit::not_started(format!("{err:#}"))
            }
        };
        debug!(succeeded = exit.succeeded(), error_class = %exit.error_class(), "worker finished");
        if self.shutdown.is_requested() {
            return Ok(Step::Interrupted);
        }

        let mut gates = None;
        let failure = if exit.succeeded() {
            let message = format!("relay: {task_id} {state} iteration {iter}");
            match self.integrator.commit_work(branch, &message) {
                Ok(Some(commit)) => debug!(commit = %commit, "worker output committed"),
                Ok(None) => {}
                Err(err) => {
                    return Ok(Step::Halted(Halt::new(format!(
                        "could not commit worker output on {branch}: {err:#}"
                    ))));
                }
            }
            let files = match self.integrator.touched_files(branch) {
                Ok(files) => files,
                Err(err) => {
                    return Ok(Step::Halted(Halt::new(format!(
                        "could not list files changed on {branch}: {err:#}"
                    ))));
                }
            };
            let input = GateInput {
                task_id: task_id.to_string(),
                stage: state.to_string(),
                workdir: self.workdir.clone(),
                files,
                timeout: self.config.gate_timeout(),
            };
            let opts = GateOptions {
                parallel: self.config.gates.parallel,
                timeout: self.config.gate_timeout(),
            };
            let report = self.gatekeeper.run_gates(&transition.gates, &input, opts);
            let failure = (!report.all_passed).then(|| (gate_error_class(&report), report.failure_detail()));
            gates = Some(report);
            failure
        } else {
            Some((exit.error_class(), exit.message.clone()))
        };

        let retry_budget = transition.retry_budget(self.config.default_retry_budget);
        let record = match &failure {
            None => None,
            Some((error_class, message)) => {
                let outcome = handle_failure(
                    self.store.as_ref(),
                    &FailureInput {
                        task_id,
                        stage: state,
                        error_class,
                        message,
                        retry_budget,
                    },
                )?;
                Some(FailureRecord {
                    action: outcome.action,
                    fingerprint: outcome.fingerprint,
                    fix_task_id: outcome.fix_task_id,
                })
            }
        };
        attempts.push(AttemptedSolution {
            iteration: iter,
            stage: state.to_string(),
            agent: agent.to_string(),
            outcome: failure
                .as_ref()
                .map_or_else(|| "passed".to_string(), |(class, _)| class.clone()),
        });
        let escalated = record
            .as_ref()
            .is_some_and(|r| r.action == FailureAction::MaxRetriesExceeded);
        let next = match (&record, escalated) {
            (None, _) => transition.on_success.clone(),
            (Some(_), true) => HUMAN_ESCALATION.to_string(),
            (Some(_), false) => transition.on_fail.clone(),
        };

        let ended_at = Utc::now();
        let meta = IterationMeta {
            task_id: task_id.to_string(),
            iter,
            stage: state.to_string(),
            agent: agent.to_string(),
            attempt,
            rebase: Some(rebase_note),
            worker: Some(exit),
            failure: record,
            next_state: next.clone(),
            started_at,
            ended_at,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        write_iteration(&self.paths, &meta, gates.as_ref())?;

        if escalated {
            return Ok(Step::Escalated(format!(
                "stage '{state}' exhausted its retry budget of {retry_budget}"
            )));
        }
        Ok(Step::Next(next))
    }

    /// Rebase the task branch when the mainline has moved.
    ///
    /// `Err` carries the status to record and the reason the task must block.
    fn reactive_rebase(&self, branch: &str) -> Result<RebaseStatus, (RebaseStatus, Halt)> {
        let status = |state, commits_behind, commit: Option<String>, detail: Option<String>| RebaseStatus {
            state,
            commits_behind,
            commit,
            detail,
            checked_at: Utc::now(),
        };
        let check = match self.integrator.check_needs_rebase(branch) {
            Ok(check) => check,
            Err(err) => {
                let detail = format!("{err:#}");
                return Err((
                    status(RebaseState::Failed, 0, None, Some(detail.clone())),
                    Halt::new(format!("could not compare {branch} with mainline: {detail}")),
                ));
            }
        };
        if !check.needs_rebase {
            return Ok(status(RebaseState::UpToDate, 0, None, None));
        }
        info!(commits_behind = check.commits_behind, "mainline moved, rebasing");
        let behind = check.commits_behind;
        match self.integrator.perform_rebase(branch) {
            Ok(RebaseOutcome::Rebased { commit }) => Ok(status(RebaseState::Rebased, behind, Some(commit), None)),
            Ok(RebaseOutcome::Conflict { detail }) => Err((
                status(RebaseState::Conflict, behind, None, Some(detail.clone())),
                Halt::conflict(format!(
                    "rebase of {branch} onto mainline hit conflicts; needs conflict resolution:\n{detail}"
                )),
            )),
            Ok(RebaseOutcome::DirtyTree { files }) => {
                let detail = files.join(", ");
                Err((
                    status(RebaseState::Failed, behind, None, Some(detail.clone())),
                    Halt::new(format!(
                        "cannot rebase {branch}: working tree has uncommitted changes ({detail})"
                    )),
                ))
            }
            Ok(RebaseOutcome::Failed { detail }) => {
                if let Err(err) = self.integrator.abort_rebase() {
                    warn!(err = %err, "rebase abort failed");
                }
                Err((
                    status(RebaseState::Failed, behind, None, Some(detail.clone())),
                    Halt::new(format!("rebase of {branch} failed and was aborted:\n{detail}")),
                ))
            }
            Err(err) => {
                if let Err(abort_err) = self.integrator.abort_rebase() {
                    warn!(err = %abort_err, "rebase abort failed");
                }
                let detail = format!("{err:#}");
                Err((
                    status(RebaseState::Failed, behind, None, Some(detail.clone())),
                    Halt::new(format!("rebase of {branch} failed: {detail}")),
                ))
            }
        }
    }

    /// Terminal transition: guard, conflict check, squash merge, close.
    #[instrument(skip_all, fields(task_id = %task_id, branch = %branch))]
    fn complete(&self, task_id: &str, branch: &str, iterations: u32) -> Result<RelayOutcome> {
        let task = self
            .store
            .show(task_id)?
            .ok_or_else(|| TaskNotFoundError(task_id.to_string()))?;
        if let MergeDecision::Refused { reason } = check_irreversible(task_id, &task.metadata) {
            warn!("irreversible task without approval, refusing merge");
            return self.block(task_id, iterations, Halt::new(reason));
        }

        match self.integrator.check_for_conflicts(branch) {
            Ok(true) => {}
            Ok(false) => {
                return self.block(
                    task_id,
                    iterations,
                    Halt::conflict(format!("{branch} no longer merges cleanly into mainline")),
                );
            }
            Err(err) => {
                return self.block(
                    task_id,
                    iterations,
                    Halt::new(format!("conflict check for {branch} failed: {err:#}")),
                );
            }
        }

        let merge = match self.integrator.perform_squash_merge(task_id, branch) {
            Ok(merge) => merge,
            Err(err) => {
                return self.block(task_id, iterations, Halt::new(format!("squash merge failed: {err:#}")));
            }
        };
        if !merge.success {
            let detail = merge.error.unwrap_or_else(|| "unknown error".to_string());
            return self.block(task_id, iterations, Halt::new(format!("squash merge failed: {detail}")));
        }
        if let Err(err) = self.integrator.cleanup_task_branch(branch) {
            warn!(err = %err, "branch cleanup failed; merge stands");
        }

        let reason = match merge.commit.as_deref().filter(|c| !c.is_empty()) {
            Some(commit) => format!("workflow complete; squash merged as {commit}"),
            None => "workflow complete".to_string(),
        };
        self.set_status(task_id, TaskStatus::Closed, &reason)?;
        info!(iterations, "task closed");
        Ok(RelayOutcome {
            task_id: task_id.to_string(),
            final_state: FinalState::Complete,
            status: TaskStatus::Closed,
            iterations,
            reason,
            conflict: false,
        })
    }

    fn block(&self, task_id: &str, iterations: u32, halt: Halt) -> Result<RelayOutcome> {
        warn!(task_id, reason = %halt.reason, "blocking task");
        self.set_status(task_id, TaskStatus::Blocked, &halt.reason)?;
        Ok(RelayOutcome {
            task_id: task_id.to_string(),
            final_state: FinalState::Blocked,
            status: TaskStatus::Blocked,
            iterations,
            reason: halt.reason,
            conflict: halt.conflict,
        })
    }

    /// Reopen the task so a later run picks it up where this one stopped.
    fn interrupt(&self, task_id: &str, iterations: u32, state: &str) -> Result<RelayOutcome> {
        warn!(task_id, state, "shutdown requested, stopping relay");
        let reason = format!("interrupted by shutdown in state '{state}'; rerun to resume");
        self.set_status(task_id, TaskStatus::Open, &reason)?;
        Ok(RelayOutcome {
            task_id: task_id.to_string(),
            final_state: FinalState::Interrupted,
            status: TaskStatus::Open,
            iterations,
            reason,
            conflict: false,
        })
    }

    /// Write or clear `error_report.json` for a finished run. Failures only warn.
    fn file_report(&self, outcome: &RelayOutcome, branch: &str, attempts: Vec<AttemptedSolution>) {
        let filed = match error_report(&self.owner, outcome, branch, attempts) {
            Some(report) => write_error_report(&self.paths, &report).map(|path| {
                info!(path = %path.display(), "error report written");
            }),
            None if outcome.final_state == FinalState::Complete => {
                clear_error_report(&self.paths, &outcome.task_id).map(|_| ())
            }
            None => Ok(()),
        };
        if let Err(err) = filed {
            warn!(err = %err, task_id = %outcome.task_id, "could not update error report");
        }
    }

    fn branch_for(&self, task: &TaskRecord) -> String {
        task.metadata
            .branch
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.config.integration.branch_prefix, task.id))
    }

    fn claim(&self, task_id: &str) -> Result<ClaimGuard<'_>> {
        if !self.state.claim_task(task_id, &self.owner)? {
            let owner = self
                .state
                .claim_holder(task_id)?
                .map(|claim| claim.owner)
                .unwrap_or_default();
            return Err(TaskClaimedError {
                task_id: task_id.to_string(),
                owner,
            }
            .into());
        }
        Ok(ClaimGuard {
            relay: self,
            task_id: task_id.to_string(),
        })
    }

    fn set_status(&self, task_id: &str, status: TaskStatus, notes: &str) -> Result<()> {
        self.update_soft(task_id, &TaskUpdate::status(status, notes))
    }

    fn update_soft(&self, task_id: &str, update: &TaskUpdate) -> Result<()> {
        if !self.store.update(task_id, update)? {
            warn!(task_id, "task update was not applied");
        }
        Ok(())
    }

    fn edit_metadata(&self, task_id: &str, edit: &mut dyn FnMut(&mut TaskMetadata)) -> Result<()> {
        if !self.store.update_metadata(task_id, edit)? {
            warn!(task_id, "metadata update was not applied");
        }
        Ok(())
    }
}

enum Step {
    Next(String),
    Halted(Halt),
    Escalated(String),
    Interrupted,
}

/// Report for an outcome that needs attention; `None` for completed or interrupted runs.
fn error_report(
    sender: &str,
    outcome: &RelayOutcome,
    branch: &str,
    attempts: Vec<AttemptedSolution>,
) -> Option<ErrorReport> {
    let (code, severity, suggested) = match outcome.final_state {
        FinalState::Complete | FinalState::Interrupted => return None,
        FinalState::Blocked if outcome.conflict => (
            "conflict",
            Severity::High,
            vec!["resolve the conflicts between the task branch and the mainline, then rerun the task"],
        ),
        FinalState::Blocked => (
            "blocked",
            Severity::High,
            vec![
                "read the task notes and the latest worker log",
                "rerun the task once the cause is fixed",
            ],
        ),
        FinalState::HumanEscalation => (
            "human_escalation",
            Severity::Blocking,
            vec![
                "review the failing stage and its linked fix tasks",
                "fix the root cause or raise the stage's retry budget, then rerun the task",
            ],
        ),
        FinalState::MaxIterationsExceeded => (
            "max_iterations_exceeded",
            Severity::Medium,
            vec![
                "check the workflow for a cycle between stages",
                "raise max_iterations if the work is progressing",
            ],
        ),
    };
    let context = BTreeMap::from([
        ("branch".to_string(), branch.to_string()),
        ("iterations".to_string(), outcome.iterations.to_string()),
        ("status".to_string(), outcome.status.as_str().to_string()),
    ]);
    let mut report = ErrorReport::new(
        sender,
        &outcome.task_id,
        severity,
        ErrorDetail {
            code: code.to_string(),
            message: outcome.reason.clone(),
            context,
        },
    );
    report.needs_human_intervention = true;
    report.attempted_solutions = attempts;
    report.suggested_actions = suggested.into_iter().map(str::to_string).collect();
    Some(report)
}

/// Releases the task claim and the task's file reservations when the run ends.
struct ClaimGuard<'a> {
    relay: &'a Relay,
    task_id: String,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        match self.relay.reservations.release_by_owner(&self.task_id) {
            Ok(0) => {}
            Ok(released) => debug!(task_id = %self.task_id, released, "released task reservations"),
            Err(err) => warn!(err = %err, task_id = %self.task_id, "failed to release reservations"),
        }
        if let Err(err) = self.relay.state.release_task(&self.task_id, &self.relay.owner) {
            warn!(err = %err, task_id = %self.task_id, "failed to release task claim");
        }
    }
}

fn rebase_note(status: &RebaseStatus) -> String {
    match (&status.state, &status.commit) {
        (RebaseState::Rebased, Some(commit)) => format!("rebased onto mainline at {commit}"),
        (RebaseState::UpToDate, _) => "up to date".to_string(),
        (state, _) => format!("{state:?}").to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_state_names_match_terminal_vocabulary() {
        assert_eq!(FinalState::Complete.as_str(), COMPLETE);
        assert_eq!(FinalState::HumanEscalation.as_str(), HUMAN_ESCALATION);
        assert_eq!(
            serde_json::to_string(&FinalState::MaxIterationsExceeded).expect("json"),
            "\"max_iterations_exceeded\""
        );
    }

    fn outcome(final_state: FinalState, conflict: bool) -> RelayOutcome {
        RelayOutcome {
            task_id: "bd-1".to_string(),
            final_state,
            status: TaskStatus::Blocked,
            iterations: 2,
            reason: "stopped".to_string(),
            conflict,
        }
    }

    #[test]
    fn only_unfinished_runs_get_error_reports() {
        assert!(error_report("relay:1", &outcome(FinalState::Complete, false), "b", Vec::new()).is_none());
        assert!(error_report("relay:1", &outcome(FinalState::Interrupted, false), "b", Vec::new()).is_none());

        let report = error_report("relay:1", &outcome(FinalState::Blocked, true), "relay/bd-1", Vec::new())
            .expect("report");
        assert_eq!(report.error.code, "conflict");
        assert_eq!(report.severity, Severity::High);
        assert_eq!(report.error.context["branch"], "relay/bd-1");
        assert!(report.needs_human_intervention);

        let escalated = error_report("relay:1", &outcome(FinalState::HumanEscalation, false), "b", Vec::new())
            .expect("report");
        assert_eq!(escalated.severity, Severity::Blocking);
        assert!(!escalated.suggested_actions.is_empty());
    }

    #[test]
    fn rebase_notes_are_readable() {
        let status = RebaseStatus {
            state: RebaseState::Rebased,
            commits_behind: 2,
            commit: Some("abc123".to_string()),
            detail: None,
            checked_at: Utc::now(),
        };
        assert_eq!(rebase_note(&status), "rebased onto mainline at abc123");
        let up = RebaseStatus {
            state: RebaseState::UpToDate,
            commit: None,
            ..status
        };
        assert_eq!(rebase_note(&up), "up to date");
    }
}
