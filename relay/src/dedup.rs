//! Failure fingerprinting, deduplication, and retry budgets.
//!
//! N workers that hit the same root cause produce exactly one fix task: the
//! first failure creates it, later ones are linked to it. Once a stage has
//! used its retry budget the task escalates to a human instead.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::budget::retry_budget_exhausted;
use crate::core::fingerprint::{FailureShape, description_marker, fingerprint, normalize_message};
use crate::core::task::{NewTask, TaskMetadata, TaskStatus, TaskUpdate};
use crate::core::types::{FailureAction, GateReport};
use crate::io::task_store::TaskStore;

/// One failed stage execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInput<'a> {
    pub task_id: &'a str,
    pub stage: &'a str,
    /// `timeout`, `signal:<n>`, `exit:<code>` or `gate:<names>`.
    pub error_class: &'a str,
    pub message: &'a str,
    pub retry_budget: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureOutcome {
    pub action: FailureAction,
    pub fix_task_id: Option<String>,
    pub fingerprint: String,
}

/// Error class for a gate failure: failing gate names, sorted.
pub fn gate_error_class(report: &GateReport) -> String {
    let mut failing = report.failing();
    failing.sort();
    format!("gate:{}", failing.join(","))
}

/// Route a failure to a fix task, an existing fix task, or a human.
///
/// A task that no longer exists is reported as [`FailureAction::TaskNotFound`]
/// rather than an error so the caller can carry on.
#[instrument(skip_all, fields(task_id = %input.task_id, stage = %input.stage, error_class = %input.error_class))]
pub fn handle_failure(store: &dyn TaskStore, input: &FailureInput<'_>) -> Result<FailureOutcome> {
    let Some(task) = store.show(input.task_id)? else {
        warn!("failing task not found");
        let fp = fingerprint(&FailureShape {
            template: input.task_id,
            stage: input.stage,
            error_class: input.error_class,
            message: input.message,
        });
        return Ok(FailureOutcome {
            action: FailureAction::TaskNotFound,
            fix_task_id: None,
            fingerprint: fp,
        });
    };

    let fp = fingerprint(&FailureShape {
        template: task.template_key(),
        stage: input.stage,
        error_class: input.error_class,
        message: input.message,
    });
    if !store.update_metadata(input.task_id, &mut |m| m.fingerprint = Some(fp.clone()))? {
        warn!("fingerprint was not recorded on the task");
    }

    let attempts = task.metadata.attempts_for(input.stage);
    if retry_budget_exhausted(attempts, input.retry_budget) {
        info!(attempts, budget = input.retry_budget, fingerprint = %fp, "retry budget exhausted, escalating");
        update_soft(
            store,
            input.task_id,
            TaskUpdate {
                status: Some(TaskStatus::HumanEscalation),
                notes: Some(format!(
                    "stage '{}' failed {attempts} time(s), retry budget {} exhausted ({}); \
                     needs human review",
                    input.stage, input.retry_budget, input.error_class
                )),
            },
        )?;
        return Ok(FailureOutcome {
            action: FailureAction::MaxRetriesExceeded,
            fix_task_id: None,
            fingerprint: fp,
        });
    }

    let fix = fix_task(input, task.template_key(), &fp);
    let (fix_id, created) = store.find_or_create_fix(&fp, &fix)?;
    if !store.add_dependency(input.task_id, &fix_id)? {
        warn!(fix_task_id = %fix_id, "could not record dependency on fix task");
    }

    let (action, status, notes) = if created {
        (
            FailureAction::CreatedFixTask,
            TaskStatus::Retrying,
            format!("stage '{}' failed; created fix task {fix_id}", input.stage),
        )
    } else {
        (
            FailureAction::LinkedToExistingFix,
            TaskStatus::Blocked,
            format!("stage '{}' failed; linked to existing fix task {fix_id}", input.stage),
        )
    };
    info!(?action, fix_task_id = %fix_id, fingerprint = %fp, "failure handled");
    update_soft(
        store,
        input.task_id,
        TaskUpdate {
            status: Some(status),
            notes: Some(notes),
        },
    )?;
    Ok(FailureOutcome {
        action,
        fix_task_id: Some(fix_id),
        fingerprint: fp,
    })
}

fn fix_task(input: &FailureInput<'_>, template: &str, fp: &str) -> NewTask {
    NewTask {
        title: format!("Fix {} failure in {}", input.stage, input.task_id),
        description: format!(
            "Stage '{}' of task {} failed ({}).\n\n{}\n\n{}",
            input.stage,
            input.task_id,
            input.error_class,
            normalize_message(input.message),
            description_marker(fp)
        ),
        metadata: TaskMetadata {
            fingerprint: Some(fp.to_string()),
            template: Some(format!("fix:{template}")),
            fix_for: Some(input.task_id.to_string()),
            failed_stage: Some(input.stage.to_string()),
            ..TaskMetadata::default()
        },
    }
}

fn update_soft(store: &dyn TaskStore, task_id: &str, update: TaskUpdate) -> Result<()> {
    if !store.update(task_id, &update)? {
        warn!(task_id, "task update was not applied");
    }
    Ok(())
}
