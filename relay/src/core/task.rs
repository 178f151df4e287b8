//! Task records as the engine sees them.
//!
//! The task store owns identity and persistence; the engine reads and writes a
//! typed metadata struct that is validated when a record crosses the store
//! boundary instead of being poked at as a loose map.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Blocked,
    Retrying,
    HumanEscalation,
    Closed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Retrying => "retrying",
            TaskStatus::HumanEscalation => "human_escalation",
            TaskStatus::Closed => "closed",
        }
    }

    /// True while the task can still be worked on (fix-task lookup only considers these).
    pub fn is_open(self) -> bool {
        !matches!(self, TaskStatus::Closed)
    }
}

/// Result of the last reactive rebase check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebaseStatus {
    pub state: RebaseState,
    pub commits_behind: u32,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebaseState {
    UpToDate,
    Rebased,
    Conflict,
    Failed,
}

/// Engine-owned metadata carried on every task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskMetadata {
    /// Stage name to number of times the stage was started.
    pub attempts: BTreeMap<String, u32>,
    /// Failure fingerprint (set on fix tasks, and on failing tasks for traceability).
    pub fingerprint: Option<String>,
    /// Merge is irreversible and needs explicit approval.
    pub irreversible: bool,
    pub approval_granted: bool,
    pub rebase_status: Option<RebaseStatus>,
    /// Template key shared by tasks spawned from the same template.
    pub template: Option<String>,
    /// Working branch; defaults to `<branch_prefix><task id>`.
    pub branch: Option<String>,
    /// For fix tasks: the task whose failure created it.
    pub fix_for: Option<String>,
    /// For fix tasks: the stage that failed.
    pub failed_stage: Option<String>,
}

impl TaskMetadata {
    pub fn attempts_for(&self, stage: &str) -> u32 {
        self.attempts.get(stage).copied().unwrap_or(0)
    }

    /// Increment the attempt counter for `stage`, returning the new value.
    pub fn bump_attempts(&mut self, stage: &str) -> u32 {
        let entry = self.attempts.entry(stage.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    }

    pub fn is_fix_task(&self) -> bool {
        self.fix_for.is_some()
    }
}

/// A task as returned by the task store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub notes: Option<String>,
    /// Ids of tasks that block this one.
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

impl TaskRecord {
    /// Key used for fingerprinting: the template if one is recorded, otherwise the id.
    pub fn template_key(&self) -> &str {
        self.metadata.template.as_deref().unwrap_or(&self.id)
    }
}

/// Fields for creating a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub metadata: TaskMetadata,
}

/// Partial update; `None` leaves the field untouched.
///
/// Metadata is edited field by field through `TaskStore::update_metadata`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub notes: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus, notes: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            notes: Some(notes.into()),
        }
    }
}

/// Filters for listing tasks. Empty filters match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Vec<TaskStatus>,
    pub fix_tasks_only: bool,
}

impl TaskFilter {
    pub fn open_fix_tasks() -> Self {
        Self {
            status: vec![
                TaskStatus::Open,
                TaskStatus::InProgress,
                TaskStatus::Blocked,
                TaskStatus::Retrying,
            ],
            fix_tasks_only: true,
        }
    }

    pub fn matches(&self, task: &TaskRecord) -> bool {
        if !self.status.is_empty() && !self.status.contains(&task.status) {
            return false;
        }
        if self.fix_tasks_only && !task.metadata.is_fix_task() {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_attempts_is_monotonic_per_stage() {
        let mut meta = TaskMetadata::default();
        assert_eq!(meta.bump_attempts("code"), 1);
        assert_eq!(meta.bump_attempts("code"), 2);
        assert_eq!(meta.bump_attempts("test"), 1);
        assert_eq!(meta.attempts_for("code"), 2);
        assert_eq!(meta.attempts_for("review"), 0);
    }

    #[test]
    fn missing_metadata_fields_default() {
        let raw = r#"{"id":"t-1","title":"t","status":"in_progress","metadata":{"irreversible":true}}"#;
        let task: TaskRecord = serde_json::from_str(raw).expect("parse");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.metadata.irreversible);
        assert!(!task.metadata.approval_granted);
        assert!(task.metadata.attempts.is_empty());
        assert_eq!(task.template_key(), "t-1");
    }

    #[test]
    fn open_fix_filter_excludes_closed_and_plain_tasks() {
        let mut fix = TaskRecord {
            id: "fix-1".to_string(),
            title: "fix".to_string(),
            description: String::new(),
            status: TaskStatus::Open,
            notes: None,
            blocked_by: Vec::new(),
            metadata: TaskMetadata {
                fix_for: Some("t-1".to_string()),
                ..TaskMetadata::default()
            },
        };
        let filter = TaskFilter::open_fix_tasks();
        assert!(filter.matches(&fix));
        fix.status = TaskStatus::Closed;
        assert!(!filter.matches(&fix));
        fix.status = TaskStatus::Open;
        fix.metadata.fix_for = None;
        assert!(!filter.matches(&fix));
    }
}
