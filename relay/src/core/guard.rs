//! Irreversible-action guard for the terminal merge transition.

use crate::core::task::TaskMetadata;

/// Decision of the irreversible-action guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    Allowed,
    Refused { reason: String },
}

/// Refuse the merge when the task is irreversible and approval is not recorded.
///
/// This is a hard stop: retries never get past it, only an explicit approval does.
pub fn check_irreversible(task_id: &str, metadata: &TaskMetadata) -> MergeDecision {
    if metadata.irreversible && !metadata.approval_granted {
        return MergeDecision::Refused {
            reason: format!(
                "task '{task_id}' is marked irreversible and has no recorded approval; \
                 set approval_granted before merging"
            ),
        };
    }
    MergeDecision::Allowed
}
