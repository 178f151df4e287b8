//! Typed errors that callers are expected to downcast from `anyhow::Error`.
//!
//! Everything else in the crate reports failures through `anyhow` with context.
//! These types exist for the conditions a caller must tell apart: lock
//! contention (retry or abort), a malformed workflow (never retry) and a task
//! that vanished before the relay could start.

use std::path::PathBuf;

use thiserror::Error;

/// The global lock could not be acquired within the caller's bound.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("timed out after {waited_ms}ms waiting for lock {}", lock_dir.display())]
pub struct LockTimeoutError {
    pub lock_dir: PathBuf,
    pub waited_ms: u64,
}

/// A workflow definition that cannot be executed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkflowConfigError {
    #[error("workflow has no states")]
    Empty,
    #[error("start state '{0}' is not defined in transitions")]
    UnknownStart(String),
    #[error("state '{state}' routes {edge} to unresolvable state '{target}'")]
    UnresolvableState {
        state: String,
        edge: &'static str,
        target: String,
    },
    #[error("state '{0}' shadows a terminal state name")]
    ReservedName(String),
    #[error("state '{state}' has an empty agent name")]
    MissingAgent { state: String },
}

/// The task handed to the relay does not exist in the task store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("task '{0}' not found")]
pub struct TaskNotFoundError(pub String);

/// Another relay instance already owns the task's claim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("task '{task_id}' is claimed by '{owner}'")]
pub struct TaskClaimedError {
    pub task_id: String,
    pub owner: String,
}
