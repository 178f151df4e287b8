//! Relay workflow engine.
//!
//! Drives a task through a declarative workflow of agent stages: each stage
//! spawns an independent worker process, its quality gates decide whether the
//! task advances, identical failures across parallel workers collapse into a
//! single fix task, and finished work is squash-merged into the mainline.
//!
//! - **[`core`]**: pure, deterministic logic (workflow graphs, task metadata,
//!   fingerprints, glob overlap, guards). No I/O, fully testable in isolation.
//! - **[`io`]**: side-effecting adapters (lock, shared state, reservations,
//!   task store, worker processes, git, gate tools, metrics, config).
//!
//! Orchestration modules ([`relay`], [`gatekeeper`], [`dedup`], [`integrate`])
//! combine the two into the state machine.

pub mod core;
pub mod dedup;
pub mod error;
pub mod exit_codes;
pub mod gatekeeper;
pub mod integrate;
pub mod io;
pub mod logging;
pub mod relay;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
