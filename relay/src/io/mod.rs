//! Side-effecting adapters used by the relay.

pub mod atomic;
pub mod config;
pub mod error_report;
pub mod gates;
pub mod git;
pub mod iteration_log;
pub mod lock;
pub mod metrics;
pub mod paths;
pub mod process;
pub mod reservations;
pub mod shutdown;
pub mod state_store;
pub mod task_store;
pub mod worker;
