//! Deterministic, pure logic shared by the relay engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod fingerprint;
pub mod glob;
pub mod guard;
pub mod task;
pub mod types;
pub mod workflow;
