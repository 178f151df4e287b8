//! Shared deterministic types for relay core logic.
//!
//! These types define stable contracts between components. They do not depend
//! on external state or I/O.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of a single verification gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    pub reason: String,
    /// True when the gate did not actually run (tool missing); always paired with `passed`.
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub details: Value,
}

impl GateResult {
    pub fn pass(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            reason: reason.into(),
            skipped: false,
            details: Value::Null,
        }
    }

    pub fn fail(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            reason: reason.into(),
            skipped: false,
            details: Value::Null,
        }
    }

    /// A passing result for a gate whose tool is unavailable.
    pub fn skipped(name: &str, reason: impl Into<String>) -> Self {
        Self {
            skipped: true,
            ..Self::pass(name, reason)
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Aggregate of all gate results for one stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub results: Vec<GateResult>,
    pub all_passed: bool,
    pub summary: String,
}

impl GateReport {
    /// Reduce results by logical AND. An empty list passes.
    pub fn from_results(results: Vec<GateResult>) -> Self {
        let failing = failing_gate_names(&results);
        let all_passed = failing.is_empty();
        let summary = if all_passed {
            format!("{} gate(s) passed", results.len())
        } else {
            format!("failed gates: {}", failing.join(", "))
        };
        Self {
            results,
            all_passed,
            summary,
        }
    }

    pub fn failing(&self) -> Vec<String> {
        failing_gate_names(&self.results)
    }

    /// Human-readable failure detail for notes and fingerprints.
    pub fn failure_detail(&self) -> String {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| format!("{}: {}", r.name, r.reason))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn failing_gate_names(results: &[GateResult]) -> Vec<String> {
    results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.name.clone())
        .collect()
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerExit {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    /// Tail of the worker log, used as the error message on failure.
    #[serde(default)]
    pub message: String,
}

impl WorkerExit {
    pub fn success() -> Self {
        Self {
            exit_code: Some(0),
            signal: None,
            timed_out: false,
            message: String::new(),
        }
    }

    pub fn failure(exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            signal: None,
            timed_out: false,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            signal: None,
            timed_out: true,
            message: message.into(),
        }
    }

    /// The worker process could not be started; classified as `exit:unknown`.
    pub fn not_started(message: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            signal: None,
            timed_out: false,
            message: message.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.signal.is_none() && self.exit_code == Some(0)
    }

    /// Error class used by the fingerprint: timeouts, signals and exit codes stay distinct.
    pub fn error_class(&self) -> String {
        if self.timed_out {
            return "timeout".to_string();
        }
        if let Some(signal) = self.signal {
            return format!("signal:{signal}");
        }
        match self.exit_code {
            Some(code) => format!("exit:{code}"),
            None => "exit:unknown".to_string(),
        }
    }
}

/// What the failure handler did about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    LinkedToExistingFix,
    CreatedFixTask,
    MaxRetriesExceeded,
    TaskNotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_passes() {
        let report = GateReport::from_results(Vec::new());
        assert!(report.all_passed);
        assert!(report.failing().is_empty());
    }

    #[test]
    fn single_failure_fails_report() {
        let report = GateReport::from_results(vec![
            GateResult::pass("tdd", "ok"),
            GateResult::skipped("mutation", "not installed"),
            GateResult::fail("lint", "3 problems"),
        ]);
        assert!(!report.all_passed);
        assert_eq!(report.failing(), vec!["lint"]);
        assert_eq!(report.summary, "failed gates: lint");
        assert_eq!(report.failure_detail(), "lint: 3 problems");
    }

    #[test]
    fn worker_error_classes_are_distinct() {
        assert_eq!(WorkerExit::timeout("slow").error_class(), "timeout");
        assert_eq!(WorkerExit::failure(2, "boom").error_class(), "exit:2");
        let signalled = WorkerExit {
            exit_code: None,
            signal: Some(9),
            timed_out: false,
            message: String::new(),
        };
        assert_eq!(signalled.error_class(), "signal:9");
        assert_eq!(WorkerExit::not_started("ENOENT").error_class(), "exit:unknown");
        assert!(!signalled.succeeded());
        assert!(WorkerExit::success().succeeded());
    }
}
