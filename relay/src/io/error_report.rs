//! Structured error reports for runs that stopped short of a merge.
//!
//! A run that ends blocked, escalated, or at the iteration ceiling leaves
//! `<cache>/runs/<task>/error_report.json` behind. A later run that completes
//! the task removes it.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::atomic::write_json_atomic;
use crate::io::paths::CachePaths;

pub const REPORT_VERSION: &str = "1.0.0";
pub const REPORT_TYPE: &str = "error_report";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Blocking,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable code, e.g. `blocked`, `conflict`, `human_escalation`.
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

/// One iteration the relay already tried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptedSolution {
    pub iteration: u32,
    pub stage: String,
    pub agent: String,
    /// `passed`, or the failure's error class.
    pub outcome: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub sender_id: String,
    pub task_id: String,
    pub severity: Severity,
    pub error: ErrorDetail,
    pub needs_human_intervention: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempted_solutions: Vec<AttemptedSolution>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_actions: Vec<String>,
}

impl ErrorReport {
    pub fn new(sender_id: &str, task_id: &str, severity: Severity, error: ErrorDetail) -> Self {
        Self {
            version: REPORT_VERSION.to_string(),
            kind: REPORT_TYPE.to_string(),
            message_id: generate_message_id(),
            timestamp: Utc::now(),
            sender_id: sender_id.to_string(),
            task_id: task_id.to_string(),
            severity,
            error,
            needs_human_intervention: false,
            attempted_solutions: Vec::new(),
            suggested_actions: Vec::new(),
        }
    }
}

/// Random 128-bit id rendered like a v4 UUID.
fn generate_message_id() -> String {
    let mut bytes: [u8; 16] = rand::thread_rng().r#gen();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

pub fn write_error_report(paths: &CachePaths, report: &ErrorReport) -> Result<PathBuf> {
    let path = paths.error_report_path(&report.task_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create report dir {}", parent.display()))?;
    }
    write_json_atomic(&path, report)?;
    debug!(path = %path.display(), "error report written");
    Ok(path)
}

/// Drop a report left by an earlier run. Returns `true` if one existed.
pub fn clear_error_report(paths: &CachePaths, task_id: &str) -> Result<bool> {
    let path = paths.error_report_path(task_id);
    match fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::atomic::read_json;

    #[test]
    fn report_serializes_with_handoff_field_names() {
        let mut report = ErrorReport::new(
            "relay:42",
            "bd-1",
            Severity::High,
            ErrorDetail {
                code: "conflict".to_string(),
                message: "rebase hit conflicts".to_string(),
                context: BTreeMap::from([("branch".to_string(), "relay/bd-1".to_string())]),
            },
        );
        report.needs_human_intervention = true;
        let json = serde_json::to_value(&report).expect("json");
        assert_eq!(json["type"], "error_report");
        assert_eq!(json["severity"], "high");
        assert_eq!(json["error"]["context"]["branch"], "relay/bd-1");
        assert!(json.get("attempted_solutions").is_none());
        assert_eq!(report.message_id.len(), 36);
        assert_eq!(report.message_id.as_bytes()[14], b'4');
    }

    #[test]
    fn write_then_clear() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = CachePaths::new(temp.path());
        let report = ErrorReport::new(
            "relay:1",
            "bd-2",
            Severity::Medium,
            ErrorDetail {
                code: "max_iterations_exceeded".to_string(),
                message: "stopped".to_string(),
                context: BTreeMap::new(),
            },
        );
        let path = write_error_report(&paths, &report).expect("write");
        assert!(path.ends_with("runs/bd-2/error_report.json"));
        let loaded: ErrorReport = read_json(&path).expect("read");
        assert_eq!(loaded, report);

        assert!(clear_error_report(&paths, "bd-2").expect("clear"));
        assert!(!clear_error_report(&paths, "bd-2").expect("clear again"));
    }
}
