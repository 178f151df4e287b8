//! Static lint gate and its report adapter.

use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::core::types::GateResult;
use crate::io::config::ToolGateConfig;
use crate::io::gates::{Gate, GateInput, ToolRun, run_tool};

pub const NAME: &str = "lint";

/// Problems reported by a lint run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LintReport {
    pub errors: u32,
    pub warnings: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EslintFileReport {
    #[serde(default)]
    error_count: u32,
    #[serde(default)]
    warning_count: u32,
}

static SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) problems? \((\d+) errors?, (\d+) warnings?\)").unwrap()
});

impl LintReport {
    /// Build a report from the tool's exit code and output.
    ///
    /// Understands eslint's JSON formatter and its stylish summary line. When
    /// neither is present the exit code decides: non-zero counts as one error.
    pub fn parse(exit_code: Option<i32>, output: &str) -> Self {
        if let Ok(files) = serde_json::from_str::<Vec<EslintFileReport>>(output.trim()) {
            return files.iter().fold(Self::default(), |acc, f| Self {
                errors: acc.errors + f.error_count,
                warnings: acc.warnings + f.warning_count,
            });
        }
        if let Some(caps) = SUMMARY.captures(output) {
            let count = |i: usize| caps[i].parse::<u32>().unwrap_or(0);
            return Self {
                errors: count(2),
                warnings: count(3),
            };
        }
        Self {
            errors: u32::from(exit_code != Some(0)),
            warnings: 0,
        }
    }

    pub fn passed(&self) -> bool {
        self.errors == 0
    }
}

#[derive(Debug, Clone)]
pub struct LintGate {
    command: Vec<String>,
}

impl LintGate {
    pub fn new(config: &ToolGateConfig) -> Self {
        Self {
            command: config.command.clone(),
        }
    }
}

impl Gate for LintGate {
    fn name(&self) -> &str {
        NAME
    }

    fn run(&self, input: &GateInput) -> Result<GateResult> {
        if input.files.is_empty() {
            return Ok(GateResult::pass(NAME, "no files to lint"));
        }
        let output = match run_tool(NAME, &self.command, &input.files, input)? {
            ToolRun::Missing(reason) => {
                warn!(gate = NAME, %reason, "lint tool unavailable, skipping");
                return Ok(GateResult::skipped(NAME, reason));
            }
            ToolRun::Finished(output) => output,
        };
        let report = LintReport::parse(output.status.code(), &output.combined_text());
        let details = json!({ "errors": report.errors, "warnings": report.warnings });
        let reason = format!("{} error(s), {} warning(s)", report.errors, report.warnings);
        Ok(if report.passed() {
            GateResult::pass(NAME, reason)
        } else {
            GateResult::fail(NAME, reason)
        }
        .with_details(details))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::gates::tests::input;

    #[test]
    fn parses_eslint_json() {
        let raw = r#"[{"filePath":"a.js","errorCount":2,"warningCount":1},
                      {"filePath":"b.js","errorCount":0,"warningCount":3}]"#;
        assert_eq!(
            LintReport::parse(Some(1), raw),
            LintReport {
                errors: 2,
                warnings: 4
            }
        );
    }

    #[test]
    fn parses_stylish_summary() {
        let raw = "src/a.js\n  3:1  error  no-undef\n\n✖ 3 problems (1 error, 2 warnings)\n";
        let report = LintReport::parse(Some(1), raw);
        assert_eq!(report.errors, 1);
        assert_eq!(report.warnings, 2);
        assert!(!report.passed());
    }

    #[test]
    fn falls_back_to_exit_code() {
        assert!(LintReport::parse(Some(0), "").passed());
        assert!(!LintReport::parse(Some(2), "boom").passed());
    }

    #[test]
    fn missing_linter_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let gate = LintGate::new(&ToolGateConfig {
            command: vec!["relay-no-such-linter".to_string()],
        });
        let result = gate.run(&input(temp.path(), &["src/a.js"])).expect("run");
        assert!(result.passed);
        assert!(result.skipped);
    }

    #[test]
    fn failing_linter_fails_gate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let gate = LintGate::new(&ToolGateConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo '1 problem (1 error, 0 warnings)'; exit 1".to_string(),
            ],
        });
        let result = gate.run(&input(temp.path(), &["src/a.js"])).expect("run");
        assert!(!result.passed);
        assert_eq!(result.details["errors"], 1);
    }
}
