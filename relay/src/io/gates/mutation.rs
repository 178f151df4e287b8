//! Mutation-score gate and its report adapter.
//!
//! Only the files the worker touched are mutated, passed through the
//! configured files flag (`--mutate a.js,b.js` for Stryker).

use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::core::types::GateResult;
use crate::io::config::MutationGateConfig;
use crate::io::gates::{Gate, GateInput, ToolRun, run_tool};

pub const NAME: &str = "mutation";

/// Mutation testing summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MutationReport {
    /// Score in percent, if the tool reported one.
    pub score: Option<f64>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonScore {
    mutation_score: f64,
}

static SCORE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)mutation score(?: of)?[^0-9]{0,12}([0-9]+(?:\.[0-9]+)?)").unwrap()
});

impl MutationReport {
    /// Accepts a `{"mutationScore": n}` JSON document or a textual
    /// "mutation score: n%" line; the last textual match wins.
    pub fn parse(exit_code: Option<i32>, output: &str) -> Self {
        let score = serde_json::from_str::<JsonScore>(output.trim())
            .map(|s| s.mutation_score)
            .ok()
            .or_else(|| {
                SCORE
                    .captures_iter(output)
                    .filter_map(|caps| caps[1].parse::<f64>().ok())
                    .last()
            });
        Self { score, exit_code }
    }

    pub fn meets(&self, threshold: f64) -> bool {
        self.score.is_some_and(|s| s >= threshold)
    }
}

#[derive(Debug, Clone)]
pub struct MutationGate {
    command: Vec<String>,
    threshold: f64,
    files_flag: String,
}

impl MutationGate {
    pub fn new(config: &MutationGateConfig) -> Self {
        Self {
            command: config.command.clone(),
            threshold: config.threshold,
            files_flag: config.files_flag.clone(),
        }
    }

    fn scope_args(&self, files: &[String]) -> Vec<String> {
        if self.files_flag.is_empty() {
            return Vec::new();
        }
        vec![self.files_flag.clone(), files.join(",")]
    }
}

impl Gate for MutationGate {
    fn name(&self) -> &str {
        NAME
    }

    fn run(&self, input: &GateInput) -> Result<GateResult> {
        if input.files.is_empty() {
            return Ok(GateResult::pass(NAME, "no files to mutate"));
        }
        let output = match run_tool(NAME, &self.command, &self.scope_args(&input.files), input)? {
            ToolRun::Missing(reason) => {
                warn!(gate = NAME, %reason, "mutation tool unavailable, skipping");
                return Ok(GateResult::skipped(NAME, reason));
            }
            ToolRun::Finished(output) => output,
        };
        let report = MutationReport::parse(output.status.code(), &output.combined_text());
        let details = json!({
            "score": report.score,
            "threshold": self.threshold,
            "exit_code": report.exit_code,
        });
        let result = match report.score {
            Some(score) if report.meets(self.threshold) => GateResult::pass(
                NAME,
                format!("mutation score {score:.2}% >= {:.2}%", self.threshold),
            ),
            Some(score) => GateResult::fail(
                NAME,
                format!("mutation score {score:.2}% below {:.2}%", self.threshold),
            ),
            None if report.exit_code == Some(0) => {
                GateResult::pass(NAME, "tool succeeded without reporting a score")
            }
            None => GateResult::fail(
                NAME,
                format!(
                    "mutation tool exited with {:?} and reported no score",
                    report.exit_code
                ),
            ),
        };
        Ok(result.with_details(details))
    }
}
