//! Test-driven-development compliance: source changes must come with test changes.

use anyhow::Result;
use serde_json::json;

use crate::core::types::GateResult;
use crate::io::config::TddGateConfig;
use crate::io::gates::{Gate, GateInput};

pub const NAME: &str = "tdd";

#[derive(Debug, Clone)]
pub struct TddGate {
    test_markers: Vec<String>,
    source_extensions: Vec<String>,
}

impl TddGate {
    pub fn new(config: &TddGateConfig) -> Self {
        Self {
            test_markers: config.test_markers.clone(),
            source_extensions: config.source_extensions.clone(),
        }
    }

    fn is_test(&self, path: &str) -> bool {
        let padded = format!("/{path}");
        self.test_markers.iter().any(|m| padded.contains(m.as_str()))
    }

    fn is_source(&self, path: &str) -> bool {
        path.rsplit_once('.')
            .is_some_and(|(_, ext)| self.source_extensions.iter().any(|e| e == ext))
    }
}

impl Gate for TddGate {
    fn name(&self) -> &str {
        NAME
    }

    fn run(&self, input: &GateInput) -> Result<GateResult> {
        let (tests, sources): (Vec<&String>, Vec<&String>) = input
            .files
            .iter()
            .filter(|f| self.is_source(f) || self.is_test(f))
            .partition(|f| self.is_test(f));

        let details = json!({ "sources": sources, "tests": tests });
        if sources.is_empty() {
            return Ok(GateResult::pass(NAME, "no source files changed").with_details(details));
        }
        if tests.is_empty() {
            return Ok(GateResult::fail(
                NAME,
                format!("{} source file(s) changed without any test changes", sources.len()),
            )
            .with_details(details));
        }
        Ok(GateResult::pass(
            NAME,
            format!("{} source file(s) changed with {} test file(s)", sources.len(), tests.len()),
        )
        .with_details(details))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::gates::tests::input;

    fn gate() -> TddGate {
        TddGate::new(&TddGateConfig::default())
    }

    #[test]
    fn source_without_tests_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = gate()
            .run(&input(temp.path(), &["src/login.ts", "README.md"]))
            .expect("run");
        assert!(!result.passed);
        assert!(result.reason.contains("1 source file"));
    }

    #[test]
    fn source_with_tests_passes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = gate()
            .run(&input(temp.path(), &["src/login.ts", "src/login.test.ts"]))
            .expect("run");
        assert!(result.passed);
        assert_eq!(result.details["tests"][0], "src/login.test.ts");
    }

    #[test]
    fn docs_only_change_passes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = gate().run(&input(temp.path(), &["docs/guide.md"])).expect("run");
        assert!(result.passed);
        assert!(!result.skipped);
    }

    #[test]
    fn top_level_tests_dir_counts() {
        assert!(gate().is_test("tests/relay.rs"));
        assert!(!gate().is_test("src/contest.rs"));
    }
}
