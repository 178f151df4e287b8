//! Declarative workflow graphs and their validation.
//!
//! A workflow is an immutable map of state name to transition. Every edge must
//! resolve to another state or to one of the terminal sentinels; anything else
//! is a configuration error raised before a single worker is spawned.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WorkflowConfigError;

/// Terminal sentinel: the workflow finished successfully.
pub const COMPLETE: &str = "complete";
/// Terminal sentinel: the workflow needs a human.
pub const HUMAN_ESCALATION: &str = "human_escalation";

/// Returns true for the terminal sentinel names.
pub fn is_terminal(state: &str) -> bool {
    state == COMPLETE || state == HUMAN_ESCALATION
}

/// Worker configuration for a single state.
///
/// Unknown keys are rejected so a misspelled setting fails validation instead
/// of silently falling back to a default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Agent type passed to the worker process. Defaults to the state name.
    #[serde(default)]
    pub agent: Option<String>,
    /// Per-stage worker timeout in seconds (`timeout` is accepted too).
    /// Falls back to the global worker timeout.
    #[serde(default, alias = "timeout")]
    pub timeout_secs: Option<u64>,
    /// Per-stage retry budget. Falls back to the global default budget.
    #[serde(default)]
    pub retry_budget: Option<u32>,
}

/// Outgoing edges and gates of a single state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub on_success: String,
    pub on_fail: String,
    #[serde(default)]
    pub gates: Vec<String>,
    #[serde(default)]
    pub config: StageConfig,
}

impl Transition {
    /// Agent type for this state.
    pub fn agent<'a>(&'a self, state: &'a str) -> &'a str {
        self.config.agent.as_deref().unwrap_or(state)
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    pub fn retry_budget(&self, default: u32) -> u32 {
        self.config.retry_budget.unwrap_or(default)
    }
}

/// A complete workflow: named, with a start state and its transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "default_workflow_name")]
    pub name: String,
    pub start: String,
    pub transitions: BTreeMap<String, Transition>,
}

fn default_workflow_name() -> String {
    "default".to_string()
}

impl WorkflowDefinition {
    /// Check that the graph is executable.
    ///
    /// Errors are reported in a stable order (states are sorted by name).
    pub fn validate(&self) -> Result<(), WorkflowConfigError> {
        if self.transitions.is_empty() {
            return Err(WorkflowConfigError::Empty);
        }
        if !self.transitions.contains_key(&self.start) {
            return Err(WorkflowConfigError::UnknownStart(self.start.clone()));
        }
        for (state, transition) in &self.transitions {
            if is_terminal(state) {
                return Err(WorkflowConfigError::ReservedName(state.clone()));
            }
            if transition
                .config
                .agent
                .as_deref()
                .is_some_and(|agent| agent.trim().is_empty())
            {
                return Err(WorkflowConfigError::MissingAgent {
                    state: state.clone(),
                });
            }
            for (edge, target) in [
                ("onSuccess", &transition.on_success),
                ("onFail", &transition.on_fail),
            ] {
                if !self.resolves(target) {
                    return Err(WorkflowConfigError::UnresolvableState {
                        state: state.clone(),
                        edge,
                        target: target.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn transition(&self, state: &str) -> Option<&Transition> {
        self.transitions.get(state)
    }

    fn resolves(&self, target: &str) -> bool {
        is_terminal(target) || self.transitions.contains_key(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(on_success: &str, on_fail: &str, gates: &[&str]) -> Transition {
        Transition {
            on_success: on_success.to_string(),
            on_fail: on_fail.to_string(),
            gates: gates.iter().map(|g| g.to_string()).collect(),
            config: StageConfig {
                agent: Some("coder".to_string()),
                ..StageConfig::default()
            },
        }
    }

    fn code_test_workflow() -> WorkflowDefinition {
        let mut transitions = BTreeMap::new();
        transitions.insert("code".to_string(), transition("test", HUMAN_ESCALATION, &[]));
        transitions.insert("test".to_string(), transition(COMPLETE, "code", &["lint"]));
        WorkflowDefinition {
            name: "feature".to_string(),
            start: "code".to_string(),
            transitions,
        }
    }

    #[test]
    fn valid_workflow_passes() {
        code_test_workflow().validate().expect("valid");
    }

    #[test]
    fn unresolvable_edge_is_rejected() {
        let mut workflow = code_test_workflow();
        workflow
            .transitions
            .insert("test".to_string(), transition(COMPLETE, "review", &[]));
        let err = workflow.validate().unwrap_err();
        assert_eq!(
            err,
            WorkflowConfigError::UnresolvableState {
                state: "test".to_string(),
                edge: "onFail",
                target: "review".to_string(),
            }
        );
    }

    #[test]
    fn unknown_start_is_rejected() {
        let mut workflow = code_test_workflow();
        workflow.start = "plan".to_string();
        assert_eq!(
            workflow.validate().unwrap_err(),
            WorkflowConfigError::UnknownStart("plan".to_string())
        );
    }

    #[test]
    fn terminal_names_cannot_be_states() {
        let mut workflow = code_test_workflow();
        workflow
            .transitions
            .insert(COMPLETE.to_string(), transition(COMPLETE, COMPLETE, &[]));
        assert!(matches!(
            workflow.validate(),
            Err(WorkflowConfigError::ReservedName(_))
        ));
    }

    #[test]
    fn parses_camel_case_json() {
        let raw = r#"{
            "start": "code",
            "transitions": {
                "code": {"onSuccess": "complete", "onFail": "human_escalation",
                         "gates": ["lint"], "config": {"agent": "coder", "timeout_secs": 60}}
            }
        }"#;
        let workflow: WorkflowDefinition = serde_json::from_str(raw).expect("parse");
        assert_eq!(workflow.name, "default");
        let code = workflow.transition("code").expect("code state");
        assert_eq!(code.gates, vec!["lint"]);
        assert_eq!(code.timeout(Duration::from_secs(5)), Duration::from_secs(60));
        assert_eq!(code.retry_budget(3), 3);
        assert_eq!(code.agent("code"), "coder");
    }

    #[test]
    fn config_block_is_optional() {
        let raw = r#"{
            "start": "code",
            "transitions": {
                "code": {"onSuccess": "test", "onFail": "human_escalation", "gates": []},
                "test": {"onSuccess": "complete", "onFail": "code", "gates": ["lint"]}
            }
        }"#;
        let workflow: WorkflowDefinition = serde_json::from_str(raw).expect("parse");
        workflow.validate().expect("valid");
        let test = workflow.transition("test").expect("test state");
        assert_eq!(test.agent("test"), "test");
        assert_eq!(test.timeout(Duration::from_secs(9)), Duration::from_secs(9));
    }

    #[test]
    fn stage_timeout_accepts_short_key() {
        let raw = r#"{"start": "code", "transitions": {
            "code": {"onSuccess": "complete", "onFail": "human_escalation",
                     "config": {"agent": "coder", "timeout": 60}}
        }}"#;
        let workflow: WorkflowDefinition = serde_json::from_str(raw).expect("parse");
        let code = &workflow.transitions["code"];
        assert_eq!(code.timeout(Duration::from_secs(1800)), Duration::from_secs(60));
    }

    #[test]
    fn unknown_stage_config_keys_are_rejected() {
        let raw = r#"{"start": "code", "transitions": {
            "code": {"onSuccess": "complete", "onFail": "human_escalation",
                     "config": {"agent": "coder", "timeuot": 60}}
        }}"#;
        let err = serde_json::from_str::<WorkflowDefinition>(raw).expect_err("typo");
        assert!(err.to_string().contains("timeuot"), "{err}");
    }

    #[test]
    fn blank_agent_is_rejected() {
        let mut workflow = code_test_workflow();
        if let Some(code) = workflow.transitions.get_mut("code") {
            code.config.agent = Some("  ".to_string());
        }
        assert_eq!(
            workflow.validate().unwrap_err(),
            WorkflowConfigError::MissingAgent {
                state: "code".to_string()
            }
        );
    }
}
