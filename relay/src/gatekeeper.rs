//! Runs a stage's gates and reduces their results.
//!
//! Each gate runs on its own thread and is raced against its timeout. A gate
//! that errors, panics, or overruns becomes a failing result; nothing a gate
//! does can abort the relay.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::remaining_budget;
use crate::core::types::{GateReport, GateResult};
use crate::io::gates::{Gate, GateInput, GateRegistry};
use crate::io::metrics::MetricsSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateOptions {
    pub parallel: bool,
    /// Per-gate timeout.
    pub timeout: Duration,
}

pub struct Gatekeeper {
    registry: GateRegistry,
    metrics: Arc<dyn MetricsSink>,
}

struct Pending {
    name: String,
    started: Instant,
    rx: mpsc::Receiver<Result<GateResult>>,
}

impl Gatekeeper {
    pub fn new(registry: GateRegistry, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { registry, metrics }
    }

    /// Run `names` against `input.files`.
    ///
    /// Unknown names are skipped with a warning. An empty list passes.
    #[instrument(skip_all, fields(task_id = %input.task_id, stage = %input.stage, gates = ?names, parallel = opts.parallel))]
    pub fn run_gates(&self, names: &[String], input: &GateInput, opts: GateOptions) -> GateReport {
        let input = GateInput {
            timeout: opts.timeout,
            ..input.clone()
        };
        let mut results = Vec::with_capacity(names.len());
        let mut pending = Vec::new();

        for name in names {
            let Some(gate) = self.registry.get(name) else {
                warn!(gate = %name, "unknown gate, skipping");
                results.push(GateResult::skipped(name, "unknown gate"));
                continue;
            };
            let job = start_gate(name, gate, &input);
            if opts.parallel {
                pending.push(job);
            } else {
                results.push(self.await_gate(job, opts.timeout));
            }
        }
        for job in pending {
            results.push(self.await_gate(job, opts.timeout));
        }

        let report = GateReport::from_results(results);
        info!(all_passed = report.all_passed, summary = %report.summary, "gates finished");
        report
    }

    fn await_gate(&self, job: Pending, timeout: Duration) -> GateResult {
        let remaining = remaining_budget(job.started + timeout).unwrap_or(Duration::ZERO);
        let result = match job.rx.recv_timeout(remaining) {
            Ok(Ok(mut result)) => {
                // Results are keyed by the registered name, whatever the gate reports.
                result.name = job.name.clone();
                result
            }
            Ok(Err(err)) => GateResult::fail(&job.name, format!("gate error: {err:#}")),
            Err(RecvTimeoutError::Timeout) => {
                warn!(gate = %job.name, timeout_secs = timeout.as_secs(), "gate timed out");
                GateResult::fail(
                    &job.name,
                    format!("gate timed out after {}s", timeout.as_secs()),
                )
            }
            Err(RecvTimeoutError::Disconnected) => {
                GateResult::fail(&job.name, "gate panicked before reporting a result")
            }
        };
        let elapsed = job.started.elapsed();
        debug!(gate = %job.name, passed = result.passed, elapsed_ms = elapsed.as_millis() as u64, "gate result");
        if !result.skipped
            && let Err(err) = self.metrics.record(&job.name, elapsed, result.passed)
        {
            warn!(err = %err, gate = %job.name, "failed to record gate metric");
        }
        result
    }
}

fn start_gate(name: &str, gate: Arc<dyn Gate>, input: &GateInput) -> Pending {
    let (tx, rx) = mpsc::channel();
    let input = input.clone();
    let started = Instant::now();
    let spawned = thread::Builder::new()
        .name(format!("relay-gate-{name}"))
        .spawn(move || {
            let _ = tx.send(gate.run(&input));
        });
    if let Err(err) = spawned {
        warn!(err = %err, gate = name, "failed to start gate thread");
    }
    Pending {
        name: name.to_string(),
        started,
        rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::metrics::MetricsSnapshot;
    use crate::test_support::ScriptedGate;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryMetrics(Mutex<MetricsSnapshot>);

    impl MetricsSink for MemoryMetrics {
        fn record(&self, gate: &str, duration: Duration, passed: bool) -> Result<()> {
            self.0
                .lock()
                .expect("metrics lock")
                .record(gate, duration, passed, 10);
            Ok(())
        }
    }

    fn input() -> GateInput {
        GateInput {
            task_id: "bd-1".to_string(),
            stage: "test".to_string(),
            workdir: std::env::temp_dir(),
            files: vec!["src/a.js".to_string()],
            timeout: Duration::from_secs(1),
        }
    }

    fn keeper(gates: Vec<ScriptedGate>) -> (Gatekeeper, Arc<MemoryMetrics>) {
        let mut registry = GateRegistry::new();
        for gate in gates {
            registry.register(Arc::new(gate));
        }
        let metrics = Arc::new(MemoryMetrics::default());
        (Gatekeeper::new(registry, metrics.clone()), metrics)
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn opts(parallel: bool, timeout_ms: u64) -> GateOptions {
        GateOptions {
            parallel,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    fn all_passing_gates_pass() {
        let (keeper, metrics) = keeper(vec![ScriptedGate::passing("tdd"), ScriptedGate::passing("lint")]);
        let report = keeper.run_gates(&names(&["tdd", "lint"]), &input(), opts(true, 1_000));
        assert!(report.all_passed);
        assert_eq!(report.results.len(), 2);
        let snapshot = metrics.0.lock().expect("lock");
        assert_eq!(snapshot.gate("lint").map(|s| s.outcomes.len()), Some(1));
    }

    #[test]
    fn one_failure_fails_the_report() {
        let (keeper, _) = keeper(vec![ScriptedGate::passing("tdd"), ScriptedGate::failing("lint", "2 errors")]);
        for parallel in [true, false] {
            let report = keeper.run_gates(&names(&["tdd", "lint"]), &input(), opts(parallel, 1_000));
            assert!(!report.all_passed);
            assert_eq!(report.failing(), vec!["lint"]);
        }
    }

    #[test]
    fn unknown_gate_is_skipped_not_fatal() {
        let (keeper, _) = keeper(vec![ScriptedGate::passing("lint")]);
        let report = keeper.run_gates(&names(&["coverage", "lint"]), &input(), opts(true, 1_000));
        assert!(report.all_passed);
        assert!(report.results[0].skipped);
    }

    #[test]
    fn slow_gate_times_out_as_failure() {
        let slow = ScriptedGate::passing("mutation").with_delay(Duration::from_millis(500));
        let (keeper, _) = keeper(vec![slow, ScriptedGate::passing("lint")]);
        let started = Instant::now();
        let report = keeper.run_gates(&names(&["mutation", "lint"]), &input(), opts(true, 50));
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(!report.all_passed);
        assert!(report.results[0].reason.contains("timed out"));
        assert!(report.results[1].passed);
    }

    #[test]
    fn erroring_and_panicking_gates_become_failures() {
        let (keeper, _) = keeper(vec![ScriptedGate::erroring("lint", "linter crashed"), ScriptedGate::panicking("tdd")]);
        let report = keeper.run_gates(&names(&["lint", "tdd"]), &input(), opts(true, 1_000));
        assert!(!report.all_passed);
        assert!(report.results[0].reason.contains("linter crashed"));
        assert!(report.results[1].reason.contains("panicked"));
    }

    #[test]
    fn empty_gate_list_passes() {
        let (keeper, _) = keeper(Vec::new());
        assert!(keeper.run_gates(&[], &input(), opts(true, 10)).all_passed);
    }
}
