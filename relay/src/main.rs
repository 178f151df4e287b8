//! Relay workflow engine CLI.
//!
//! `relay run` drives one task through a workflow; the other commands inspect
//! and manage the shared cache (file reservations, gate metrics) and check
//! workflow files before they are used.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use relay::exit_codes;
use relay::integrate::{GitIntegrator, Integrator, NoopIntegrator};
use relay::io::config::{RelayConfig, default_config_path, load_config, load_workflow};
use relay::io::gates::GateRegistry;
use relay::io::lock::LockDir;
use relay::io::metrics::MetricsStore;
use relay::io::paths::CachePaths;
use relay::io::reservations::{ReservationStore, ReserveOptions};
use relay::io::shutdown::Shutdown;
use relay::io::task_store::FileTaskStore;
use relay::io::worker::ProcessWorker;
use relay::relay::{Relay, RelayDeps};

#[derive(Parser)]
#[command(
    name = "relay",
    version,
    about = "Relay workflow engine: drives tasks through gated agent stages"
)]
struct Cli {
    /// Repository root (cache and config paths resolve against it).
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Config file; defaults to `<root>/.relay/config.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a task through a workflow until it completes, blocks or escalates.
    Run {
        task_id: String,
        /// Workflow definition (`.toml` or `.json`).
        #[arg(long)]
        workflow: PathBuf,
        /// Print the outcome as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Reserve file patterns for an owner.
    Reserve {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        ttl_secs: Option<u64>,
        /// Allow overlap with other shared reservations.
        #[arg(long)]
        shared: bool,
        #[arg(required = true)]
        patterns: Vec<String>,
    },
    /// Release reservations by pattern, owner, id, or all of them.
    Release(ReleaseArgs),
    /// List active reservations as JSON.
    Reservations,
    /// Show gate timing percentiles and pass rates.
    Metrics {
        #[arg(long)]
        gate: Option<String>,
    },
    /// Check a workflow file without running it.
    Validate { workflow: PathBuf },
}

#[derive(Args)]
#[group(multiple = false)]
struct ReleaseArgs {
    #[arg(long)]
    owner: Option<String>,
    #[arg(long)]
    id: Option<String>,
    /// Drop every reservation regardless of owner.
    #[arg(long)]
    all: bool,
    patterns: Vec<String>,
}

fn main() {
    relay::logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| default_config_path(&cli.root));
    let config = load_config(&config_path)?;
    match cli.command {
        Command::Run {
            task_id,
            workflow,
            json,
        } => cmd_run(&cli.root, config, &task_id, &workflow, json),
        Command::Reserve {
            owner,
            ttl_secs,
            shared,
            patterns,
        } => {
            let mut opts = ReserveOptions::owner(owner);
            if let Some(secs) = ttl_secs {
                opts = opts.with_ttl(Duration::from_secs(secs));
            }
            if shared {
                opts = opts.shared();
            }
            cmd_reserve(&cli.root, &config, &opts, &patterns)
        }
        Command::Release(args) => cmd_release(&cli.root, &config, &args),
        Command::Reservations => {
            let active = reservation_store(&cli.root, &config).status()?;
            print_json(&active)?;
            Ok(exit_codes::OK)
        }
        Command::Metrics { gate } => cmd_metrics(&cli.root, &config, gate.as_deref()),
        Command::Validate { workflow } => {
            let workflow = load_workflow(&workflow)?;
            println!(
                "workflow '{}' is valid ({} states, start '{}')",
                workflow.name,
                workflow.transitions.len(),
                workflow.start
            );
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(root: &Path, config: RelayConfig, task_id: &str, workflow: &Path, json: bool) -> Result<i32> {
    let workflow = load_workflow(workflow)?;
    let paths = cache_paths(root, &config);
    paths.ensure()?;
    let lock = LockDir::new(&paths.lock_dir, &config.lock);
    let shutdown = Shutdown::new();
    shutdown.install_signal_handler()?;

    let integrator: Arc<dyn Integrator> = if config.integration.enabled {
        let mut git = GitIntegrator::new(root, &config.integration).ignoring(".relay/");
        if let Ok(rel) = paths.root.strip_prefix(root) {
            git = git.ignoring(rel.to_string_lossy().into_owned());
        }
        Arc::new(git)
    } else {
        Arc::new(NoopIntegrator)
    };
    let deps = RelayDeps {
        store: Arc::new(FileTaskStore::new(paths.clone(), lock.clone(), config.lock_timeout())),
        worker: Arc::new(ProcessWorker::new(&config.worker).with_shutdown(shutdown.clone())),
        integrator,
        gates: GateRegistry::with_builtins(&config.gates),
        metrics: Arc::new(MetricsStore::new(&paths.metrics_path, lock, config.lock_timeout())),
        shutdown,
    };
    let outcome = Relay::new(config, root, deps).run(task_id, &workflow)?;

    if json {
        print_json(&outcome)?;
    } else {
        println!(
            "{}: {} after {} iteration(s) (status {}): {}",
            outcome.task_id,
            outcome.final_state.as_str(),
            outcome.iterations,
            outcome.status.as_str(),
            outcome.reason
        );
    }
    Ok(exit_codes::for_outcome(&outcome))
}

fn cmd_reserve(
    root: &Path,
    config: &RelayConfig,
    opts: &ReserveOptions,
    patterns: &[String],
) -> Result<i32> {
    match reservation_store(root, config).reserve(patterns, opts)? {
        Some(reservation) => {
            print_json(&reservation)?;
            Ok(exit_codes::OK)
        }
        None => {
            eprintln!("patterns overlap an active reservation held by another owner");
            Ok(exit_codes::CONFLICT)
        }
    }
}

fn cmd_release(root: &Path, config: &RelayConfig, args: &ReleaseArgs) -> Result<i32> {
    let store = reservation_store(root, config);
    let released = if args.all {
        store.force_clear()?
    } else if let Some(owner) = &args.owner {
        store.release_by_owner(owner)?
    } else if let Some(id) = &args.id {
        usize::from(store.release_by_id(id)?)
    } else if !args.patterns.is_empty() {
        store.release(&args.patterns)?
    } else {
        return Err(anyhow!("nothing to release: pass patterns, --owner, --id or --all"));
    };
    println!("released {released} reservation(s)");
    Ok(exit_codes::OK)
}

#[derive(Serialize)]
struct GateMetricsRow {
    gate: String,
    samples: usize,
    p50_ms: Option<u64>,
    p95_ms: Option<u64>,
    pass_rate: Option<f64>,
}

fn cmd_metrics(root: &Path, config: &RelayConfig, gate: Option<&str>) -> Result<i32> {
    let paths = cache_paths(root, config);
    let lock = LockDir::new(&paths.lock_dir, &config.lock);
    let snapshot = MetricsStore::new(&paths.metrics_path, lock, config.lock_timeout()).snapshot()?;
    let rows: Vec<GateMetricsRow> = snapshot
        .gates
        .iter()
        .filter(|(name, _)| gate.is_none_or(|g| g == name.as_str()))
        .map(|(name, samples)| GateMetricsRow {
            gate: name.clone(),
            samples: samples.durations_ms.len(),
            p50_ms: samples.percentile(50.0),
            p95_ms: samples.percentile(95.0),
            pass_rate: samples.pass_rate(),
        })
        .collect();
    print_json(&rows)?;
    Ok(exit_codes::OK)
}

fn cache_paths(root: &Path, config: &RelayConfig) -> CachePaths {
    CachePaths::new(config.cache_dir_in(root))
}

/// One-shot commands exit right away, so expiry relies on lazy pruning.
fn reservation_store(root: &Path, config: &RelayConfig) -> ReservationStore {
    let paths = cache_paths(root, config);
    let lock = LockDir::new(&paths.lock_dir, &config.lock);
    ReservationStore::new(
        &paths.reservations_path,
        lock,
        config.lock_timeout(),
        config.reservation_ttl(),
    )
    .without_sweeper()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run() {
        let cli = Cli::parse_from(["relay", "run", "bd-1", "--workflow", "wf.toml"]);
        assert!(matches!(
            cli.command,
            Command::Run { ref task_id, json: false, .. } if task_id == "bd-1"
        ));
        assert_eq!(cli.root, PathBuf::from("."));
    }

    #[test]
    fn parse_reserve_with_ttl() {
        let cli = Cli::parse_from([
            "relay", "reserve", "--owner", "w1", "--ttl-secs", "30", "src/a.js", "src/b.js",
        ]);
        match cli.command {
            Command::Reserve {
                owner,
                ttl_secs,
                shared,
                patterns,
            } => {
                assert_eq!(owner, "w1");
                assert_eq!(ttl_secs, Some(30));
                assert!(!shared);
                assert_eq!(patterns, vec!["src/a.js", "src/b.js"]);
            }
            _ => panic!("expected reserve"),
        }
    }

    #[test]
    fn release_selectors_are_exclusive() {
        assert!(Cli::try_parse_from(["relay", "release", "--owner", "w1", "--all"]).is_err());
        assert!(Cli::try_parse_from(["relay", "release", "--id", "res-1"]).is_ok());
    }
}
