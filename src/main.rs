mod cleanup;
mod config;
mod engine;
mod feed;
mod runtime;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{ConfigLoader, FeedDefaults, RunSettings, Settings};
use engine::{
    spawn_ticker, wait_for_shutdown_signal, watch_config, ControlLoop, Diagnostics, HealthMonitor,
    Reconciler,
};
use feed::{FeedSpec, FeedStatus};
use runtime::{DockerCli, WorkerRuntime};

/// Keeps one LDES consumer worker running per configured feed
#[derive(Debug, Parser)]
#[command(name = "feedvisor", version, about)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    /// Log filter when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the reconciliation engine until signalled
    Run(RunSettings),

    /// Load the configuration and report every feed
    Validate {
        /// Graph prefix for default target graphs
        #[arg(long, env = "GRAPH_PREFIX", default_value = "ldes")]
        graph_prefix: String,

        /// Print a JSON report instead of text
        #[arg(long)]
        json: bool,
    },

    /// Stop and remove every owned worker carrying the prefix
    Cleanup {
        /// Seconds a worker gets to stop before it is killed
        #[arg(long, default_value_t = 10)]
        stop_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Run(run) => run_engine(cli.settings, run).await,
        Command::Validate { graph_prefix, json } => validate(&cli.settings, graph_prefix, json),
        Command::Cleanup { stop_timeout } => {
            run_cleanup(&cli.settings, Duration::from_secs(stop_timeout)).await
        }
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_engine(settings: Settings, run: RunSettings) -> Result<ExitCode> {
    let reconciler_settings = run.reconciler(&settings);
    let op_timeout = reconciler_settings.op_timeout;
    let interval = run.monitor_interval();

    let runtime: Arc<dyn WorkerRuntime> = Arc::new(
        DockerCli::new(&run.image, settings.owner(), run.state_dir())
            .with_network(run.network.clone()),
    );
    let reconciler = Reconciler::new(
        Arc::clone(&runtime),
        reconciler_settings,
        Diagnostics::new(run.logs_dir()),
    );

    info!(
        config = %settings.config.display(),
        image = %run.image,
        prefix = %settings.prefix,
        owner = %settings.owner(),
        "Starting feedvisor"
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let mut control = ControlLoop::new(
        reconciler,
        ConfigLoader::new(run.feed_defaults()),
        settings.config.clone(),
        rx,
    );

    match control.bootstrap().await {
        Ok(running) => info!(running, "Initial pass complete"),
        Err(e) => {
            error!(error = %e, "Engine could not start");
            return Ok(ExitCode::FAILURE);
        }
    }

    let monitor = HealthMonitor::new(runtime, interval, op_timeout);
    let health = tokio::spawn(monitor.run(control.subscribe(), tx.clone()));
    let ticker = spawn_ticker(interval, tx.clone());
    let _watcher = if run.no_watch {
        None
    } else {
        match watch_config(&settings.config, tx.clone()) {
            Ok(debouncer) => Some(debouncer),
            Err(e) => {
                warn!(error = %e, "File watching unavailable, relying on periodic checks");
                None
            }
        }
    };
    drop(tx);

    let summary = control.run(wait_for_shutdown_signal()).await;
    health.abort();
    ticker.abort();

    let stopped = summary
        .state
        .values()
        .filter(|r| matches!(r.status, FeedStatus::Stopped | FeedStatus::Removed))
        .count();
    info!(stopped, "Shutdown complete");

    Ok(if summary.ever_running {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[derive(Serialize)]
struct ValidationReport<'a> {
    path: PathBuf,
    feeds: Vec<&'a FeedSpec>,
    problems: Vec<String>,
}

fn validate(settings: &Settings, graph_prefix: String, json: bool) -> Result<ExitCode> {
    let loader = ConfigLoader::new(FeedDefaults {
        graph_prefix,
        ..FeedDefaults::default()
    });
    let loaded = loader
        .load(&settings.config)
        .with_context(|| format!("Failed to load {}", settings.config.display()))?;

    let report = ValidationReport {
        path: settings.config.clone(),
        feeds: loaded.set.feeds.values().collect(),
        problems: loaded.invalid.iter().map(|e| e.to_string()).collect(),
    };

    if json {
        let out = serde_json::to_string_pretty(&report).context("Failed to render report")?;
        println!("{}", out);
    } else {
        println!("{}: {} feed(s)", report.path.display(), report.feeds.len());
        for spec in &report.feeds {
            let verdict = if spec.validate().is_ok() { "ok" } else { "invalid" };
            println!(
                "  {:<24} {:<8} {} -> {} ({}, every {}s, restart {})",
                spec.name,
                verdict,
                spec.source,
                spec.destination,
                spec.target_context,
                spec.polling_interval,
                spec.restart_policy,
            );
        }
        for problem in &report.problems {
            println!("  ! {}", problem);
        }
    }

    Ok(if report.problems.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_cleanup(settings: &Settings, stop_timeout: Duration) -> Result<ExitCode> {
    // Only listing, stop and remove are used
    let runtime = DockerCli::new(String::new(), settings.owner(), PathBuf::new());
    let report = cleanup::cleanup(&runtime, &settings.owner(), &settings.prefix, stop_timeout)
        .await
        .context("Failed to list workers")?;

    println!(
        "Cleanup complete: {}/{} worker(s) removed",
        report.removed, report.found
    );
    Ok(if report.removed == report.found {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "feedvisor",
            "--config",
            "/data/feeds",
            "run",
            "--image",
            "ldes2sparql:dev",
            "--remove-orphans",
        ])
        .unwrap();
        assert_eq!(cli.settings.config, PathBuf::from("/data/feeds"));
        match cli.command {
            Command::Run(run) => {
                assert_eq!(run.image, "ldes2sparql:dev");
                assert!(run.remove_orphans);
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_validate_and_cleanup() {
        let cli = Cli::try_parse_from(["feedvisor", "validate", "--json"]).unwrap();
        assert!(matches!(cli.command, Command::Validate { json: true, .. }));

        let cli = Cli::try_parse_from(["feedvisor", "cleanup", "--stop-timeout", "3"]).unwrap();
        assert!(matches!(cli.command, Command::Cleanup { stop_timeout: 3 }));
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["feedvisor"]).is_err());
    }
}
