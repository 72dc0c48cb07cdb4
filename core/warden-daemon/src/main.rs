//! Warden daemon: polls session transcripts and the shared commit log on an
//! interval and keeps every agent's persisted lifecycle record current.
//!
//! `--once` runs a single reconciliation pass and prints the resulting
//! snapshot as JSON; otherwise the process polls in the foreground until
//! killed.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use warden_core::{
    EngineRuntime, ErrorPolicy, GitCommitLog, NoRestart, ReconcileEngine, WardenConfig,
};

#[derive(Parser, Debug)]
#[command(name = "warden-daemon", about = "Agent lifecycle reconciliation daemon")]
struct Cli {
    /// JSON configuration file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root of the shared repository (commit log + per-agent state dirs).
    #[arg(long)]
    root: Option<PathBuf>,

    /// Transcript directory (defaults to <root>/_sessions).
    #[arg(long)]
    sessions_dir: Option<PathBuf>,

    /// Where per-agent records are written (defaults to <root>).
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Known agent identity; repeatable.
    #[arg(long = "agent")]
    agents: Vec<String>,

    /// Seconds between poll cycles.
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Seconds of transcript silence before a session counts as quiescent.
    #[arg(long)]
    quiescence_secs: Option<i64>,

    /// Run one reconciliation pass, print the snapshot as JSON, and exit.
    #[arg(long)]
    once: bool,

    /// Abort the whole cycle on the first per-agent error.
    #[arg(long)]
    fail_fast: bool,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Invalid configuration");
            std::process::exit(1);
        }
    };
    if config.agents.is_empty() {
        error!("No agents configured; pass --agent or list them in the config file");
        std::process::exit(1);
    }

    let engine = ReconcileEngine::new(
        &config,
        Box::new(GitCommitLog::new(&config.repo_root)),
        Box::new(NoRestart),
    );
    let runtime = EngineRuntime::new(engine, Duration::from_secs(config.poll_interval_secs));

    if cli.once {
        run_once(&runtime);
        return;
    }
    run_forever(runtime, &config);
}

fn build_config(cli: &Cli) -> warden_core::Result<WardenConfig> {
    let mut config = match (&cli.config, &cli.root) {
        (Some(path), _) => WardenConfig::load(path)?,
        (None, Some(root)) => WardenConfig::for_repo(root, cli.agents.clone()),
        (None, None) => {
            match warden_core::config::default_config_path().filter(|p| p.exists()) {
                Some(path) => WardenConfig::load(&path)?,
                None => WardenConfig::for_repo(
                    std::env::current_dir().map_err(|e| {
                        warden_core::WardenError::io("resolving current directory", e)
                    })?,
                    cli.agents.clone(),
                ),
            }
        }
    };

    if let Some(root) = &cli.root {
        config.repo_root = root.clone();
    }
    if let Some(dir) = &cli.sessions_dir {
        config.sessions_dir = dir.clone();
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }
    if !cli.agents.is_empty() {
        config.agents = cli
            .agents
            .iter()
            .map(|a| warden_core::types::normalize_agent_id(a))
            .collect();
    }
    if let Some(secs) = cli.interval_secs {
        config.poll_interval_secs = secs;
    }
    if let Some(secs) = cli.quiescence_secs {
        config.quiescence_secs = secs;
    }
    if cli.fail_fast {
        config.error_policy = ErrorPolicy::FailFast;
    }
    Ok(config)
}

fn run_once(runtime: &EngineRuntime) {
    match runtime.force_poll() {
        Ok(snapshot) => {
            let records: Vec<_> = snapshot.records.values().collect();
            match serde_json::to_string_pretty(&records) {
                Ok(json) => println!("{}", json),
                Err(err) => {
                    error!(error = %err, "Failed to serialize snapshot");
                    std::process::exit(1);
                }
            }
            if !snapshot.recent_errors.is_empty() {
                for message in &snapshot.recent_errors {
                    error!("{}", message);
                }
                std::process::exit(2);
            }
        }
        Err(err) => {
            error!(error = %err, "Reconciliation failed");
            std::process::exit(1);
        }
    }
}

fn run_forever(mut runtime: EngineRuntime, config: &WardenConfig) {
    info!(
        root = %config.repo_root.display(),
        agents = ?config.agents,
        interval_secs = config.poll_interval_secs,
        "Warden daemon started"
    );
    runtime.start();

    // Records are persisted atomically each cycle, so an abrupt kill loses
    // at most the cycle in flight.
    loop {
        std::thread::park();
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
