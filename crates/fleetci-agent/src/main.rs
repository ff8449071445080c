//! FleetCI build agent.

use anyhow::Context;
use clap::Parser;
use fleetci_agent::Agent;
use fleetci_config::{LogFormat, load_agent_config, parse_coordinator_url};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetci-agent")]
#[command(about = "FleetCI build agent", long_about = None, version)]
struct Args {
    /// Path to the KDL configuration file
    #[arg(short, long, env = "FLEETCI_AGENT_CONFIG", default_value = "agent.kdl")]
    config: PathBuf,

    /// Coordinator agent endpoint, overrides the config file
    #[arg(long, env = "FLEETCI_COORDINATOR")]
    coordinator: Option<String>,

    /// Authentication token, overrides the config file
    #[arg(long, env = "FLEETCI_AGENT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Agent name, overrides the config file
    #[arg(long, env = "FLEETCI_AGENT_NAME")]
    name: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "FLEETCI_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_agent_config(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(raw) = &args.coordinator {
        config.coordinator = parse_coordinator_url(raw).context("invalid coordinator URL")?;
    }
    if let Some(token) = args.token {
        config.token = token;
    }
    if let Some(name) = args.name {
        config.name = name;
    }
    init_tracing(args.log_json || config.log_format == LogFormat::Json);

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("failed to create {}", config.work_dir.display()))?;

    let agent = Agent::new(config);
    let info = agent.info();
    info!(
        name = %info.name,
        hostname = %info.hostname,
        platform = ?info.platform,
        capabilities = ?info.capabilities,
        max_jobs = info.max_concurrent_jobs,
        "Starting agent"
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });

    agent.run(cancel).await;
    info!("Agent stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        _ => {
            warn!("Failed to install signal handlers, falling back to Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl-C, shutting down");
    }
}
