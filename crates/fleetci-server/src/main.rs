//! FleetCI coordinator server.

use anyhow::Context;
use clap::Parser;
use fleetci_config::{CoordinatorConfig, LogFormat, load_coordinator_config};
use fleetci_core::credential::CredentialStore;
use fleetci_core::cron::CronStore;
use fleetci_core::settings::SettingsStore;
use fleetci_credentials::{CredentialResolver, SecretCipher};
use fleetci_db::{
    MemoryCredentialStore, MemoryCronStore, MemorySettingsStore, PgCredentialRepo, PgCronRepo,
    PgSettingsRepo, create_pool, run_migrations,
};
use fleetci_scheduler::shutdown::HookFuture;
use fleetci_scheduler::{
    Coordinator, CoordinatorParts, ShutdownOptions, install_shutdown_handler, parse_timezone,
};
use fleetci_server::{AppState, ChannelBroadcaster, routes};
use sqlx::PgPool;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Time allowed for HTTP connections to finish once the coordinator is down.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "fleetci-server")]
#[command(about = "FleetCI coordinator", long_about = None, version)]
struct Args {
    /// Path to the KDL configuration file
    #[arg(short, long, env = "FLEETCI_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(long, env = "FLEETCI_LISTEN")]
    listen: Option<SocketAddr>,

    /// PostgreSQL URL, overrides the config file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Hex-encoded credential encryption key, overrides the config file
    #[arg(long, env = "FLEETCI_ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "FLEETCI_LOG_JSON")]
    log_json: bool,
}

struct Storage {
    cron: Arc<dyn CronStore>,
    settings: Arc<dyn SettingsStore>,
    credentials: Arc<dyn CredentialStore>,
    pool: Option<PgPool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(args.log_json || config.log_format == LogFormat::Json);

    if config.agent_tokens.is_empty() {
        warn!("No agent tokens configured, every agent will be refused");
    }

    let storage = open_storage(config.database_url.as_deref()).await?;
    let credentials = match &config.encryption_key {
        Some(key) => {
            let cipher = SecretCipher::from_hex_key(key).context("invalid encryption key")?;
            let resolver = CredentialResolver::new(storage.credentials.clone(), cipher)
                .allow_plaintext(config.allow_plaintext_credentials);
            Some(Arc::new(resolver))
        }
        None => {
            warn!("No encryption key configured, credential injection is disabled");
            None
        }
    };
    let default_timezone = parse_timezone(&config.default_timezone)
        .with_context(|| format!("invalid default timezone {}", config.default_timezone))?;

    let events = ChannelBroadcaster::default();
    let coordinator = Arc::new(Coordinator::new(CoordinatorParts {
        cron_store: storage.cron.clone(),
        settings: storage.settings.clone(),
        broadcaster: Arc::new(events.clone()),
        credentials,
        runner: None,
        default_timezone,
        heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
    }));

    let state = AppState::new(
        coordinator.clone(),
        events,
        config.agent_tokens.clone(),
        storage.pool.clone(),
    );
    register_hooks(&coordinator, &state, storage.pool);

    let report = coordinator
        .start()
        .await
        .context("failed to restore cron schedules")?;
    if !report.disabled.is_empty() {
        warn!(disabled = ?report.disabled, "Some cron schedules were disabled");
    }

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let shutdown = install_shutdown_handler().context("failed to install signal handlers")?;
    info!("Starting server on {}", config.listen);
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;

    let stop_serving = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop_serving.cancelled().await })
            .await
    });

    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = &mut server => {
            // The server stopped on its own; still run the shutdown pipeline.
            match result {
                Ok(Ok(())) => warn!("Server exited unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "Server failed"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
            shutdown.cancel();
        }
    }

    if let Some(report) = coordinator
        .stop(ShutdownOptions::from(&config.shutdown))
        .await
    {
        if report.is_clean() {
            info!("Shutdown complete");
        } else {
            warn!(stages = ?report.stages, "Shutdown finished with errors");
        }
    }

    if !server.is_finished()
        && tokio::time::timeout(SERVER_DRAIN_TIMEOUT, &mut server)
            .await
            .is_err()
    {
        warn!("HTTP connections still open, aborting server");
        server.abort();
    }

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

fn load_config(args: &Args) -> anyhow::Result<CoordinatorConfig> {
    let mut config = match &args.config {
        Some(path) => load_coordinator_config(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => CoordinatorConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(url) = &args.database_url {
        config.database_url = Some(url.clone());
    }
    if let Some(key) = &args.encryption_key {
        config.encryption_key = Some(key.clone());
    }
    Ok(config)
}

async fn open_storage(database_url: Option<&str>) -> anyhow::Result<Storage> {
    match database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = create_pool(url)
                .await
                .context("failed to connect to database")?;
            run_migrations(&pool)
                .await
                .context("failed to run migrations")?;
            info!("Database connected");
            Ok(Storage {
                cron: Arc::new(PgCronRepo::new(pool.clone())),
                settings: Arc::new(PgSettingsRepo::new(pool.clone())),
                credentials: Arc::new(PgCredentialRepo::new(pool.clone())),
                pool: Some(pool),
            })
        }
        None => {
            warn!("No database configured, using in-memory storage");
            Ok(Storage {
                cron: Arc::new(MemoryCronStore::new()),
                settings: Arc::new(MemorySettingsStore::new()),
                credentials: Arc::new(MemoryCredentialStore::new()),
                pool: None,
            })
        }
    }
}

fn register_hooks(coordinator: &Coordinator, state: &AppState, pool: Option<PgPool>) {
    let shutdown = coordinator.shutdown_coordinator();

    let closing = state.closing.clone();
    shutdown.on_close_clients(Box::new(move || -> HookFuture {
        Box::pin(async move {
            closing.cancel();
            Ok(())
        })
    }));

    if let Some(pool) = pool {
        shutdown.on_close_storage(Box::new(move || -> HookFuture {
            Box::pin(async move {
                pool.close().await;
                Ok(())
            })
        }));
    }
}
