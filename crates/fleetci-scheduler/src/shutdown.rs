//! Coordinator shutdown.
//!
//! Shutdown is an ordered, best-effort pipeline. Every stage runs even if an
//! earlier one failed, and each outcome is logged and reported.

use fleetci_config::ShutdownConfig;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cron::CronScheduler;
use crate::dispatcher::Dispatcher;

pub type HookFuture = Pin<Box<dyn Future<Output = fleetci_core::Result<()>> + Send>>;

/// A deferred shutdown action.
pub type ShutdownHook = Box<dyn FnOnce() -> HookFuture + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownStage {
    Notify,
    RunningJobs,
    CronTimers,
    Channels,
    Storage,
    Cleanup,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub stage: ShutdownStage,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub stages: Vec<StageOutcome>,
}

impl ShutdownReport {
    fn record(&mut self, stage: ShutdownStage, result: Result<String, String>) {
        let (ok, detail) = match result {
            Ok(detail) => {
                info!(stage = ?stage, detail = %detail, "Shutdown stage complete");
                (true, detail)
            }
            Err(detail) => {
                warn!(stage = ?stage, detail = %detail, "Shutdown stage failed");
                (false, detail)
            }
        };
        self.stages.push(StageOutcome { stage, ok, detail });
    }

    pub fn is_clean(&self) -> bool {
        self.stages.iter().all(|s| s.ok)
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownOptions {
    pub reason: String,
    pub wait_for_jobs: bool,
    pub force: bool,
    pub drain_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self::from(&ShutdownConfig::default())
    }
}

impl From<&ShutdownConfig> for ShutdownOptions {
    fn from(config: &ShutdownConfig) -> Self {
        Self {
            reason: "coordinator shutting down".into(),
            wait_for_jobs: config.wait_for_jobs,
            force: config.force,
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
        }
    }
}

struct Cleanup {
    name: String,
    priority: i32,
    hook: ShutdownHook,
}

pub struct ShutdownCoordinator {
    dispatcher: Arc<Dispatcher>,
    cron: Arc<CronScheduler>,
    started: AtomicBool,
    close_clients: Mutex<Option<ShutdownHook>>,
    close_storage: Mutex<Option<ShutdownHook>>,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl ShutdownCoordinator {
    pub fn new(dispatcher: Arc<Dispatcher>, cron: Arc<CronScheduler>) -> Self {
        Self {
            dispatcher,
            cron,
            started: AtomicBool::new(false),
            close_clients: Mutex::new(None),
            close_storage: Mutex::new(None),
            cleanups: Mutex::new(Vec::new()),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Closes client channels after agent channels.
    pub fn on_close_clients(&self, hook: ShutdownHook) {
        if let Ok(mut slot) = self.close_clients.lock() {
            *slot = Some(hook);
        }
    }

    /// Closes the storage connection.
    pub fn on_close_storage(&self, hook: ShutdownHook) {
        if let Ok(mut slot) = self.close_storage.lock() {
            *slot = Some(hook);
        }
    }

    /// Run `hook` at the very end. Lower priorities run first.
    pub fn register_cleanup(&self, name: impl Into<String>, priority: i32, hook: ShutdownHook) {
        if let Ok(mut cleanups) = self.cleanups.lock() {
            cleanups.push(Cleanup {
                name: name.into(),
                priority,
                hook,
            });
        }
    }

    /// Run the pipeline. Returns `None` if shutdown was already started.
    pub async fn shutdown(&self, options: ShutdownOptions) -> Option<ShutdownReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already in progress, ignoring request");
            return None;
        }

        info!(
            reason = %options.reason,
            wait_for_jobs = options.wait_for_jobs,
            force = options.force,
            "Shutting down"
        );
        let mut report = ShutdownReport::default();

        self.dispatcher.stop_intake();
        let notified = self.dispatcher.broadcast_shutdown(&options.reason).await;
        report.record(
            ShutdownStage::Notify,
            Ok(format!("{} agents notified", notified)),
        );

        let jobs = self.handle_running_jobs(&options).await;
        report.record(ShutdownStage::RunningJobs, jobs);

        let stopped = self.cron.stop_all().await;
        report.record(
            ShutdownStage::CronTimers,
            Ok(format!("{} timers stopped", stopped)),
        );

        let closed = self.dispatcher.close_all(&options.reason).await;
        let clients = run_hook(take(&self.close_clients)).await;
        report.record(
            ShutdownStage::Channels,
            clients.map(|_| format!("{} agent channels closed", closed)),
        );

        let storage = run_hook(take(&self.close_storage)).await;
        report.record(ShutdownStage::Storage, storage.map(|_| "closed".to_string()));

        let cleanup = self.run_cleanups().await;
        report.record(ShutdownStage::Cleanup, cleanup);

        info!(clean = report.is_clean(), "Shutdown complete");
        Some(report)
    }

    async fn handle_running_jobs(&self, options: &ShutdownOptions) -> Result<String, String> {
        let running = self.dispatcher.running_job_count().await;
        if running == 0 {
            return Ok("no running jobs".into());
        }

        if options.force {
            let requested = self.dispatcher.cancel_all_running().await;
            return Ok(format!("cancellation requested for {} jobs", requested));
        }

        if !options.wait_for_jobs {
            let paused = self.dispatcher.pause_running(&options.reason).await;
            return Ok(format!("{} jobs left paused", paused));
        }

        info!(running, timeout = ?options.drain_timeout, "Waiting for running jobs");
        let deadline = Instant::now() + options.drain_timeout;
        loop {
            let remaining = self.dispatcher.running_job_count().await;
            if remaining == 0 {
                return Ok("all running jobs finished".into());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(format!("{} jobs still running after drain timeout", remaining));
            }
            info!(remaining, "Jobs still running");
            tokio::time::sleep(options.poll_interval.min(deadline - now)).await;
        }
    }

    async fn run_cleanups(&self) -> Result<String, String> {
        let mut cleanups = match self.cleanups.lock() {
            Ok(mut cleanups) => std::mem::take(&mut *cleanups),
            Err(_) => return Err("cleanup registry poisoned".into()),
        };
        cleanups.sort_by_key(|c| c.priority);

        let total = cleanups.len();
        let mut failed = 0;
        for cleanup in cleanups {
            if let Err(e) = (cleanup.hook)().await {
                error!(name = %cleanup.name, error = %e, "Cleanup failed");
                failed += 1;
            }
        }

        if failed == 0 {
            Ok(format!("{} callbacks run", total))
        } else {
            Err(format!("{} of {} callbacks failed", failed, total))
        }
    }
}

fn take(slot: &Mutex<Option<ShutdownHook>>) -> Option<ShutdownHook> {
    slot.lock().ok().and_then(|mut s| s.take())
}

async fn run_hook(hook: Option<ShutdownHook>) -> Result<(), String> {
    match hook {
        Some(hook) => hook().await.map_err(|e| e.to_string()),
        None => Ok(()),
    }
}

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received.
#[cfg(unix)]
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    use tokio::signal::unix::{SignalKind, signal};

    let token = CancellationToken::new();
    let token_clone = token.clone();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
        }
        token_clone.cancel();
    });

    Ok(token)
}

#[cfg(not(unix))]
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, initiating graceful shutdown");
        }
        token_clone.cancel();
    });

    Ok(token)
}
