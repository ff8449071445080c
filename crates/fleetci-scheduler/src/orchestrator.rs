//! The coordinator object.
//!
//! Owns the dispatcher, the cron scheduler and the shutdown pipeline. Built
//! once at startup and handed to request handlers; there is no global state.

use chrono_tz::Tz;
use fleetci_core::cron::CronStore;
use fleetci_core::event::Broadcaster;
use fleetci_core::settings::SettingsStore;
use fleetci_core::workflow::WorkflowRunner;
use fleetci_credentials::CredentialResolver;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cron::{CronError, CronScheduler, RestoreReport};
use crate::dispatcher::Dispatcher;
use crate::runner::DispatchRunner;
use crate::shutdown::{ShutdownCoordinator, ShutdownOptions, ShutdownReport};

/// Collaborators the coordinator is built from.
pub struct CoordinatorParts {
    pub cron_store: Arc<dyn CronStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub credentials: Option<Arc<CredentialResolver>>,
    /// Workflow entry point. Defaults to submitting jobs to the dispatcher.
    pub runner: Option<Arc<dyn WorkflowRunner>>,
    pub default_timezone: Tz,
    pub heartbeat_timeout: Duration,
}

pub struct Coordinator {
    dispatcher: Arc<Dispatcher>,
    cron: Arc<CronScheduler>,
    runner: Arc<dyn WorkflowRunner>,
    shutdown: ShutdownCoordinator,
    heartbeat_timeout: Duration,
    background: CancellationToken,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(parts: CoordinatorParts) -> Self {
        let mut dispatcher = Dispatcher::new(parts.broadcaster.clone());
        if let Some(resolver) = parts.credentials {
            dispatcher = dispatcher.with_credentials(resolver);
        }
        let dispatcher = Arc::new(dispatcher);

        let runner: Arc<dyn WorkflowRunner> = match parts.runner {
            Some(runner) => runner,
            None => Arc::new(DispatchRunner::new(dispatcher.clone())),
        };

        let cron = Arc::new(CronScheduler::new(
            parts.cron_store,
            parts.settings,
            runner.clone(),
            parts.broadcaster,
            parts.default_timezone,
        ));
        let shutdown = ShutdownCoordinator::new(dispatcher.clone(), cron.clone());

        Self {
            dispatcher,
            cron,
            runner,
            shutdown,
            heartbeat_timeout: parts.heartbeat_timeout,
            background: CancellationToken::new(),
            sweeper: std::sync::Mutex::new(None),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn cron(&self) -> &Arc<CronScheduler> {
        &self.cron
    }

    pub fn runner(&self) -> &Arc<dyn WorkflowRunner> {
        &self.runner
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Restore cron timers from storage and start the heartbeat sweeper.
    pub async fn start(&self) -> Result<RestoreReport, CronError> {
        let report = self.cron.restore().await?;

        let dispatcher = self.dispatcher.clone();
        let cancel = self.background.clone();
        let timeout = self.heartbeat_timeout;
        let timeout_chrono =
            chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(90));
        let period = (timeout / 3).max(Duration::from_secs(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        dispatcher.sweep_stale(timeout_chrono).await;
                    }
                }
            }
        });
        match self.sweeper.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(_) => warn!("Heartbeat sweeper slot poisoned"),
        }

        info!(
            restored = report.restored.len(),
            disabled = report.disabled.len(),
            "Coordinator started"
        );
        Ok(report)
    }

    /// Run the shutdown pipeline and stop background tasks.
    pub async fn stop(&self, options: ShutdownOptions) -> Option<ShutdownReport> {
        let report = self.shutdown.shutdown(options).await;
        self.background.cancel();
        let handle = self.sweeper.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        report
    }
}
