//! Cron triggers.
//!
//! Every cron-trigger node with an expression gets a persisted
//! [`CronJobConfig`] and a live timer task. Timers fire in the configured
//! IANA timezone, which can be changed at runtime without losing or
//! duplicating a firing.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use fleetci_core::cron::{CronJobConfig, CronStore};
use fleetci_core::event::{Broadcaster, Event};
use fleetci_core::settings::{SettingsStore, TIMEZONE_SETTING};
use fleetci_core::workflow::{
    Edge, Node, TriggerContext, WorkflowRunner, reachable_execution_nodes,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("unknown timezone: {0}")]
    InvalidTimezone(String),

    #[error(transparent)]
    Store(#[from] fleetci_core::Error),
}

impl From<CronError> for fleetci_core::Error {
    fn from(err: CronError) -> Self {
        match err {
            CronError::Store(e) => e,
            other => fleetci_core::Error::InvalidInput(other.to_string()),
        }
    }
}

/// Parse a 5-field (minute precision) or 6-field (with seconds) expression.
pub fn parse_expression(expression: &str) -> Result<Schedule, CronError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| CronError::InvalidExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

pub fn parse_timezone(name: &str) -> Result<Tz, CronError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| CronError::InvalidTimezone(name.to_string()))
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidCron {
    pub cron_node_id: String,
    pub expression: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleReport {
    pub scheduled: Vec<String>,
    pub invalid: Vec<InvalidCron>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub disabled: Vec<String>,
}

/// A live timer as seen from the API.
#[derive(Debug, Clone, Serialize)]
pub struct CronTimerInfo {
    pub job_id: String,
    pub project_id: String,
    pub cron_node_id: String,
    pub cron_node_label: Option<String>,
    pub cron_expression: String,
    pub timezone: String,
    pub next_fire: Option<DateTime<Utc>>,
}

struct CronTimer {
    config: CronJobConfig,
    schedule: Schedule,
    timezone: Tz,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl CronTimer {
    fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.schedule
            .upcoming(self.timezone)
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    fn info(&self) -> CronTimerInfo {
        CronTimerInfo {
            job_id: self.config.job_id.clone(),
            project_id: self.config.project_id.clone(),
            cron_node_id: self.config.cron_node_id.clone(),
            cron_node_label: self.config.cron_node_label.clone(),
            cron_expression: self.config.cron_expression.clone(),
            timezone: self.timezone.name().to_string(),
            next_fire: self.next_fire(),
        }
    }

    /// Stop the task and wait for an in-flight firing to finish.
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!(job_id = %self.config.job_id, error = %e, "Cron timer task failed");
            }
        }
    }
}

struct CronState {
    timers: HashMap<String, CronTimer>,
    timezone: Tz,
}

/// What a timer needs when it fires.
struct FireContext {
    store: Arc<dyn CronStore>,
    runner: Arc<dyn WorkflowRunner>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl FireContext {
    async fn fire(&self, config: &CronJobConfig, timezone: Tz) {
        let fired_at = Utc::now();
        info!(
            job_id = %config.job_id,
            project_id = %config.project_id,
            timezone = timezone.name(),
            "Cron trigger fired"
        );

        if let Err(e) = self.store.update_last_run(&config.job_id, fired_at).await {
            warn!(job_id = %config.job_id, error = %e, "Failed to record cron run");
        }

        self.broadcaster.broadcast_to_project(
            &config.project_id,
            Event::CronTriggerFired {
                project_id: config.project_id.clone(),
                cron_job_id: config.job_id.clone(),
                cron_node_id: config.cron_node_id.clone(),
                fired_at,
            },
        );

        let reachable = reachable_execution_nodes(&config.cron_node_id, &config.nodes, &config.edges);
        if reachable.is_empty() {
            warn!(job_id = %config.job_id, "Cron trigger has no connected execution nodes");
            self.broadcaster.broadcast_to_project(
                &config.project_id,
                Event::CronNoConnectedNodes {
                    project_id: config.project_id.clone(),
                    cron_job_id: config.job_id.clone(),
                    cron_node_id: config.cron_node_id.clone(),
                },
            );
            return;
        }

        let context = TriggerContext {
            source: "cron".into(),
            trigger_node_id: config.cron_node_id.clone(),
            cron_expression: Some(config.cron_expression.clone()),
            timezone: Some(timezone.name().to_string()),
        };

        match self
            .runner
            .execute_from_trigger(
                &config.project_id,
                &config.nodes,
                &config.edges,
                &config.cron_node_id,
                context,
            )
            .await
        {
            Ok(outcome) if outcome.success => {
                info!(
                    job_id = %config.job_id,
                    build_number = ?outcome.build_number,
                    nodes = reachable.len(),
                    "Cron workflow started"
                );
            }
            Ok(_) => warn!(job_id = %config.job_id, "Cron workflow was not started"),
            Err(e) => error!(job_id = %config.job_id, error = %e, "Cron workflow failed to start"),
        }
    }
}

async fn run_timer(
    ctx: Arc<FireContext>,
    config: CronJobConfig,
    schedule: Schedule,
    timezone: Tz,
    cancel: CancellationToken,
) {
    loop {
        let Some(next) = schedule.upcoming(timezone).next() else {
            debug!(job_id = %config.job_id, "Cron schedule has no further firings");
            break;
        };
        let delay = (next.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        ctx.fire(&config, timezone).await;
    }
}

pub struct CronScheduler {
    ctx: Arc<FireContext>,
    settings: Arc<dyn SettingsStore>,
    default_timezone: Tz,
    state: Mutex<CronState>,
}

impl CronScheduler {
    pub fn new(
        store: Arc<dyn CronStore>,
        settings: Arc<dyn SettingsStore>,
        runner: Arc<dyn WorkflowRunner>,
        broadcaster: Arc<dyn Broadcaster>,
        default_timezone: Tz,
    ) -> Self {
        Self {
            ctx: Arc::new(FireContext {
                store,
                runner,
                broadcaster,
            }),
            settings,
            default_timezone,
            state: Mutex::new(CronState {
                timers: HashMap::new(),
                timezone: default_timezone,
            }),
        }
    }

    fn start_timer(&self, config: CronJobConfig, schedule: Schedule, timezone: Tz) -> CronTimer {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_timer(
            self.ctx.clone(),
            config.clone(),
            schedule.clone(),
            timezone,
            cancel.clone(),
        ));
        CronTimer {
            config,
            schedule,
            timezone,
            cancel,
            handle,
        }
    }

    pub async fn timezone(&self) -> Tz {
        self.state.lock().await.timezone
    }

    /// Create or replace the timers for every cron node in a project's graph.
    /// Timers of cron nodes no longer in the graph are removed.
    pub async fn schedule(
        &self,
        project_id: &str,
        nodes: &[Node],
        edges: &[Edge],
    ) -> Result<ScheduleReport, CronError> {
        let mut report = ScheduleReport::default();
        let mut prepared = Vec::new();
        let now = Utc::now();

        for node in nodes {
            let Some(expression) = node.cron_expression() else {
                continue;
            };
            let schedule = match parse_expression(expression) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(project_id, node_id = %node.id, error = %e, "Skipping cron node");
                    report.invalid.push(InvalidCron {
                        cron_node_id: node.id.clone(),
                        expression: expression.to_string(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let config = CronJobConfig {
                job_id: CronJobConfig::key(project_id, &node.id),
                project_id: project_id.to_string(),
                cron_node_id: node.id.clone(),
                cron_node_label: node.label.clone(),
                cron_expression: expression.to_string(),
                enabled: true,
                nodes: nodes.to_vec(),
                edges: edges.to_vec(),
                last_run: None,
                created_at: now,
                updated_at: now,
            };
            self.ctx.store.upsert(&config).await?;
            prepared.push((config, schedule));
        }

        let keep: HashSet<String> = prepared.iter().map(|(c, _)| c.job_id.clone()).collect();
        let mut stopped = Vec::new();
        {
            let mut state = self.state.lock().await;
            let timezone = state.timezone;

            let stale: Vec<String> = state
                .timers
                .iter()
                .filter(|(key, t)| t.config.project_id == project_id && !keep.contains(*key))
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                if let Some(timer) = state.timers.remove(&key) {
                    stopped.push(timer);
                }
                report.removed.push(key);
            }

            for (config, schedule) in prepared {
                let key = config.job_id.clone();
                let timer = self.start_timer(config, schedule, timezone);
                if let Some(previous) = state.timers.insert(key.clone(), timer) {
                    stopped.push(previous);
                }
                info!(job_id = %key, timezone = timezone.name(), "Cron timer scheduled");
                report.scheduled.push(key);
            }
        }

        for timer in stopped {
            timer.stop().await;
        }
        for key in &report.removed {
            self.ctx.store.delete(key).await?;
        }

        Ok(report)
    }

    /// Recreate timers for every enabled stored configuration. Configurations
    /// that no longer parse are disabled and the rest still start.
    pub async fn restore(&self) -> Result<RestoreReport, CronError> {
        let timezone = match self.settings.get_setting(TIMEZONE_SETTING).await {
            Ok(Some(name)) => parse_timezone(&name).unwrap_or_else(|e| {
                warn!(error = %e, "Stored timezone is invalid, using default");
                self.default_timezone
            }),
            Ok(None) => self.default_timezone,
            Err(e) => {
                warn!(error = %e, "Failed to read timezone setting, using default");
                self.default_timezone
            }
        };

        let configs = self.ctx.store.list_enabled().await?;
        let mut report = RestoreReport::default();
        let mut started = Vec::new();

        for config in configs {
            match parse_expression(&config.cron_expression) {
                Ok(schedule) => {
                    report.restored.push(config.job_id.clone());
                    started.push((config, schedule));
                }
                Err(e) => {
                    warn!(job_id = %config.job_id, error = %e, "Disabling cron job with invalid expression");
                    if let Err(e) = self.ctx.store.set_enabled(&config.job_id, false).await {
                        error!(job_id = %config.job_id, error = %e, "Failed to disable cron job");
                    }
                    report.disabled.push(config.job_id);
                }
            }
        }

        let mut stopped = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.timezone = timezone;
            for (config, schedule) in started {
                let key = config.job_id.clone();
                let timer = self.start_timer(config, schedule, timezone);
                if let Some(previous) = state.timers.insert(key, timer) {
                    stopped.push(previous);
                }
            }
        }
        for timer in stopped {
            timer.stop().await;
        }

        info!(
            restored = report.restored.len(),
            disabled = report.disabled.len(),
            timezone = timezone.name(),
            "Cron timers restored"
        );
        Ok(report)
    }

    /// Switch every timer to a new timezone.
    ///
    /// The timer map stays locked from the first stop to the last restart, so
    /// no firing interleaves with the swap.
    pub async fn update_timezone(&self, name: &str) -> Result<Tz, CronError> {
        let timezone = parse_timezone(name)?;
        let mut state = self.state.lock().await;

        self.settings
            .set_setting(TIMEZONE_SETTING, timezone.name())
            .await?;

        let keys: Vec<String> = state.timers.keys().cloned().collect();
        for key in &keys {
            if let Some(timer) = state.timers.remove(key) {
                timer.stop().await;
            }
        }
        state.timezone = timezone;

        for key in keys {
            let config = match self.ctx.store.get(&key).await {
                Ok(Some(config)) if config.enabled => config,
                Ok(_) => {
                    debug!(job_id = %key, "Cron job gone or disabled, not recreated");
                    continue;
                }
                Err(e) => {
                    error!(job_id = %key, error = %e, "Failed to reload cron job");
                    continue;
                }
            };
            match parse_expression(&config.cron_expression) {
                Ok(schedule) => {
                    let timer = self.start_timer(config, schedule, timezone);
                    state.timers.insert(key, timer);
                }
                Err(e) => warn!(job_id = %key, error = %e, "Cron job no longer parses"),
            }
        }

        info!(timezone = timezone.name(), timers = state.timers.len(), "Cron timezone updated");
        Ok(timezone)
    }

    /// Stop one timer and delete its stored configuration.
    pub async fn remove(&self, job_id: &str) -> Result<bool, CronError> {
        let timer = self.state.lock().await.timers.remove(job_id);
        let existed = timer.is_some();
        if let Some(timer) = timer {
            timer.stop().await;
        }
        self.ctx.store.delete(job_id).await?;
        Ok(existed)
    }

    /// Stop every timer of a project. Stored configurations are kept.
    pub async fn cancel_project(&self, project_id: &str) -> usize {
        let stopped: Vec<CronTimer> = {
            let mut state = self.state.lock().await;
            let keys: Vec<String> = state
                .timers
                .iter()
                .filter(|(_, t)| t.config.project_id == project_id)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter()
                .filter_map(|k| state.timers.remove(k))
                .collect()
        };
        let count = stopped.len();
        for timer in stopped {
            timer.stop().await;
        }
        if count > 0 {
            info!(project_id, count, "Cron timers cancelled");
        }
        count
    }

    /// Stop a project's timers and delete their stored configurations.
    pub async fn remove_project(&self, project_id: &str) -> Result<usize, CronError> {
        let keys: Vec<String> = {
            let state = self.state.lock().await;
            state
                .timers
                .values()
                .filter(|t| t.config.project_id == project_id)
                .map(|t| t.config.job_id.clone())
                .collect()
        };
        self.cancel_project(project_id).await;
        for key in &keys {
            self.ctx.store.delete(key).await?;
        }
        Ok(keys.len())
    }

    pub async fn stop_all(&self) -> usize {
        let timers: Vec<CronTimer> = {
            let mut state = self.state.lock().await;
            state.timers.drain().map(|(_, t)| t).collect()
        };
        let count = timers.len();
        for timer in timers {
            timer.stop().await;
        }
        info!(count, "Cron timers stopped");
        count
    }

    pub async fn list(&self) -> Vec<CronTimerInfo> {
        let state = self.state.lock().await;
        let mut timers: Vec<CronTimerInfo> = state.timers.values().map(CronTimer::info).collect();
        timers.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        timers
    }

    pub async fn next_fire(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .timers
            .get(job_id)
            .and_then(CronTimer::next_fire)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.timers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Timelike;
    use fleetci_core::workflow::{NodeType, TriggerOutcome};
    use fleetci_db::{MemoryCronStore, MemorySettingsStore};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: StdMutex<Vec<(String, TriggerContext)>>,
    }

    #[async_trait]
    impl WorkflowRunner for RecordingRunner {
        async fn execute_from_trigger(
            &self,
            project_id: &str,
            _nodes: &[Node],
            _edges: &[Edge],
            _trigger_node_id: &str,
            context: TriggerContext,
        ) -> fleetci_core::Result<TriggerOutcome> {
            self.calls
                .lock()
                .unwrap()
                .push((project_id.to_string(), context));
            Ok(TriggerOutcome {
                success: true,
                job_id: Some("job".into()),
                build_number: Some(1),
                agent_id: None,
            })
        }
    }

    #[derive(Default)]
    struct RecordingBroadcaster {
        events: StdMutex<Vec<Event>>,
    }

    impl Broadcaster for RecordingBroadcaster {
        fn broadcast_to_project(&self, _project_id: &str, event: Event) {
            self.events.lock().unwrap().push(event);
        }

        fn broadcast_to_clients(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Harness {
        store: Arc<MemoryCronStore>,
        settings: Arc<MemorySettingsStore>,
        runner: Arc<RecordingRunner>,
        broadcaster: Arc<RecordingBroadcaster>,
        scheduler: CronScheduler,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryCronStore::new());
        let settings = Arc::new(MemorySettingsStore::new());
        let runner = Arc::new(RecordingRunner::default());
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let scheduler = CronScheduler::new(
            store.clone(),
            settings.clone(),
            runner.clone(),
            broadcaster.clone(),
            Tz::UTC,
        );
        Harness {
            store,
            settings,
            runner,
            broadcaster,
            scheduler,
        }
    }

    fn cron_node(id: &str, expression: &str) -> Node {
        Node {
            id: id.into(),
            node_type: NodeType::CronTrigger,
            label: Some(format!("{} label", id)),
            data: serde_json::json!({ "cron_expression": expression }),
            credentials: vec![],
        }
    }

    fn shell_node(id: &str) -> Node {
        Node {
            id: id.into(),
            node_type: NodeType::Shell,
            label: None,
            data: serde_json::json!({ "command": "make" }),
            credentials: vec![],
        }
    }

    fn edge(source: &str, target: &str) -> Edge {
        Edge {
            source: source.into(),
            target: target.into(),
        }
    }

    fn stored(job_id: &str, expression: &str) -> CronJobConfig {
        let now = Utc::now();
        CronJobConfig {
            job_id: job_id.into(),
            project_id: "proj".into(),
            cron_node_id: "cron".into(),
            cron_node_label: None,
            cron_expression: expression.into(),
            enabled: true,
            nodes: vec![cron_node("cron", expression), shell_node("build")],
            edges: vec![edge("cron", "build")],
            last_run: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..60 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        check()
    }

    #[test]
    fn test_parse_expression() {
        assert!(parse_expression("*/5 * * * *").is_ok());
        assert!(parse_expression("30 */5 * * * *").is_ok());
        assert!(parse_expression("  0 9 * * *  ").is_ok());
        assert!(matches!(
            parse_expression("every tuesday"),
            Err(CronError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn test_five_field_fires_on_the_minute() {
        let schedule = parse_expression("*/5 * * * *").unwrap();
        let next = schedule.upcoming(Utc).next().unwrap();
        assert_eq!(next.second(), 0);
        assert_eq!(next.minute() % 5, 0);
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("Asia/Tokyo").unwrap(), Tz::Asia__Tokyo);
        assert!(matches!(
            parse_timezone("Mars/Olympus"),
            Err(CronError::InvalidTimezone(_))
        ));
    }

    #[tokio::test]
    async fn test_schedule_replaces_and_prunes() {
        let h = harness();
        let nodes = vec![
            cron_node("nightly", "0 0 2 * * *"),
            cron_node("hourly", "0 * * * *"),
            cron_node("broken", "not a cron"),
            shell_node("build"),
        ];
        let edges = vec![edge("nightly", "build"), edge("hourly", "build")];

        let report = h.scheduler.schedule("proj", &nodes, &edges).await.unwrap();
        assert_eq!(report.scheduled.len(), 2);
        assert_eq!(report.invalid.len(), 1);
        assert_eq!(report.invalid[0].cron_node_id, "broken");
        assert_eq!(h.scheduler.len().await, 2);
        assert!(h.store.get("cron_proj_nightly").await.unwrap().is_some());

        let report = h
            .scheduler
            .schedule("proj", &nodes[..1], &edges[..1])
            .await
            .unwrap();
        assert_eq!(report.removed, vec!["cron_proj_hourly".to_string()]);
        assert_eq!(h.scheduler.len().await, 1);
        assert!(h.store.get("cron_proj_hourly").await.unwrap().is_none());

        let listed = h.scheduler.list().await;
        assert_eq!(listed[0].job_id, "cron_proj_nightly");
        assert_eq!(listed[0].cron_node_label.as_deref(), Some("nightly label"));
        assert!(listed[0].next_fire.is_some());
    }

    #[tokio::test]
    async fn test_restore_disables_invalid_config() {
        let h = harness();
        h.store.upsert(&stored("good", "0 0 * * * *")).await.unwrap();
        h.store.upsert(&stored("bad", "every full moon")).await.unwrap();

        let report = h.scheduler.restore().await.unwrap();
        assert_eq!(report.restored, vec!["good".to_string()]);
        assert_eq!(report.disabled, vec!["bad".to_string()]);
        assert_eq!(h.scheduler.len().await, 1);

        let bad = h.store.get("bad").await.unwrap().unwrap();
        assert!(!bad.enabled);
    }

    #[tokio::test]
    async fn test_restore_uses_stored_timezone() {
        let h = harness();
        h.settings
            .set_setting(TIMEZONE_SETTING, "Europe/Berlin")
            .await
            .unwrap();
        h.scheduler.restore().await.unwrap();
        assert_eq!(h.scheduler.timezone().await, Tz::Europe__Berlin);
    }

    #[tokio::test]
    async fn test_timezone_swap_keeps_last_run() {
        let h = harness();
        let nodes = vec![cron_node("morning", "0 0 9 * * *"), shell_node("build")];
        let edges = vec![edge("morning", "build")];
        h.scheduler.schedule("proj", &nodes, &edges).await.unwrap();

        let ran_at = Utc::now() - chrono::Duration::hours(3);
        h.store
            .update_last_run("cron_proj_morning", ran_at)
            .await
            .unwrap();

        let tz = h.scheduler.update_timezone("Asia/Tokyo").await.unwrap();
        assert_eq!(tz, Tz::Asia__Tokyo);
        assert_eq!(
            h.settings.get_setting(TIMEZONE_SETTING).await.unwrap().as_deref(),
            Some("Asia/Tokyo")
        );

        let next = h.scheduler.next_fire("cron_proj_morning").await.unwrap();
        let local = next.with_timezone(&Tz::Asia__Tokyo);
        assert_eq!((local.hour(), local.minute()), (9, 0));

        let config = h.store.get("cron_proj_morning").await.unwrap().unwrap();
        assert_eq!(config.last_run, Some(ran_at));
        assert_eq!(h.scheduler.list().await[0].timezone, "Asia/Tokyo");

        assert!(h.scheduler.update_timezone("Nowhere/Else").await.is_err());
        assert_eq!(h.scheduler.timezone().await, Tz::Asia__Tokyo);
    }

    #[tokio::test]
    async fn test_firing_runs_connected_nodes() {
        let h = harness();
        let nodes = vec![cron_node("tick", "* * * * * *"), shell_node("build")];
        let edges = vec![edge("tick", "build")];
        h.scheduler.schedule("proj", &nodes, &edges).await.unwrap();

        let runner = h.runner.clone();
        assert!(wait_for(|| !runner.calls.lock().unwrap().is_empty()).await);
        h.scheduler.stop_all().await;

        let (project_id, context) = h.runner.calls.lock().unwrap()[0].clone();
        assert_eq!(project_id, "proj");
        assert_eq!(context.source, "cron");
        assert_eq!(context.trigger_node_id, "tick");
        assert_eq!(context.timezone.as_deref(), Some("UTC"));

        let config = h.store.get("cron_proj_tick").await.unwrap().unwrap();
        assert!(config.last_run.is_some());
        assert!(h.broadcaster.events.lock().unwrap().iter().any(|e| matches!(
            e,
            Event::CronTriggerFired { cron_node_id, .. } if cron_node_id == "tick"
        )));
    }

    #[tokio::test]
    async fn test_firing_without_connected_nodes_warns() {
        let h = harness();
        let nodes = vec![cron_node("tick", "* * * * * *"), shell_node("orphan")];
        h.scheduler.schedule("proj", &nodes, &[]).await.unwrap();

        let broadcaster = h.broadcaster.clone();
        assert!(
            wait_for(|| broadcaster
                .events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, Event::CronNoConnectedNodes { .. })))
            .await
        );
        h.scheduler.stop_all().await;
        assert!(h.runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_cancel_project() {
        let h = harness();
        let nodes = vec![cron_node("a", "0 0 * * * *"), cron_node("b", "0 30 * * * *")];
        h.scheduler.schedule("proj", &nodes, &[]).await.unwrap();
        h.scheduler
            .schedule("other", &nodes[..1], &[])
            .await
            .unwrap();
        assert_eq!(h.scheduler.len().await, 3);

        assert!(h.scheduler.remove("cron_proj_a").await.unwrap());
        assert!(!h.scheduler.remove("cron_proj_a").await.unwrap());
        assert!(h.store.get("cron_proj_a").await.unwrap().is_none());

        assert_eq!(h.scheduler.cancel_project("proj").await, 1);
        assert!(h.store.get("cron_proj_b").await.unwrap().is_some());
        assert_eq!(h.scheduler.len().await, 1);

        assert_eq!(h.scheduler.remove_project("other").await.unwrap(), 1);
        assert!(h.store.get("cron_other_a").await.unwrap().is_none());
        assert!(h.scheduler.is_empty().await);
    }
}
