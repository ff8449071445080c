//! Job dispatch.
//!
//! The dispatcher owns the agent registry, the per-agent queues and the
//! coordinator's view of every live job. Queues are drained whenever an agent
//! gains capacity: on connect, on job completion and on a capacity change.
//!
//! Credentials are resolved here, just before a job is sent. The decrypted
//! values travel to the agent as `mask_values` and are also kept on the job
//! so output can be masked again before it is broadcast.

use chrono::Utc;
use fleetci_core::event::{Broadcaster, Event};
use fleetci_core::job::{JobRecord, JobSpec, JobStatus, Priority};
use fleetci_core::protocol::{
    AgentInfo, AgentMessage, AgentStatus, CoordinatorMessage, ExecuteJob, JobStatusUpdate,
};
use fleetci_credentials::{CredentialResolver, LogMasker, ResolvedEnvironment};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

use crate::queue::{JobQueue, QueueError, QueueStats};
use crate::registry::{AgentRegistry, AgentSender, AgentSummary};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no connected agent can run this job")]
    NoAgent,

    #[error("agent not connected: {0}")]
    UnknownAgent(String),

    #[error("job {0} already exists")]
    Duplicate(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("coordinator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<DispatchError> for fleetci_core::Error {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotFound(_) | DispatchError::UnknownAgent(_) => {
                fleetci_core::Error::NotFound(err.to_string())
            }
            DispatchError::Duplicate(_) => fleetci_core::Error::Conflict(err.to_string()),
            DispatchError::Queue(_) => fleetci_core::Error::InvalidInput(err.to_string()),
            DispatchError::NoAgent | DispatchError::ShuttingDown => {
                fleetci_core::Error::Internal(err.to_string())
            }
        }
    }
}

/// A request to run one job.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub job: JobSpec,
    /// Target agent. Picked automatically when absent.
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Capabilities an automatically picked agent must have.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Dispatched {
        job_id: String,
        agent_id: String,
    },
    Queued {
        job_id: String,
        agent_id: String,
        position: usize,
    },
}

impl SubmitOutcome {
    pub fn agent_id(&self) -> &str {
        match self {
            SubmitOutcome::Dispatched { agent_id, .. } | SubmitOutcome::Queued { agent_id, .. } => {
                agent_id
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was still queued and has been removed.
    Removed { job_id: String },
    /// The owning agent was asked to stop the job.
    Requested { job_id: String, agent_id: String },
}

enum Placement {
    Send(JobSpec, AgentSender),
    Queued(usize),
}

struct TrackedJob {
    record: JobRecord,
    masker: LogMasker,
}

#[derive(Default)]
struct DispatchState {
    registry: AgentRegistry,
    queue: JobQueue,
    jobs: HashMap<String, TrackedJob>,
    /// Receivers of a job's final status, keyed by job id.
    waiters: HashMap<String, Vec<oneshot::Sender<JobStatus>>>,
}

impl DispatchState {
    /// Claim a slot on `agent_id` for a job and hand back what is needed to
    /// send it.
    fn reserve(&mut self, agent_id: &str, job_id: &str) -> Option<(JobSpec, AgentSender)> {
        let sender = self.registry.sender(agent_id)?;
        let tracked = self.jobs.get_mut(job_id)?;
        self.registry.job_started(agent_id, job_id);
        tracked.record.agent_id = Some(agent_id.to_string());
        tracked.record.status = JobStatus::Dispatched;
        Some((tracked.record.spec.clone(), sender))
    }

    fn release(&mut self, job_id: &str) -> Option<TrackedJob> {
        let tracked = self.jobs.remove(job_id)?;
        if let Some(agent_id) = &tracked.record.agent_id {
            self.registry.job_finished(agent_id, job_id);
        }
        Some(tracked)
    }

    /// Hand the final status of a job that is no longer tracked to whoever
    /// is waiting on it.
    fn settle(&mut self, job_id: &str, status: JobStatus) {
        for waiter in self.waiters.remove(job_id).into_iter().flatten() {
            let _ = waiter.send(status);
        }
    }
}

pub struct Dispatcher {
    state: Mutex<DispatchState>,
    /// Serializes the reserve-resolve-send sequence so jobs leave each queue
    /// in order.
    dispatch_lock: Mutex<()>,
    broadcaster: Arc<dyn Broadcaster>,
    credentials: Option<Arc<CredentialResolver>>,
    accepting: AtomicBool,
}

impl Dispatcher {
    pub fn new(broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self {
            state: Mutex::new(DispatchState::default()),
            dispatch_lock: Mutex::new(()),
            broadcaster,
            credentials: None,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn with_credentials(mut self, resolver: Arc<CredentialResolver>) -> Self {
        self.credentials = Some(resolver);
        self
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Refuse new jobs and stop draining queues.
    pub fn stop_intake(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub async fn agent_connected(&self, agent_id: &str, info: AgentInfo, sender: AgentSender) {
        let name = info.name.clone();
        {
            let mut state = self.state.lock().await;
            state.registry.register(agent_id, info, sender);
        }
        info!(agent_id, name = %name, "Agent registered");
        self.broadcaster.broadcast_to_clients(Event::AgentConnected {
            agent_id: agent_id.to_string(),
            name,
        });
        self.drain(agent_id).await;
    }

    /// Forget an agent. Its queued jobs are dropped and the jobs it was
    /// running are reported failed.
    pub async fn agent_disconnected(&self, agent_id: &str) {
        let (dropped, orphaned) = {
            let mut state = self.state.lock().await;
            let Some(agent) = state.registry.unregister(agent_id) else {
                return;
            };
            let dropped: Vec<JobRecord> = state
                .queue
                .clear_queue(agent_id)
                .into_iter()
                .filter_map(|entry| state.jobs.remove(&entry.job.job_id))
                .map(|t| t.record)
                .collect();
            let orphaned: Vec<JobRecord> = agent
                .running
                .iter()
                .filter_map(|job_id| state.jobs.remove(job_id))
                .map(|t| t.record)
                .collect();
            for record in dropped.iter().chain(orphaned.iter()) {
                state.settle(&record.spec.job_id, JobStatus::Failed);
            }
            (dropped, orphaned)
        };
        let shutting_down = !self.is_accepting();

        if !dropped.is_empty() || !orphaned.is_empty() {
            warn!(
                agent_id,
                dropped = dropped.len(),
                orphaned = orphaned.len(),
                "Agent disconnected with outstanding jobs"
            );
        } else {
            info!(agent_id, "Agent disconnected");
        }

        for record in dropped.iter().chain(orphaned.iter()) {
            // Jobs paused by shutdown were already reported as retriable.
            if shutting_down && record.status == JobStatus::Retrying {
                continue;
            }
            self.broadcaster.broadcast_to_project(
                &record.spec.project_id,
                Event::JobStatusChanged {
                    project_id: record.spec.project_id.clone(),
                    job_id: record.spec.job_id.clone(),
                    status: JobStatus::Failed,
                    message: Some(format!("agent {} disconnected", agent_id)),
                },
            );
        }
        self.broadcaster.broadcast_to_clients(Event::AgentDisconnected {
            agent_id: agent_id.to_string(),
            dropped_jobs: dropped.len(),
        });
    }

    /// Accept a job. It is sent immediately if its agent has a free slot and
    /// nothing is queued ahead of it, otherwise it waits in the agent's queue.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, DispatchError> {
        if !self.is_accepting() {
            return Err(DispatchError::ShuttingDown);
        }

        let _dispatch = self.dispatch_lock.lock().await;
        let job_id = request.job.job_id.clone();
        let project_id = request.job.project_id.clone();

        let (agent_id, placement) = {
            let mut state = self.state.lock().await;
            if state.jobs.contains_key(&job_id) {
                return Err(DispatchError::Duplicate(job_id));
            }

            let agent_id = match request.agent_id {
                Some(id) if state.registry.contains(&id) => id,
                Some(id) => return Err(DispatchError::UnknownAgent(id)),
                None => state
                    .registry
                    .select(&request.capabilities)
                    .map(str::to_string)
                    .ok_or(DispatchError::NoAgent)?,
            };

            let direct =
                state.registry.has_capacity(&agent_id) && state.queue.is_empty(&agent_id);
            if direct {
                if job_id.is_empty() {
                    return Err(QueueError::EmptyJobId.into());
                }
                state.jobs.insert(
                    job_id.clone(),
                    TrackedJob {
                        record: JobRecord::new(request.job),
                        masker: LogMasker::new(),
                    },
                );
                let Some((spec, sender)) = state.reserve(&agent_id, &job_id) else {
                    state.jobs.remove(&job_id);
                    return Err(DispatchError::UnknownAgent(agent_id));
                };
                (agent_id, Placement::Send(spec, sender))
            } else {
                let position =
                    state
                        .queue
                        .enqueue(&agent_id, request.job.clone(), request.priority)?;
                let mut record = JobRecord::new(request.job);
                record.agent_id = Some(agent_id.clone());
                state.jobs.insert(
                    job_id.clone(),
                    TrackedJob {
                        record,
                        masker: LogMasker::new(),
                    },
                );
                (agent_id, Placement::Queued(position))
            }
        };

        match placement {
            Placement::Send(spec, sender) => {
                self.deliver(&agent_id, spec, sender).await;
                Ok(SubmitOutcome::Dispatched { job_id, agent_id })
            }
            Placement::Queued(position) => {
                info!(job_id = %job_id, agent_id = %agent_id, position, "Job queued");
                self.broadcaster.broadcast_to_project(
                    &project_id,
                    Event::JobQueued {
                        project_id: project_id.clone(),
                        job_id: job_id.clone(),
                        agent_id: agent_id.clone(),
                        position,
                    },
                );
                Ok(SubmitOutcome::Queued {
                    job_id,
                    agent_id,
                    position,
                })
            }
        }
    }

    /// Submit a job and get a receiver for its final status. The receiver
    /// fires once the job leaves the coordinator's view, however it ends.
    pub async fn submit_watched(
        &self,
        request: SubmitRequest,
    ) -> Result<(SubmitOutcome, oneshot::Receiver<JobStatus>), DispatchError> {
        let job_id = request.job.job_id.clone();
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .await
            .waiters
            .entry(job_id.clone())
            .or_default()
            .push(tx);
        match self.submit(request).await {
            Ok(outcome) => Ok((outcome, rx)),
            Err(e) => {
                let mut state = self.state.lock().await;
                if !state.jobs.contains_key(&job_id) {
                    state.waiters.remove(&job_id);
                }
                Err(e)
            }
        }
    }

    /// Send queued jobs to `agent_id` while it has free slots.
    pub async fn drain(&self, agent_id: &str) {
        let _dispatch = self.dispatch_lock.lock().await;
        loop {
            let next = {
                let mut state = self.state.lock().await;
                if !self.is_accepting() || !state.registry.has_capacity(agent_id) {
                    break;
                }
                let Some(entry) = state.queue.dequeue_next(agent_id) else {
                    break;
                };
                state.reserve(agent_id, &entry.job.job_id)
            };
            if let Some((spec, sender)) = next {
                self.deliver(agent_id, spec, sender).await;
            }
        }
    }

    /// Resolve credentials and send the job. The slot must already be held.
    async fn deliver(&self, agent_id: &str, mut spec: JobSpec, sender: AgentSender) {
        let resolved = match &self.credentials {
            Some(resolver) => resolver.resolve(&spec.nodes, spec.environment.clone()).await,
            None => ResolvedEnvironment {
                environment: spec.environment.clone(),
                secrets: Vec::new(),
            },
        };
        spec.environment = resolved.environment.clone();
        let job_id = spec.job_id.clone();
        let project_id = spec.project_id.clone();

        {
            let mut state = self.state.lock().await;
            if let Some(tracked) = state.jobs.get_mut(&job_id) {
                resolved.register(&mut tracked.masker);
            }
        }

        let message = CoordinatorMessage::ExecuteJob(ExecuteJob {
            spec,
            mask_values: resolved.secrets,
        });

        if sender.send(message).is_err() {
            warn!(job_id = %job_id, agent_id, "Agent channel closed before dispatch");
            {
                let mut state = self.state.lock().await;
                state.release(&job_id);
                state.settle(&job_id, JobStatus::Failed);
            }
            self.broadcaster.broadcast_to_project(
                &project_id,
                Event::JobStatusChanged {
                    project_id: project_id.clone(),
                    job_id,
                    status: JobStatus::Failed,
                    message: Some("agent unavailable".into()),
                },
            );
            return;
        }

        info!(job_id = %job_id, agent_id, "Job dispatched");
        self.broadcaster.broadcast_to_project(
            &project_id,
            Event::JobStatusChanged {
                project_id: project_id.clone(),
                job_id,
                status: JobStatus::Dispatched,
                message: None,
            },
        );
    }

    /// Apply a message received from an agent.
    pub async fn handle_agent_message(&self, agent_id: &str, message: AgentMessage) {
        match message {
            AgentMessage::Authenticate { .. } | AgentMessage::Register { .. } => {
                warn!(agent_id, "Unexpected handshake message on an open session");
            }
            AgentMessage::Heartbeat {
                status,
                current_jobs,
            } => {
                let revived = {
                    let mut state = self.state.lock().await;
                    let was_offline = state
                        .registry
                        .get(agent_id)
                        .is_some_and(|a| a.status == AgentStatus::Offline);
                    state.registry.heartbeat(agent_id, status) && was_offline
                };
                debug!(agent_id, ?status, current_jobs, "Heartbeat");
                if revived {
                    info!(agent_id, "Agent back online");
                    self.drain(agent_id).await;
                }
            }
            AgentMessage::JobOutput { job_id, mut output } => {
                let project_id = {
                    let state = self.state.lock().await;
                    let Some(tracked) = owned_job(&state, agent_id, &job_id) else {
                        return;
                    };
                    output.message = tracked.masker.mask_line(&output.message);
                    tracked.record.spec.project_id.clone()
                };
                self.broadcaster.broadcast_to_project(
                    &project_id,
                    Event::JobOutput {
                        project_id: project_id.clone(),
                        job_id,
                        output,
                    },
                );
            }
            AgentMessage::JobFailure {
                job_id,
                error,
                is_retrying,
                current_attempt,
                max_attempts,
            } => {
                let (project_id, error) = {
                    let mut state = self.state.lock().await;
                    if owned_job(&state, agent_id, &job_id).is_none() {
                        return;
                    }
                    let Some(tracked) = state.jobs.get_mut(&job_id) else {
                        return;
                    };
                    tracked.record.attempt = current_attempt;
                    (
                        tracked.record.spec.project_id.clone(),
                        tracked.masker.mask_line(&error),
                    )
                };
                self.broadcaster.broadcast_to_project(
                    &project_id,
                    Event::JobFailure {
                        project_id: project_id.clone(),
                        job_id,
                        error,
                        is_retrying,
                        current_attempt,
                        max_attempts,
                    },
                );
            }
            AgentMessage::JobStatus {
                job_id,
                status,
                message,
            } => match status {
                JobStatusUpdate::Running => {
                    self.transition(agent_id, &job_id, JobStatus::Running, message)
                        .await;
                }
                JobStatusUpdate::Retrying => {
                    self.transition(agent_id, &job_id, JobStatus::Retrying, message)
                        .await;
                }
                JobStatusUpdate::Failed => {
                    self.finish(agent_id, &job_id, JobStatus::Failed, None, message)
                        .await;
                }
                JobStatusUpdate::Cancelled => {
                    self.finish(agent_id, &job_id, JobStatus::Cancelled, None, message)
                        .await;
                }
                JobStatusUpdate::TimedOut => {
                    self.finish(agent_id, &job_id, JobStatus::TimedOut, None, message)
                        .await;
                }
                JobStatusUpdate::Cancelling | JobStatusUpdate::CancelFailed => {
                    let note = match status {
                        JobStatusUpdate::Cancelling => "cancelling",
                        _ => "cancel failed",
                    };
                    let message = match message {
                        Some(m) => format!("{}: {}", note, m),
                        None => note.to_string(),
                    };
                    let current = {
                        let state = self.state.lock().await;
                        owned_job(&state, agent_id, &job_id).map(|t| t.record.status)
                    };
                    if let Some(current) = current {
                        self.transition(agent_id, &job_id, current, Some(message))
                            .await;
                    }
                }
            },
            AgentMessage::JobComplete {
                job_id,
                exit_code,
                output,
                duration_ms,
            } => {
                debug!(job_id = %job_id, duration_ms, bytes = output.len(), "Job complete");
                let status = if exit_code == 0 {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                self.finish(agent_id, &job_id, status, Some(exit_code), None)
                    .await;
            }
        }
    }

    async fn transition(
        &self,
        agent_id: &str,
        job_id: &str,
        status: JobStatus,
        message: Option<String>,
    ) {
        let (project_id, message) = {
            let mut state = self.state.lock().await;
            if owned_job(&state, agent_id, job_id).is_none() {
                return;
            }
            let Some(tracked) = state.jobs.get_mut(job_id) else {
                return;
            };
            tracked.record.status = status;
            if status == JobStatus::Running && tracked.record.started_at.is_none() {
                tracked.record.started_at = Some(Utc::now());
            }
            let message = message.map(|m| tracked.masker.mask_line(&m));
            (tracked.record.spec.project_id.clone(), message)
        };
        self.broadcaster.broadcast_to_project(
            &project_id,
            Event::JobStatusChanged {
                project_id: project_id.clone(),
                job_id: job_id.to_string(),
                status,
                message,
            },
        );
    }

    async fn finish(
        &self,
        agent_id: &str,
        job_id: &str,
        status: JobStatus,
        exit_code: Option<i32>,
        message: Option<String>,
    ) {
        let (record, message) = {
            let mut state = self.state.lock().await;
            if owned_job(&state, agent_id, job_id).is_none() {
                return;
            }
            let Some(mut tracked) = state.release(job_id) else {
                return;
            };
            tracked.record.status = status;
            tracked.record.exit_code = exit_code;
            tracked.record.finished_at = Some(Utc::now());
            let message = message.map(|m| tracked.masker.mask_line(&m));
            tracked.masker.clear();
            state.settle(job_id, status);
            (tracked.record, message)
        };

        info!(job_id, agent_id, status = %status, "Job finished");
        self.broadcaster.broadcast_to_project(
            &record.spec.project_id,
            Event::JobStatusChanged {
                project_id: record.spec.project_id.clone(),
                job_id: job_id.to_string(),
                status,
                message,
            },
        );
        self.drain(agent_id).await;
    }

    /// Cancel a job. Queued jobs are removed; running ones are asked to stop
    /// and finish when their agent reports back.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome, DispatchError> {
        let (outcome, project_id) = {
            let mut state = self.state.lock().await;
            let Some(tracked) = state.jobs.get(job_id) else {
                return Err(DispatchError::NotFound(job_id.to_string()));
            };
            let project_id = tracked.record.spec.project_id.clone();

            if let Some(agent_id) = state.queue.agent_for(job_id).map(str::to_string) {
                state.queue.remove_job(&agent_id, job_id);
                state.jobs.remove(job_id);
                state.settle(job_id, JobStatus::Cancelled);
                (
                    CancelOutcome::Removed {
                        job_id: job_id.to_string(),
                    },
                    project_id,
                )
            } else {
                let Some(agent_id) = tracked.record.agent_id.clone() else {
                    return Err(DispatchError::NotFound(job_id.to_string()));
                };
                if !state.registry.send(
                    &agent_id,
                    CoordinatorMessage::CancelJob {
                        job_id: job_id.to_string(),
                    },
                ) {
                    return Err(DispatchError::UnknownAgent(agent_id));
                }
                (
                    CancelOutcome::Requested {
                        job_id: job_id.to_string(),
                        agent_id,
                    },
                    project_id,
                )
            }
        };

        match &outcome {
            CancelOutcome::Removed { .. } => {
                info!(job_id, "Queued job cancelled");
                self.broadcaster.broadcast_to_project(
                    &project_id,
                    Event::JobStatusChanged {
                        project_id: project_id.clone(),
                        job_id: job_id.to_string(),
                        status: JobStatus::Cancelled,
                        message: Some("removed from queue".into()),
                    },
                );
            }
            CancelOutcome::Requested { agent_id, .. } => {
                info!(job_id, agent_id = %agent_id, "Cancellation requested");
            }
        }
        Ok(outcome)
    }

    pub async fn set_agent_capacity(&self, agent_id: &str, max: u32) -> Result<(), DispatchError> {
        let found = self
            .state
            .lock()
            .await
            .registry
            .set_max_concurrent_jobs(agent_id, max);
        if !found {
            return Err(DispatchError::UnknownAgent(agent_id.to_string()));
        }
        self.drain(agent_id).await;
        Ok(())
    }

    pub async fn running_job_count(&self) -> usize {
        self.state.lock().await.registry.running_jobs()
    }

    /// Ask every agent to cancel every job it is running.
    pub async fn cancel_all_running(&self) -> usize {
        let state = self.state.lock().await;
        let mut requested = 0;
        for agent in state.registry.list() {
            for job_id in agent.current_jobs {
                if state
                    .registry
                    .send(&agent.agent_id, CoordinatorMessage::CancelJob { job_id })
                {
                    requested += 1;
                }
            }
        }
        requested
    }

    /// Leave running jobs alone but report them as retriable.
    pub async fn pause_running(&self, reason: &str) -> usize {
        let paused: Vec<(String, String)> = {
            let mut state = self.state.lock().await;
            state
                .jobs
                .values_mut()
                .filter(|t| matches!(t.record.status, JobStatus::Dispatched | JobStatus::Running))
                .map(|t| {
                    t.record.status = JobStatus::Retrying;
                    (t.record.spec.project_id.clone(), t.record.spec.job_id.clone())
                })
                .collect()
        };
        for (project_id, job_id) in &paused {
            self.broadcaster.broadcast_to_project(
                project_id,
                Event::JobStatusChanged {
                    project_id: project_id.clone(),
                    job_id: job_id.clone(),
                    status: JobStatus::Retrying,
                    message: Some(reason.to_string()),
                },
            );
        }
        paused.len()
    }

    /// Tell agents and clients the coordinator is going away.
    pub async fn broadcast_shutdown(&self, reason: &str) -> usize {
        let notified = self
            .state
            .lock()
            .await
            .registry
            .broadcast(&CoordinatorMessage::Shutdown {
                reason: reason.to_string(),
            });
        self.broadcaster.broadcast_to_clients(Event::ServerShutdown {
            reason: reason.to_string(),
        });
        notified
    }

    /// Send a final notice and drop every agent channel.
    pub async fn close_all(&self, reason: &str) -> usize {
        let mut state = self.state.lock().await;
        let notice = CoordinatorMessage::Shutdown {
            reason: reason.to_string(),
        };
        state.registry.broadcast(&notice);
        let ids = state.registry.ids();
        for id in &ids {
            state.registry.unregister(id);
        }
        ids.len()
    }

    /// Mark agents that missed their heartbeats offline.
    pub async fn sweep_stale(&self, timeout: chrono::Duration) -> Vec<String> {
        let stale = self.state.lock().await.registry.mark_stale(timeout);
        for agent_id in &stale {
            warn!(agent_id = %agent_id, "Agent missed heartbeats, marked offline");
        }
        stale
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.state.lock().await.queue.stats()
    }

    pub async fn agents(&self) -> Vec<AgentSummary> {
        self.state.lock().await.registry.list()
    }

    pub async fn job(&self, job_id: &str) -> Option<JobRecord> {
        self.state
            .lock()
            .await
            .jobs
            .get(job_id)
            .map(|t| t.record.clone())
    }
}

/// A tracked job that `agent_id` is allowed to report on.
fn owned_job<'a>(state: &'a DispatchState, agent_id: &str, job_id: &str) -> Option<&'a TrackedJob> {
    let tracked = state.jobs.get(job_id)?;
    if tracked.record.agent_id.as_deref() != Some(agent_id) {
        warn!(job_id, agent_id, "Ignoring report for a job the agent does not own");
        return None;
    }
    Some(tracked)
}
