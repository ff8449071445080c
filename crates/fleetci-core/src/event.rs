//! Events broadcast to dashboard clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobStatus;
use crate::protocol::OutputRecord;

/// Something clients may want to know about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    CronTriggerFired {
        project_id: String,
        cron_job_id: String,
        cron_node_id: String,
        fired_at: DateTime<Utc>,
    },
    CronNoConnectedNodes {
        project_id: String,
        cron_job_id: String,
        cron_node_id: String,
    },
    JobQueued {
        project_id: String,
        job_id: String,
        agent_id: String,
        position: usize,
    },
    JobStatusChanged {
        project_id: String,
        job_id: String,
        status: JobStatus,
        #[serde(default)]
        message: Option<String>,
    },
    JobOutput {
        project_id: String,
        job_id: String,
        output: OutputRecord,
    },
    JobFailure {
        project_id: String,
        job_id: String,
        error: String,
        is_retrying: bool,
        current_attempt: u32,
        max_attempts: u32,
    },
    AgentConnected {
        agent_id: String,
        name: String,
    },
    AgentDisconnected {
        agent_id: String,
        dropped_jobs: usize,
    },
    ServerShutdown {
        reason: String,
    },
}

impl Event {
    /// Project the event belongs to, if any.
    pub fn project_id(&self) -> Option<&str> {
        match self {
            Event::CronTriggerFired { project_id, .. }
            | Event::CronNoConnectedNodes { project_id, .. }
            | Event::JobQueued { project_id, .. }
            | Event::JobStatusChanged { project_id, .. }
            | Event::JobOutput { project_id, .. }
            | Event::JobFailure { project_id, .. } => Some(project_id),
            Event::AgentConnected { .. }
            | Event::AgentDisconnected { .. }
            | Event::ServerShutdown { .. } => None,
        }
    }
}

/// Fan-out of events to connected clients.
pub trait Broadcaster: Send + Sync {
    fn broadcast_to_project(&self, project_id: &str, event: Event);

    fn broadcast_to_clients(&self, event: Event);
}
