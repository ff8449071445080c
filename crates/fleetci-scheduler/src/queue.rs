//! Per-agent job queue.
//!
//! Jobs wait here while their agent is at capacity. Within one agent's queue
//! every `High` entry precedes every `Normal` entry and each class is FIFO.
//! The queue only stores; dispatch decisions live in the dispatcher.

use chrono::{DateTime, Utc};
use fleetci_core::job::{JobSpec, Priority};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("agent id must not be empty")]
    EmptyAgentId,

    #[error("job id must not be empty")]
    EmptyJobId,

    #[error("job {0} is already queued")]
    Duplicate(String),
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub job: JobSpec,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueCounters {
    pub enqueued: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub removed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentQueueDepth {
    pub agent_id: String,
    pub high: usize,
    pub normal: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub agents: Vec<AgentQueueDepth>,
    pub total: usize,
    #[serde(flatten)]
    pub counters: QueueCounters,
    /// Mean time between enqueue and dequeue, over every dequeued entry.
    pub average_wait_ms: u64,
}

#[derive(Debug, Default)]
pub struct JobQueue {
    queues: HashMap<String, VecDeque<QueueEntry>>,
    counters: QueueCounters,
    total_wait_ms: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job for an agent. Returns its zero-based position.
    pub fn enqueue(
        &mut self,
        agent_id: &str,
        job: JobSpec,
        priority: Priority,
    ) -> Result<usize, QueueError> {
        if agent_id.is_empty() {
            return Err(QueueError::EmptyAgentId);
        }
        if job.job_id.is_empty() {
            return Err(QueueError::EmptyJobId);
        }

        let queue = self.queues.entry(agent_id.to_string()).or_default();
        if queue.iter().any(|e| e.job.job_id == job.job_id) {
            return Err(QueueError::Duplicate(job.job_id));
        }

        let position = match priority {
            Priority::High => queue
                .iter()
                .position(|e| e.priority == Priority::Normal)
                .unwrap_or(queue.len()),
            Priority::Normal => queue.len(),
        };

        debug!(agent_id, job_id = %job.job_id, ?priority, position, "Job queued");
        queue.insert(
            position,
            QueueEntry {
                job,
                priority,
                enqueued_at: Utc::now(),
            },
        );
        self.counters.enqueued += 1;
        Ok(position)
    }

    /// Pop the head of an agent's queue.
    pub fn dequeue_next(&mut self, agent_id: &str) -> Option<QueueEntry> {
        let queue = self.queues.get_mut(agent_id)?;
        let entry = queue.pop_front()?;
        if queue.is_empty() {
            self.queues.remove(agent_id);
        }

        let waited = (Utc::now() - entry.enqueued_at).num_milliseconds().max(0) as u64;
        self.total_wait_ms += waited;
        self.counters.dispatched += 1;
        debug!(agent_id, job_id = %entry.job.job_id, waited_ms = waited, "Job dequeued");
        Some(entry)
    }

    /// Remove a still-queued job. Returns whether it was there.
    pub fn remove_job(&mut self, agent_id: &str, job_id: &str) -> bool {
        let Some(queue) = self.queues.get_mut(agent_id) else {
            return false;
        };
        let Some(index) = queue.iter().position(|e| e.job.job_id == job_id) else {
            return false;
        };
        queue.remove(index);
        if queue.is_empty() {
            self.queues.remove(agent_id);
        }
        self.counters.removed += 1;
        true
    }

    /// Drop every job queued for an agent. Returns the dropped entries.
    pub fn clear_queue(&mut self, agent_id: &str) -> Vec<QueueEntry> {
        let dropped: Vec<QueueEntry> = self
            .queues
            .remove(agent_id)
            .map(Vec::from)
            .unwrap_or_default();
        self.counters.dropped += dropped.len() as u64;
        dropped
    }

    /// Which agent a queued job is waiting for.
    pub fn agent_for(&self, job_id: &str) -> Option<&str> {
        self.queues
            .iter()
            .find(|(_, q)| q.iter().any(|e| e.job.job_id == job_id))
            .map(|(agent, _)| agent.as_str())
    }

    pub fn len(&self, agent_id: &str) -> usize {
        self.queues.get(agent_id).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, agent_id: &str) -> bool {
        self.len(agent_id) == 0
    }

    pub fn total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn stats(&self) -> QueueStats {
        let mut agents: Vec<AgentQueueDepth> = self
            .queues
            .iter()
            .map(|(agent_id, q)| {
                let high = q.iter().filter(|e| e.priority == Priority::High).count();
                AgentQueueDepth {
                    agent_id: agent_id.clone(),
                    high,
                    normal: q.len() - high,
                }
            })
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let average_wait_ms = self
            .total_wait_ms
            .checked_div(self.counters.dispatched)
            .unwrap_or(0);

        QueueStats {
            agents,
            total: self.total(),
            counters: self.counters,
            average_wait_ms,
        }
    }
}
