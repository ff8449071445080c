//! Messages exchanged between the coordinator and its agents.
//!
//! Every frame is a JSON object tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executor::Platform;
use crate::job::JobSpec;

/// Static facts an agent reports when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub hostname: String,
    pub platform: Platform,
    pub capabilities: Vec<String>,
    pub max_concurrent_jobs: u32,
    pub version: String,
}

/// Health reported in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Busy,
    Offline,
}

/// Which stream an output record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Stdout,
    Stderr,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLevel {
    Info,
    Warn,
    Error,
}

/// One line of job output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    #[serde(rename = "type")]
    pub output_type: OutputType,
    pub level: OutputLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Strictly increasing per agent, even for lines within one millisecond.
    pub nanotime: u64,
    pub source: String,
}

/// Non-terminal and terminal job states an agent reports out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatusUpdate {
    Running,
    Retrying,
    Failed,
    Cancelled,
    TimedOut,
    Cancelling,
    CancelFailed,
}

/// An instruction to run a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteJob {
    #[serde(flatten)]
    pub spec: JobSpec,
    /// Literal values that must be redacted from every output line.
    #[serde(default)]
    pub mask_values: Vec<String>,
}

/// Agent → coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Authenticate {
        token: String,
    },
    Register {
        agent_info: AgentInfo,
    },
    Heartbeat {
        status: AgentStatus,
        current_jobs: u32,
    },
    JobOutput {
        job_id: String,
        output: OutputRecord,
    },
    JobComplete {
        job_id: String,
        exit_code: i32,
        output: String,
        duration_ms: u64,
    },
    JobFailure {
        job_id: String,
        error: String,
        is_retrying: bool,
        current_attempt: u32,
        max_attempts: u32,
    },
    JobStatus {
        job_id: String,
        status: JobStatusUpdate,
        #[serde(default)]
        message: Option<String>,
    },
}

/// Coordinator → agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    Welcome { version: String },
    Authenticated { agent_id: String },
    AuthFailed { reason: String },
    Registered,
    ExecuteJob(ExecuteJob),
    CancelJob { job_id: String },
    Shutdown { reason: String },
    Error { message: String },
}

/// Heartbeat cadence agents are expected to keep.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobPayload, RetryPolicy};
    use std::collections::HashMap;

    #[test]
    fn test_agent_message_tags() {
        let msg = AgentMessage::Heartbeat {
            status: AgentStatus::Busy,
            current_jobs: 2,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["status"], "busy");
    }

    #[test]
    fn test_execute_job_is_flat() {
        let msg = CoordinatorMessage::ExecuteJob(ExecuteJob {
            spec: JobSpec {
                job_id: "job-1".into(),
                project_id: "proj".into(),
                build_number: 7,
                payload: JobPayload::Commands {
                    commands: vec!["make".into()],
                },
                executor: Some("bash".into()),
                environment: HashMap::new(),
                working_directory: None,
                timeout_seconds: Some(60),
                retry: RetryPolicy {
                    retry_enabled: true,
                    max_retries: 2,
                    retry_delay_seconds: 5,
                },
                nodes: vec![],
            },
            mask_values: vec![],
        });

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "execute_job");
        assert_eq!(json["job_id"], "job-1");
        assert_eq!(json["max_retries"], 2);

        let back: CoordinatorMessage = serde_json::from_value(json).unwrap();
        match back {
            CoordinatorMessage::ExecuteJob(job) => assert_eq!(job.spec.build_number, 7),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_status_update_names() {
        let msg = AgentMessage::JobStatus {
            job_id: "j".into(),
            status: JobStatusUpdate::CancelFailed,
            message: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["status"], "cancel_failed");
    }
}
