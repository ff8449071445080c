//! Job model shared by the coordinator and the agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::workflow::Node;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Dispatched,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Dispatched => "dispatched",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue priority. `High` entries always dispatch before `Normal` ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// Retry policy for ordinary command failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub retry_enabled: bool,
    #[serde(default)]
    pub max_retries: u32,
    /// Delay between attempts in seconds. Negative values are treated as zero.
    #[serde(default)]
    pub retry_delay_seconds: i64,
}

impl RetryPolicy {
    /// Total number of attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        if self.retry_enabled {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds.max(0) as u64)
    }
}

/// A git checkout step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCheckout {
    /// Repository URL to clone.
    pub url: String,
    /// Branch to clone.
    #[serde(default)]
    pub branch: Option<String>,
    /// Commit to check out after cloning.
    #[serde(default)]
    pub sha: Option<String>,
    /// Directory to clone into, relative to the job's working directory.
    #[serde(default = "default_checkout_dir")]
    pub target_dir: String,
    /// Clone with `--depth 1`.
    #[serde(default)]
    pub shallow: bool,
    /// Remove the target directory before cloning.
    #[serde(default)]
    pub clean: bool,
}

fn default_checkout_dir() -> String {
    "source".to_string()
}

/// Package managers the dependency step knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
    Pip,
    Cargo,
    Go,
    Bundler,
    Composer,
}

/// A dependency installation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyInstall {
    pub manager: PackageManager,
    /// Directory containing the manifest, relative to the working directory.
    #[serde(default)]
    pub directory: Option<String>,
    /// Install exactly what the lockfile says.
    #[serde(default)]
    pub frozen_lockfile: bool,
    /// Requirements file for pip.
    #[serde(default)]
    pub requirements_file: Option<String>,
}

/// What a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Commands joined and run by a shell.
    Commands { commands: Vec<String> },
    /// A script body run by an interpreter (or a shell).
    Script { body: String },
    /// A structured git checkout.
    Checkout(GitCheckout),
    /// A structured dependency installation.
    Dependencies(DependencyInstall),
}

impl JobPayload {
    pub fn is_structured(&self) -> bool {
        matches!(self, JobPayload::Checkout(_) | JobPayload::Dependencies(_))
    }
}

/// Everything needed to run a job on an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: String,
    pub project_id: String,
    pub build_number: u64,
    pub payload: JobPayload,
    /// Requested runtime name; `None` means the host's native shell.
    /// Parsed into an `ExecutorKind` by the resolver so unknown names are
    /// reported as a configuration failure instead of a decode error.
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    /// Timeout in seconds; zero or absent disables it.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(flatten)]
    pub retry: RetryPolicy,
    /// Workflow nodes this job was built from, used for credential bindings.
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl JobSpec {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Coordinator-side record of a job and where it is.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub spec: JobSpec,
    pub agent_id: Option<String>,
    pub status: JobStatus,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl JobRecord {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            spec,
            agent_id: None,
            status: JobStatus::Queued,
            attempt: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_attempts() {
        let disabled = RetryPolicy {
            retry_enabled: false,
            max_retries: 5,
            retry_delay_seconds: 1,
        };
        assert_eq!(disabled.max_attempts(), 1);

        let enabled = RetryPolicy {
            retry_enabled: true,
            max_retries: 2,
            retry_delay_seconds: 1,
        };
        assert_eq!(enabled.max_attempts(), 3);
    }

    #[test]
    fn test_negative_delay_is_zero() {
        let policy = RetryPolicy {
            retry_enabled: true,
            max_retries: 1,
            retry_delay_seconds: -10,
        };
        assert_eq!(policy.delay(), Duration::ZERO);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::TimedOut.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }

    #[test]
    fn test_zero_timeout_disabled() {
        let spec = JobSpec {
            job_id: "j".into(),
            project_id: "p".into(),
            build_number: 1,
            payload: JobPayload::Commands {
                commands: vec!["true".into()],
            },
            executor: None,
            environment: HashMap::new(),
            working_directory: None,
            timeout_seconds: Some(0),
            retry: RetryPolicy::default(),
            nodes: vec![],
        };
        assert!(spec.timeout().is_none());
    }

    #[test]
    fn test_payload_wire_format() {
        let payload: JobPayload = serde_json::from_str(
            r#"{"kind":"checkout","url":"https://example.com/r.git","shallow":true}"#,
        )
        .unwrap();
        match payload {
            JobPayload::Checkout(checkout) => {
                assert!(checkout.shallow);
                assert_eq!(checkout.target_dir, "source");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
