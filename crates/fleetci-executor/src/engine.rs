//! The agent-side execution engine.
//!
//! One engine runs every job an agent is given. For each job it acknowledges
//! the dispatch, resolves an executor, runs attempts sequentially under the
//! retry policy and reports output and state changes upstream as
//! [`AgentMessage`]s.

use fleetci_core::executor::{self, Platform};
use fleetci_core::job::{JobPayload, JobSpec, JobStatus};
use fleetci_core::protocol::{
    AgentMessage, ExecuteJob, JobStatusUpdate, OutputLevel, OutputType,
};
use fleetci_credentials::LogMasker;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command;
use crate::error::ExecutorError;
use crate::output::NanoClock;
use crate::process::{self, KILL_GRACE, ProcessOptions, ProcessOutcome};

/// Static settings for an engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root under which job working directories are created.
    pub work_dir: PathBuf,
    pub platform: Platform,
    /// Capability tags the host advertises.
    pub capabilities: Vec<String>,
    pub kill_grace: Duration,
    /// Jobs beyond this many are refused. `None` means no limit.
    pub max_jobs: Option<usize>,
}

impl EngineConfig {
    pub fn new(work_dir: impl Into<PathBuf>, capabilities: Vec<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            platform: Platform::current(),
            capabilities,
            kill_grace: KILL_GRACE,
            max_jobs: None,
        }
    }
}

/// How a job ended, as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Accepted, no process started yet.
    Preparing,
    /// A process for some attempt has been started.
    Started,
}

struct ActiveJob {
    cancel: CancellationToken,
    phase: Phase,
}

struct Inner {
    config: EngineConfig,
    clock: NanoClock,
    jobs: Mutex<HashMap<String, ActiveJob>>,
    events: mpsc::UnboundedSender<AgentMessage>,
}

/// Runs jobs and reports on them. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<Inner>,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig, events: mpsc::UnboundedSender<AgentMessage>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                clock: NanoClock::new(),
                jobs: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Number of jobs currently accepted and not yet finished.
    pub fn running_jobs(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.jobs().contains_key(job_id)
    }

    /// Run a job in the background.
    pub fn spawn(&self, job: ExecuteJob) -> tokio::task::JoinHandle<JobOutcome> {
        let engine = self.clone();
        tokio::spawn(async move { engine.execute(job).await })
    }

    /// Cancel a running job. Returns whether a cancellation was started.
    ///
    /// Reports `cancelling` when the job has a process to stop, and
    /// `cancel_failed` when the job is unknown or has not started one yet.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let token = {
            let jobs = self.jobs();
            match jobs.get(job_id) {
                Some(job) if job.phase == Phase::Started => Some(job.cancel.clone()),
                Some(_) => None,
                None => None,
            }
        };

        match token {
            Some(token) => {
                info!(job_id, "Cancelling job");
                self.status(job_id, JobStatusUpdate::Cancelling, None);
                token.cancel();
                true
            }
            None => {
                warn!(job_id, "Cancel requested for a job with no running process");
                self.status(
                    job_id,
                    JobStatusUpdate::CancelFailed,
                    Some("job has no running process".to_string()),
                );
                false
            }
        }
    }

    /// Cancel every job. Used when the agent shuts down.
    pub fn cancel_all(&self) -> usize {
        let jobs = self.jobs();
        for job in jobs.values() {
            job.cancel.cancel();
        }
        jobs.len()
    }

    /// Run a job to completion.
    pub async fn execute(&self, job: ExecuteJob) -> JobOutcome {
        let ExecuteJob { spec, mask_values } = job;
        let job_id = spec.job_id.clone();

        let cancel = CancellationToken::new();
        {
            let mut jobs = self.jobs();
            if jobs.contains_key(&job_id) {
                warn!(job_id = %job_id, "Job is already running on this agent");
                self.status(
                    &job_id,
                    JobStatusUpdate::Failed,
                    Some("job is already running on this agent".to_string()),
                );
                return failed(None, 0);
            }
            if let Some(max) = self.inner.config.max_jobs.filter(|max| jobs.len() >= *max) {
                warn!(job_id = %job_id, max, "Job refused, agent is at capacity");
                self.status(
                    &job_id,
                    JobStatusUpdate::Failed,
                    Some(format!("agent is at capacity ({} jobs)", max)),
                );
                return failed(None, 0);
            }
            jobs.insert(
                job_id.clone(),
                ActiveJob {
                    cancel: cancel.clone(),
                    phase: Phase::Preparing,
                },
            );
        }
        let _registration = Registration {
            engine: self,
            job_id: &job_id,
        };

        self.status(&job_id, JobStatusUpdate::Running, None);
        info!(job_id = %job_id, project_id = %spec.project_id, build = spec.build_number, "Job started");

        let mut masker = LogMasker::with_values(mask_values);
        let outcome = self.run_attempts(&spec, &masker, &cancel).await;
        masker.clear();

        info!(
            job_id = %job_id,
            status = %outcome.status,
            attempts = outcome.attempts,
            "Job finished"
        );
        outcome
    }

    async fn run_attempts(
        &self,
        spec: &JobSpec,
        masker: &LogMasker,
        cancel: &CancellationToken,
    ) -> JobOutcome {
        let job_id = spec.job_id.as_str();
        let config = &self.inner.config;
        let started = Instant::now();
        let max_attempts = spec.retry.max_attempts();

        let resolved = match executor::resolve(
            requested_executor(spec),
            config.platform,
            &config.capabilities,
        ) {
            Ok(resolved) => resolved,
            Err(e) => return self.configuration_failure(job_id, masker, &ExecutorError::from(e)),
        };

        let work_dir = match job_work_dir(&config.work_dir, spec) {
            Ok(dir) => dir,
            Err(e) => return self.configuration_failure(job_id, masker, &e),
        };
        if let Err(e) = tokio::fs::create_dir_all(&work_dir).await {
            error!(job_id, path = %work_dir.display(), error = %e, "Cannot create working directory");
            self.status(
                job_id,
                JobStatusUpdate::Failed,
                Some(masker.mask_line(&format!("cannot create working directory: {}", e))),
            );
            return failed(None, 0);
        }
        let environment = job_environment(spec);

        let mut attempt = 0;
        loop {
            attempt += 1;
            // Only the attempt that completes is returned in `job_complete`.
            let mut output = String::new();

            if cancel.is_cancelled() {
                return self.cancelled(job_id, attempt - 1);
            }

            let result = match command::prepare(
                &spec.payload,
                &resolved,
                config.platform,
                &work_dir,
                job_id,
                attempt,
            )
            .await
            {
                Ok(invocation) => {
                    let outcome = process::run_supervised(
                        &invocation,
                        ProcessOptions {
                            working_dir: &work_dir,
                            environment: &environment,
                            timeout: spec.timeout(),
                            kill_grace: config.kill_grace,
                        },
                        cancel,
                        |_| self.mark_started(job_id),
                        |kind, line| {
                            let message = masker.mask_line(&line);
                            output.push_str(&message);
                            output.push('\n');
                            let level = match kind {
                                OutputType::Stderr => OutputLevel::Warn,
                                _ => OutputLevel::Info,
                            };
                            self.output(job_id, kind, level, message);
                        },
                    )
                    .await;
                    drop(invocation);
                    outcome
                }
                Err(e) if e.is_configuration() => {
                    return self.configuration_failure(job_id, masker, &e);
                }
                Err(e) => Err(e),
            };

            let error = match result {
                Ok(ProcessOutcome::Exited(0)) => {
                    self.emit(AgentMessage::JobComplete {
                        job_id: job_id.to_string(),
                        exit_code: 0,
                        output,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    return JobOutcome {
                        status: JobStatus::Completed,
                        exit_code: Some(0),
                        attempts: attempt,
                    };
                }
                Ok(ProcessOutcome::TimedOut) => {
                    let secs = spec.timeout_seconds.unwrap_or_default();
                    self.status(
                        job_id,
                        JobStatusUpdate::TimedOut,
                        Some(format!("job timed out after {}s", secs)),
                    );
                    return JobOutcome {
                        status: JobStatus::TimedOut,
                        exit_code: Some(process::SIGNALLED_EXIT_CODE),
                        attempts: attempt,
                    };
                }
                Ok(ProcessOutcome::Cancelled) | Ok(ProcessOutcome::Signalled) => {
                    return self.cancelled(job_id, attempt);
                }
                Ok(ProcessOutcome::Exited(code)) => format!("process exited with code {}", code),
                Err(e) => masker.mask_line(&e.to_string()),
            };

            let is_retrying = attempt < max_attempts;
            warn!(job_id, attempt, max_attempts, error = %error, "Attempt failed");
            self.emit(AgentMessage::JobFailure {
                job_id: job_id.to_string(),
                error: error.clone(),
                is_retrying,
                current_attempt: attempt,
                max_attempts,
            });

            if !is_retrying {
                let message = if max_attempts > 1 {
                    format!("job failed after {} attempts: {}", attempt, error)
                } else {
                    format!("job failed: {}", error)
                };
                self.status(job_id, JobStatusUpdate::Failed, Some(message));
                return failed(exit_code_of(&error), attempt);
            }

            let delay = spec.retry.delay();
            self.status(
                job_id,
                JobStatusUpdate::Retrying,
                Some(format!(
                    "retrying in {}s (attempt {} of {})",
                    delay.as_secs(),
                    attempt + 1,
                    max_attempts
                )),
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return self.cancelled(job_id, attempt),
            }
        }
    }

    fn configuration_failure(
        &self,
        job_id: &str,
        masker: &LogMasker,
        error: &ExecutorError,
    ) -> JobOutcome {
        let message = masker.mask_line(&error.to_string());
        error!(job_id, error = %message, "Job configuration error");
        self.output(
            job_id,
            OutputType::System,
            OutputLevel::Error,
            message.clone(),
        );
        self.status(job_id, JobStatusUpdate::Failed, Some(message));
        failed(None, 0)
    }

    fn cancelled(&self, job_id: &str, attempts: u32) -> JobOutcome {
        self.status(
            job_id,
            JobStatusUpdate::Cancelled,
            Some(format!(
                "job cancelled (exit code {})",
                process::SIGNALLED_EXIT_CODE
            )),
        );
        JobOutcome {
            status: JobStatus::Cancelled,
            exit_code: Some(process::SIGNALLED_EXIT_CODE),
            attempts,
        }
    }

    fn mark_started(&self, job_id: &str) {
        if let Some(job) = self.jobs().get_mut(job_id) {
            job.phase = Phase::Started;
        }
    }

    fn output(&self, job_id: &str, kind: OutputType, level: OutputLevel, message: String) {
        let record = self.inner.clock.record(kind, level, message, job_id);
        self.emit(AgentMessage::JobOutput {
            job_id: job_id.to_string(),
            output: record,
        });
    }

    fn status(&self, job_id: &str, status: JobStatusUpdate, message: Option<String>) {
        self.emit(AgentMessage::JobStatus {
            job_id: job_id.to_string(),
            status,
            message,
        });
    }

    fn emit(&self, message: AgentMessage) {
        if self.inner.events.send(message).is_err() {
            debug!("Engine event receiver dropped");
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, ActiveJob>> {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes a job from the active set however its run ends.
struct Registration<'a> {
    engine: &'a ExecutionEngine,
    job_id: &'a str,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.engine.jobs().remove(self.job_id);
    }
}

fn failed(exit_code: Option<i32>, attempts: u32) -> JobOutcome {
    JobOutcome {
        status: JobStatus::Failed,
        exit_code,
        attempts,
    }
}

fn exit_code_of(error: &str) -> Option<i32> {
    error
        .strip_prefix("process exited with code ")
        .and_then(|code| code.parse().ok())
}

fn requested_executor(spec: &JobSpec) -> Option<&str> {
    match (&spec.executor, &spec.payload) {
        (Some(name), _) => Some(name.as_str()),
        (None, JobPayload::Checkout(_)) => Some("git"),
        (None, JobPayload::Dependencies(_)) => Some("dependency"),
        (None, _) => None,
    }
}

/// The job's directory under `root`. Absolute paths and `..` are refused so a
/// job cannot leave the work root.
fn job_work_dir(root: &Path, spec: &JobSpec) -> Result<PathBuf, ExecutorError> {
    let relative = spec
        .working_directory
        .as_deref()
        .filter(|d| !d.is_empty())
        .unwrap_or(&spec.project_id);
    let path = Path::new(relative);
    let contained = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !contained {
        return Err(ExecutorError::WorkingDirectory(relative.to_string()));
    }
    Ok(root.join(path))
}

fn job_environment(spec: &JobSpec) -> HashMap<String, String> {
    let mut env = spec.environment.clone();
    env.insert("CI".to_string(), "true".to_string());
    env.insert("FLEETCI".to_string(), "true".to_string());
    env.insert("FLEETCI_JOB_ID".to_string(), spec.job_id.clone());
    env.insert(
        "FLEETCI_BUILD_NUMBER".to_string(),
        spec.build_number.to_string(),
    );
    env
}
