//! Supervision of a single job process.
//!
//! A supervised process runs until it exits, its deadline passes or its
//! cancellation token fires. Timeout and cancellation both escalate from
//! SIGTERM to SIGKILL after a grace window.

use fleetci_core::protocol::OutputType;
use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::command::Invocation;
use crate::error::{ExecutorError, ExecutorResult};

/// Default time between SIGTERM and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Exit code reported for processes that did not exit on their own.
pub const SIGNALLED_EXIT_CODE: i32 = -1;

/// How long to keep reading buffered output after the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Exited on its own with this code.
    Exited(i32),
    /// Killed by a signal nobody here sent.
    Signalled,
    /// Stopped because the cancellation token fired.
    Cancelled,
    /// Stopped because the deadline passed.
    TimedOut,
}

impl ProcessOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            ProcessOutcome::Exited(code) => *code,
            _ => SIGNALLED_EXIT_CODE,
        }
    }
}

/// Everything about the process except what to run.
pub struct ProcessOptions<'a> {
    pub working_dir: &'a Path,
    pub environment: &'a HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub kill_grace: Duration,
}

enum Stop {
    Cancelled,
    TimedOut,
}

/// Spawn `invocation` and supervise it to completion.
///
/// `on_spawn` runs once the child exists; `on_line` receives every output
/// line in the order it was read.
pub async fn run_supervised<S, L>(
    invocation: &Invocation,
    options: ProcessOptions<'_>,
    cancel: &CancellationToken,
    on_spawn: S,
    mut on_line: L,
) -> ExecutorResult<ProcessOutcome>
where
    S: FnOnce(Option<u32>),
    L: FnMut(OutputType, String),
{
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .current_dir(options.working_dir)
        .envs(options.environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|e| ExecutorError::Spawn(format!("{}: {}", invocation.program, e)))?;
    let pid = child.id();
    debug!(program = %invocation.program, pid = ?pid, "Process started");
    on_spawn(pid);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecutorError::Spawn("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecutorError::Spawn("stderr not captured".to_string()))?;
    let mut stdout = BufReader::new(stdout).lines();
    let mut stderr = BufReader::new(stderr).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;

    let deadline = options.timeout.map(|t| Instant::now() + t);
    let expiry = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expiry);

    let ended: Result<ExitStatus, Stop> = loop {
        tokio::select! {
            line = stdout.next_line(), if stdout_open => match line {
                Ok(Some(line)) => on_line(OutputType::Stdout, line),
                _ => stdout_open = false,
            },
            line = stderr.next_line(), if stderr_open => match line {
                Ok(Some(line)) => on_line(OutputType::Stderr, line),
                _ => stderr_open = false,
            },
            status = child.wait() => break Ok(status?),
            _ = cancel.cancelled() => break Err(Stop::Cancelled),
            _ = &mut expiry => break Err(Stop::TimedOut),
        }
    };

    let outcome = match ended {
        Ok(status) => classify(status),
        Err(stop) => {
            terminate(&mut child, pid, options.kill_grace).await;
            match stop {
                Stop::Cancelled => ProcessOutcome::Cancelled,
                Stop::TimedOut => ProcessOutcome::TimedOut,
            }
        }
    };

    // Pick up whatever was still buffered in the pipes.
    let drain = async {
        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => on_line(OutputType::Stdout, line),
                    _ => stdout_open = false,
                },
                line = stderr.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => on_line(OutputType::Stderr, line),
                    _ => stderr_open = false,
                },
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        debug!(pid = ?pid, "Output pipes still open after exit, giving up on drain");
    }

    Ok(outcome)
}

fn classify(status: ExitStatus) -> ProcessOutcome {
    match status.code() {
        Some(code) => ProcessOutcome::Exited(code),
        None => ProcessOutcome::Signalled,
    }
}

/// SIGTERM the process group, then SIGKILL once the grace window is over.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed");
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!(pid, error = %e, "SIGKILL failed");
        }
    }

    #[cfg(not(unix))]
    let _ = (pid, grace);

    if let Err(e) = child.kill().await {
        debug!(error = %e, "Kill after termination failed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Invocation {
        Invocation {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            script: None,
        }
    }

    async fn run(
        script: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> (ProcessOutcome, Vec<(OutputType, String)>) {
        let dir = tempfile::tempdir().unwrap();
        let env = HashMap::from([("GREETING".to_string(), "hello".to_string())]);
        let mut lines = Vec::new();
        let outcome = run_supervised(
            &sh(script),
            ProcessOptions {
                working_dir: dir.path(),
                environment: &env,
                timeout,
                kill_grace: Duration::from_millis(500),
            },
            cancel,
            |_| {},
            |kind, line| lines.push((kind, line)),
        )
        .await
        .unwrap();
        (outcome, lines)
    }

    #[tokio::test]
    async fn test_captures_lines_in_order() {
        let (outcome, lines) = run(
            "echo one; echo $GREETING; echo oops >&2; echo two",
            None,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome, ProcessOutcome::Exited(0));
        let stdout: Vec<&str> = lines
            .iter()
            .filter(|(k, _)| *k == OutputType::Stdout)
            .map(|(_, l)| l.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "hello", "two"]);
        assert!(lines.contains(&(OutputType::Stderr, "oops".to_string())));
    }

    #[tokio::test]
    async fn test_exit_code() {
        let (outcome, _) = run("exit 3", None, &CancellationToken::new()).await;
        assert_eq!(outcome, ProcessOutcome::Exited(3));
        assert_eq!(outcome.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_timeout() {
        let started = Instant::now();
        let (outcome, _) = run(
            "sleep 30",
            Some(Duration::from_millis(200)),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome, ProcessOutcome::TimedOut);
        assert_eq!(outcome.exit_code(), SIGNALLED_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancel_escalates_past_ignored_sigterm() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let (outcome, _) = run("trap '' TERM; sleep 30", None, &cancel).await;
        assert_eq!(outcome, ProcessOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_external_signal() {
        let (outcome, _) = run("kill -KILL $$", None, &CancellationToken::new()).await;
        assert_eq!(outcome, ProcessOutcome::Signalled);
        assert_eq!(outcome.exit_code(), -1);
    }
}
