//! Turning a job payload into a concrete process invocation.

use fleetci_core::executor::{ExecutorType, Platform, ResolvedExecutor};
use fleetci_core::job::{DependencyInstall, GitCheckout, JobPayload, PackageManager};
use std::path::{Path, PathBuf};

use crate::error::{ExecutorError, ExecutorResult};

/// Program, arguments and any script file backing them.
#[derive(Debug)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Removed when the invocation is dropped.
    pub script: Option<ScriptFile>,
}

/// A script written into the working directory for an interpreter.
///
/// The file is deleted on drop, so every exit path cleans it up.
#[derive(Debug)]
pub struct ScriptFile {
    path: PathBuf,
}

impl ScriptFile {
    pub async fn create(
        dir: &Path,
        job_id: &str,
        attempt: u32,
        extension: &str,
        body: &str,
    ) -> std::io::Result<Self> {
        let path = dir.join(script_file_name(job_id, attempt, extension));
        tokio::fs::write(&path, body).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScriptFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove script file");
            }
        }
    }
}

pub fn script_file_name(job_id: &str, attempt: u32, extension: &str) -> String {
    format!(".fleetci-{}-{}.{}", job_id, attempt, extension)
}

/// Build the invocation for one attempt of a job.
pub async fn prepare(
    payload: &JobPayload,
    resolved: &ResolvedExecutor,
    platform: Platform,
    work_dir: &Path,
    job_id: &str,
    attempt: u32,
) -> ExecutorResult<Invocation> {
    let mismatch = || ExecutorError::PayloadMismatch {
        executor: resolved.kind.to_string(),
        payload: payload_name(payload).to_string(),
    };

    match resolved.executor_type {
        ExecutorType::Shell => {
            let body = match payload {
                JobPayload::Commands { commands } => commands.join(platform.command_separator()),
                JobPayload::Script { body } => body.clone(),
                _ => return Err(mismatch()),
            };
            let mut args = resolved.args.clone();
            args.push(body);
            Ok(Invocation {
                program: resolved.command.clone(),
                args,
                script: None,
            })
        }
        ExecutorType::Interpreter => {
            let body = match payload {
                JobPayload::Commands { commands } => commands.join("\n"),
                JobPayload::Script { body } => body.clone(),
                _ => return Err(mismatch()),
            };
            let extension = resolved.script_extension.as_deref().unwrap_or("txt");
            let script = ScriptFile::create(work_dir, job_id, attempt, extension, &body).await?;
            let mut args = resolved.args.clone();
            args.push(script.path().to_string_lossy().into_owned());
            Ok(Invocation {
                program: resolved.command.clone(),
                args,
                script: Some(script),
            })
        }
        ExecutorType::Git => match payload {
            JobPayload::Checkout(checkout) => {
                Ok(native_shell(platform, git_checkout_command(checkout, platform)))
            }
            _ => Err(mismatch()),
        },
        ExecutorType::Dependency => match payload {
            JobPayload::Dependencies(install) => {
                Ok(native_shell(platform, dependency_command(install, platform)))
            }
            _ => Err(mismatch()),
        },
    }
}

fn native_shell(platform: Platform, script: String) -> Invocation {
    let config = platform.native_shell().config();
    let mut args: Vec<String> = config.args.iter().map(|s| s.to_string()).collect();
    args.push(script);
    Invocation {
        program: config.command.to_string(),
        args,
        script: None,
    }
}

fn payload_name(payload: &JobPayload) -> &'static str {
    match payload {
        JobPayload::Commands { .. } => "commands",
        JobPayload::Script { .. } => "script",
        JobPayload::Checkout(_) => "checkout",
        JobPayload::Dependencies(_) => "dependencies",
    }
}

/// Compose the shell command for a git checkout step.
pub fn git_checkout_command(checkout: &GitCheckout, platform: Platform) -> String {
    let dir = checkout.target_dir.trim_end_matches(['/', '\\']);
    let mut steps = Vec::new();

    if let Some(parent) = Path::new(dir).parent().filter(|p| !p.as_os_str().is_empty()) {
        let parent = quote(&parent.to_string_lossy(), platform);
        steps.push(if platform.is_windows() {
            format!("New-Item -ItemType Directory -Force -Path {} | Out-Null", parent)
        } else {
            format!("mkdir -p {}", parent)
        });
    }

    if checkout.clean {
        let target = quote(dir, platform);
        steps.push(if platform.is_windows() {
            format!(
                "if (Test-Path {0}) {{ Remove-Item -Recurse -Force {0} }}",
                target
            )
        } else {
            format!("rm -rf {}", target)
        });
    }

    let mut clone = String::from("git clone");
    if checkout.shallow {
        clone.push_str(" --depth 1");
    }
    if let Some(branch) = &checkout.branch {
        clone.push_str(&format!(" --branch {}", quote(branch, platform)));
    }
    clone.push_str(&format!(
        " {} {}",
        quote(&checkout.url, platform),
        quote(dir, platform)
    ));
    steps.push(clone);

    if let Some(sha) = &checkout.sha {
        steps.push(format!(
            "git -C {} checkout {}",
            quote(dir, platform),
            quote(sha, platform)
        ));
    }

    steps.join(platform.command_separator())
}

/// Compose the shell command for a dependency installation step.
pub fn dependency_command(install: &DependencyInstall, platform: Platform) -> String {
    let frozen = install.frozen_lockfile;
    let command = match install.manager {
        PackageManager::Npm if frozen => "npm ci".to_string(),
        PackageManager::Npm => "npm install".to_string(),
        PackageManager::Yarn if frozen => "yarn install --frozen-lockfile".to_string(),
        PackageManager::Yarn => "yarn install".to_string(),
        PackageManager::Pnpm if frozen => "pnpm install --frozen-lockfile".to_string(),
        PackageManager::Pnpm => "pnpm install".to_string(),
        PackageManager::Pip => format!(
            "pip install -r {}",
            quote(
                install
                    .requirements_file
                    .as_deref()
                    .unwrap_or("requirements.txt"),
                platform
            )
        ),
        PackageManager::Cargo if frozen => "cargo fetch --locked".to_string(),
        PackageManager::Cargo => "cargo fetch".to_string(),
        PackageManager::Go => "go mod download".to_string(),
        PackageManager::Bundler => "bundle install".to_string(),
        PackageManager::Composer => "composer install".to_string(),
    };

    match install.directory.as_deref().filter(|d| !d.is_empty()) {
        Some(dir) => format!(
            "cd {}{}{}",
            quote(dir, platform),
            platform.command_separator(),
            command
        ),
        None => command,
    }
}

/// Quote an argument for the platform's native shell when it needs it.
fn quote(arg: &str, platform: Platform) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@=+,%".contains(c));
    if safe {
        return arg.to_string();
    }
    if platform.is_windows() {
        format!("'{}'", arg.replace('\'', "''"))
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetci_core::executor::resolve;

    fn checkout() -> GitCheckout {
        GitCheckout {
            url: "https://github.com/acme/app.git".into(),
            branch: Some("main".into()),
            sha: Some("abc123".into()),
            target_dir: "build/source".into(),
            shallow: true,
            clean: true,
        }
    }

    #[test]
    fn test_git_command_unix() {
        assert_eq!(
            git_checkout_command(&checkout(), Platform::Linux),
            "mkdir -p build && rm -rf build/source && \
             git clone --depth 1 --branch main https://github.com/acme/app.git build/source && \
             git -C build/source checkout abc123"
        );
    }

    #[test]
    fn test_git_command_minimal() {
        let checkout = GitCheckout {
            url: "git@github.com:acme/app.git".into(),
            branch: None,
            sha: None,
            target_dir: "source".into(),
            shallow: false,
            clean: false,
        };
        assert_eq!(
            git_checkout_command(&checkout, Platform::Linux),
            "git clone git@github.com:acme/app.git source"
        );
    }

    #[test]
    fn test_git_command_windows_separator() {
        let command = git_checkout_command(&checkout(), Platform::Windows);
        assert!(command.starts_with("New-Item -ItemType Directory -Force -Path build | Out-Null; "));
        assert!(command.contains("; git clone --depth 1"));
        assert!(!command.contains("&&"));
    }

    #[test]
    fn test_dependency_commands() {
        let install = |manager, frozen, directory: Option<&str>| DependencyInstall {
            manager,
            directory: directory.map(String::from),
            frozen_lockfile: frozen,
            requirements_file: None,
        };

        assert_eq!(
            dependency_command(&install(PackageManager::Npm, true, Some("web")), Platform::Linux),
            "cd web && npm ci"
        );
        assert_eq!(
            dependency_command(&install(PackageManager::Npm, false, None), Platform::Linux),
            "npm install"
        );
        assert_eq!(
            dependency_command(&install(PackageManager::Yarn, true, None), Platform::Linux),
            "yarn install --frozen-lockfile"
        );
        assert_eq!(
            dependency_command(&install(PackageManager::Pip, false, None), Platform::Linux),
            "pip install -r requirements.txt"
        );
        assert_eq!(
            dependency_command(&install(PackageManager::Go, false, Some("svc")), Platform::Windows),
            "cd svc; go mod download"
        );
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote("plain/path", Platform::Linux), "plain/path");
        assert_eq!(quote("has space", Platform::Linux), "'has space'");
        assert_eq!(quote("it's", Platform::Linux), r"'it'\''s'");
        assert_eq!(quote("it's", Platform::Windows), "'it''s'");
    }

    #[tokio::test]
    async fn test_shell_invocation_is_inline() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve(Some("bash"), Platform::Linux, &[]).unwrap();
        let payload = JobPayload::Commands {
            commands: vec!["make".into(), "make test".into()],
        };
        let inv = prepare(&payload, &resolved, Platform::Linux, dir.path(), "job-1", 1)
            .await
            .unwrap();
        assert_eq!(inv.program, "bash");
        assert_eq!(inv.args, vec!["-c", "make && make test"]);
        assert!(inv.script.is_none());
    }

    #[tokio::test]
    async fn test_script_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let caps = vec!["python3".to_string()];
        let resolved = resolve(Some("python3"), Platform::Linux, &caps).unwrap();
        let payload = JobPayload::Script {
            body: "print('hi')".into(),
        };

        let inv = prepare(&payload, &resolved, Platform::Linux, dir.path(), "job-7", 2)
            .await
            .unwrap();
        let path = inv.script.as_ref().unwrap().path().to_path_buf();
        assert_eq!(path, dir.path().join(".fleetci-job-7-2.py"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "print('hi')");
        assert_eq!(inv.args.last().unwrap(), &path.to_string_lossy());

        drop(inv);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_payload_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let caps = vec!["git".to_string()];
        let resolved = resolve(Some("git"), Platform::Linux, &caps).unwrap();
        let payload = JobPayload::Commands {
            commands: vec!["ls".into()],
        };
        let result = prepare(&payload, &resolved, Platform::Linux, dir.path(), "job", 1).await;
        assert!(matches!(result, Err(ExecutorError::PayloadMismatch { .. })));
    }
}
