//! Executor resolution.
//!
//! Maps a requested runtime plus the host platform and capability set to a
//! concrete invocation. The set of runtimes is closed: anything that does
//! not parse into an [`ExecutorKind`] is rejected up front.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Host operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Linux,
    Macos,
    Windows,
}

impl Platform {
    /// The platform this binary was compiled for.
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Macos
        } else {
            Platform::Linux
        }
    }

    pub fn is_windows(&self) -> bool {
        matches!(self, Platform::Windows)
    }

    /// Separator used to chain composed commands.
    pub fn command_separator(&self) -> &'static str {
        if self.is_windows() { "; " } else { " && " }
    }

    /// The shell used when a job does not ask for one.
    pub fn native_shell(&self) -> ExecutorKind {
        if self.is_windows() {
            ExecutorKind::Powershell
        } else {
            ExecutorKind::Bash
        }
    }
}

/// Every runtime a job may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Bash,
    Sh,
    Zsh,
    Powershell,
    Cmd,
    Python,
    Python3,
    Node,
    Ruby,
    Perl,
    Php,
    Deno,
    Git,
    Dependency,
}

/// How an executor is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorType {
    /// Script passed inline as an argument.
    Shell,
    /// Script written to a file which is passed to the interpreter.
    Interpreter,
    /// Structured checkout payload.
    Git,
    /// Structured dependency payload.
    Dependency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlatformRestriction {
    Any,
    UnixOnly,
    WindowsOnly,
}

impl PlatformRestriction {
    fn allows(&self, platform: Platform) -> bool {
        match self {
            PlatformRestriction::Any => true,
            PlatformRestriction::UnixOnly => !platform.is_windows(),
            PlatformRestriction::WindowsOnly => platform.is_windows(),
        }
    }
}

/// Static description of one executor kind.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,
    pub executor_type: ExecutorType,
    pub command: &'static str,
    pub args: &'static [&'static str],
    pub script_extension: Option<&'static str>,
    /// At least one of these tags must be advertised by the host.
    /// Empty means always available.
    pub required_capabilities: &'static [&'static str],
    restriction: PlatformRestriction,
}

const fn entry(
    kind: ExecutorKind,
    executor_type: ExecutorType,
    command: &'static str,
    args: &'static [&'static str],
    script_extension: Option<&'static str>,
    required_capabilities: &'static [&'static str],
    restriction: PlatformRestriction,
) -> ExecutorConfig {
    ExecutorConfig {
        kind,
        executor_type,
        command,
        args,
        script_extension,
        required_capabilities,
        restriction,
    }
}

use ExecutorKind as K;
use ExecutorType as T;
use PlatformRestriction as R;

static EXECUTORS: &[ExecutorConfig] = &[
    entry(K::Bash, T::Shell, "bash", &["-c"], None, &[], R::Any),
    entry(K::Sh, T::Shell, "sh", &["-c"], None, &[], R::UnixOnly),
    entry(K::Zsh, T::Shell, "zsh", &["-c"], None, &["zsh"], R::UnixOnly),
    entry(
        K::Powershell,
        T::Shell,
        "powershell",
        &["-NoProfile", "-NonInteractive", "-Command"],
        None,
        &[],
        R::WindowsOnly,
    ),
    entry(K::Cmd, T::Shell, "cmd", &["/C"], None, &[], R::WindowsOnly),
    entry(
        K::Python,
        T::Interpreter,
        "python",
        &[],
        Some("py"),
        &["python", "python3"],
        R::Any,
    ),
    entry(
        K::Python3,
        T::Interpreter,
        "python3",
        &[],
        Some("py"),
        &["python3", "python"],
        R::Any,
    ),
    entry(K::Node, T::Interpreter, "node", &[], Some("js"), &["node", "nodejs"], R::Any),
    entry(K::Ruby, T::Interpreter, "ruby", &[], Some("rb"), &["ruby"], R::Any),
    entry(K::Perl, T::Interpreter, "perl", &[], Some("pl"), &["perl"], R::Any),
    entry(K::Php, T::Interpreter, "php", &[], Some("php"), &["php"], R::Any),
    entry(
        K::Deno,
        T::Interpreter,
        "deno",
        &["run", "--allow-all"],
        Some("ts"),
        &["deno"],
        R::Any,
    ),
    entry(K::Git, T::Git, "git", &[], None, &["git"], R::Any),
    entry(K::Dependency, T::Dependency, "", &[], None, &[], R::Any),
];

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            K::Bash => "bash",
            K::Sh => "sh",
            K::Zsh => "zsh",
            K::Powershell => "powershell",
            K::Cmd => "cmd",
            K::Python => "python",
            K::Python3 => "python3",
            K::Node => "node",
            K::Ruby => "ruby",
            K::Perl => "perl",
            K::Php => "php",
            K::Deno => "deno",
            K::Git => "git",
            K::Dependency => "dependency",
        }
    }

    /// Look up the static table entry for this kind.
    pub fn config(&self) -> &'static ExecutorConfig {
        EXECUTORS
            .iter()
            .find(|e| e.kind == *self)
            .unwrap_or(&EXECUTORS[0])
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorKind {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let kind = match normalized.as_str() {
            "bash" => K::Bash,
            "sh" => K::Sh,
            "zsh" => K::Zsh,
            "powershell" | "pwsh" => K::Powershell,
            "cmd" => K::Cmd,
            "python" => K::Python,
            "python3" => K::Python3,
            "node" | "nodejs" | "javascript" => K::Node,
            "ruby" => K::Ruby,
            "perl" => K::Perl,
            "php" => K::Php,
            "deno" | "typescript" => K::Deno,
            "git" | "checkout" => K::Git,
            "dependency" | "dependencies" => K::Dependency,
            _ => return Err(ResolveError::UnknownKind(s.to_string())),
        };
        Ok(kind)
    }
}

/// Why no executor could be resolved. Always a configuration problem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("unknown executor kind: {0}")]
    UnknownKind(String),

    #[error("executor {kind} is not available on {platform:?}")]
    WrongPlatform { kind: ExecutorKind, platform: Platform },

    #[error("executor {kind} requires one of the capabilities {required:?}")]
    MissingCapability {
        kind: ExecutorKind,
        required: Vec<String>,
    },
}

/// A concrete invocation strategy for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedExecutor {
    pub kind: ExecutorKind,
    pub executor_type: ExecutorType,
    pub command: String,
    pub args: Vec<String>,
    /// Set for interpreters that need the script written to a file.
    pub script_extension: Option<String>,
}

impl ResolvedExecutor {
    /// True when the payload must be treated as a structured object.
    pub fn is_structured(&self) -> bool {
        matches!(
            self.executor_type,
            ExecutorType::Git | ExecutorType::Dependency
        )
    }
}

/// Resolve a requested executor name for this host.
pub fn resolve(
    requested: Option<&str>,
    platform: Platform,
    capabilities: &[String],
) -> Result<ResolvedExecutor, ResolveError> {
    let kind = match requested.map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => name.parse::<ExecutorKind>()?,
        None => platform.native_shell(),
    };
    resolve_kind(kind, platform, capabilities)
}

/// Resolve an already-parsed kind for this host.
pub fn resolve_kind(
    kind: ExecutorKind,
    platform: Platform,
    capabilities: &[String],
) -> Result<ResolvedExecutor, ResolveError> {
    let config = kind.config();

    if !config.restriction.allows(platform) {
        return Err(ResolveError::WrongPlatform { kind, platform });
    }

    if !config.required_capabilities.is_empty()
        && !config
            .required_capabilities
            .iter()
            .any(|tag| capabilities.iter().any(|c| c.eq_ignore_ascii_case(tag)))
    {
        return Err(ResolveError::MissingCapability {
            kind,
            required: config
                .required_capabilities
                .iter()
                .map(|s| s.to_string())
                .collect(),
        });
    }

    Ok(ResolvedExecutor {
        kind,
        executor_type: config.executor_type,
        command: config.command.to_string(),
        args: config.args.iter().map(|s| s.to_string()).collect(),
        script_extension: config.script_extension.map(str::to_string),
    })
}

/// Capability tags every host advertises for its platform.
pub fn platform_capabilities(platform: Platform) -> Vec<String> {
    let tags: &[&str] = match platform {
        Platform::Linux => &["linux", "unix", "bash", "sh"],
        Platform::Macos => &["macos", "unix", "bash", "sh", "zsh"],
        Platform::Windows => &["windows", "powershell", "cmd"],
    };
    tags.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(tags: &[&str]) -> Vec<String> {
        tags.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_is_native_shell() {
        let resolved = resolve(None, Platform::Linux, &[]).unwrap();
        assert_eq!(resolved.kind, ExecutorKind::Bash);
        assert_eq!(resolved.args, vec!["-c"]);
        assert!(resolved.script_extension.is_none());

        let resolved = resolve(Some(""), Platform::Windows, &[]).unwrap();
        assert_eq!(resolved.kind, ExecutorKind::Powershell);
    }

    #[test]
    fn test_interpreter_needs_script_file() {
        let resolved = resolve(Some("python3"), Platform::Linux, &caps(&["python3"])).unwrap();
        assert_eq!(resolved.executor_type, ExecutorType::Interpreter);
        assert_eq!(resolved.script_extension.as_deref(), Some("py"));
    }

    #[test]
    fn test_unknown_kind() {
        let err = resolve(Some("cobol"), Platform::Linux, &[]).unwrap_err();
        assert_eq!(err, ResolveError::UnknownKind("cobol".to_string()));
    }

    #[test]
    fn test_platform_restricted() {
        let err = resolve(Some("cmd"), Platform::Linux, &[]).unwrap_err();
        assert!(matches!(err, ResolveError::WrongPlatform { .. }));

        let err = resolve(Some("zsh"), Platform::Windows, &caps(&["zsh"])).unwrap_err();
        assert!(matches!(err, ResolveError::WrongPlatform { .. }));
    }

    #[test]
    fn test_missing_capability() {
        let err = resolve(Some("ruby"), Platform::Linux, &caps(&["python3"])).unwrap_err();
        match err {
            ResolveError::MissingCapability { kind, required } => {
                assert_eq!(kind, ExecutorKind::Ruby);
                assert_eq!(required, vec!["ruby"]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_any_capability_suffices() {
        assert!(resolve(Some("python"), Platform::Linux, &caps(&["PYTHON3"])).is_ok());
    }

    #[test]
    fn test_structured_kinds() {
        let git = resolve(Some("git"), Platform::Linux, &caps(&["git"])).unwrap();
        assert!(git.is_structured());
        let deps = resolve(Some("dependencies"), Platform::Macos, &[]).unwrap();
        assert!(deps.is_structured());
    }

    #[test]
    fn test_every_kind_has_table_entry() {
        for kind in [
            K::Bash,
            K::Sh,
            K::Zsh,
            K::Powershell,
            K::Cmd,
            K::Python,
            K::Python3,
            K::Node,
            K::Ruby,
            K::Perl,
            K::Php,
            K::Deno,
            K::Git,
            K::Dependency,
        ] {
            assert_eq!(kind.config().kind, kind);
            assert_eq!(kind.as_str().parse::<ExecutorKind>().unwrap(), kind);
        }
    }
}
