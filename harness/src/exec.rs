use crate::error::{self, Result};
use async_trait::async_trait;
use log::debug;
use snafu::ensure;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

/// A command line and the time it is allowed to take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl Cmd {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    /// Builds a command from a prefix such as `["microk8s", "kubectl"]`, where the first element
    /// is the program and the rest are leading arguments.
    pub fn from_prefix(prefix: &[String]) -> Self {
        let mut parts = prefix.iter();
        let program = parts.next().cloned().unwrap_or_default();
        Self::new(program).args(parts)
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.timeout
    }
}

impl Display for Cmd {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// The captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Fails with `CommandFailed` unless the command exited successfully.
    pub fn check(self, cmd: &Cmd) -> Result<Self> {
        ensure!(
            self.success(),
            error::CommandFailedSnafu {
                command: cmd.to_string(),
                code: self.code,
                stdout: self.stdout.trim(),
                stderr: self.stderr.trim(),
            }
        );
        Ok(self)
    }
}

/// Runs external commands. Everything the verifier does outside the Kubernetes API goes through
/// this trait so that it can be replaced in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `cmd` to completion and captures its output. A non-zero exit status is not an error
    /// at this level.
    async fn output(&self, cmd: &Cmd) -> Result<CommandOutput>;

    /// Runs `cmd` and fails unless it exits successfully.
    async fn run(&self, cmd: &Cmd) -> Result<CommandOutput> {
        self.output(cmd).await?.check(cmd)
    }
}

/// Runs commands as child processes of the verifier.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    default_timeout: Option<Duration>,
}

impl SystemRunner {
    /// Commands without a timeout of their own are bounded by `default_timeout`.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout: Some(default_timeout),
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, cmd: &Cmd) -> Result<CommandOutput> {
        debug!("$ {}", cmd);
        let mut command = tokio::process::Command::new(cmd.program());
        command
            .args(cmd.arguments())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let child = command.output();
        let output = match cmd.time_limit().or(self.default_timeout) {
            Some(timeout) => match tokio::time::timeout(timeout, child).await {
                Ok(output) => output,
                Err(_) => {
                    return error::CommandTimeoutSnafu {
                        command: cmd.to_string(),
                        timeout,
                    }
                    .fail()
                }
            },
            None => child.await,
        };
        let output = match output {
            Ok(output) => output,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Err(error::Error::CommandNotFound {
                    program: cmd.program().to_string(),
                    source,
                })
            }
            Err(source) => {
                return Err(error::Error::CommandSpawn {
                    command: cmd.to_string(),
                    source,
                })
            }
        };
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Returns `true` if `program` is an executable file in one of the `PATH` directories.
pub fn program_on_path(program: &str) -> bool {
    let paths = match std::env::var_os("PATH") {
        Some(paths) => paths,
        None => return false,
    };
    std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(program)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
