//! External process invocation.
//!
//! Every shell-out the engine performs (process listing, service-manager
//! queries, elevation) goes through [`CommandRunner`], so tests can substitute
//! scripted output for the real tools.
use async_trait::async_trait;
use std::{process::Stdio, time::Duration};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::CommandError;

/// Captured result of a finished external process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Builds a successful output carrying `stdout`.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Builds a failed output with the given exit code and `stderr`.
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns `true` when the process exited with status 0.
    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }

    /// Standard output followed by standard error.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Runs an external program to completion and captures its output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, killing it if it outlives `timeout`.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        debug!("Running {program} {}", args.join(" "));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Launch {
                program: program.to_string(),
                source,
            })?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(source)) => Err(CommandError::Launch {
                program: program.to_string(),
                source,
            }),
            Err(_) => {
                warn!("'{program}' exceeded {timeout:?}; killed");
                Err(CommandError::Timeout {
                    program: program.to_string(),
                    timeout,
                })
            }
        }
    }
}

/// Quotes `value` for inclusion in a POSIX shell command line.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=+@%,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Converts a list of string slices into owned arguments.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
