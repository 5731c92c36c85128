//! Privilege escalation for batched install, repair, and restart operations.
//!
//! The engine never holds root itself. Each privileged remediation composes a
//! single shell command and hands it to a [`PrivilegedExecutor`], which asks
//! the user for credentials exactly once per call.
use async_trait::async_trait;
use nix::unistd::Uid;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::command::{CommandOutput, CommandRunner, args};
use crate::constants::ELEVATION_TOOL;
use crate::error::CommandError;

/// AppleScript error code reported when the user dismisses the prompt.
const USER_CANCELLED_CODE: &str = "(-128)";

/// Runs a compound shell command with elevated privileges.
#[async_trait]
pub trait PrivilegedExecutor: Send + Sync {
    /// Executes `script` as root, showing `prompt` as the justification.
    async fn execute(&self, script: &str, prompt: &str)
    -> Result<CommandOutput, CommandError>;
}

/// Elevates through the system authorization dialog, or runs the script
/// directly when the engine already has an effective uid of 0.
pub struct ElevatingExecutor {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl ElevatingExecutor {
    /// Creates an executor that launches through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

#[async_trait]
impl PrivilegedExecutor for ElevatingExecutor {
    async fn execute(
        &self,
        script: &str,
        prompt: &str,
    ) -> Result<CommandOutput, CommandError> {
        if Uid::effective().is_root() {
            debug!("Already root; running privileged script directly");
            return self
                .runner
                .run("sh", &args(["-c", script]), self.timeout)
                .await;
        }

        info!("Requesting administrator privileges: {prompt}");
        let apple_script = format!(
            "do shell script \"{}\" with administrator privileges with prompt \"{}\"",
            applescript_escape(script),
            applescript_escape(prompt)
        );
        let output = self
            .runner
            .run(ELEVATION_TOOL, &args(["-e", apple_script.as_str()]), self.timeout)
            .await?;

        if was_cancelled(&output) {
            warn!("Administrator prompt was dismissed");
        }
        Ok(output)
    }
}

/// Returns `true` when the output indicates the user declined elevation.
pub fn was_cancelled(output: &CommandOutput) -> bool {
    !output.is_success() && output.stderr.contains(USER_CANCELLED_CODE)
}

fn applescript_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
