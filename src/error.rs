//! Error handling for the lifecycle engine.
//!
//! These errors stay internal to the engine: every caller-facing operation
//! recovers them locally into a boolean, an empty result, or a `FixOutcome`.
use thiserror::Error;

/// Errors raised while loading or persisting the engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or writing a configuration file.
    #[error("Failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A `${VAR}` reference could not be resolved.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A duration string did not match `<number>[ms|s|m|h]`.
    #[error("Invalid duration value: '{0}'")]
    InvalidDuration(String),
}

/// Errors raised while rendering a service descriptor.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// The XML writer rejected an event.
    #[error("Failed to render unit file for '{label}': {reason}")]
    Render {
        /// Label of the unit being rendered.
        label: String,
        /// Writer error text.
        reason: String,
    },

    /// The rendered document was not valid UTF-8.
    #[error("Rendered unit file is not UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Errors raised by external process invocation.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The program could not be launched.
    #[error("Failed to launch '{program}': {source}")]
    Launch {
        /// Program that failed to launch.
        program: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The program did not finish before the kill fallback fired.
    #[error("'{program}' did not finish within {timeout:?}")]
    Timeout {
        /// Program that was killed.
        program: String,
        /// Timeout that elapsed.
        timeout: std::time::Duration,
    },
}

/// Errors raised by the privileged installer.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Writing a unit file to the scratch directory failed.
    #[error("Failed to stage unit files: {0}")]
    Staging(#[from] std::io::Error),

    /// A unit file could not be rendered.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    /// The batched privileged command failed or elevation was declined.
    #[error("Privileged install failed (exit {status:?}): {stderr}")]
    Privileged {
        /// Exit status of the compound command, if it ran.
        status: Option<i32>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },
}
