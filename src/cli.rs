//! Command-line interface for kpctl.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::autofix::AutoFixAction;
use crate::descriptor::ServiceId;

/// Verbosity override for one invocation. Accepts tracing's level names or
/// 0-5, plus "warning" as spelled in the engine's own log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// `EnvFilter` directive for this level.
    pub fn directive(&self) -> String {
        self.0.to_string().to_ascii_lowercase()
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        // tracing reads an empty string as ERROR
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }
        let name = if trimmed.eq_ignore_ascii_case("warning") {
            "warn"
        } else {
            trimmed
        };
        LevelFilter::from_str(name)
            .map(LogLevelArg)
            .map_err(|_| format!("invalid log level '{trimmed}' (expected off..trace or 0-5)"))
    }
}

/// Command-line interface for the KeyPath lifecycle engine.
#[derive(Parser)]
#[command(name = "kpctl", version, author)]
#[command(about = "Installs, checks, and repairs the KeyPath keyboard services", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Engine settings file (defaults to ~/.config/keypath/lifecycle.yaml).
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for kpctl.
#[derive(Subcommand)]
pub enum Commands {
    /// Scan for software competing for the keyboard.
    Detect {
        /// Emit machine-readable JSON output.
        #[arg(long)]
        json: bool,
    },

    /// Show the health of the managed services.
    Status {
        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Check whether an auto-fix applies right now.
    CanFix {
        /// Action name, e.g. `restart-unhealthy-services`.
        action: AutoFixAction,
    },

    /// Run an auto-fix.
    Fix {
        /// Action name, e.g. `restart-unhealthy-services`.
        action: AutoFixAction,

        /// Emit the full outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Explain why a service is unhealthy.
    Diagnose {
        /// Service to diagnose (`kanata`, `vhid-daemon`, `vhid-manager`).
        service: ServiceId,
    },

    /// Print the unit file the current settings render for a service.
    Render {
        /// Service to render (`kanata`, `vhid-daemon`, `vhid-manager`).
        service: ServiceId,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
