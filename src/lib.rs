//! KeyPath lifecycle engine: detects software competing for the keyboard,
//! installs and supervises the remapping engine and VirtualHID services through
//! the system service manager, diagnoses failures, and applies auto-fixes.

/// Auto-fix actions and the single-flight orchestrator.
pub mod autofix;

/// CLI interface.
pub mod cli;

/// External process invocation.
pub mod command;

/// Configuration management.
pub mod config;

/// Conflict records, deduplication, and detection passes.
pub mod conflict;

/// Service labels, canonical paths, and timing defaults.
pub mod constants;

/// Service descriptors and unit-file rendering.
pub mod descriptor;

/// Failure diagnosis.
pub mod diagnose;

/// VirtualHID driver version inspection.
pub mod driver;

/// Caller-facing engine facade.
pub mod engine;

/// Error handling.
pub mod error;

/// Privileged unit installation.
pub mod installer;

/// Log tailing.
pub mod logs;

/// Privilege escalation.
pub mod privilege;

/// Process scanning and classification.
pub mod scanner;

/// Health monitoring.
pub mod status;

#[doc(hidden)]
pub mod test_utils;
