//! Process scanner: lists processes matching a pattern and classifies them.
use std::{path::Path, sync::Arc, time::Duration};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::command::{CommandRunner, args};
use crate::conflict::SystemConflict;
use crate::constants::{
    GRABBER_PROCESS_NAME, KANATA_PROCESS_NAME, PROCESS_LIST_FLAGS, PROCESS_LIST_TOOL,
    VHID_DAEMON_PROCESS_NAME, VHID_PROCESS_PATTERN,
};

/// One row of process-listing output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRow {
    /// Process id.
    pub pid: u32,
    /// Space-joined command line.
    pub command: String,
}

/// Shells out to the process enumeration primitive.
pub struct ProcessScanner {
    runner: Arc<dyn CommandRunner>,
    exclusions: Vec<String>,
    timeout: Duration,
}

impl ProcessScanner {
    /// Creates a scanner that drops rows mentioning any of `exclusions`.
    pub fn new(runner: Arc<dyn CommandRunner>, exclusions: Vec<String>, timeout: Duration) -> Self {
        Self {
            runner,
            exclusions,
            timeout,
        }
    }

    /// Lists processes whose command line contains `pattern`, excluding the
    /// scanner's own invocation and processes running one of our own configs.
    pub async fn scan(&self, pattern: &str) -> Vec<ProcessRow> {
        let output = self.list(pattern).await;
        parse_rows(&output, &self.exclusions)
    }

    /// Same as [`scan`](Self::scan) but keeps processes running our own
    /// configs; used to find engine instances the service manager does not own.
    pub async fn scan_including_own(&self, pattern: &str) -> Vec<ProcessRow> {
        let output = self.list(pattern).await;
        parse_rows(&output, &[])
    }

    /// Returns `true` when `command` mentions one of the excluded config paths.
    pub fn is_own(&self, command: &str) -> bool {
        mentions_any(command, &self.exclusions)
    }

    /// Synchronous variant of [`scan`](Self::scan) over the in-process table.
    /// Used by capability checks that must not shell out.
    pub fn snapshot(&self, pattern: &str) -> Vec<ProcessRow> {
        process_table()
            .into_iter()
            .filter(|row| row.command.contains(pattern))
            .filter(|row| !is_self_match(&row.command) && !self.is_own(&row.command))
            .collect()
    }

    /// Synchronous lookup of engine processes running one of our configs.
    pub fn own_snapshot(&self, pattern: &str) -> Vec<ProcessRow> {
        process_table()
            .into_iter()
            .filter(|row| row.command.contains(pattern) && self.is_own(&row.command))
            .collect()
    }

    async fn list(&self, pattern: &str) -> String {
        let argv = args([PROCESS_LIST_FLAGS, pattern]);
        match self.runner.run(PROCESS_LIST_TOOL, &argv, self.timeout).await {
            Ok(output) if output.is_success() => output.stdout,
            Ok(output) if output.status == Some(1) => {
                debug!("No processes match '{pattern}'");
                String::new()
            }
            Ok(output) => {
                warn!(
                    "{PROCESS_LIST_TOOL} exited with {:?} while scanning for '{pattern}': {}",
                    output.status,
                    output.stderr.trim()
                );
                String::new()
            }
            Err(err) => {
                warn!("Process scan for '{pattern}' failed: {err}");
                String::new()
            }
        }
    }
}

/// Parses `<pid> <command...>` rows, discarding unparseable lines, the
/// listing tool's own invocation, and rows mentioning any of `exclusions`.
pub fn parse_rows(output: &str, exclusions: &[String]) -> Vec<ProcessRow> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (pid, command) = match line.split_once(char::is_whitespace) {
                Some((pid, command)) => (pid, command.trim()),
                None => (line, ""),
            };
            let pid = pid.parse::<u32>().ok()?;
            Some(ProcessRow {
                pid,
                command: command.to_string(),
            })
        })
        .filter(|row| !is_self_match(&row.command))
        .filter(|row| {
            let own = mentions_any(&row.command, exclusions);
            if own {
                debug!("Ignoring pid {} running our own config", row.pid);
            }
            !own
        })
        .collect()
}

fn mentions_any(command: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .any(|needle| !needle.is_empty() && command.contains(needle.as_str()))
}

fn is_self_match(command: &str) -> bool {
    let executable = command.split_whitespace().next().unwrap_or_default();
    let name = Path::new(executable)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(executable);
    name == PROCESS_LIST_TOOL
        || command.contains(&format!("{PROCESS_LIST_TOOL} {PROCESS_LIST_FLAGS}"))
}

/// Every visible process as `(pid, command line)`. Falls back to the process
/// name when the command line is not readable.
pub fn process_table() -> Vec<ProcessRow> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .processes()
        .iter()
        .map(|(pid, process)| {
            let command = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            let command = if command.is_empty() {
                process.name().to_string_lossy().into_owned()
            } else {
                command
            };
            ProcessRow {
                pid: pid.as_u32(),
                command,
            }
        })
        .collect()
}

/// Returns `true` while `pid` exists and is not a zombie.
pub fn is_alive(pid: u32) -> bool {
    let mut system = System::new();
    let target = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    system
        .process(target)
        .is_some_and(|process| process.status() != ProcessStatus::Zombie)
}

/// Maps a process row onto the conflict it represents, if any.
pub fn classify(row: &ProcessRow) -> Option<SystemConflict> {
    let command = row.command.as_str();
    if command.contains(VHID_DAEMON_PROCESS_NAME) {
        return Some(SystemConflict::VirtualHidDaemonRunning { pid: row.pid });
    }
    if command.contains(VHID_PROCESS_PATTERN) {
        return Some(SystemConflict::VirtualHidDeviceRunning {
            pid: row.pid,
            process_name: vhid_process_name(command),
        });
    }
    if command.contains(GRABBER_PROCESS_NAME) {
        return Some(SystemConflict::GrabberRunning { pid: row.pid });
    }
    if command.contains(KANATA_PROCESS_NAME) {
        return Some(SystemConflict::ProcessRunning {
            pid: row.pid,
            command: row.command.clone(),
        });
    }
    None
}

/// Extracts the executable name from a VirtualHID command line. Install
/// paths contain spaces, so the last occurrence of the shared prefix is used.
fn vhid_process_name(command: &str) -> String {
    match command.rfind(VHID_PROCESS_PATTERN) {
        Some(start) => command[start..]
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or(VHID_PROCESS_PATTERN)
            .to_string(),
        None => VHID_PROCESS_PATTERN.to_string(),
    }
}
