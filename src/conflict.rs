//! Conflict records, deduplication, and the detection passes that produce them.
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt,
    path::PathBuf,
    sync::OnceLock,
};
use tracing::{debug, info};

use crate::constants::{
    DIAGNOSIS_LOG_LINES, GRABBER_PROCESS_NAME, KANATA_PROCESS_NAME, NO_PID,
    VHID_PROCESS_PATTERN,
};
use crate::logs::tail_lines;
use crate::scanner::{ProcessRow, ProcessScanner, classify};

/// Something that competes with the managed services for the keyboard,
/// the virtual HID device, or the engine's port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SystemConflict {
    /// A remapping engine instance we did not launch.
    ProcessRunning { pid: u32, command: String },
    /// The competing keyboard grabber.
    GrabberRunning { pid: u32 },
    /// A VirtualHID daemon instance.
    VirtualHidDaemonRunning { pid: u32 },
    /// Another VirtualHID process (activation manager, device helpers).
    VirtualHidDeviceRunning { pid: u32, process_name: String },
    /// A keyboard opened exclusively by someone else.
    ExclusiveDeviceAccess { device: String },
}

impl SystemConflict {
    /// Process id backing the conflict, if any.
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::ProcessRunning { pid, .. }
            | Self::GrabberRunning { pid }
            | Self::VirtualHidDaemonRunning { pid }
            | Self::VirtualHidDeviceRunning { pid, .. } => Some(*pid),
            Self::ExclusiveDeviceAccess { .. } => None,
        }
    }

    /// Key used by [`deduplicate`]; pid-less conflicts share the sentinel.
    pub fn dedup_key(&self) -> i64 {
        self.pid().map(i64::from).unwrap_or(NO_PID)
    }

    /// Whether terminating a process can clear this conflict.
    pub fn is_auto_resolvable(&self) -> bool {
        self.pid().is_some()
    }
}

impl fmt::Display for SystemConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessRunning { pid, command } => {
                write!(f, "Kanata process (PID {pid}): {command}")
            }
            Self::GrabberRunning { pid } => write!(f, "Karabiner grabber (PID {pid})"),
            Self::VirtualHidDaemonRunning { pid } => {
                write!(f, "VirtualHID daemon (PID {pid})")
            }
            Self::VirtualHidDeviceRunning { pid, process_name } => {
                write!(f, "{process_name} (PID {pid})")
            }
            Self::ExclusiveDeviceAccess { device } => {
                write!(f, "Exclusive access held on device '{device}'")
            }
        }
    }
}

/// Collapses conflicts to one per process id, keeping the first seen.
/// Pid-less conflicts are never collapsed.
pub fn deduplicate(conflicts: Vec<SystemConflict>) -> Vec<SystemConflict> {
    let mut seen = HashSet::new();
    conflicts
        .into_iter()
        .filter(|conflict| {
            let key = conflict.dedup_key();
            key == NO_PID || seen.insert(key)
        })
        .collect()
}

/// Deduplicated outcome of one detection pass. Replaced, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictDetectionResult {
    pub conflicts: Vec<SystemConflict>,
    pub can_auto_resolve: bool,
    pub summary: String,
    pub captured_at: DateTime<Utc>,
}

impl ConflictDetectionResult {
    /// Deduplicates `conflicts` and derives the summary fields.
    pub fn from_conflicts(conflicts: Vec<SystemConflict>) -> Self {
        let conflicts = deduplicate(conflicts);
        let can_auto_resolve =
            !conflicts.is_empty() && conflicts.iter().all(SystemConflict::is_auto_resolvable);
        let summary = summarize(&conflicts);
        Self {
            conflicts,
            can_auto_resolve,
            summary,
            captured_at: Utc::now(),
        }
    }

    /// Returns `true` when nothing conflicts.
    pub fn is_clear(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Process ids that terminating would clear.
    pub fn pids(&self) -> Vec<u32> {
        self.conflicts.iter().filter_map(SystemConflict::pid).collect()
    }
}

fn summarize(conflicts: &[SystemConflict]) -> String {
    if conflicts.is_empty() {
        return "No conflicts detected".to_string();
    }
    let details: Vec<String> = conflicts.iter().map(ToString::to_string).collect();
    format!(
        "Found {} conflict{}: {}",
        conflicts.len(),
        if conflicts.len() == 1 { "" } else { "s" },
        details.join("; ")
    )
}

/// Runs the detection passes in a fixed order: engine, grabber, VirtualHID,
/// then device access.
pub struct ConflictDetector {
    scanner: ProcessScanner,
    disabled_marker: PathBuf,
    kanata_log: PathBuf,
}

impl ConflictDetector {
    pub fn new(scanner: ProcessScanner, disabled_marker: PathBuf, kanata_log: PathBuf) -> Self {
        Self {
            scanner,
            disabled_marker,
            kanata_log,
        }
    }

    /// Runs every pass and returns the deduplicated result.
    pub async fn detect(&self) -> ConflictDetectionResult {
        let mut conflicts = Vec::new();

        conflicts.extend(self.classified(KANATA_PROCESS_NAME).await);

        if self.disabled_marker.exists() {
            debug!(
                "Grabber permanently disabled ({}); skipping grabber/VirtualHID scan",
                self.disabled_marker.display()
            );
        } else {
            conflicts.extend(self.classified(GRABBER_PROCESS_NAME).await);
            conflicts.extend(self.classified(VHID_PROCESS_PATTERN).await);
        }

        conflicts.extend(self.device_access_conflicts());

        let result = ConflictDetectionResult::from_conflicts(conflicts);
        info!("{}", result.summary);
        result
    }

    /// Engine processes running one of our configs, whoever launched them.
    pub async fn own_engine_processes(&self) -> Vec<ProcessRow> {
        self.scanner
            .scan_including_own(KANATA_PROCESS_NAME)
            .await
            .into_iter()
            .filter(|row| self.scanner.is_own(&row.command))
            .collect()
    }

    /// Cheap synchronous check for any process-backed conflict.
    pub fn has_live_conflicts(&self) -> bool {
        let mut patterns = vec![KANATA_PROCESS_NAME];
        if !self.disabled_marker.exists() {
            patterns.extend([GRABBER_PROCESS_NAME, VHID_PROCESS_PATTERN]);
        }
        patterns.into_iter().any(|pattern| {
            self.scanner
                .snapshot(pattern)
                .iter()
                .any(|row| classify(row).is_some())
        })
    }

    /// Cheap synchronous check for engine instances running our config.
    pub fn own_engine_running(&self) -> bool {
        !self.scanner.own_snapshot(KANATA_PROCESS_NAME).is_empty()
    }

    async fn classified(&self, pattern: &str) -> Vec<SystemConflict> {
        self.scanner
            .scan(pattern)
            .await
            .iter()
            .filter_map(classify)
            .collect()
    }

    fn device_access_conflicts(&self) -> Vec<SystemConflict> {
        match tail_lines(&self.kanata_log, DIAGNOSIS_LOG_LINES) {
            Ok(lines) => exclusive_access_devices(&lines)
                .into_iter()
                .map(|device| SystemConflict::ExclusiveDeviceAccess { device })
                .collect(),
            Err(err) => {
                debug!(
                    "Skipping device access pass; cannot read {}: {err}",
                    self.kanata_log.display()
                );
                Vec::new()
            }
        }
    }
}

fn exclusive_access_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?i)exclusive\s*access.*device\s*[:=]\s*"?([^"]+?)"?\s*$"#)
            .expect("valid exclusive access pattern")
    })
}

/// Devices named by exclusive-access failures in engine log lines, in order
/// of first appearance.
pub fn exclusive_access_devices(lines: &[String]) -> Vec<String> {
    let mut devices: Vec<String> = Vec::new();
    for line in lines {
        let lower = line.to_ascii_lowercase();
        if !lower.contains("exclusive access") && !lower.contains("exclusiveaccess") {
            continue;
        }
        let device = exclusive_access_pattern()
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "unknown device".to_string());
        if !devices.contains(&device) {
            devices.push(device);
        }
    }
    devices
}
