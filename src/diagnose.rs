//! Root-cause classification for services that stay unhealthy.
//!
//! The diagnoser only reads: the raw status text from the service manager
//! and, for the remapping engine, the tail of its log. It never mutates state
//! and tolerates unreadable logs.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum_macros::{AsRefStr, Display};
use tracing::{debug, info};

use crate::autofix::AutoFixAction;
use crate::constants::DIAGNOSIS_LOG_LINES;
use crate::descriptor::ServiceId;
use crate::logs::tail_lines;
use crate::status::parser::parse_service_status;

/// Classified root cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    CodeSigning,
    MissingBinary,
    PermissionDenied,
    UnexpectedExit,
    CapturePermissionMissing,
    ConfigSyntax,
    ConfigMissing,
    DeviceUnavailable,
    /// Conflicting processes outlived termination.
    ConflictPersists,
    Unknown,
}

impl FailureKind {
    /// Fixed guidance shown with the diagnosis.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::CodeSigning => {
                "The binary was rejected by code signing. Reinstall KeyPath so the signed engine is restored."
            }
            Self::MissingBinary => {
                "The service executable could not be launched. Reinstall the component it points to."
            }
            Self::PermissionDenied => {
                "The service manager was denied access. Check ownership of the unit file and binary."
            }
            Self::UnexpectedExit => {
                "The service exited unexpectedly. Restarting it usually recovers; see the log if it recurs."
            }
            Self::CapturePermissionMissing => {
                "Grant Input Monitoring and Accessibility to the engine in System Settings > Privacy & Security."
            }
            Self::ConfigSyntax => {
                "The remapping configuration has a syntax error. Fix the reported line and save again."
            }
            Self::ConfigMissing => {
                "The remapping configuration file is missing. Create it or point KeyPath at an existing file."
            }
            Self::DeviceUnavailable => {
                "The virtual keyboard driver is unavailable. Activate the VirtualHID driver and restart its daemon."
            }
            Self::ConflictPersists => {
                "Conflicting keyboard software is still running. Quit it manually, or disable it from starting at login."
            }
            Self::Unknown => {
                "The cause is unclear. Inspect the service log and `launchctl print` output manually."
            }
        }
    }

    /// Whether only the user can resolve this cause.
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            Self::CapturePermissionMissing
                | Self::ConfigSyntax
                | Self::PermissionDenied
                | Self::ConflictPersists
                | Self::Unknown
        )
    }

    /// Auto-fix that addresses this cause, when one exists.
    pub fn suggested_action(&self) -> Option<AutoFixAction> {
        match self {
            Self::MissingBinary | Self::CodeSigning => {
                Some(AutoFixAction::InstallLaunchDaemonServices)
            }
            Self::UnexpectedExit => Some(AutoFixAction::RestartUnhealthyServices),
            Self::ConfigMissing => Some(AutoFixAction::CreateConfigFile),
            Self::DeviceUnavailable => Some(AutoFixAction::ActivateVhidDeviceManager),
            Self::PermissionDenied
            | Self::CapturePermissionMissing
            | Self::ConfigSyntax
            | Self::ConflictPersists
            | Self::Unknown => None,
        }
    }
}

/// One classified cause for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub service: ServiceId,
    pub kind: FailureKind,
    /// Line that triggered the match, if any.
    pub evidence: Option<String>,
    pub remediation: String,
    pub requires_user_action: bool,
}

impl Diagnosis {
    pub(crate) fn new(service: ServiceId, kind: FailureKind, evidence: Option<String>) -> Self {
        Self {
            service,
            kind,
            evidence,
            remediation: kind.remediation().to_string(),
            requires_user_action: kind.requires_user_action(),
        }
    }
}

const STATUS_RULES: &[(FailureKind, &[&str])] = &[
    (
        FailureKind::CodeSigning,
        &["os_reason_codesigning", "code signature", "codesigning"],
    ),
    (
        FailureKind::MissingBinary,
        &["no such file or directory", "posix_spawn", "exec format error", "could not find or use program"],
    ),
    (
        FailureKind::PermissionDenied,
        &["permission denied", "operation not permitted"],
    ),
];

const LOG_RULES: &[(FailureKind, &[&str])] = &[
    (
        FailureKind::DeviceUnavailable,
        &[
            "driver is not activated",
            "driver not activated",
            "connect_failed",
            "virtual_hid_keyboard not ready",
            "exclusive access",
        ],
    ),
    (
        FailureKind::CapturePermissionMissing,
        &[
            "(iokit/common) not permitted",
            "input monitoring permission",
            "accessibility permission",
        ],
    ),
    (
        FailureKind::ConfigSyntax,
        &["error in configuration", "failed to parse", "parse error"],
    ),
    (
        FailureKind::ConfigMissing,
        &["failed to read config", "could not read config", "config file not found"],
    ),
];

/// Engine log lines logged below warning level never describe a fault.
fn is_informational(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    ["[info]", "[debug]", "[trace]"]
        .iter()
        .any(|level| lower.contains(level))
}

/// Finds the first rule that matches any line, scanning newest lines first.
fn match_rules<'a>(
    rules: &[(FailureKind, &[&str])],
    lines: impl DoubleEndedIterator<Item = &'a str> + Clone,
) -> Vec<(FailureKind, String)> {
    let mut found = Vec::new();
    for (kind, needles) in rules {
        let hit = lines.clone().rev().find(|line| {
            let lower = line.to_ascii_lowercase();
            needles.iter().any(|needle| lower.contains(needle))
        });
        if let Some(line) = hit {
            found.push((*kind, line.trim().to_string()));
        }
    }
    found
}

/// Classifies why a service is unhealthy.
#[derive(Debug, Clone)]
pub struct FailureDiagnoser {
    kanata_log: PathBuf,
}

impl FailureDiagnoser {
    pub fn new(kanata_log: PathBuf) -> Self {
        Self { kanata_log }
    }

    /// Diagnoses `service` from its raw status text. Always returns at least
    /// one entry; [`FailureKind::Unknown`] when nothing matched.
    pub fn diagnose(&self, service: ServiceId, raw_status: &str) -> Vec<Diagnosis> {
        let mut diagnoses: Vec<Diagnosis> = match_rules(STATUS_RULES, raw_status.lines())
            .into_iter()
            .map(|(kind, line)| Diagnosis::new(service, kind, Some(line)))
            .collect();

        let parsed = parse_service_status(raw_status);
        if let Some(code) = parsed.last_exit_code.filter(|code| *code != 0)
            && parsed.pid.is_none()
        {
            diagnoses.push(Diagnosis::new(
                service,
                FailureKind::UnexpectedExit,
                Some(format!("last exit code = {code}")),
            ));
        }

        if service == ServiceId::Kanata {
            diagnoses.extend(self.diagnose_log(service));
        }

        let mut seen = Vec::new();
        diagnoses.retain(|diagnosis| {
            if seen.contains(&diagnosis.kind) {
                false
            } else {
                seen.push(diagnosis.kind);
                true
            }
        });

        if diagnoses.is_empty() {
            diagnoses.push(Diagnosis::new(service, FailureKind::Unknown, None));
        }

        for diagnosis in &diagnoses {
            info!(
                "Diagnosis for {}: {} ({})",
                service.label(),
                diagnosis.kind,
                diagnosis.remediation
            );
        }
        diagnoses
    }

    fn diagnose_log(&self, service: ServiceId) -> Vec<Diagnosis> {
        match tail_lines(&self.kanata_log, DIAGNOSIS_LOG_LINES) {
            Ok(lines) => match_rules(
                LOG_RULES,
                lines
                    .iter()
                    .map(String::as_str)
                    .filter(|line| !is_informational(line)),
            )
            .into_iter()
                .map(|(kind, line)| Diagnosis::new(service, kind, Some(line)))
                .collect(),
            Err(err) => {
                debug!(
                    "Cannot read {} for diagnosis: {err}",
                    self.kanata_log.display()
                );
                Vec::new()
            }
        }
    }
}
