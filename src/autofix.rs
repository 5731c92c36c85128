//! Auto-fix orchestrator.
//!
//! Each [`AutoFixAction`] is a short recipe over the scanner, installer,
//! health monitor, and diagnoser. At most one recipe runs at a time: a second
//! caller waits on the gate until the first has finished.
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::Arc};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::command::shell_quote;
use crate::config::save_config;
use crate::conflict::ConflictDetector;
use crate::constants::{DEFAULT_TCP_PORT, SERVICE_MANAGER_TOOL};
use crate::descriptor::ServiceId;
use crate::diagnose::{Diagnosis, FailureDiagnoser, FailureKind};
use crate::driver::{installed_version, version_mismatch};
use crate::installer::{Installer, LoadMode};
use crate::privilege::PrivilegedExecutor;
use crate::scanner::is_alive;
use crate::status::{HealthMonitor, ServicePhase};

/// Closed set of remediations.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AutoFixAction {
    TerminateConflictingProcesses,
    StartVirtualHidDaemon,
    RestartVirtualHidDaemon,
    ActivateVhidDeviceManager,
    InstallLaunchDaemonServices,
    RepairVhidDaemonServices,
    RegenerateServiceConfiguration,
    RestartUnhealthyServices,
    AdoptOrphanedProcess,
    ReplaceOrphanedProcess,
    EnableTcpServer,
    InstallLogRotation,
    CreateConfigFile,
    FixDriverVersionMismatch,
}

/// Result of one auto-fix.
///
/// `attempted` is the caller-facing success flag: the recipe ran and any
/// remaining problem has been diagnosed. It stays `true` when the root cause
/// needs the user (for example a missing OS permission). `resolved` reports
/// whether the problem was actually observed to be gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixOutcome {
    pub action: AutoFixAction,
    pub attempted: bool,
    pub resolved: bool,
    pub diagnoses: Vec<Diagnosis>,
    pub detail: String,
}

impl FixOutcome {
    fn resolved(action: AutoFixAction, detail: impl Into<String>) -> Self {
        Self {
            action,
            attempted: true,
            resolved: true,
            diagnoses: Vec::new(),
            detail: detail.into(),
        }
    }

    fn failed(action: AutoFixAction, detail: impl Into<String>) -> Self {
        Self {
            action,
            attempted: false,
            resolved: false,
            diagnoses: Vec::new(),
            detail: detail.into(),
        }
    }

    fn verified(
        action: AutoFixAction,
        resolved: bool,
        diagnoses: Vec<Diagnosis>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            action,
            attempted: true,
            resolved,
            diagnoses,
            detail: detail.into(),
        }
    }

    /// Adds causes found before the fix for services that are still
    /// diagnosed. A concrete cause displaces [`FailureKind::Unknown`].
    fn with_earlier_diagnoses(mut self, earlier: Vec<Diagnosis>) -> Self {
        if self.resolved {
            return self;
        }
        for diagnosis in earlier {
            let still_failing = self.diagnoses.iter().any(|d| d.service == diagnosis.service);
            let known = self
                .diagnoses
                .iter()
                .any(|d| d.service == diagnosis.service && d.kind == diagnosis.kind);
            if still_failing && !known {
                self.diagnoses.push(diagnosis);
            }
        }
        let diagnosed: Vec<(ServiceId, FailureKind)> =
            self.diagnoses.iter().map(|d| (d.service, d.kind)).collect();
        self.diagnoses.retain(|d| {
            d.kind != FailureKind::Unknown
                || !diagnosed
                    .iter()
                    .any(|(service, kind)| *service == d.service && *kind != FailureKind::Unknown)
        });
        self
    }
}

const DEFAULT_REMAP_CONFIG: &str = "\
;; KeyPath remapping configuration
(defcfg
  process-unmapped-keys yes
)

(defsrc)

(deflayer base)
";

/// Dispatches [`AutoFixAction`]s behind a single-flight gate.
pub struct AutoFixer {
    detector: Arc<ConflictDetector>,
    installer: Arc<Installer>,
    monitor: Arc<HealthMonitor>,
    diagnoser: FailureDiagnoser,
    executor: Arc<dyn PrivilegedExecutor>,
    config_file: Option<PathBuf>,
    gate: Mutex<()>,
}

impl AutoFixer {
    pub fn new(
        detector: Arc<ConflictDetector>,
        installer: Arc<Installer>,
        monitor: Arc<HealthMonitor>,
        diagnoser: FailureDiagnoser,
        executor: Arc<dyn PrivilegedExecutor>,
        config_file: Option<PathBuf>,
    ) -> Self {
        Self {
            detector,
            installer,
            monitor,
            diagnoser,
            executor,
            config_file,
            gate: Mutex::new(()),
        }
    }

    /// Fast, side-effect-free check whether `action` applies right now.
    pub fn can_perform(&self, action: AutoFixAction) -> bool {
        let config = self.installer.config();
        match action {
            AutoFixAction::TerminateConflictingProcesses => self.detector.has_live_conflicts(),
            AutoFixAction::StartVirtualHidDaemon => config.vhid_daemon_binary.exists(),
            AutoFixAction::RestartVirtualHidDaemon => {
                self.installer.is_installed(ServiceId::VhidDaemon)
            }
            AutoFixAction::ActivateVhidDeviceManager => config.vhid_manager_binary.exists(),
            AutoFixAction::InstallLaunchDaemonServices => ServiceId::ALL
                .iter()
                .any(|id| !self.installer.is_installed(*id)),
            AutoFixAction::RepairVhidDaemonServices => ServiceId::VHID
                .iter()
                .any(|id| !self.installer.is_current(*id)),
            AutoFixAction::RegenerateServiceConfiguration => {
                self.installer.is_installed(ServiceId::Kanata)
                    && !self.installer.is_current(ServiceId::Kanata)
            }
            AutoFixAction::RestartUnhealthyServices => true,
            AutoFixAction::AdoptOrphanedProcess | AutoFixAction::ReplaceOrphanedProcess => {
                !self.installer.is_installed(ServiceId::Kanata)
                    && self.detector.own_engine_running()
            }
            AutoFixAction::EnableTcpServer => config.tcp_port.is_none(),
            AutoFixAction::InstallLogRotation => !self.installer.log_rotation_installed(),
            AutoFixAction::CreateConfigFile => !config.config_path.exists(),
            AutoFixAction::FixDriverVersionMismatch => {
                let installed = installed_version(&config.driver_info_plist);
                version_mismatch(installed.as_deref(), &config.expected_driver_version)
                    && config.driver_pkg.exists()
            }
        }
    }

    /// Runs `action`, waiting for any auto-fix already in flight to finish
    /// first. Returns the caller-facing success flag.
    pub async fn perform(&self, action: AutoFixAction) -> bool {
        self.perform_detailed(action).await.attempted
    }

    /// Runs `action` and returns the full outcome.
    pub async fn perform_detailed(&self, action: AutoFixAction) -> FixOutcome {
        let _guard = match self.gate.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!("Auto-fix in progress; {action} waits for it to finish");
                self.gate.lock().await
            }
        };

        info!("Performing auto-fix: {action}");
        let outcome = self.dispatch(action).await;
        if outcome.attempted {
            info!(
                "Auto-fix {action} finished (resolved: {}): {}",
                outcome.resolved, outcome.detail
            );
        } else {
            error!("Auto-fix {action} failed: {}", outcome.detail);
        }
        outcome
    }

    async fn dispatch(&self, action: AutoFixAction) -> FixOutcome {
        match action {
            AutoFixAction::TerminateConflictingProcesses => self.terminate_conflicts(action).await,
            AutoFixAction::StartVirtualHidDaemon => self.start_vhid_daemon(action).await,
            AutoFixAction::RestartVirtualHidDaemon => {
                self.kickstart(action, &[ServiceId::VhidDaemon]).await
            }
            AutoFixAction::ActivateVhidDeviceManager => self.activate_manager(action).await,
            AutoFixAction::InstallLaunchDaemonServices => {
                self.install_and_verify(action, &ServiceId::ALL, LoadMode::Load)
                    .await
            }
            AutoFixAction::RepairVhidDaemonServices => {
                self.install_and_verify(action, &ServiceId::VHID, LoadMode::Reload)
                    .await
            }
            AutoFixAction::RegenerateServiceConfiguration => {
                self.install_and_verify(action, &[ServiceId::Kanata], LoadMode::Reload)
                    .await
            }
            AutoFixAction::RestartUnhealthyServices => self.restart_unhealthy(action).await,
            AutoFixAction::AdoptOrphanedProcess => self.adopt_orphan(action).await,
            AutoFixAction::ReplaceOrphanedProcess => self.replace_orphan(action).await,
            AutoFixAction::EnableTcpServer => self.enable_tcp_server(action).await,
            AutoFixAction::InstallLogRotation => {
                if self.installer.install_log_rotation().await {
                    FixOutcome::resolved(action, "Installed log rotation for the engine log")
                } else {
                    FixOutcome::failed(action, "Log rotation install failed")
                }
            }
            AutoFixAction::CreateConfigFile => self.create_config_file(action),
            AutoFixAction::FixDriverVersionMismatch => self.fix_driver(action).await,
        }
    }

    /// Snapshot, install anything unloaded, then restart whatever is still
    /// unhealthy in one privileged batch and poll for recovery.
    async fn restart_unhealthy(&self, action: AutoFixAction) -> FixOutcome {
        let config = self.installer.config();
        let snapshot = self.monitor.snapshot().await;
        if snapshot.all_healthy() {
            return FixOutcome::resolved(action, "All services are already healthy");
        }

        let unloaded = snapshot.unloaded();
        if !unloaded.is_empty() {
            info!("Services not loaded: {unloaded:?}; installing all services");
            if let Err(err) = self.installer.try_install(&ServiceId::ALL, LoadMode::Load).await {
                return FixOutcome::failed(action, format!("Install failed: {err}"));
            }
            self.monitor.mark_restarted(&unloaded);
            tokio::time::sleep(config.timings.install_settle).await;
        }

        let snapshot = self.monitor.snapshot().await;
        let unhealthy = snapshot.unhealthy();
        if unhealthy.is_empty() {
            if unloaded.is_empty() {
                return FixOutcome::resolved(action, "Services recovered before restart");
            }
            return self
                .verify(action, &unloaded, format!("Installed {unloaded:?}"))
                .await;
        }

        let mut earlier = Vec::new();
        for id in &unhealthy {
            earlier.extend(self.diagnose(*id).await);
        }

        let script = kickstart_script(&unhealthy);
        if let Err(detail) = self.run_privileged(&script, "KeyPath needs to restart its keyboard services.").await {
            return FixOutcome::failed(action, detail);
        }

        let mut touched = unhealthy.clone();
        touched.extend(unloaded.iter().copied().filter(|id| !unhealthy.contains(id)));
        self.verify(action, &touched, format!("Restarted {unhealthy:?}"))
            .await
            .with_earlier_diagnoses(earlier)
    }

    async fn terminate_conflicts(&self, action: AutoFixAction) -> FixOutcome {
        let result = self.detector.detect().await;
        let pids = result.pids();
        if pids.is_empty() {
            return FixOutcome::resolved(action, result.summary);
        }
        self.terminate(action, &pids).await
    }

    async fn terminate(&self, action: AutoFixAction, pids: &[u32]) -> FixOutcome {
        let list = pids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        let script =
            format!("kill -TERM {list} 2>/dev/null; sleep 1; kill -KILL {list} 2>/dev/null; true");
        if let Err(detail) = self
            .run_privileged(&script, "KeyPath needs to stop conflicting keyboard software.")
            .await
        {
            return FixOutcome::failed(action, detail);
        }

        let timings = self.installer.config().timings;
        let deadline = tokio::time::Instant::now() + timings.recovery_timeout;
        loop {
            let alive: Vec<u32> = pids.iter().copied().filter(|pid| is_alive(*pid)).collect();
            if alive.is_empty() {
                return FixOutcome::resolved(action, format!("Terminated PIDs {pids:?}"));
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("PIDs still alive after termination: {alive:?}");
                let survivors = Diagnosis::new(
                    ServiceId::Kanata,
                    FailureKind::ConflictPersists,
                    Some(format!("still running: {alive:?}")),
                );
                return FixOutcome::verified(
                    action,
                    false,
                    vec![survivors],
                    format!("PIDs still alive: {alive:?}"),
                );
            }
            tokio::time::sleep(timings.recovery_poll_interval).await;
        }
    }

    async fn start_vhid_daemon(&self, action: AutoFixAction) -> FixOutcome {
        if !self.installer.is_installed(ServiceId::VhidDaemon) {
            return self
                .install_and_verify(action, &[ServiceId::VhidDaemon], LoadMode::Load)
                .await;
        }
        let script = format!(
            "{SERVICE_MANAGER_TOOL} kickstart {}",
            ServiceId::VhidDaemon.target()
        );
        if let Err(detail) = self
            .run_privileged(&script, "KeyPath needs to start the VirtualHID daemon.")
            .await
        {
            return FixOutcome::failed(action, detail);
        }
        self.verify(action, &[ServiceId::VhidDaemon], "Started VirtualHID daemon")
            .await
    }

    async fn kickstart(&self, action: AutoFixAction, ids: &[ServiceId]) -> FixOutcome {
        if let Err(detail) = self
            .run_privileged(&kickstart_script(ids), "KeyPath needs to restart its keyboard services.")
            .await
        {
            return FixOutcome::failed(action, detail);
        }
        self.verify(action, ids, format!("Restarted {ids:?}")).await
    }

    async fn activate_manager(&self, action: AutoFixAction) -> FixOutcome {
        let manager = self.installer.config().vhid_manager_binary;
        let script = format!("{} activate", shell_quote(&manager.to_string_lossy()));
        match self
            .run_privileged(&script, "KeyPath needs to activate the VirtualHID driver.")
            .await
        {
            Ok(()) => FixOutcome::resolved(action, "Activated the VirtualHID driver"),
            Err(detail) => FixOutcome::failed(action, detail),
        }
    }

    async fn install_and_verify(
        &self,
        action: AutoFixAction,
        ids: &[ServiceId],
        mode: LoadMode,
    ) -> FixOutcome {
        if let Err(err) = self.installer.try_install(ids, mode).await {
            return FixOutcome::failed(action, format!("Install failed: {err}"));
        }
        self.verify(action, ids, format!("Installed {ids:?}")).await
    }

    async fn adopt_orphan(&self, action: AutoFixAction) -> FixOutcome {
        match self
            .installer
            .try_install(&[ServiceId::Kanata], LoadMode::FilesOnly)
            .await {
            Ok(()) => FixOutcome::resolved(
                action,
                "Installed the engine unit; the running instance was left untouched",
            ),
            Err(err) => FixOutcome::failed(action, format!("Install failed: {err}")),
        }
    }

    async fn replace_orphan(&self, action: AutoFixAction) -> FixOutcome {
        let pids: Vec<u32> = self
            .detector
            .own_engine_processes()
            .await
            .iter()
            .map(|row| row.pid)
            .collect();
        if !pids.is_empty() {
            let terminated = self.terminate(action, &pids).await;
            if !terminated.attempted {
                return terminated;
            }
        }
        self.install_and_verify(action, &ServiceId::ALL, LoadMode::Reload)
            .await
    }

    async fn enable_tcp_server(&self, action: AutoFixAction) -> FixOutcome {
        let mut config = self.installer.config();
        let port = *config.tcp_port.get_or_insert(DEFAULT_TCP_PORT);
        if let Some(path) = &self.config_file
            && let Err(err) = save_config(&config, path)
        {
            return FixOutcome::failed(action, format!("Cannot persist settings: {err}"));
        }
        self.installer.update_config(config);
        info!("TCP control interface enabled on port {port}");
        self.install_and_verify(action, &[ServiceId::Kanata], LoadMode::Reload)
            .await
    }

    fn create_config_file(&self, action: AutoFixAction) -> FixOutcome {
        let path = self.installer.config().config_path;
        if path.exists() {
            return FixOutcome::resolved(action, format!("{} already exists", path.display()));
        }
        let written = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::write(&path, DEFAULT_REMAP_CONFIG));
        match written {
            Ok(()) => FixOutcome::resolved(action, format!("Created {}", path.display())),
            Err(err) => FixOutcome::failed(action, format!("Cannot create {}: {err}", path.display())),
        }
    }

    async fn fix_driver(&self, action: AutoFixAction) -> FixOutcome {
        let config = self.installer.config();
        let script = [
            format!(
                "installer -pkg {} -target /",
                shell_quote(&config.driver_pkg.to_string_lossy())
            ),
            format!(
                "{} activate",
                shell_quote(&config.vhid_manager_binary.to_string_lossy())
            ),
            kickstart_script(&[ServiceId::VhidDaemon]),
        ]
        .join(" && ");
        if let Err(detail) = self
            .run_privileged(&script, "KeyPath needs to update the VirtualHID driver.")
            .await
        {
            return FixOutcome::failed(action, detail);
        }

        let installed = installed_version(&config.driver_info_plist);
        let resolved = !version_mismatch(installed.as_deref(), &config.expected_driver_version);
        FixOutcome::verified(
            action,
            resolved,
            Vec::new(),
            format!(
                "Driver version now {}",
                installed.as_deref().unwrap_or("unknown")
            ),
        )
    }

    /// Opens the warm-up window, polls for recovery, and diagnoses anything
    /// still unhealthy.
    async fn verify(
        &self,
        action: AutoFixAction,
        ids: &[ServiceId],
        detail: impl Into<String>,
    ) -> FixOutcome {
        let timings = self.installer.config().timings;
        self.monitor.mark_restarted(ids);
        let resolved = self
            .monitor
            .wait_until_healthy(ids, timings.recovery_timeout, timings.recovery_poll_interval)
            .await;

        let mut diagnoses = Vec::new();
        if !resolved {
            for id in ids {
                if self.monitor.status(*id).await.phase != ServicePhase::Healthy {
                    diagnoses.extend(self.diagnose(*id).await);
                }
            }
        }
        FixOutcome::verified(action, resolved, diagnoses, detail)
    }

    async fn diagnose(&self, id: ServiceId) -> Vec<Diagnosis> {
        let raw = self.monitor.raw_status(id).await.unwrap_or_default();
        self.diagnoser.diagnose(id, &raw)
    }

    async fn run_privileged(&self, script: &str, prompt: &str) -> Result<(), String> {
        debug!("Privileged script: {script}");
        match self.executor.execute(script, prompt).await {
            Ok(output) if output.is_success() => Ok(()),
            Ok(output) => Err(format!(
                "Privileged command exited with {:?}: {}",
                output.status,
                output.combined().trim()
            )),
            Err(err) => Err(err.to_string()),
        }
    }
}

/// One `kickstart -k` per service, chained so any failure aborts the batch.
pub fn kickstart_script(ids: &[ServiceId]) -> String {
    ids.iter()
        .map(|id| format!("{SERVICE_MANAGER_TOOL} kickstart -k {}", id.target()))
        .collect::<Vec<_>>()
        .join(" && ")
}
