//! Caller-facing facade over conflict detection, health, and auto-fix.
use std::{path::PathBuf, sync::Arc};
use tracing::debug;

use crate::autofix::{AutoFixAction, AutoFixer, FixOutcome};
use crate::command::{CommandRunner, SystemCommandRunner};
use crate::config::EngineConfig;
use crate::conflict::{ConflictDetectionResult, ConflictDetector};
use crate::descriptor::{DescriptorBuilder, ServiceId};
use crate::diagnose::{Diagnosis, FailureDiagnoser};
use crate::error::InstallError;
use crate::installer::Installer;
use crate::privilege::{ElevatingExecutor, PrivilegedExecutor};
use crate::scanner::ProcessScanner;
use crate::status::{
    HealthMonitor, ServiceHealthSnapshot,
    warmup::{Clock, InMemoryWarmupStore, SystemClock, WarmupTracker},
};

/// Wires the components together and exposes the four caller operations.
pub struct LifecycleEngine {
    detector: Arc<ConflictDetector>,
    monitor: Arc<HealthMonitor>,
    installer: Arc<Installer>,
    diagnoser: FailureDiagnoser,
    fixer: AutoFixer,
}

impl LifecycleEngine {
    /// Builds an engine that talks to the real system tools.
    ///
    /// `config_file` is where settings changes (such as enabling the TCP
    /// interface) are persisted.
    pub fn from_config(config: EngineConfig, config_file: Option<PathBuf>) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
        let executor: Arc<dyn PrivilegedExecutor> = Arc::new(ElevatingExecutor::new(
            runner.clone(),
            config.timings.privileged_timeout,
        ));
        Self::with_parts(config, config_file, runner, executor, Arc::new(SystemClock))
    }

    /// Builds an engine over injected primitives.
    pub fn with_parts(
        config: EngineConfig,
        config_file: Option<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        executor: Arc<dyn PrivilegedExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let timeout = config.timings.command_timeout;
        let scanner = ProcessScanner::new(runner.clone(), config.own_config_paths(), timeout);
        let detector = Arc::new(ConflictDetector::new(
            scanner,
            config.disabled_marker.clone(),
            config.kanata_log.clone(),
        ));
        let warmup = WarmupTracker::new(
            clock,
            Arc::new(InMemoryWarmupStore::default()),
            config.timings.warmup_window,
        );
        let monitor = Arc::new(HealthMonitor::new(runner, warmup, timeout));
        let diagnoser = FailureDiagnoser::new(config.kanata_log.clone());
        let installer = Arc::new(Installer::new(DescriptorBuilder::new(config), executor.clone()));
        let fixer = AutoFixer::new(
            detector.clone(),
            installer.clone(),
            monitor.clone(),
            diagnoser.clone(),
            executor,
            config_file,
        );

        debug!("Lifecycle engine ready");
        Self {
            detector,
            monitor,
            installer,
            diagnoser,
            fixer,
        }
    }

    /// Runs every conflict detection pass.
    pub async fn detect_conflicts(&self) -> ConflictDetectionResult {
        self.detector.detect().await
    }

    /// Current status of every managed service.
    pub async fn get_service_status(&self) -> ServiceHealthSnapshot {
        self.monitor.snapshot().await
    }

    /// Classifies why `id` is unhealthy.
    pub async fn diagnose(&self, id: ServiceId) -> Vec<Diagnosis> {
        let raw = self.monitor.raw_status(id).await.unwrap_or_default();
        self.diagnoser.diagnose(id, &raw)
    }

    pub fn can_auto_fix(&self, action: AutoFixAction) -> bool {
        self.fixer.can_perform(action)
    }

    /// Runs `action`; `true` means it was attempted and diagnosed, not
    /// necessarily that the problem is gone.
    pub async fn perform_auto_fix(&self, action: AutoFixAction) -> bool {
        self.fixer.perform(action).await
    }

    pub async fn perform_auto_fix_detailed(&self, action: AutoFixAction) -> FixOutcome {
        self.fixer.perform_detailed(action).await
    }

    /// Unit file text the current configuration renders for `id`.
    pub fn render_unit(&self, id: ServiceId) -> Result<String, InstallError> {
        self.installer.render(id)
    }

    /// Installs and loads every service behind one prompt.
    pub async fn install_all(&self) -> bool {
        let installed = self.installer.install_all().await;
        if installed {
            self.monitor.mark_restarted(&ServiceId::ALL);
        }
        installed
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }
}
