//! Privileged installer.
//!
//! Units are rendered and staged into a scratch directory as the current user,
//! then placed, owned, and loaded by a single compound command run through the
//! [`PrivilegedExecutor`]. Every step is chained with `&&`, so one failing
//! sub-step fails the whole batch.
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::command::shell_quote;
use crate::config::EngineConfig;
use crate::constants::{LAUNCHD_DOMAIN, NEWSYSLOG_ENTRY_NAME, SERVICE_MANAGER_TOOL};
use crate::descriptor::{DescriptorBuilder, ServiceId, fingerprint};
use crate::error::InstallError;
use crate::privilege::{PrivilegedExecutor, was_cancelled};

const INSTALL_PROMPT: &str = "KeyPath needs to install its keyboard services.";
const ROTATION_PROMPT: &str = "KeyPath needs to install log rotation for the keyboard engine.";

/// Rotate the engine log at 10 MB, keeping five compressed generations.
const ROTATION_SIZE_KB: u32 = 10_240;
const ROTATION_COUNT: u32 = 5;

/// What happens to units after their files are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Place the files and leave the service manager alone.
    FilesOnly,
    /// Bootstrap units that are not loaded yet. A unit that is already
    /// loaded keeps running the definition it was loaded with.
    Load,
    /// Boot each unit out before bootstrapping it, restarting whatever runs.
    Reload,
}

/// A unit file written to the scratch directory.
#[derive(Debug, Clone)]
pub struct StagedUnit {
    pub id: ServiceId,
    pub staged: PathBuf,
    pub target: PathBuf,
    pub fingerprint: String,
}

/// Stages, places, and loads unit files.
pub struct Installer {
    builder: RwLock<DescriptorBuilder>,
    executor: Arc<dyn PrivilegedExecutor>,
}

impl Installer {
    pub fn new(builder: DescriptorBuilder, executor: Arc<dyn PrivilegedExecutor>) -> Self {
        Self {
            builder: RwLock::new(builder),
            executor,
        }
    }

    /// Snapshot of the configuration units are rendered from.
    pub fn config(&self) -> EngineConfig {
        self.builder().config().clone()
    }

    /// Replaces the configuration used for subsequent renders.
    pub fn update_config(&self, config: EngineConfig) {
        let mut builder = self
            .builder
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *builder = DescriptorBuilder::new(config);
    }

    /// Renders the unit file for `id` from the current configuration.
    pub fn render(&self, id: ServiceId) -> Result<String, InstallError> {
        Ok(self.builder().render(id)?)
    }

    fn builder(&self) -> DescriptorBuilder {
        self.builder
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installed location of the unit for `id`.
    pub fn target_path(&self, id: ServiceId) -> PathBuf {
        self.config().launch_daemons_dir.join(id.unit_file_name())
    }

    /// Whether a unit file for `id` exists in the daemon directory.
    pub fn is_installed(&self, id: ServiceId) -> bool {
        self.target_path(id).exists()
    }

    /// Whether the installed unit for `id` matches what the current
    /// configuration would render.
    pub fn is_current(&self, id: ServiceId) -> bool {
        let installed = match fs::read_to_string(self.target_path(id)) {
            Ok(text) => text,
            Err(err) => {
                debug!("Unit for {} not readable: {err}", id.label());
                return false;
            }
        };
        match self.render(id) {
            Ok(rendered) => fingerprint(&installed) == fingerprint(&rendered),
            Err(err) => {
                warn!("Cannot render unit for {}: {err}", id.label());
                false
            }
        }
    }

    /// Installs and loads every managed service behind one prompt.
    pub async fn install_all(&self) -> bool {
        self.install(&ServiceId::ALL).await
    }

    /// Installs and loads `ids` behind one prompt.
    pub async fn install(&self, ids: &[ServiceId]) -> bool {
        log_result(ids, self.try_install(ids, LoadMode::Load).await)
    }

    /// Places unit files for `ids` without loading them, leaving any process
    /// already running untouched.
    pub async fn install_files_only(&self, ids: &[ServiceId]) -> bool {
        log_result(ids, self.try_install(ids, LoadMode::FilesOnly).await)
    }

    /// Stages and installs `ids`, then loads them according to `mode`.
    ///
    /// # Errors
    /// * [`InstallError::Staging`] / [`InstallError::Descriptor`] before any
    ///   privileged call is made.
    /// * [`InstallError::Privileged`] when elevation was declined or any
    ///   chained step exited nonzero.
    pub async fn try_install(&self, ids: &[ServiceId], mode: LoadMode) -> Result<(), InstallError> {
        let config = self.config();
        let (_scratch, units) = self.stage(ids, &config.launch_daemons_dir)?;
        let script = install_script(&units, &config.launch_daemons_dir, mode);
        self.run_privileged(&script, INSTALL_PROMPT).await?;

        for unit in &units {
            info!(
                "Installed {} ({}) [{mode:?}]",
                unit.target.display(),
                &unit.fingerprint[..12],
            );
        }
        Ok(())
    }

    /// Renders `ids` into a fresh scratch directory. The directory is removed
    /// when the returned [`TempDir`] drops.
    pub fn stage(
        &self,
        ids: &[ServiceId],
        target_dir: &Path,
    ) -> Result<(TempDir, Vec<StagedUnit>), InstallError> {
        let scratch = tempfile::Builder::new().prefix("keypath-units-").tempdir()?;
        let builder = self.builder();
        let mut units = Vec::with_capacity(ids.len());
        for id in ids {
            let text = builder.render(*id)?;
            let staged = scratch.path().join(id.unit_file_name());
            fs::write(&staged, &text)?;
            debug!("Staged {} at {}", id.label(), staged.display());
            units.push(StagedUnit {
                id: *id,
                staged,
                target: target_dir.join(id.unit_file_name()),
                fingerprint: fingerprint(&text),
            });
        }
        Ok((scratch, units))
    }

    /// Path of the engine log rotation entry.
    pub fn log_rotation_path(&self) -> PathBuf {
        self.config().newsyslog_dir.join(NEWSYSLOG_ENTRY_NAME)
    }

    /// Whether the rotation entry is installed with the expected content.
    pub fn log_rotation_installed(&self) -> bool {
        let expected = newsyslog_entry(&self.config().kanata_log);
        fs::read_to_string(self.log_rotation_path()).is_ok_and(|text| text == expected)
    }

    /// Installs the `newsyslog` entry for the engine log.
    pub async fn install_log_rotation(&self) -> bool {
        match self.try_install_log_rotation().await {
            Ok(()) => true,
            Err(err) => {
                error!("Log rotation install failed: {err}");
                false
            }
        }
    }

    pub async fn try_install_log_rotation(&self) -> Result<(), InstallError> {
        let config = self.config();
        let scratch = tempfile::Builder::new().prefix("keypath-rotation-").tempdir()?;
        let staged = scratch.path().join(NEWSYSLOG_ENTRY_NAME);
        fs::write(&staged, newsyslog_entry(&config.kanata_log))?;

        let target = config.newsyslog_dir.join(NEWSYSLOG_ENTRY_NAME);
        let script = [
            format!("mkdir -p {}", shell_quote(&config.newsyslog_dir.to_string_lossy())),
            place_file(&staged, &target),
        ]
        .join(" && ");
        self.run_privileged(&script, ROTATION_PROMPT).await?;
        info!("Installed log rotation entry {}", target.display());
        Ok(())
    }

    async fn run_privileged(&self, script: &str, prompt: &str) -> Result<(), InstallError> {
        debug!("Privileged script: {script}");
        let output = self
            .executor
            .execute(script, prompt)
            .await
            .map_err(|err| InstallError::Privileged {
                status: None,
                stdout: String::new(),
                stderr: err.to_string(),
            })?;

        if output.is_success() {
            return Ok(());
        }
        if was_cancelled(&output) {
            warn!("Install cancelled at the administrator prompt");
        }
        Err(InstallError::Privileged {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

fn log_result(ids: &[ServiceId], result: Result<(), InstallError>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            error!("Install of {ids:?} failed: {err}");
            false
        }
    }
}

fn place_file(staged: &Path, target: &Path) -> String {
    let target = shell_quote(&target.to_string_lossy());
    format!(
        "cp {} {target} && chown root:wheel {target} && chmod 644 {target}",
        shell_quote(&staged.to_string_lossy())
    )
}

/// Builds the compound install command. Steps run in order and any failure
/// aborts the rest.
///
/// Under [`LoadMode::Load`] a failed bootstrap is accepted when the service
/// manager already knows the unit, so reinstalling a running set changes
/// nothing. [`LoadMode::Reload`] boots each unit out first.
pub fn install_script(units: &[StagedUnit], target_dir: &Path, mode: LoadMode) -> String {
    let mut steps = vec![format!(
        "mkdir -p {}",
        shell_quote(&target_dir.to_string_lossy())
    )];
    for unit in units {
        steps.push(place_file(&unit.staged, &unit.target));
    }
    if mode == LoadMode::FilesOnly {
        return steps.join(" && ");
    }
    for unit in units {
        let target = shell_quote(&unit.target.to_string_lossy());
        let service = unit.id.target();
        if mode == LoadMode::Reload {
            steps.push(format!(
                "({SERVICE_MANAGER_TOOL} bootout {service} >/dev/null 2>&1 || true)"
            ));
            steps.push(format!(
                "{SERVICE_MANAGER_TOOL} bootstrap {LAUNCHD_DOMAIN} {target}"
            ));
        } else {
            steps.push(format!(
                "({SERVICE_MANAGER_TOOL} bootstrap {LAUNCHD_DOMAIN} {target} 2>/dev/null || {SERVICE_MANAGER_TOOL} print {service} >/dev/null)"
            ));
        }
        steps.push(format!("{SERVICE_MANAGER_TOOL} enable {service}"));
    }
    steps.join(" && ")
}

/// `newsyslog.conf(5)` line rotating `log` by size.
pub fn newsyslog_entry(log: &Path) -> String {
    format!(
        "# logfilename\t[owner:group]\tmode\tcount\tsize\twhen\tflags\n{}\troot:wheel\t644\t{ROTATION_COUNT}\t{ROTATION_SIZE_KB}\t*\tNJ\n",
        log.display()
    )
}
