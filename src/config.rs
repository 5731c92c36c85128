//! Configuration management for the lifecycle engine.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};
use tracing::{debug, info};

use crate::constants::{
    CANONICAL_DRIVER_INFO_PLIST, CANONICAL_DRIVER_PKG, CANONICAL_KANATA_PATH,
    CANONICAL_VHID_DAEMON_PATH, CANONICAL_VHID_MANAGER_PATH, COMMAND_TIMEOUT,
    DISABLED_MARKER_NAME, ENGINE_CONFIG_NAME, EXPECTED_DRIVER_VERSION,
    INSTALL_SETTLE_DELAY, KANATA_CONFIG_NAME, KANATA_LOG_PATH, LAUNCH_DAEMONS_DIR,
    NEWSYSLOG_DIR, PRIVILEGED_TIMEOUT, RECOVERY_POLL_INTERVAL, RECOVERY_TIMEOUT,
    USER_CONFIG_DIR, WARMUP_WINDOW,
};
use crate::error::ConfigError;

/// Settings the descriptor builder, scanner, installer, and diagnoser read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Remapping engine executable.
    pub kanata_binary: PathBuf,
    /// Remapping configuration file passed via `--cfg`.
    pub config_path: PathBuf,
    /// Other configuration paths the application owns (used for self-filtering).
    pub extra_config_paths: Vec<PathBuf>,
    /// Port of the engine's TCP control interface, when enabled.
    pub tcp_port: Option<u16>,
    /// Engine log tailed by the diagnoser.
    pub kanata_log: PathBuf,
    /// VirtualHID daemon executable.
    pub vhid_daemon_binary: PathBuf,
    /// VirtualHID activation manager executable.
    pub vhid_manager_binary: PathBuf,
    /// Directory installed unit files are placed in.
    pub launch_daemons_dir: PathBuf,
    /// Marker file that suppresses grabber/VirtualHID scanning.
    pub disabled_marker: PathBuf,
    /// `Info.plist` of the installed driver bundle.
    pub driver_info_plist: PathBuf,
    /// Bundled driver installer package.
    pub driver_pkg: PathBuf,
    /// Driver version the engine expects.
    pub expected_driver_version: String,
    /// Directory holding log rotation entries.
    pub newsyslog_dir: PathBuf,
    /// Timing knobs for warm-up, settle, and polling.
    pub timings: TimingConfig,
}

/// Durations used by the health monitor and auto-fix recipes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Grace period after a (re)start.
    #[serde(with = "duration_str")]
    pub warmup_window: Duration,
    /// Pause after installing units.
    #[serde(with = "duration_str")]
    pub install_settle: Duration,
    /// Hard wall-clock limit for recovery polling.
    #[serde(with = "duration_str")]
    pub recovery_timeout: Duration,
    /// Interval between recovery polls.
    #[serde(with = "duration_str")]
    pub recovery_poll_interval: Duration,
    /// Kill fallback for read-only external calls.
    #[serde(with = "duration_str")]
    pub command_timeout: Duration,
    /// Kill fallback for privileged calls.
    #[serde(with = "duration_str")]
    pub privileged_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            warmup_window: WARMUP_WINDOW,
            install_settle: INSTALL_SETTLE_DELAY,
            recovery_timeout: RECOVERY_TIMEOUT,
            recovery_poll_interval: RECOVERY_POLL_INTERVAL,
            command_timeout: COMMAND_TIMEOUT,
            privileged_timeout: PRIVILEGED_TIMEOUT,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let home = home_dir();
        Self {
            kanata_binary: PathBuf::from(CANONICAL_KANATA_PATH),
            config_path: home.join(USER_CONFIG_DIR).join(KANATA_CONFIG_NAME),
            extra_config_paths: Vec::new(),
            tcp_port: None,
            kanata_log: PathBuf::from(KANATA_LOG_PATH),
            vhid_daemon_binary: PathBuf::from(CANONICAL_VHID_DAEMON_PATH),
            vhid_manager_binary: PathBuf::from(CANONICAL_VHID_MANAGER_PATH),
            launch_daemons_dir: PathBuf::from(LAUNCH_DAEMONS_DIR),
            disabled_marker: home.join(DISABLED_MARKER_NAME),
            driver_info_plist: PathBuf::from(CANONICAL_DRIVER_INFO_PLIST),
            driver_pkg: PathBuf::from(CANONICAL_DRIVER_PKG),
            expected_driver_version: EXPECTED_DRIVER_VERSION.to_string(),
            newsyslog_dir: PathBuf::from(NEWSYSLOG_DIR),
            timings: TimingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration paths whose presence in a command line marks the process
    /// as one of ours.
    pub fn own_config_paths(&self) -> Vec<String> {
        std::iter::once(&self.config_path)
            .chain(self.extra_config_paths.iter())
            .map(|path| path.to_string_lossy().into_owned())
            .filter(|path| !path.is_empty())
            .collect()
    }
}

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Default location of the engine settings file.
pub fn default_config_path() -> PathBuf {
    home_dir().join(USER_CONFIG_DIR).join(ENGINE_CONFIG_NAME)
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("valid env var pattern")
    })
}

/// Expands `${VAR}`/`$VAR` references and a leading `~` on each line.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing = None;
    let expanded = env_var_pattern().replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    if let Some(var_name) = missing {
        return Err(ConfigError::MissingEnvVar(var_name));
    }

    let home = home_dir().to_string_lossy().into_owned();
    let lines: Vec<String> = expanded
        .lines()
        .map(|line| expand_tilde(line, &home))
        .collect();
    Ok(lines.join("\n"))
}

/// Replaces `~/` at the start of a YAML scalar with the home directory.
fn expand_tilde(line: &str, home: &str) -> String {
    let Some((key, value)) = line.split_once(": ") else {
        return line.to_string();
    };
    let trimmed = value.trim_start_matches(['"', '\'']);
    if let Some(rest) = trimmed.strip_prefix("~/") {
        let quote = &value[..value.len() - trimmed.len()];
        return format!("{key}: {quote}{home}/{rest}");
    }
    line.to_string()
}

/// Loads the engine configuration, falling back to defaults when no file
/// exists at the default location.
pub fn load_config(config_path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => {
            let path = default_config_path();
            if !path.exists() {
                debug!("No engine config at {}; using defaults", path.display());
                return Ok(EngineConfig::default());
            }
            path
        }
    };

    let content = fs::read_to_string(&path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, path.display()),
        ))
    })?;

    let expanded = expand_env_vars(&content)?;
    if expanded.trim().is_empty() {
        return Ok(EngineConfig::default());
    }

    let config: EngineConfig = serde_yaml::from_str(&expanded)?;
    info!("Loaded engine config from {}", path.display());
    Ok(config)
}

/// Persists the configuration as YAML, creating parent directories.
pub fn save_config(config: &EngineConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_yaml::to_string(config)?)?;
    Ok(())
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ConfigError::InvalidDuration(raw.to_string()));
    }

    let invalid = || ConfigError::InvalidDuration(raw.to_string());

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(D::Error::custom)
    }
}
