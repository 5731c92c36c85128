//! Constants and default values for the lifecycle engine.
//!
//! This module centralizes service labels, canonical install locations, search
//! patterns, and the timing defaults used by the health monitor and auto-fix
//! recipes.

use std::time::Duration;

// ============================================================================
// Service Labels
// ============================================================================

/// Launch daemon label of the remapping engine.
pub const KANATA_LABEL: &str = "com.keypath.kanata";

/// Launch daemon label of the VirtualHID daemon.
pub const VHID_DAEMON_LABEL: &str = "com.keypath.karabiner-vhiddaemon";

/// Launch daemon label of the one-shot VirtualHID activation manager.
pub const VHID_MANAGER_LABEL: &str = "com.keypath.karabiner-vhidmanager";

/// Service-manager domain all units are registered in.
pub const LAUNCHD_DOMAIN: &str = "system";

// ============================================================================
// Canonical Paths
// ============================================================================

/// Fallback location of the bundled engine binary.
pub const CANONICAL_KANATA_PATH: &str = "/Library/KeyPath/bin/kanata";

/// VirtualHID daemon executable shipped with the DriverKit package.
pub const CANONICAL_VHID_DAEMON_PATH: &str = "/Library/Application Support/org.pqrs/Karabiner-DriverKit-VirtualHIDDevice/Applications/Karabiner-VirtualHIDDevice-Daemon.app/Contents/MacOS/Karabiner-VirtualHIDDevice-Daemon";

/// VirtualHID activation manager executable.
pub const CANONICAL_VHID_MANAGER_PATH: &str = "/Applications/.Karabiner-VirtualHIDDevice-Manager.app/Contents/MacOS/Karabiner-VirtualHIDDevice-Manager";

/// Bundle metadata of the installed DriverKit extension.
pub const CANONICAL_DRIVER_INFO_PLIST: &str = "/Applications/.Karabiner-VirtualHIDDevice-Manager.app/Contents/Info.plist";

/// Installer package bundled with the application.
pub const CANONICAL_DRIVER_PKG: &str =
    "/Library/KeyPath/Resources/Karabiner-DriverKit-VirtualHIDDevice.pkg";

/// Driver version the bundled engine was built against.
pub const EXPECTED_DRIVER_VERSION: &str = "5.0.0";

/// Directory the system service manager loads daemons from.
pub const LAUNCH_DAEMONS_DIR: &str = "/Library/LaunchDaemons";

/// Directory holding `newsyslog` rotation entries.
pub const NEWSYSLOG_DIR: &str = "/etc/newsyslog.d";

/// Name of the rotation entry installed for the engine log.
pub const NEWSYSLOG_ENTRY_NAME: &str = "com.keypath.kanata.conf";

/// Log written by the remapping engine (stdout and stderr).
pub const KANATA_LOG_PATH: &str = "/var/log/kanata.log";

/// Log written by the VirtualHID daemon.
pub const VHID_DAEMON_LOG_PATH: &str = "/var/log/karabiner-vhid-daemon.log";

/// Log written by the activation manager.
pub const VHID_MANAGER_LOG_PATH: &str = "/var/log/karabiner-vhid-manager.log";

/// User configuration directory, relative to `$HOME`.
pub const USER_CONFIG_DIR: &str = ".config/keypath";

/// Name of the remapping configuration file inside the user config dir.
pub const KANATA_CONFIG_NAME: &str = "keypath.kbd";

/// Name of the engine's own settings file inside the user config dir.
pub const ENGINE_CONFIG_NAME: &str = "lifecycle.yaml";

/// Marker whose presence means the grabber was permanently disabled.
pub const DISABLED_MARKER_NAME: &str = ".keypath/karabiner-grabber-disabled";

// ============================================================================
// Process Scanning
// ============================================================================

/// Process enumeration primitive.
pub const PROCESS_LIST_TOOL: &str = "pgrep";

/// Flags asking the enumeration primitive for `<pid> <full command>` rows.
pub const PROCESS_LIST_FLAGS: &str = "-fl";

/// Substring identifying the remapping engine.
pub const KANATA_PROCESS_NAME: &str = "kanata";

/// Substring identifying the competing keyboard grabber.
pub const GRABBER_PROCESS_NAME: &str = "karabiner_grabber";

/// Substring shared by all VirtualHID processes.
pub const VHID_PROCESS_PATTERN: &str = "Karabiner-VirtualHIDDevice";

/// Substring identifying the VirtualHID daemon role.
pub const VHID_DAEMON_PROCESS_NAME: &str = "Karabiner-VirtualHIDDevice-Daemon";

/// Sentinel pid for conflicts that are not backed by a process.
pub const NO_PID: i64 = -1;

// ============================================================================
// Service Manager
// ============================================================================

/// Service-manager control utility.
pub const SERVICE_MANAGER_TOOL: &str = "launchctl";

/// Elevation helper used when the engine is not already root.
pub const ELEVATION_TOOL: &str = "osascript";

/// Restart throttle applied to the engine unit, in seconds.
pub const KANATA_THROTTLE_INTERVAL_SECS: u32 = 1;

/// Default port for the engine's TCP control interface.
pub const DEFAULT_TCP_PORT: u16 = 37001;

/// Number of log lines inspected by the diagnoser.
pub const DIAGNOSIS_LOG_LINES: usize = 50;

// ============================================================================
// Timing
// ============================================================================

/// Grace period after a (re)start during which a not-yet-running service is
/// not classified as failed.
pub const WARMUP_WINDOW: Duration = Duration::from_secs(3);

/// Pause after installing units before their health is re-queried.
pub const INSTALL_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Maximum time to wait for restarted services to recover.
pub const RECOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between recovery polls.
pub const RECOVERY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Kill fallback for read-only external calls.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Kill fallback for privileged calls (includes time spent at the prompt).
pub const PRIVILEGED_TIMEOUT: Duration = Duration::from_secs(300);
