//! Service descriptors and their launchd property-list rendering.
//!
//! Descriptors are rebuilt from [`EngineConfig`] on every use. Only the
//! rendered unit file is ever persisted, which is what makes reinstalling
//! idempotent and lets a settings change drive a regenerate-and-reload repair.
use quick_xml::{
    Writer,
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use tracing::warn;

use crate::config::EngineConfig;
use crate::constants::{
    CANONICAL_KANATA_PATH, CANONICAL_VHID_DAEMON_PATH, CANONICAL_VHID_MANAGER_PATH,
    KANATA_LABEL, KANATA_THROTTLE_INTERVAL_SECS, LAUNCHD_DOMAIN, VHID_DAEMON_LABEL,
    VHID_DAEMON_LOG_PATH, VHID_MANAGER_LABEL, VHID_MANAGER_LOG_PATH,
};
use crate::error::DescriptorError;

/// The three services the engine manages.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ServiceId {
    /// The remapping engine.
    Kanata,
    /// The VirtualHID daemon.
    VhidDaemon,
    /// The one-shot VirtualHID activation manager.
    VhidManager,
}

/// Restart policy of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Expected to run continuously; restarted on exit.
    KeepAlive,
    /// Expected to run once and exit cleanly.
    RunOnce,
}

impl ServiceId {
    /// All managed services in install order.
    pub const ALL: [ServiceId; 3] = [Self::Kanata, Self::VhidDaemon, Self::VhidManager];

    /// The VirtualHID pair.
    pub const VHID: [ServiceId; 2] = [Self::VhidDaemon, Self::VhidManager];

    /// Service-manager label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Kanata => KANATA_LABEL,
            Self::VhidDaemon => VHID_DAEMON_LABEL,
            Self::VhidManager => VHID_MANAGER_LABEL,
        }
    }

    /// Restart policy.
    pub fn kind(&self) -> ServiceKind {
        match self {
            Self::Kanata | Self::VhidDaemon => ServiceKind::KeepAlive,
            Self::VhidManager => ServiceKind::RunOnce,
        }
    }

    /// `domain/label` target used by service-manager verbs.
    pub fn target(&self) -> String {
        format!("{LAUNCHD_DOMAIN}/{}", self.label())
    }

    /// File name of the installed unit.
    pub fn unit_file_name(&self) -> String {
        format!("{}.plist", self.label())
    }
}

/// Everything needed to render one unit file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub label: String,
    /// Ordered argument vector; the first entry is the executable.
    pub arguments: Vec<String>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub user: String,
    pub group: String,
    pub run_at_load: bool,
    pub keep_alive: bool,
    pub throttle_interval: Option<u32>,
}

impl ServiceDescriptor {
    /// Executable path (first argument).
    pub fn program(&self) -> &str {
        self.arguments.first().map(String::as_str).unwrap_or_default()
    }
}

/// Builds descriptors and unit files from injected configuration.
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    config: EngineConfig,
}

impl DescriptorBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Builds the descriptor for `id`.
    pub fn build(&self, id: ServiceId) -> ServiceDescriptor {
        let (arguments, log_path, throttle_interval) = match id {
            ServiceId::Kanata => (
                self.kanata_arguments(),
                self.config.kanata_log.clone(),
                Some(KANATA_THROTTLE_INTERVAL_SECS),
            ),
            ServiceId::VhidDaemon => (
                vec![resolve_binary(
                    &self.config.vhid_daemon_binary,
                    CANONICAL_VHID_DAEMON_PATH,
                    "VirtualHID daemon",
                )],
                PathBuf::from(VHID_DAEMON_LOG_PATH),
                None,
            ),
            ServiceId::VhidManager => (
                vec![
                    resolve_binary(
                        &self.config.vhid_manager_binary,
                        CANONICAL_VHID_MANAGER_PATH,
                        "VirtualHID manager",
                    ),
                    "activate".to_string(),
                ],
                PathBuf::from(VHID_MANAGER_LOG_PATH),
                None,
            ),
        };

        ServiceDescriptor {
            id,
            label: id.label().to_string(),
            arguments,
            stdout_path: log_path.clone(),
            stderr_path: log_path,
            user: "root".to_string(),
            group: "wheel".to_string(),
            run_at_load: true,
            keep_alive: id.kind() == ServiceKind::KeepAlive,
            throttle_interval,
        }
    }

    /// Renders the unit file text for `id`.
    pub fn render(&self, id: ServiceId) -> Result<String, DescriptorError> {
        render_plist(&self.build(id))
    }

    fn kanata_arguments(&self) -> Vec<String> {
        let mut arguments = vec![
            resolve_binary(&self.config.kanata_binary, CANONICAL_KANATA_PATH, "kanata"),
            "--cfg".to_string(),
            self.config.config_path.to_string_lossy().into_owned(),
        ];
        if let Some(port) = self.config.tcp_port {
            arguments.push("--port".to_string());
            arguments.push(port.to_string());
        }
        arguments.push("--debug".to_string());
        arguments.push("--log-layer-changes".to_string());
        arguments
    }
}

/// Returns `configured` when it is a usable absolute path, otherwise the
/// canonical location. Existence is not checked here.
fn resolve_binary(configured: &Path, canonical: &str, what: &str) -> String {
    let raw = configured.to_string_lossy();
    let usable = configured.is_absolute()
        && !raw.trim().is_empty()
        && !raw.contains(['\n', '\0']);
    if usable {
        raw.into_owned()
    } else {
        warn!("Invalid {what} binary path '{raw}'; falling back to {canonical}");
        canonical.to_string()
    }
}

/// SHA-256 of a rendered unit file, hex encoded.
pub fn fingerprint(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

struct PlistWriter {
    writer: Writer<Vec<u8>>,
    label: String,
}

impl PlistWriter {
    fn event(&mut self, event: Event<'_>) -> Result<(), DescriptorError> {
        self.writer
            .write_event(event)
            .map_err(|err| DescriptorError::Render {
                label: self.label.clone(),
                reason: err.to_string(),
            })
    }

    fn element(&mut self, name: &str, text: &str) -> Result<(), DescriptorError> {
        self.event(Event::Start(BytesStart::new(name)))?;
        self.event(Event::Text(BytesText::new(text)))?;
        self.event(Event::End(BytesEnd::new(name)))
    }

    fn key(&mut self, key: &str) -> Result<(), DescriptorError> {
        self.element("key", key)
    }

    fn string(&mut self, key: &str, value: &str) -> Result<(), DescriptorError> {
        self.key(key)?;
        self.element("string", value)
    }

    fn boolean(&mut self, key: &str, value: bool) -> Result<(), DescriptorError> {
        self.key(key)?;
        let tag = if value { "true" } else { "false" };
        self.event(Event::Empty(BytesStart::new(tag)))
    }

    fn integer(&mut self, key: &str, value: u32) -> Result<(), DescriptorError> {
        self.key(key)?;
        self.element("integer", &value.to_string())
    }

    fn array(&mut self, key: &str, values: &[String]) -> Result<(), DescriptorError> {
        self.key(key)?;
        self.event(Event::Start(BytesStart::new("array")))?;
        for value in values {
            self.element("string", value)?;
        }
        self.event(Event::End(BytesEnd::new("array")))
    }
}

/// Renders a descriptor as a launchd property list.
pub fn render_plist(descriptor: &ServiceDescriptor) -> Result<String, DescriptorError> {
    let mut plist = PlistWriter {
        writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        label: descriptor.label.clone(),
    };

    plist.event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    plist.event(Event::DocType(BytesText::from_escaped(
        r#"plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd""#,
    )))?;
    plist.event(Event::Start(
        BytesStart::new("plist").with_attributes([("version", "1.0")]),
    ))?;
    plist.event(Event::Start(BytesStart::new("dict")))?;

    plist.string("Label", &descriptor.label)?;
    plist.array("ProgramArguments", &descriptor.arguments)?;
    plist.boolean("RunAtLoad", descriptor.run_at_load)?;
    plist.boolean("KeepAlive", descriptor.keep_alive)?;
    plist.string("StandardOutPath", &descriptor.stdout_path.to_string_lossy())?;
    plist.string("StandardErrorPath", &descriptor.stderr_path.to_string_lossy())?;
    plist.string("UserName", &descriptor.user)?;
    plist.string("GroupName", &descriptor.group)?;
    if let Some(interval) = descriptor.throttle_interval {
        plist.integer("ThrottleInterval", interval)?;
        plist.string("ProcessType", "Interactive")?;
    }

    plist.event(Event::End(BytesEnd::new("dict")))?;
    plist.event(Event::End(BytesEnd::new("plist")))?;

    let mut text = String::from_utf8(plist.writer.into_inner())?;
    text.push('\n');
    Ok(text)
}
