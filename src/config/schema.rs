//! Configuration schema definitions.
//!
//! This module defines the structure of the compute configuration files.
//! Every field deserializes with an empty/zero default so that a partial file
//! only overrides what it mentions; the embedded `default.toml` supplies the
//! real defaults.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConfigError;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Server identity and storage locations.
    #[serde(default)]
    pub server: ServerConfig,

    /// Console and UDP port ranges.
    #[serde(default)]
    pub ports: PortsConfig,

    /// Bridge helper settings.
    #[serde(default)]
    pub ubridge: UbridgeConfig,

    /// Event fan-out settings.
    #[serde(default)]
    pub notifications: NotificationsConfig,

    /// Console proxy settings.
    #[serde(default)]
    pub console: ConsoleConfig,

    /// VPCS backend settings.
    #[serde(default)]
    pub vpcs: VpcsConfig,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Lists are merged (appended).
    /// Scalars are overridden when the other value is non-default.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.server.merge(other.server);
        self.ports.merge(other.ports);
        self.ubridge.merge(other.ubridge);
        self.notifications.merge(other.notifications);
        self.console.merge(other.console);
        self.vpcs.merge(other.vpcs);
    }

    /// Check cross-field constraints after merging.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.console_start_port_range > self.ports.console_end_port_range {
            return Err(ConfigError::InvalidValue {
                field: "ports.console_start_port_range".to_string(),
                message: "start of range is above its end".to_string(),
            });
        }
        if self.ports.udp_start_port_range > self.ports.udp_end_port_range {
            return Err(ConfigError::InvalidValue {
                field: "ports.udp_start_port_range".to_string(),
                message: "start of range is above its end".to_string(),
            });
        }
        if self.console.escape.chars().count() != 2 {
            return Err(ConfigError::InvalidValue {
                field: "console.escape".to_string(),
                message: "escape prefix must be two characters, e.g. \"^^\"".to_string(),
            });
        }
        if !self.server.host.is_empty() {
            self.server.host_addr()?;
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub log_level: String,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// Server identity and storage locations.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ServerConfig {
    /// Address ports are allocated and probed on.
    #[serde(default)]
    pub host: String,

    /// Whether the controller runs on this same host.
    ///
    /// Local servers accept absolute image paths verbatim.
    #[serde(default)]
    pub local: bool,

    /// Root directory of project working directories. `~` is expanded.
    #[serde(default)]
    pub projects_path: String,

    /// Default image directory. `~` is expanded.
    #[serde(default)]
    pub images_path: String,

    /// Extra directories images may be resolved from.
    #[serde(default)]
    pub additional_images_paths: Vec<String>,
}

impl ServerConfig {
    fn merge(&mut self, other: ServerConfig) {
        if !other.host.is_empty() {
            self.host = other.host;
        }
        if other.local {
            self.local = true;
        }
        if !other.projects_path.is_empty() {
            self.projects_path = other.projects_path;
        }
        if !other.images_path.is_empty() {
            self.images_path = other.images_path;
        }
        self.additional_images_paths
            .extend(other.additional_images_paths);
    }

    /// Parsed host address.
    pub fn host_addr(&self) -> Result<IpAddr, ConfigError> {
        self.host.parse().map_err(|_| ConfigError::InvalidValue {
            field: "server.host".to_string(),
            message: format!("'{}' is not an IP address", self.host),
        })
    }

    /// Projects directory with `~` expanded.
    pub fn projects_dir(&self) -> PathBuf {
        expand_home(&self.projects_path)
    }

    /// Default images directory with `~` expanded.
    pub fn images_dir(&self) -> PathBuf {
        expand_home(&self.images_path)
    }

    /// Additional image directories with `~` expanded.
    pub fn additional_images_dirs(&self) -> Vec<PathBuf> {
        self.additional_images_paths
            .iter()
            .map(|p| expand_home(p))
            .collect()
    }
}

/// Console and UDP port ranges.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PortsConfig {
    /// First console (TCP) port.
    #[serde(default)]
    pub console_start_port_range: u16,
    /// Last console (TCP) port.
    #[serde(default)]
    pub console_end_port_range: u16,
    /// First UDP tunnel port.
    #[serde(default)]
    pub udp_start_port_range: u16,
    /// Last UDP tunnel port.
    #[serde(default)]
    pub udp_end_port_range: u16,
}

impl PortsConfig {
    fn merge(&mut self, other: PortsConfig) {
        if other.console_start_port_range != 0 {
            self.console_start_port_range = other.console_start_port_range;
        }
        if other.console_end_port_range != 0 {
            self.console_end_port_range = other.console_end_port_range;
        }
        if other.udp_start_port_range != 0 {
            self.udp_start_port_range = other.udp_start_port_range;
        }
        if other.udp_end_port_range != 0 {
            self.udp_end_port_range = other.udp_end_port_range;
        }
    }

    /// Console range as an inclusive range.
    pub fn console_range(&self) -> RangeInclusive<u16> {
        self.console_start_port_range..=self.console_end_port_range
    }

    /// UDP range as an inclusive range.
    pub fn udp_range(&self) -> RangeInclusive<u16> {
        self.udp_start_port_range..=self.udp_end_port_range
    }
}

/// Bridge helper settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct UbridgeConfig {
    /// Helper executable name or path.
    #[serde(default)]
    pub path: String,

    /// Per-command reply timeout in seconds.
    #[serde(default)]
    pub command_timeout_secs: u64,

    /// Control channel connect timeout in seconds.
    #[serde(default)]
    pub connect_timeout_secs: u64,
}

impl UbridgeConfig {
    fn merge(&mut self, other: UbridgeConfig) {
        if !other.path.is_empty() {
            self.path = other.path;
        }
        if other.command_timeout_secs != 0 {
            self.command_timeout_secs = other.command_timeout_secs;
        }
        if other.connect_timeout_secs != 0 {
            self.connect_timeout_secs = other.connect_timeout_secs;
        }
    }

    /// Per-command reply timeout.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    /// Control channel connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

/// Event fan-out settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NotificationsConfig {
    /// Per-listener queue bound. Events beyond it are dropped and counted.
    #[serde(default)]
    pub queue_capacity: usize,

    /// Heartbeat interval for streaming transports.
    #[serde(default)]
    pub heartbeat_secs: u64,
}

impl NotificationsConfig {
    fn merge(&mut self, other: NotificationsConfig) {
        if other.queue_capacity != 0 {
            self.queue_capacity = other.queue_capacity;
        }
        if other.heartbeat_secs != 0 {
            self.heartbeat_secs = other.heartbeat_secs;
        }
    }

    /// Heartbeat interval.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

/// Console proxy settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ConsoleConfig {
    /// Two-character escape prefix (`^^` means Ctrl-^).
    #[serde(default)]
    pub escape: String,

    /// Maximum simultaneous telnet viewers.
    #[serde(default)]
    pub max_viewers: usize,

    /// Address the telnet listener binds to.
    #[serde(default)]
    pub telnet_host: String,
}

impl ConsoleConfig {
    fn merge(&mut self, other: ConsoleConfig) {
        if !other.escape.is_empty() {
            self.escape = other.escape;
        }
        if other.max_viewers != 0 {
            self.max_viewers = other.max_viewers;
        }
        if !other.telnet_host.is_empty() {
            self.telnet_host = other.telnet_host;
        }
    }
}

/// VPCS backend settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct VpcsConfig {
    /// VPCS executable name or path.
    #[serde(default)]
    pub path: String,
}

impl VpcsConfig {
    fn merge(&mut self, other: VpcsConfig) {
        if !other.path.is_empty() {
            self.path = other.path;
        }
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest.trim_start_matches('/'));
    }
    Path::new(path).to_path_buf()
}
