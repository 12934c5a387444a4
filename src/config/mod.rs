//! Configuration system for netsim-compute.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (`config/default.toml`)
//! 2. System config: `/etc/netsim/compute.toml`
//! 3. User config: `~/.config/netsim/compute.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! # Merge Behavior
//!
//! - **Lists** (`additional_images_paths`) are **merged** (appended)
//! - **Scalars** (port ranges, timeouts, paths) are **overridden** when set
//!
//! # Example
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! projects_path = "/srv/netsim/projects"
//!
//! [ports]
//! udp_start_port_range = 20000
//! udp_end_port_range = 20999
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    Config, ConsoleConfig, GeneralConfig, NotificationsConfig, PortsConfig, ServerConfig,
    UbridgeConfig, VpcsConfig,
};
