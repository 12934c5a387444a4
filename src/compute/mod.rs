//! The service bundle shared by every manager and node.
//!
//! One [`ComputeContext`] is built at process start and handed to each
//! backend manager; tests build isolated instances with fakes through
//! [`ComputeContextBuilder`].
//!
//! # Example
//!
//! ```no_run
//! use netsim_compute::compute::ComputeContext;
//! use netsim_compute::config::ConfigLoader;
//!
//! let config = ConfigLoader::defaults().unwrap();
//! let compute = ComputeContext::builder(config).build().unwrap();
//! assert_eq!(compute.notifications().listener_count(), 0);
//! ```

mod error;

pub use error::{ComputeError, ComputeResult};

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::notification::NotificationManager;
use crate::ports::PortManager;
use crate::project::ProjectRegistry;
use crate::telemetry::AuditLogger;
use crate::ubridge::{BridgeLauncher, LinkClaims, UbridgeLauncher};

/// Services injected into managers and nodes.
pub struct ComputeContext {
    config: Config,
    ports: Arc<PortManager>,
    notifications: NotificationManager,
    projects: ProjectRegistry,
    links: LinkClaims,
    launcher: Arc<dyn BridgeLauncher>,
    audit: Arc<AuditLogger>,
    migration_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("ports", &self.ports)
            .field("notifications", &self.notifications)
            .field("projects", &self.projects.root())
            .finish_non_exhaustive()
    }
}

impl ComputeContext {
    /// Start building a context from a validated configuration.
    pub fn builder(config: Config) -> ComputeContextBuilder {
        ComputeContextBuilder {
            config,
            launcher: None,
            audit: None,
            probe_ports: true,
            projects_path: None,
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Port allocator.
    pub fn ports(&self) -> &Arc<PortManager> {
        &self.ports
    }

    /// Event fan-out.
    pub fn notifications(&self) -> &NotificationManager {
        &self.notifications
    }

    /// Open projects.
    pub fn projects(&self) -> &ProjectRegistry {
        &self.projects
    }

    /// Which bridge relays which host link.
    pub fn links(&self) -> &LinkClaims {
        &self.links
    }

    /// Starts bridge helpers for bridged nodes.
    pub fn launcher(&self) -> &Arc<dyn BridgeLauncher> {
        &self.launcher
    }

    /// Audit trail.
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Serializes legacy project migrations.
    pub(crate) fn migration_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.migration_lock
    }
}

/// Builder for [`ComputeContext`].
pub struct ComputeContextBuilder {
    config: Config,
    launcher: Option<Arc<dyn BridgeLauncher>>,
    audit: Option<Arc<AuditLogger>>,
    probe_ports: bool,
    projects_path: Option<PathBuf>,
}

impl ComputeContextBuilder {
    /// Use a custom bridge launcher instead of spawning `ubridge`.
    #[must_use]
    pub fn launcher(mut self, launcher: Arc<dyn BridgeLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Write audit events to this logger instead of discarding them.
    #[must_use]
    pub fn audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Whether port allocation probes the host.
    #[must_use]
    pub fn probe_ports(mut self, probe: bool) -> Self {
        self.probe_ports = probe;
        self
    }

    /// Override the projects directory.
    #[must_use]
    pub fn projects_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.projects_path = Some(path.into());
        self
    }

    /// Validate the configuration and assemble the services.
    pub fn build(self) -> ComputeResult<Arc<ComputeContext>> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| ComputeError::Validation(e.to_string()))?;
        let host = config
            .server
            .host_addr()
            .map_err(|e| ComputeError::Validation(e.to_string()))?;

        let mut ports = PortManager::new(host, config.ports.console_range(), config.ports.udp_range());
        if !self.probe_ports {
            ports = ports.without_probe();
        }
        let ports = Arc::new(ports);

        let projects_path = self
            .projects_path
            .unwrap_or_else(|| config.server.projects_dir());
        let launcher = self.launcher.unwrap_or_else(|| {
            Arc::new(UbridgeLauncher::new(
                PathBuf::from(&config.ubridge.path),
                Arc::clone(&ports),
                config.ubridge.connect_timeout(),
                config.ubridge.command_timeout(),
            ))
        });

        Ok(Arc::new(ComputeContext {
            notifications: NotificationManager::new(
                config.notifications.queue_capacity,
                projects_path.clone(),
            ),
            projects: ProjectRegistry::new(projects_path, Arc::clone(&ports)),
            ports,
            links: LinkClaims::new(),
            launcher,
            audit: self.audit.unwrap_or_else(|| Arc::new(AuditLogger::disabled())),
            migration_lock: tokio::sync::Mutex::new(()),
            config,
        }))
    }
}
