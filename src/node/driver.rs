//! The capability every backend implements.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::adapter::Adapter;
use super::error::BackendError;
use crate::compute::ComputeContext;
use crate::nio::{LinkType, Nio};

/// How a backend's adapters reach their NIOs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wiring {
    /// The driver relays NIOs itself (`attach_nio`/`detach_nio`).
    Direct,
    /// A bridge helper relays between an internal endpoint and the NIO.
    Bridged,
}

/// The backend side of a bridged adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternalEndpoint {
    /// The backend listens on a local UDP tunnel.
    Udp {
        /// Port the bridge binds.
        lport: u16,
        /// Backend address.
        rhost: String,
        /// Port the backend binds.
        rport: u16,
    },
    /// An existing host TAP device.
    Tap {
        /// Device name.
        device: String,
    },
    /// A TAP created by the helper and moved into a process' namespace.
    Namespace {
        /// Host-side TAP device name.
        tap: String,
        /// Process owning the namespace.
        pid: u32,
        /// Interface name inside the namespace.
        ifname: String,
    },
}

/// What a successful start reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Started {
    /// Backend process or container PID.
    pub pid: Option<u32>,
}

/// Node facts handed to driver calls.
#[derive(Clone, Copy)]
pub struct DriverContext<'a> {
    /// Node identifier.
    pub node_id: Uuid,
    /// Current display name.
    pub name: &'a str,
    /// Owning project.
    pub project_id: Uuid,
    /// Node working directory, for backends that have one.
    pub working_dir: Option<&'a Path>,
    /// Console port, for backends that have one.
    pub console: Option<u16>,
    /// Adapters and their bound NIOs.
    pub adapters: &'a [Adapter],
    /// Shared services.
    pub compute: &'a Arc<ComputeContext>,
}

/// Backend-specific lifecycle.
///
/// Drivers keep their own runtime state (PIDs, container ids) behind
/// interior mutability. Default implementations cover the operations a
/// backend may lack.
#[async_trait]
pub trait Driver: Send + Sync {
    /// How adapters are wired.
    fn wiring(&self) -> Wiring;

    /// Called once when the node is created.
    async fn create(&self, _node: DriverContext<'_>) -> Result<(), BackendError> {
        Ok(())
    }

    /// Start the backend.
    async fn start(&self, node: DriverContext<'_>) -> Result<Started, BackendError>;

    /// Stop the backend.
    async fn stop(&self, node: DriverContext<'_>) -> Result<(), BackendError>;

    /// Pause the backend.
    async fn suspend(&self, _node: DriverContext<'_>) -> Result<(), BackendError> {
        Err(BackendError::Unsupported {
            operation: "suspend",
        })
    }

    /// Resume a paused backend.
    async fn resume(&self, _node: DriverContext<'_>) -> Result<(), BackendError> {
        Err(BackendError::Unsupported { operation: "resume" })
    }

    /// Release everything the backend holds. The node is stopped first.
    async fn close(&self, _node: DriverContext<'_>) -> Result<(), BackendError> {
        Ok(())
    }

    /// Backend side of a bridged adapter while started.
    fn endpoint(&self, _adapter: u32, _started: &Started) -> Option<InternalEndpoint> {
        None
    }

    /// Connect a NIO on a started, directly wired node.
    async fn attach_nio(
        &self,
        _node: DriverContext<'_>,
        _adapter: u32,
        _port: u32,
        _nio: &Nio,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    /// Disconnect a NIO on a started, directly wired node.
    async fn detach_nio(
        &self,
        _node: DriverContext<'_>,
        _adapter: u32,
        _port: u32,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    /// Filters or the suspend flag of a connected NIO changed.
    async fn update_nio(
        &self,
        _node: DriverContext<'_>,
        _adapter: u32,
        _port: u32,
        _nio: &Nio,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    /// Start a capture on a started, directly wired node.
    async fn capture_start(
        &self,
        _node: DriverContext<'_>,
        _adapter: u32,
        _port: u32,
        _path: &Path,
        _link_type: LinkType,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported {
            operation: "packet capture",
        })
    }

    /// Stop a capture on a started, directly wired node.
    async fn capture_stop(
        &self,
        _node: DriverContext<'_>,
        _adapter: u32,
        _port: u32,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    /// Rewrite files derived from the node's name or settings.
    async fn regenerate_configuration(&self, _node: DriverContext<'_>) -> Result<(), BackendError> {
        Ok(())
    }
}
