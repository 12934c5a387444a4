//! In-crate fakes shared by unit tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::compute::ComputeContext;
use crate::config::ConfigLoader;
use crate::node::{BackendError, Driver, DriverContext, InternalEndpoint, ProcessError, Started, Wiring};
use crate::ubridge::{
    BridgeCommand, BridgeHelper, BridgeLauncher, LaunchRequest, UbridgeError, UbridgeResult,
};

/// Records every command; optionally refuses namespace moves.
#[derive(Default)]
pub(crate) struct RecordingHelper {
    lines: Mutex<Vec<String>>,
    shutdowns: AtomicUsize,
    fail_ns: AtomicBool,
}

impl RecordingHelper {
    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_namespace_moves(&self) {
        self.fail_ns.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BridgeHelper for RecordingHelper {
    async fn send(&self, command: &BridgeCommand) -> UbridgeResult<Vec<String>> {
        self.lines.lock().unwrap().push(command.to_string());
        if let BridgeCommand::MoveToNs { tap, pid, .. } = command
            && self.fail_ns.load(Ordering::SeqCst)
        {
            return Err(UbridgeError::Namespace {
                tap: tap.clone(),
                pid: *pid,
                message: "No such process".to_string(),
            });
        }
        Ok(Vec::new())
    }

    async fn shutdown(&self) -> UbridgeResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out one shared [`RecordingHelper`].
#[derive(Default)]
pub(crate) struct RecordingLauncher {
    pub(crate) helper: Arc<RecordingHelper>,
}

#[async_trait]
impl BridgeLauncher for RecordingLauncher {
    async fn launch(&self, _request: LaunchRequest<'_>) -> UbridgeResult<Arc<dyn BridgeHelper>> {
        Ok(Arc::clone(&self.helper) as Arc<dyn BridgeHelper>)
    }
}

/// A compute context with projects under `dir`, no port probing and a
/// fake bridge launcher.
pub(crate) fn compute(dir: &Path, launcher: Arc<RecordingLauncher>) -> Arc<ComputeContext> {
    ComputeContext::builder(ConfigLoader::defaults().unwrap())
        .projects_path(dir.join("projects"))
        .probe_ports(false)
        .launcher(launcher)
        .build()
        .unwrap()
}

enum FakeEndpoint {
    Namespace,
    UdpTunnel,
}

/// A bridged driver whose backend is imaginary.
pub(crate) struct FakeDriver {
    endpoint: FakeEndpoint,
    pid: u32,
    stops: Arc<AtomicUsize>,
    fail_start: AtomicBool,
    regenerated: Arc<Mutex<Vec<String>>>,
}

impl FakeDriver {
    fn with(endpoint: FakeEndpoint, pid: u32) -> Self {
        Self {
            endpoint,
            pid,
            stops: Arc::default(),
            fail_start: AtomicBool::new(false),
            regenerated: Arc::default(),
        }
    }

    /// Container-like: TAP moved into the namespace of `pid`.
    pub(crate) fn namespace(pid: u32) -> Self {
        Self::with(FakeEndpoint::Namespace, pid)
    }

    /// Process-like: local UDP tunnel.
    pub(crate) fn udp_tunnel() -> Self {
        Self::with(FakeEndpoint::UdpTunnel, 1000)
    }

    pub(crate) fn stops(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.stops)
    }

    pub(crate) fn regenerated(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.regenerated)
    }

    pub(crate) fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn wiring(&self) -> Wiring {
        Wiring::Bridged
    }

    async fn start(&self, _node: DriverContext<'_>) -> Result<Started, BackendError> {
        if self.fail_start.swap(false, Ordering::SeqCst) {
            return Err(ProcessError::EarlyExit {
                status: "exit status: 1".to_string(),
            }
            .into());
        }
        Ok(Started {
            pid: Some(self.pid),
        })
    }

    async fn stop(&self, _node: DriverContext<'_>) -> Result<(), BackendError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn endpoint(&self, adapter: u32, started: &Started) -> Option<InternalEndpoint> {
        match self.endpoint {
            FakeEndpoint::Namespace => Some(InternalEndpoint::Namespace {
                tap: format!("tap-fake-e{adapter}"),
                pid: started.pid?,
                ifname: format!("eth{adapter}"),
            }),
            FakeEndpoint::UdpTunnel => {
                let base = 30001 + adapter as u16 * 2;
                Some(InternalEndpoint::Udp {
                    lport: base,
                    rhost: "127.0.0.1".to_string(),
                    rport: base + 1,
                })
            }
        }
    }

    async fn regenerate_configuration(&self, node: DriverContext<'_>) -> Result<(), BackendError> {
        self.regenerated.lock().unwrap().push(node.name.to_string());
        Ok(())
    }
}
