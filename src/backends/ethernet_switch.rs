//! In-process learning Ethernet switch.
//!
//! Every port is a UDP tunnel relayed by its own task. Frames are forwarded
//! by destination MAC once the switch has seen it as a source, flooded
//! otherwise. The switch has no working directory and no console.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::compute::{ComputeContext, ComputeError, ComputeResult};
use crate::manager::Backend;
use crate::nio::{Nio, NioKind};
use crate::node::{Adapter, BackendError, Driver, DriverContext, NodeSpec, Started, Wiring};

/// Ports on a switch created without settings.
pub const DEFAULT_PORTS: u32 = 8;

const MAX_FRAME: usize = 65535;
const HEADER_LEN: usize = 14;

type Mac = [u8; 6];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Switch settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EthernetSwitchParams {
    /// Number of ports.
    pub ports: Option<u32>,
}

/// The `ethernet_switch` backend.
#[derive(Debug, Default)]
pub struct EthernetSwitch;

impl Backend for EthernetSwitch {
    const NAME: &'static str = "ethernet_switch";
    const HAS_WORKING_DIRECTORY: bool = false;
    type Params = EthernetSwitchParams;

    fn adapters(&self, params: &EthernetSwitchParams) -> ComputeResult<Vec<Adapter>> {
        match params.ports.unwrap_or(DEFAULT_PORTS) {
            0 => Err(ComputeError::Validation(
                "An Ethernet switch needs at least one port".to_string(),
            )),
            ports => Ok(vec![Adapter::with_ports(0, ports)]),
        }
    }

    fn driver(
        &self,
        _spec: &NodeSpec,
        _params: EthernetSwitchParams,
        _compute: &Arc<ComputeContext>,
    ) -> ComputeResult<Box<dyn Driver>> {
        Ok(Box::new(SwitchDriver::default()))
    }
}

struct PortLink {
    socket: Arc<UdpSocket>,
    suspended: bool,
}

/// Port sockets and the MAC address table.
#[derive(Default)]
struct Fabric {
    ports: Mutex<HashMap<u32, PortLink>>,
    macs: Mutex<HashMap<Mac, u32>>,
}

impl Fabric {
    /// Sockets a frame received on `ingress` goes out of.
    fn forward(&self, ingress: u32, frame: &[u8]) -> Vec<Arc<UdpSocket>> {
        if frame.len() < HEADER_LEN {
            return Vec::new();
        }
        let ports = lock(&self.ports);
        if ports.get(&ingress).is_none_or(|p| p.suspended) {
            return Vec::new();
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&frame[..6]);
        src.copy_from_slice(&frame[6..12]);

        let mut macs = lock(&self.macs);
        if src[0] & 1 == 0 {
            macs.insert(src, ingress);
        }
        let known = if dst[0] & 1 == 0 { macs.get(&dst).copied() } else { None };

        match known {
            Some(egress) if egress == ingress => Vec::new(),
            Some(egress) => ports
                .get(&egress)
                .filter(|p| !p.suspended)
                .map(|p| vec![Arc::clone(&p.socket)])
                .unwrap_or_default(),
            None => ports
                .iter()
                .filter(|(port, link)| **port != ingress && !link.suspended)
                .map(|(_, link)| Arc::clone(&link.socket))
                .collect(),
        }
    }

    fn forget_port(&self, port: u32) {
        lock(&self.ports).remove(&port);
        lock(&self.macs).retain(|_, p| *p != port);
    }

    /// MAC addresses learned per port.
    fn table(&self) -> HashMap<Mac, u32> {
        lock(&self.macs).clone()
    }
}

async fn relay(fabric: Arc<Fabric>, port: u32, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_FRAME];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                // ICMP errors of earlier sends surface here.
                trace!("Switch port {} receive error: {}", port, e);
                continue;
            }
        };
        let frame = &buf[..n];
        for egress in fabric.forward(port, frame) {
            if let Err(e) = egress.send(frame).await {
                trace!("Switch port {} send error: {}", port, e);
            }
        }
    }
}

/// Relays frames between the switch's UDP NIOs.
#[derive(Default)]
pub struct SwitchDriver {
    fabric: Arc<Fabric>,
    tasks: Mutex<HashMap<u32, JoinHandle<()>>>,
}

impl SwitchDriver {
    fn stop_port(&self, port: u32) {
        if let Some(task) = lock(&self.tasks).remove(&port) {
            task.abort();
        }
        self.fabric.forget_port(port);
    }

    fn stop_all(&self) {
        let ports: Vec<u32> = lock(&self.tasks).keys().copied().collect();
        for port in ports {
            self.stop_port(port);
        }
    }
}

impl Drop for SwitchDriver {
    fn drop(&mut self) {
        for (_, task) in lock(&self.tasks).drain() {
            task.abort();
        }
    }
}

#[async_trait]
impl Driver for SwitchDriver {
    fn wiring(&self) -> Wiring {
        Wiring::Direct
    }

    async fn start(&self, node: DriverContext<'_>) -> Result<Started, BackendError> {
        info!(node_id = %node.node_id, node = node.name, "Ethernet switch started");
        Ok(Started::default())
    }

    async fn stop(&self, node: DriverContext<'_>) -> Result<(), BackendError> {
        self.stop_all();
        info!(node_id = %node.node_id, node = node.name, "Ethernet switch stopped");
        Ok(())
    }

    async fn close(&self, _node: DriverContext<'_>) -> Result<(), BackendError> {
        self.stop_all();
        Ok(())
    }

    async fn attach_nio(
        &self,
        node: DriverContext<'_>,
        _adapter: u32,
        port: u32,
        nio: &Nio,
    ) -> Result<(), BackendError> {
        let (lport, rhost, rport) = match nio.kind() {
            NioKind::Udp { lport, rhost, rport } => (*lport, rhost.as_str(), *rport),
            NioKind::Null => return Ok(()),
            other => {
                return Err(BackendError::Switch(format!(
                    "Only UDP tunnels can be attached to switch ports, got {other:?}"
                )));
            }
        };
        let local = SocketAddr::new(node.compute.ports().host(), lport);
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| BackendError::Switch(format!("Cannot bind {local}: {e}")))?;
        socket
            .connect((rhost, rport))
            .await
            .map_err(|e| BackendError::Switch(format!("Cannot reach {rhost}:{rport}: {e}")))?;
        let socket = Arc::new(socket);

        self.stop_port(port);
        lock(&self.fabric.ports).insert(
            port,
            PortLink {
                socket: Arc::clone(&socket),
                suspended: nio.is_suspended(),
            },
        );
        let task = tokio::spawn(relay(Arc::clone(&self.fabric), port, socket));
        lock(&self.tasks).insert(port, task);
        debug!(node_id = %node.node_id, "Switch port {} relaying {} <-> {}:{}", port, lport, rhost, rport);
        Ok(())
    }

    async fn detach_nio(
        &self,
        node: DriverContext<'_>,
        _adapter: u32,
        port: u32,
    ) -> Result<(), BackendError> {
        self.stop_port(port);
        debug!(node_id = %node.node_id, "Switch port {} detached", port);
        Ok(())
    }

    async fn update_nio(
        &self,
        _node: DriverContext<'_>,
        _adapter: u32,
        port: u32,
        nio: &Nio,
    ) -> Result<(), BackendError> {
        if let Some(link) = lock(&self.fabric.ports).get_mut(&port) {
            link.suspended = nio.is_suspended();
        }
        Ok(())
    }
}
