//! Host port allocation for consoles, bridge control channels and UDP tunnels.
//!
//! The port manager hands out ports from two bounded ranges: a TCP range used
//! for device consoles and bridge helper control sockets, and a UDP range used
//! for the local end of UDP tunnels. Every allocation is attributed to a
//! project so that closing a project can bulk-release whatever its nodes left
//! behind (a crashed backend never gets the chance to release its own ports).
//!
//! # Allocation Policy
//!
//! - The lowest port of the range that is neither allocated nor busy on the
//!   host wins. "Busy on the host" is checked by binding the candidate on the
//!   configured host address and dropping the socket straight away.
//! - Releasing is idempotent: releasing a free port is a no-op.
//! - A manager is scoped to one host address. Run one manager per bind address.
//!
//! # Example
//!
//! ```no_run
//! use netsim_compute::ports::PortManager;
//! use uuid::Uuid;
//!
//! let ports = PortManager::new("127.0.0.1".parse().unwrap(), 5000..=5100, 10000..=10100);
//! let project = Uuid::new_v4();
//!
//! let lport = ports.allocate_udp_port(project)?;
//! ports.release_udp_port(lport, project);
//! # Ok::<(), netsim_compute::ports::PortError>(())
//! ```

mod error;

pub use error::{PortError, PortResult};

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, TcpListener, UdpSocket};
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};
use uuid::Uuid;

/// Default TCP range for consoles and bridge control sockets.
pub const DEFAULT_CONSOLE_PORT_RANGE: RangeInclusive<u16> = 5000..=10000;

/// Default UDP range for tunnel endpoints.
pub const DEFAULT_UDP_PORT_RANGE: RangeInclusive<u16> = 10000..=20000;

/// Transport protocol of a port pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP (consoles, bridge helper control channels).
    Tcp,
    /// UDP (tunnel endpoints).
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// One contiguous range plus the ports currently handed out from it.
#[derive(Debug)]
struct PortPool {
    protocol: Protocol,
    range: RangeInclusive<u16>,
    /// Allocated port -> owning project.
    allocated: BTreeMap<u16, Uuid>,
}

impl PortPool {
    fn new(protocol: Protocol, range: RangeInclusive<u16>) -> Self {
        Self {
            protocol,
            range,
            allocated: BTreeMap::new(),
        }
    }

    fn allocate(
        &mut self,
        project: Uuid,
        range: RangeInclusive<u16>,
        host: IpAddr,
        probe: bool,
    ) -> PortResult<u16> {
        for port in range.clone() {
            if self.allocated.contains_key(&port) {
                continue;
            }
            if probe && !host_port_is_free(self.protocol, host, port) {
                debug!("{} port {} busy on {}, skipping", self.protocol, port, host);
                continue;
            }
            self.allocated.insert(port, project);
            debug!("Allocated {} port {} for project {}", self.protocol, port, project);
            return Ok(port);
        }

        Err(PortError::Exhausted {
            protocol: self.protocol,
            start: *range.start(),
            end: *range.end(),
        })
    }

    fn reserve(&mut self, port: u16, project: Uuid) -> PortResult<()> {
        if !self.range.contains(&port) {
            return Err(PortError::OutOfRange {
                protocol: self.protocol,
                port,
                start: *self.range.start(),
                end: *self.range.end(),
            });
        }

        match self.allocated.get(&port) {
            Some(owner) if *owner == project => Ok(()),
            Some(_) => Err(PortError::InUse {
                protocol: self.protocol,
                port,
            }),
            None => {
                self.allocated.insert(port, project);
                debug!("Reserved {} port {} for project {}", self.protocol, port, project);
                Ok(())
            }
        }
    }

    fn release(&mut self, port: u16, project: Uuid) {
        match self.allocated.get(&port) {
            Some(owner) if *owner == project => {
                self.allocated.remove(&port);
                debug!("Released {} port {} for project {}", self.protocol, port, project);
            }
            Some(owner) => {
                warn!(
                    "Refusing to release {} port {}: held by project {}, not {}",
                    self.protocol, port, owner, project
                );
            }
            None => {}
        }
    }

    fn release_all(&mut self, project: Uuid) -> Vec<u16> {
        let ports: Vec<u16> = self
            .allocated
            .iter()
            .filter(|(_, owner)| **owner == project)
            .map(|(port, _)| *port)
            .collect();
        for port in &ports {
            self.allocated.remove(port);
        }
        ports
    }

    fn free_count(&self) -> usize {
        let total = self.range.clone().count();
        let used = self
            .allocated
            .keys()
            .filter(|port| self.range.contains(port))
            .count();
        total - used
    }
}

/// Check whether a port can currently be bound on the host.
fn host_port_is_free(protocol: Protocol, host: IpAddr, port: u16) -> bool {
    match protocol {
        Protocol::Tcp => TcpListener::bind((host, port)).is_ok(),
        Protocol::Udp => UdpSocket::bind((host, port)).is_ok(),
    }
}

/// Allocates and releases console (TCP) and tunnel (UDP) ports.
///
/// All mutation goes through this type; pools are never shared otherwise.
#[derive(Debug)]
pub struct PortManager {
    /// Address candidate ports are probed on.
    host: IpAddr,
    /// Whether to probe the host before handing out a port.
    probe: bool,
    tcp: Mutex<PortPool>,
    udp: Mutex<PortPool>,
}

impl PortManager {
    /// Create a port manager for the given host and ranges.
    pub fn new(
        host: IpAddr,
        console_range: RangeInclusive<u16>,
        udp_range: RangeInclusive<u16>,
    ) -> Self {
        Self {
            host,
            probe: true,
            tcp: Mutex::new(PortPool::new(Protocol::Tcp, console_range)),
            udp: Mutex::new(PortPool::new(Protocol::Udp, udp_range)),
        }
    }

    /// Disable host probing (allocation then depends on bookkeeping alone).
    #[must_use]
    pub fn without_probe(mut self) -> Self {
        self.probe = false;
        self
    }

    /// The host address this manager is scoped to.
    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// Allocate the lowest free UDP port for a project.
    pub fn allocate_udp_port(&self, project: Uuid) -> PortResult<u16> {
        let mut pool = lock(&self.udp);
        let range = pool.range.clone();
        pool.allocate(project, range, self.host, self.probe)
    }

    /// Allocate the lowest free console (TCP) port for a project.
    ///
    /// `range` and `host` default to the configured console range and host.
    pub fn allocate_console_port(
        &self,
        project: Uuid,
        range: Option<RangeInclusive<u16>>,
        host: Option<IpAddr>,
    ) -> PortResult<u16> {
        let mut pool = lock(&self.tcp);
        let range = range.unwrap_or_else(|| pool.range.clone());
        pool.allocate(project, range, host.unwrap_or(self.host), self.probe)
    }

    /// Claim a specific UDP port for a project.
    ///
    /// Claiming a port the same project already holds succeeds.
    pub fn reserve_udp_port(&self, port: u16, project: Uuid) -> PortResult<()> {
        lock(&self.udp).reserve(port, project)
    }

    /// Claim a specific TCP port for a project.
    pub fn reserve_tcp_port(&self, port: u16, project: Uuid) -> PortResult<()> {
        lock(&self.tcp).reserve(port, project)
    }

    /// Release a UDP port. Releasing a free port is a no-op.
    pub fn release_udp_port(&self, port: u16, project: Uuid) {
        lock(&self.udp).release(port, project);
    }

    /// Release a TCP port. Releasing a free port is a no-op.
    pub fn release_tcp_port(&self, port: u16, project: Uuid) {
        lock(&self.tcp).release(port, project);
    }

    /// Free every port still attributed to a project.
    ///
    /// Returns the number of ports released.
    pub fn release_all(&self, project: Uuid) -> usize {
        let tcp = lock(&self.tcp).release_all(project);
        let udp = lock(&self.udp).release_all(project);
        if !tcp.is_empty() || !udp.is_empty() {
            debug!(
                "Released {} tcp and {} udp ports left by project {}",
                tcp.len(),
                udp.len(),
                project
            );
        }
        tcp.len() + udp.len()
    }

    /// Number of UDP ports of the configured range not currently allocated.
    pub fn free_udp_count(&self) -> usize {
        lock(&self.udp).free_count()
    }

    /// Number of TCP ports of the configured range not currently allocated.
    pub fn free_tcp_count(&self) -> usize {
        lock(&self.tcp).free_count()
    }

    /// Whether a UDP port is currently allocated.
    pub fn is_udp_allocated(&self, port: u16) -> bool {
        lock(&self.udp).allocated.contains_key(&port)
    }

    /// Whether a TCP port is currently allocated.
    pub fn is_tcp_allocated(&self, port: u16) -> bool {
        lock(&self.tcp).allocated.contains_key(&port)
    }

    /// Ports held by a project, as `(protocol, port)` pairs in ascending order.
    pub fn allocated_ports(&self, project: Uuid) -> Vec<(Protocol, u16)> {
        let mut ports = Vec::new();
        for pool in [&self.tcp, &self.udp] {
            let pool = lock(pool);
            ports.extend(
                pool.allocated
                    .iter()
                    .filter(|(_, owner)| **owner == project)
                    .map(|(port, _)| (pool.protocol, *port)),
            );
        }
        ports
    }
}

/// Lock a pool, recovering the data if a previous holder panicked.
fn lock(pool: &Mutex<PortPool>) -> MutexGuard<'_, PortPool> {
    pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn manager(udp: RangeInclusive<u16>) -> PortManager {
        PortManager::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000..=5010, udp).without_probe()
    }

    #[test]
    fn test_allocates_lowest_free_port() {
        let ports = manager(10000..=10010);
        let project = Uuid::new_v4();

        assert_eq!(ports.allocate_udp_port(project).unwrap(), 10000);
        assert_eq!(ports.allocate_udp_port(project).unwrap(), 10001);

        ports.release_udp_port(10000, project);
        assert_eq!(ports.allocate_udp_port(project).unwrap(), 10000);
    }

    #[test]
    fn test_exhaustion() {
        let ports = manager(10000..=10001);
        let project = Uuid::new_v4();

        ports.allocate_udp_port(project).unwrap();
        ports.allocate_udp_port(project).unwrap();
        let err = ports.allocate_udp_port(project).unwrap_err();
        assert!(matches!(err, PortError::Exhausted { protocol: Protocol::Udp, .. }));
    }

    #[test]
    fn test_release_is_idempotent() {
        let ports = manager(10000..=10003);
        let project = Uuid::new_v4();
        let port = ports.allocate_udp_port(project).unwrap();

        ports.release_udp_port(port, project);
        ports.release_udp_port(port, project);
        ports.release_udp_port(10003, project);

        assert_eq!(ports.free_udp_count(), 4);
    }

    #[test]
    fn test_no_double_allocation_under_churn() {
        let ports = manager(10000..=10004);
        let project = Uuid::new_v4();
        let mut held = Vec::new();

        for round in 0..20 {
            if round % 3 == 2
                && let Some(port) = held.pop()
            {
                ports.release_udp_port(port, project);
                ports.release_udp_port(port, project);
            } else if let Ok(port) = ports.allocate_udp_port(project) {
                assert!(!held.contains(&port), "port {port} handed out twice");
                held.push(port);
            }
            assert_eq!(ports.free_udp_count(), 5 - held.len());
        }
    }

    #[test]
    fn test_release_all_only_touches_project() {
        let ports = manager(10000..=10010);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        ports.allocate_udp_port(first).unwrap();
        ports.allocate_console_port(first, None, None).unwrap();
        let kept = ports.allocate_udp_port(second).unwrap();

        assert_eq!(ports.release_all(first), 2);
        assert!(ports.is_udp_allocated(kept));
        assert_eq!(ports.allocated_ports(second), vec![(Protocol::Udp, kept)]);
        assert!(ports.allocated_ports(first).is_empty());
    }

    #[test]
    fn test_release_by_other_project_is_ignored() {
        let ports = manager(10000..=10010);
        let owner = Uuid::new_v4();
        let port = ports.allocate_udp_port(owner).unwrap();

        ports.release_udp_port(port, Uuid::new_v4());
        assert!(ports.is_udp_allocated(port));
    }

    #[test]
    fn test_reserve() {
        let ports = manager(10000..=10010);
        let owner = Uuid::new_v4();

        ports.reserve_udp_port(10005, owner).unwrap();
        ports.reserve_udp_port(10005, owner).unwrap();
        assert!(matches!(
            ports.reserve_udp_port(10005, Uuid::new_v4()),
            Err(PortError::InUse { port: 10005, .. })
        ));
        assert!(matches!(
            ports.reserve_udp_port(30000, owner),
            Err(PortError::OutOfRange { port: 30000, .. })
        ));
    }

    #[test]
    fn test_console_port_custom_range() {
        let ports = manager(10000..=10010);
        let project = Uuid::new_v4();

        let port = ports
            .allocate_console_port(project, Some(6000..=6001), None)
            .unwrap();
        assert_eq!(port, 6000);
        assert!(ports.is_tcp_allocated(6000));
    }

    #[test]
    fn test_probe_skips_busy_port() {
        let busy = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy_port = busy.local_addr().unwrap().port();
        let ports = PortManager::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            5000..=5010,
            busy_port..=busy_port.saturating_add(1),
        );

        let port = ports.allocate_udp_port(Uuid::new_v4()).unwrap();
        assert_ne!(port, busy_port);
    }
}
