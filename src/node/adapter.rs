//! Network adapters and their port slots.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::compute::{ComputeError, ComputeResult};
use crate::nio::Nio;

/// A numbered network interface of a node.
///
/// Each port slot holds at most one NIO.
#[derive(Debug, Clone)]
pub struct Adapter {
    number: u32,
    port_count: u32,
    nios: BTreeMap<u32, Nio>,
}

impl Adapter {
    /// Single-port adapter.
    pub fn new(number: u32) -> Self {
        Self::with_ports(number, 1)
    }

    /// Adapter with `port_count` slots.
    pub fn with_ports(number: u32, port_count: u32) -> Self {
        Self {
            number,
            port_count,
            nios: BTreeMap::new(),
        }
    }

    /// Adapter number.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Number of port slots.
    pub fn port_count(&self) -> u32 {
        self.port_count
    }

    /// NIO bound to a port slot.
    pub fn nio(&self, port: u32) -> Option<&Nio> {
        self.nios.get(&port)
    }

    pub(crate) fn nio_mut(&mut self, port: u32) -> Option<&mut Nio> {
        self.nios.get_mut(&port)
    }

    /// Bound NIOs by port number.
    pub fn nios(&self) -> impl Iterator<Item = (u32, &Nio)> {
        self.nios.iter().map(|(port, nio)| (*port, nio))
    }

    pub(crate) fn check_port(&self, port: u32) -> ComputeResult<()> {
        if port >= self.port_count {
            return Err(ComputeError::Validation(format!(
                "Port {} does not exist on adapter {} ({} ports)",
                port, self.number, self.port_count
            )));
        }
        Ok(())
    }

    /// Bind a NIO to a free slot.
    pub fn bind(&mut self, port: u32, nio: Nio) -> ComputeResult<()> {
        self.check_port(port)?;
        if let Some(existing) = self.nios.get(&port) {
            return Err(ComputeError::Conflict(format!(
                "Adapter {} port {} is already connected to {}",
                self.number, port, existing
            )));
        }
        self.nios.insert(port, nio);
        Ok(())
    }

    /// Remove the NIO from a slot.
    pub fn unbind(&mut self, port: u32) -> Option<Nio> {
        self.nios.remove(&port)
    }

    /// Remove every NIO.
    pub(crate) fn clear(&mut self) -> Vec<Nio> {
        std::mem::take(&mut self.nios).into_values().collect()
    }
}

/// Serialized view of a bound slot.
#[derive(Debug, Clone, Serialize)]
pub struct PortBinding {
    /// Adapter number.
    pub adapter_number: u32,
    /// Port number inside the adapter.
    pub port_number: u32,
    /// The bound NIO.
    pub nio: Nio,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_nio_per_slot() {
        let mut adapter = Adapter::new(0);
        adapter.bind(0, Nio::udp(10001, "127.0.0.1", 10002)).unwrap();

        let err = adapter.bind(0, Nio::null()).unwrap_err();
        assert!(matches!(err, ComputeError::Conflict(_)));

        assert!(adapter.unbind(0).is_some());
        adapter.bind(0, Nio::null()).unwrap();
    }

    #[test]
    fn test_port_out_of_range() {
        let mut adapter = Adapter::with_ports(0, 8);
        adapter.bind(7, Nio::null()).unwrap();
        assert!(matches!(
            adapter.bind(8, Nio::null()),
            Err(ComputeError::Validation(_))
        ));
    }
}
