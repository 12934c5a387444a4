//! netsim-compute: the compute side of a network simulation host.
//!
//! This crate manages emulated network devices ("nodes") on one host: it
//! allocates console and UDP tunnel ports, describes node endpoints as NIOs,
//! wires them through the uBridge helper, fans lifecycle events out to
//! subscribers and proxies device consoles to a terminal or telnet viewers.
//!
//! # Architecture
//!
//! - **Compute**: [`ComputeContext`](compute::ComputeContext) owns the shared
//!   services every manager needs
//! - **Ports**: per-host TCP console and UDP tunnel allocation
//! - **NIO**: endpoint descriptions (UDP tunnel, TAP, Ethernet, null)
//! - **uBridge**: line protocol client for the bridge helper process
//! - **Node / Manager**: node lifecycle and per-backend registries
//! - **Notification**: bounded per-subscriber event queues
//! - **Console**: UNIX datagram console proxy with locking
//! - **Telemetry**: structured syslog logging for audit trails

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod backends;
pub mod cleanup;
pub mod cli;
pub mod cli_handler;
pub mod compute;
pub mod config;
pub mod console;
pub mod manager;
pub mod nio;
pub mod node;
pub mod notification;
pub mod ports;
pub mod project;
pub mod telemetry;
pub mod ubridge;

#[cfg(test)]
pub(crate) mod test_support;
