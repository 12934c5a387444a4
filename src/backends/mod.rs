//! Concrete backend types.
//!
//! | Backend           | Wiring  | Working dir | Console | Internal endpoint          |
//! |-------------------|---------|-------------|---------|----------------------------|
//! | `ethernet_switch` | direct  | no          | no      | in-process UDP relay       |
//! | `vpcs`            | bridged | yes         | yes     | local UDP tunnel           |
//! | `docker`          | bridged | yes         | no      | TAP moved into a namespace |
//!
//! Each type implements [`Backend`](crate::manager::Backend) and is used
//! through a [`Manager`](crate::manager::Manager).

pub mod docker;
pub mod ethernet_switch;
pub mod vpcs;

pub use docker::{ContainerEngine, ContainerRequest, Docker, DockerParams};
pub use ethernet_switch::{EthernetSwitch, EthernetSwitchParams};
pub use vpcs::{Vpcs, VpcsParams};
