//! Nodes: supervised instances of emulated network devices.
//!
//! A [`Node`] owns its adapters and the NIOs bound to them. Everything
//! backend-specific sits behind the [`Driver`] trait; the node itself
//! implements the shared lifecycle:
//!
//! ```text
//! start:  reserve NIO ports ─► Driver::start ─► launch bridge helper
//!         └─► per adapter: bridge create ─► attach internal endpoint
//!             (TAP + namespace move / UDP tunnel) ─► add NIO ─► filters
//!             ─► bridge start ─► capture
//! stop:   bridge delete ─► helper shutdown ─► Driver::stop ─► release ports
//! ```
//!
//! Directly wired drivers (in-process switches) skip the helper and get
//! `attach_nio`/`detach_nio` calls instead.
//!
//! # Errors
//!
//! Driver failures are logged with the node id, name and operation, emitted
//! as `log.error` notifications and returned as
//! [`ComputeError::Backend`](crate::compute::ComputeError::Backend).
//! Failures that only mean "already in that state" count as success.

mod adapter;
mod driver;
mod error;
mod instance;

pub use adapter::{Adapter, PortBinding};
pub use driver::{Driver, DriverContext, InternalEndpoint, Started, Wiring};
pub use error::{BackendError, ContainerEngineError, ProcessError};
pub use instance::{Node, NodeInfo, NodeSpec, NodeStatus};
