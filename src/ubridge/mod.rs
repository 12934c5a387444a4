//! Bridge helper (uBridge) client.
//!
//! Frames between a backend's internal interface and a NIO are relayed by an
//! external helper process driven over a line-oriented TCP control protocol.
//! Each started node that needs bridging gets its own helper process.
//!
//! # Architecture
//!
//! ```text
//! Node ──► BridgeLauncher::launch ──► ubridge -H 127.0.0.1:<port>
//!   │                                      ▲
//!   └──► Bridge (state machine) ──send──► BridgeHelper (UbridgeHypervisor)
//!
//!   bridge create bridge0
//!   bridge add_nio_tap bridge0 tap-nsim-e0
//!   docker move_to_ns tap-nsim-e0 4242 eth0
//!   bridge add_nio_udp bridge0 10001 127.0.0.1 10002
//!   bridge start bridge0
//! ```
//!
//! # Errors
//!
//! A `2xx-` reply becomes [`UbridgeError::Command`], except for
//! `docker move_to_ns` which becomes [`UbridgeError::Namespace`]: callers
//! abort node start on it rather than retrying. Every command is bounded by
//! the configured command timeout ([`UbridgeError::Timeout`]).

pub mod bridge;
mod error;
mod hypervisor;
mod protocol;

pub use bridge::{Bridge, BridgeState, LinkClaims};
pub use error::{UbridgeError, UbridgeResult};
pub use hypervisor::{UbridgeHypervisor, UbridgeLauncher, MIN_UBRIDGE_VERSION};
pub use protocol::{parse_reply_line, parse_version, BridgeCommand, ReplyLine, ReplyParser};

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

/// A connection to a running bridge helper.
#[async_trait]
pub trait BridgeHelper: Send + Sync {
    /// Send one command and wait for its complete reply.
    async fn send(&self, command: &BridgeCommand) -> UbridgeResult<Vec<String>>;

    /// Stop the helper and release what it holds.
    async fn shutdown(&self) -> UbridgeResult<()>;
}

/// What a launcher needs to know about the node it serves.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    /// Node the helper serves.
    pub node_id: Uuid,
    /// Project the control port is attributed to.
    pub project_id: Uuid,
    /// Directory the helper runs in and logs to.
    pub working_dir: &'a Path,
}

/// Starts bridge helpers.
#[async_trait]
pub trait BridgeLauncher: Send + Sync {
    /// Start a helper for a node and return a connected client.
    async fn launch(&self, request: LaunchRequest<'_>) -> UbridgeResult<Arc<dyn BridgeHelper>>;
}
