//! Error types for the bridge helper client.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use super::bridge::BridgeState;

/// Errors from bridge helper communication and bridge bookkeeping.
#[derive(Debug, Error)]
pub enum UbridgeError {
    /// Failed to spawn the helper executable.
    #[error("Failed to launch bridge helper {path}: {source}")]
    Launch {
        /// Helper executable.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to connect to the helper's control port.
    #[error("Failed to connect to bridge helper at {addr}: {source}")]
    Connect {
        /// Control address.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The helper answered a command with an error line.
    #[error("Bridge helper rejected '{command}': {message}")]
    Command {
        /// The command line sent.
        command: String,
        /// The helper's error text.
        message: String,
    },

    /// The helper sent something that is not a hypervisor reply.
    #[error("Malformed bridge helper reply: {0}")]
    Protocol(String),

    /// No complete reply within the command timeout.
    #[error("No reply to '{command}' within {secs}s")]
    Timeout {
        /// The command line sent.
        command: String,
        /// The bound that elapsed.
        secs: u64,
    },

    /// `docker move_to_ns` failed.
    #[error("Failed to move {tap} into namespace of PID {pid}: {message}")]
    Namespace {
        /// Host-side TAP device.
        tap: String,
        /// Target process.
        pid: u32,
        /// Helper's error text.
        message: String,
    },

    /// A bridge operation is not valid in the bridge's current state.
    #[error("Bridge {bridge} is {state}, cannot {operation}")]
    InvalidState {
        /// Bridge name.
        bridge: String,
        /// Current state.
        state: BridgeState,
        /// Attempted operation.
        operation: &'static str,
    },

    /// A capture is already running on the bridge.
    #[error("Bridge {bridge} is already capturing")]
    CaptureActive {
        /// Bridge name.
        bridge: String,
    },

    /// A NIO is already relayed by another bridge.
    #[error("NIO {nio} is already attached to bridge {bridge}")]
    NioInUse {
        /// NIO key.
        nio: String,
        /// Bridge holding it.
        bridge: String,
    },

    /// The helper connection was closed.
    #[error("Bridge helper is not running")]
    NotRunning,

    /// Generic I/O error on the control channel.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bridge helper operations.
pub type UbridgeResult<T> = Result<T, UbridgeError>;
