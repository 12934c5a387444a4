//! Error types for port allocation.

use thiserror::Error;

use super::Protocol;

/// Errors from the port manager.
#[derive(Debug, Error)]
pub enum PortError {
    /// Every port of the searched range is allocated or busy on the host.
    #[error("No free {protocol} port in range {start}-{end}")]
    Exhausted {
        /// Transport protocol of the pool.
        protocol: Protocol,
        /// First port of the searched range.
        start: u16,
        /// Last port of the searched range.
        end: u16,
    },

    /// A specific port was requested but another project holds it.
    #[error("Port {port}/{protocol} is already in use")]
    InUse {
        /// Transport protocol of the pool.
        protocol: Protocol,
        /// The requested port.
        port: u16,
    },

    /// A specific port was requested outside the configured range.
    #[error("Port {port}/{protocol} is outside the range {start}-{end}")]
    OutOfRange {
        /// Transport protocol of the pool.
        protocol: Protocol,
        /// The requested port.
        port: u16,
        /// First port of the configured range.
        start: u16,
        /// Last port of the configured range.
        end: u16,
    },
}

/// Result type for port operations.
pub type PortResult<T> = Result<T, PortError>;
