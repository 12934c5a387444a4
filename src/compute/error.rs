//! The uniform error contract of the Manager/Node boundary.
//!
//! Subsystem errors (`PortError`, `UbridgeError`, `BackendError`) are folded
//! into [`ComputeError`] so callers see one taxonomy regardless of backend.

use std::path::PathBuf;

use thiserror::Error;

use crate::node::BackendError;
use crate::ports::PortError;
use crate::ubridge::UbridgeError;

/// Errors surfaced by managers, nodes and NIOs.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// Node, project or file absent (or hidden by project scoping).
    #[error("{0}")]
    NotFound(String),

    /// Malformed identifier, settings or path.
    #[error("{0}")]
    Validation(String),

    /// A pool (ports, addresses) has nothing left.
    #[error("{0}")]
    ResourceExhausted(String),

    /// The request clashes with current state (duplicate binding,
    /// capture already running, link down).
    #[error("{0}")]
    Conflict(String),

    /// The host refuses the operation (missing privileges).
    #[error("{0}")]
    Forbidden(String),

    /// No image matched a relative or absolute image reference.
    #[error("Image '{image}' could not be found")]
    ImageMissing {
        /// The path as requested.
        image: String,
    },

    /// A backend driver failed.
    #[error("{node}: {operation} failed: {source}")]
    Backend {
        /// Node display name.
        node: String,
        /// Lifecycle operation (start, stop, attach_nio...).
        operation: &'static str,
        /// Underlying backend failure.
        #[source]
        source: BackendError,
    },

    /// The bridge helper refused a command or could not be reached.
    #[error("Bridge helper error: {0}")]
    Bridge(#[source] UbridgeError),

    /// Moving a TAP device into a container namespace failed.
    ///
    /// Node start aborts on this error instead of retrying.
    #[error("Could not move {tap} into the namespace of PID {pid}: {message}")]
    UbridgeNamespace {
        /// Host-side TAP device.
        tap: String,
        /// Target process.
        pid: u32,
        /// Helper's error message.
        message: String,
    },

    /// A bounded backend call did not complete in time.
    #[error("Timed out after {secs}s waiting for {operation}")]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// The bound that elapsed.
        secs: u64,
    },

    /// Moving legacy project files into the current layout failed.
    #[error("Legacy node migration failed for {path}: {source}")]
    Migration {
        /// File or directory being moved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ComputeError {
    /// HTTP-like status class for the API layer.
    pub fn status_code(&self) -> u16 {
        match self {
            ComputeError::NotFound(_) | ComputeError::ImageMissing { .. } => 404,
            ComputeError::Validation(_) => 400,
            ComputeError::Forbidden(_) => 403,
            ComputeError::Conflict(_) => 409,
            ComputeError::ResourceExhausted(_) => 503,
            ComputeError::Backend { .. }
            | ComputeError::Bridge(_)
            | ComputeError::UbridgeNamespace { .. } => 502,
            ComputeError::Timeout { .. } => 504,
            ComputeError::Migration { .. } | ComputeError::Io(_) => 500,
        }
    }
}

impl From<PortError> for ComputeError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Exhausted { .. } => ComputeError::ResourceExhausted(err.to_string()),
            PortError::InUse { .. } => ComputeError::Conflict(err.to_string()),
            PortError::OutOfRange { .. } => ComputeError::Validation(err.to_string()),
        }
    }
}

impl From<UbridgeError> for ComputeError {
    fn from(err: UbridgeError) -> Self {
        match err {
            UbridgeError::Namespace { tap, pid, message } => {
                ComputeError::UbridgeNamespace { tap, pid, message }
            }
            UbridgeError::Timeout { command, secs } => ComputeError::Timeout {
                operation: format!("bridge helper reply to '{command}'"),
                secs,
            },
            UbridgeError::InvalidState { .. }
            | UbridgeError::CaptureActive { .. }
            | UbridgeError::NioInUse { .. } => {
                ComputeError::Conflict(err.to_string())
            }
            other => ComputeError::Bridge(other),
        }
    }
}

/// Result type for compute operations.
pub type ComputeResult<T> = Result<T, ComputeError>;
