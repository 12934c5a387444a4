//! Backend driver errors.
//!
//! Each backend technology has its own error type. All of them distinguish
//! "already in the desired state" from genuine failures through
//! [`BackendError::is_no_op`]; the node treats the former as success.

use std::path::PathBuf;

use thiserror::Error;

/// Failures reported by a container engine.
#[derive(Debug, Error)]
pub enum ContainerEngineError {
    /// The request changed nothing (container already started/stopped).
    #[error("Container {0} is already in the requested state")]
    NotModified(String),

    /// The container or image does not exist.
    #[error("Container engine object not found: {0}")]
    NotFound(String),

    /// The engine answered with an error status.
    #[error("Container engine error {status}: {message}")]
    Api {
        /// HTTP-like status returned by the engine.
        status: u16,
        /// Engine error message.
        message: String,
    },

    /// The engine could not be reached.
    #[error("Container engine unavailable: {0}")]
    Unavailable(String),
}

/// Failures of a backend that runs as a local process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Start requested while the process runs.
    #[error("Process is already running with PID {pid}")]
    AlreadyRunning {
        /// Running process.
        pid: u32,
    },

    /// Stop requested while no process runs.
    #[error("Process is not running")]
    NotRunning,

    /// The executable could not be spawned.
    #[error("Failed to start {path}: {source}")]
    Spawn {
        /// Executable.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The process exited right after being started.
    #[error("Process exited immediately with status {status}")]
    EarlyExit {
        /// Exit status as reported by the OS.
        status: String,
    },

    /// Signal delivery failed.
    #[error("Failed to signal PID {pid}: {source}")]
    Signal {
        /// Target process.
        pid: u32,
        /// Errno from kill(2).
        #[source]
        source: nix::errno::Errno,
    },

    /// Reading or writing the backend's files failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A backend driver failure.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Container backends.
    #[error(transparent)]
    Container(#[from] ContainerEngineError),

    /// Process backends.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// In-process switches.
    #[error("Switch error: {0}")]
    Switch(String),

    /// The backend does not implement the operation.
    #[error("{operation} is not supported by this node type")]
    Unsupported {
        /// Operation name.
        operation: &'static str,
    },
}

impl BackendError {
    /// Whether the failure only says the backend was already in the
    /// requested state.
    pub fn is_no_op(&self) -> bool {
        matches!(
            self,
            BackendError::Container(ContainerEngineError::NotModified(_))
                | BackendError::Process(ProcessError::AlreadyRunning { .. })
                | BackendError::Process(ProcessError::NotRunning)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_op_classification() {
        assert!(BackendError::from(ContainerEngineError::NotModified("web1".into())).is_no_op());
        assert!(BackendError::from(ProcessError::NotRunning).is_no_op());
        assert!(!BackendError::from(ContainerEngineError::Api {
            status: 500,
            message: "boom".into()
        })
        .is_no_op());
        assert!(!BackendError::Unsupported { operation: "suspend" }.is_no_op());
    }

    #[test]
    fn test_transparent_display() {
        let err = BackendError::from(ProcessError::AlreadyRunning { pid: 99 });
        assert_eq!(err.to_string(), "Process is already running with PID 99");
    }
}
