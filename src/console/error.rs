//! Console proxy errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the console proxy.
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// Another proxy holds the console.
    #[error("Console {} is already connected, held by PID {}", path.display(), pid.map_or_else(|| "unknown".to_string(), |p| p.to_string()))]
    Locked {
        /// Lock file.
        path: PathBuf,
        /// PID recorded in the lock file.
        pid: Option<u32>,
    },

    /// The lock could not be taken for a reason other than contention.
    ///
    /// Attaching is refused rather than risking two proxies on one console.
    #[error("Cannot lock {}: {source}", path.display())]
    LockUnavailable {
        /// Lock file.
        path: PathBuf,
        /// Errno from flock(2).
        #[source]
        source: nix::errno::Errno,
    },

    /// The backend console socket could not be bound or reached.
    #[error("Console socket {} unavailable: {source}", path.display())]
    Socket {
        /// Socket path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Unusable escape setting.
    #[error("Invalid console escape '{0}': use one character or ^X notation")]
    InvalidEscape(String),

    /// Readiness multiplexer failure.
    #[error("epoll failed: {0}")]
    Poll(#[from] nix::errno::Errno),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for console operations.
pub type ConsoleResult<T> = Result<T, ConsoleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_display_names_holder() {
        let err = ConsoleError::Locked {
            path: PathBuf::from("/tmp/netio1000/ttyC3.lck"),
            pid: Some(4242),
        };
        let msg = err.to_string();
        assert!(msg.contains("already connected"));
        assert!(msg.contains("held by PID 4242"));

        let unknown = ConsoleError::Locked {
            path: PathBuf::from("x.lck"),
            pid: None,
        };
        assert!(unknown.to_string().ends_with("held by PID unknown"));
    }
}
