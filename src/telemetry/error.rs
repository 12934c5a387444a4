//! Telemetry error types.

use thiserror::Error;

/// Errors that can occur during telemetry operations.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to connect to syslog.
    #[error("Failed to connect to syslog: {0}")]
    SyslogConnection(String),

    /// Logger already initialized.
    #[error("Audit logger already initialized")]
    AlreadyInitialized,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syslog_connection_display() {
        let err = TelemetryError::SyslogConnection("no such socket".to_string());
        assert!(err.to_string().contains("no such socket"));
    }
}
