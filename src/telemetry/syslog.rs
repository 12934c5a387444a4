//! Audit records on the local syslog daemon.
//!
//! Every [`AuditEvent`] becomes one JSON line at `info` severity on the
//! daemon facility, tagged `NETSIM_COMPUTE`.

use std::sync::{Mutex, OnceLock};

use syslog::{Facility, Formatter3164, Logger, LoggerBackend};
use tracing::{debug, warn};

use super::error::TelemetryError;
use super::events::AuditEvent;

/// Process name syslog files the records under.
pub const SYSLOG_TAG: &str = "NETSIM_COMPUTE";

type SyslogWriter = Logger<LoggerBackend, Formatter3164>;

/// Installed by the binary for code that runs without a compute context.
static GLOBAL: OnceLock<AuditLogger> = OnceLock::new();

/// Sink for audit events. A disabled logger drops everything it is given.
#[derive(Default)]
pub struct AuditLogger {
    writer: Option<Mutex<SyslogWriter>>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// One audit line: the event with its `ts` field.
fn render(event: &AuditEvent) -> serde_json::Result<String> {
    serde_json::to_string(&event.with_timestamp())
}

impl AuditLogger {
    /// Open the local syslog socket.
    pub fn connect() -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_DAEMON,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };
        let writer =
            syslog::unix(formatter).map_err(|e| TelemetryError::SyslogConnection(e.to_string()))?;
        debug!("Audit records go to syslog as {}", SYSLOG_TAG);
        Ok(Self {
            writer: Some(Mutex::new(writer)),
        })
    }

    /// A logger that records nothing.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { writer: None }
    }

    /// Whether events reach syslog.
    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    /// Record an event. Failures are reported through `tracing` only.
    pub fn log(&self, event: AuditEvent) {
        let Some(writer) = &self.writer else {
            return;
        };
        let line = match render(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Dropping unserializable audit event: {}", e);
                return;
            }
        };
        let mut writer = writer.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = writer.info(&line) {
            warn!("Syslog write failed: {}", e);
        }
    }
}

/// Connect the process-wide logger. Fails without a syslog daemon or when
/// called twice.
pub fn init_logger() -> Result<&'static AuditLogger, TelemetryError> {
    GLOBAL
        .set(AuditLogger::connect()?)
        .map_err(|_| TelemetryError::AlreadyInitialized)?;
    GLOBAL.get().ok_or(TelemetryError::AlreadyInitialized)
}

/// The process-wide logger, once [`init_logger`] succeeded.
pub fn try_audit() -> Option<&'static AuditLogger> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_disabled_logger_drops_events() {
        let logger = AuditLogger::disabled();
        assert!(!logger.is_connected());
        assert!(!AuditLogger::default().is_connected());
        logger.log(AuditEvent::NodeStop {
            node_id: Uuid::new_v4(),
            name: "PC1".to_string(),
        });
    }

    #[test]
    fn test_rendered_line_is_one_json_object() {
        let line = render(&AuditEvent::ConsoleReject {
            instance: 2,
            holder_pid: None,
        })
        .unwrap();
        assert!(!line.contains('\n'));

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "console_reject");
        assert_eq!(value["instance"], 2);
        assert!(value["ts"].is_string());
    }

    #[test]
    fn test_no_global_logger_in_library_code() {
        // Only the binary installs one.
        assert!(try_audit().is_none());
    }

    #[test]
    #[ignore = "Requires running syslog daemon"]
    fn test_connect() {
        assert!(AuditLogger::connect().unwrap().is_connected());
    }
}
