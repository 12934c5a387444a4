//! Telemetry and audit logging for the compute host.
//!
//! This module provides structured logging to syslog with the `NETSIM_COMPUTE`
//! tag. Node lifecycle, wiring, capture and console events are recorded for
//! later reconstruction of what happened on a host.
//!
//! # Architecture
//!
//! - **Audit logging** (syslog): lifecycle events go to syslog, never stdout/stderr
//! - **Debug logging** (tracing): development logs go to stderr via `tracing`
//!
//! The library never reaches for the global logger on its own: an
//! `Arc<AuditLogger>` is carried by [`ComputeContext`](crate::compute::ComputeContext).
//! The binary also installs a process-wide logger for the console
//! front-end, reachable through [`try_audit`].
//!
//! # Event Format
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"node_start","node_id":"...","name":"PC1","pid":4242}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::AuditEvent;
pub use syslog::{init_logger, try_audit, AuditLogger, SYSLOG_TAG};
