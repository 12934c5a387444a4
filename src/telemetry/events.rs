//! Audit event types for structured logging.
//!
//! These events are logged to syslog with the `NETSIM_COMPUTE` tag so that
//! node lifecycle and wiring changes on a compute host leave an audit trail.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Audit events for lifecycle logging.
///
/// Each variant is one state change on the compute host that an operator may
/// need to reconstruct after the fact.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Node registered by a manager.
    NodeCreate {
        /// Node identifier.
        node_id: Uuid,
        /// Node display name.
        name: String,
        /// Backend type (vpcs, docker, ethernet_switch...).
        node_type: String,
        /// Owning project.
        project_id: Uuid,
    },

    /// Node backend started.
    NodeStart {
        /// Node identifier.
        node_id: Uuid,
        /// Node display name.
        name: String,
        /// Backend process or container PID, when there is one.
        pid: Option<u32>,
    },

    /// Node backend stopped.
    NodeStop {
        /// Node identifier.
        node_id: Uuid,
        /// Node display name.
        name: String,
    },

    /// Node closed and removed from its manager.
    NodeDelete {
        /// Node identifier.
        node_id: Uuid,
        /// Node display name.
        name: String,
    },

    /// NIO bound to an adapter slot.
    NioBind {
        /// Node identifier.
        node_id: Uuid,
        /// Adapter number.
        adapter: u32,
        /// Port number inside the adapter.
        port: u32,
        /// Human-readable NIO description.
        nio: String,
    },

    /// NIO removed from an adapter slot.
    NioUnbind {
        /// Node identifier.
        node_id: Uuid,
        /// Adapter number.
        adapter: u32,
        /// Port number inside the adapter.
        port: u32,
    },

    /// Packet capture started on a link.
    CaptureStart {
        /// Node identifier.
        node_id: Uuid,
        /// Adapter number.
        adapter: u32,
        /// Capture output file.
        path: String,
    },

    /// Packet capture stopped on a link.
    CaptureStop {
        /// Node identifier.
        node_id: Uuid,
        /// Adapter number.
        adapter: u32,
    },

    /// Console proxy attached to a backend console.
    ConsoleAttach {
        /// Console instance number.
        instance: u32,
        /// PID of the attaching proxy.
        pid: u32,
        /// `tty` or `telnet`.
        mode: String,
    },

    /// Console attach refused because another proxy holds the lock.
    ConsoleReject {
        /// Console instance number.
        instance: u32,
        /// PID recorded in the lock file, if readable.
        holder_pid: Option<u32>,
    },

    /// Legacy numeric node identifier migrated to a UUID.
    NodeMigrate {
        /// Owning project.
        project_id: Uuid,
        /// Legacy numeric identifier.
        legacy_id: u64,
        /// Newly assigned identifier.
        node_id: Uuid,
    },

    /// Image file written to the image store.
    ImageWrite {
        /// Final image path.
        path: String,
        /// SHA-256 checksum of the written file.
        checksum: String,
    },
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub(crate) fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}
