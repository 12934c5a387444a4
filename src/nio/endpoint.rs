//! The NIO endpoint type.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::filter::{NioFilter, NioFilters};
use super::settings::NioSettings;
use crate::compute::{ComputeError, ComputeResult};

/// Endpoint variant and its addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NioKind {
    /// UDP tunnel between a local and a remote port.
    Udp {
        /// Local port on this host.
        lport: u16,
        /// Remote host.
        rhost: String,
        /// Remote port.
        rport: u16,
    },
    /// Host TAP device.
    Tap {
        /// Device name.
        device: String,
    },
    /// Host Ethernet interface.
    Ethernet {
        /// Interface name.
        device: String,
    },
    /// Unconnected endpoint.
    Null,
}

/// Capture link type passed to the bridge helper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkType {
    /// Ethernet.
    #[default]
    #[serde(rename = "DLT_EN10MB")]
    En10mb,
    /// PPP over serial.
    #[serde(rename = "DLT_PPP_SERIAL")]
    PppSerial,
    /// Cisco HDLC.
    #[serde(rename = "DLT_C_HDLC")]
    CHdlc,
    /// Frame Relay.
    #[serde(rename = "DLT_FRELAY")]
    FrameRelay,
    /// ATM RFC 1483.
    #[serde(rename = "DLT_ATM_RFC1483")]
    AtmRfc1483,
}

impl LinkType {
    /// pcap DLT name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::En10mb => "DLT_EN10MB",
            LinkType::PppSerial => "DLT_PPP_SERIAL",
            LinkType::CHdlc => "DLT_C_HDLC",
            LinkType::FrameRelay => "DLT_FRELAY",
            LinkType::AtmRfc1483 => "DLT_ATM_RFC1483",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkType {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DLT_EN10MB" => Ok(LinkType::En10mb),
            "DLT_PPP_SERIAL" => Ok(LinkType::PppSerial),
            "DLT_C_HDLC" => Ok(LinkType::CHdlc),
            "DLT_FRELAY" => Ok(LinkType::FrameRelay),
            "DLT_ATM_RFC1483" => Ok(LinkType::AtmRfc1483),
            other => Err(ComputeError::Validation(format!(
                "Unknown capture link type '{other}'"
            ))),
        }
    }
}

/// An active capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capture {
    /// Output pcap file.
    pub path: PathBuf,
    /// Link type written in the pcap header.
    pub link_type: LinkType,
}

/// One endpoint of a virtual wire.
///
/// Owned by the adapter slot it is bound to. Filters and capture state travel
/// with the NIO; the bridge relaying it applies them.
#[derive(Debug, Clone, PartialEq)]
pub struct Nio {
    kind: NioKind,
    filters: NioFilters,
    capture: Option<Capture>,
    suspended: bool,
}

impl Nio {
    fn with_kind(kind: NioKind) -> Self {
        Self {
            kind,
            filters: NioFilters::default(),
            capture: None,
            suspended: false,
        }
    }

    /// UDP tunnel endpoint.
    pub fn udp(lport: u16, rhost: impl Into<String>, rport: u16) -> Self {
        Self::with_kind(NioKind::Udp {
            lport,
            rhost: rhost.into(),
            rport,
        })
    }

    /// TAP endpoint.
    pub fn tap(device: impl Into<String>) -> Self {
        Self::with_kind(NioKind::Tap {
            device: device.into(),
        })
    }

    /// Ethernet endpoint.
    pub fn ethernet(device: impl Into<String>) -> Self {
        Self::with_kind(NioKind::Ethernet {
            device: device.into(),
        })
    }

    /// Unconnected endpoint.
    pub fn null() -> Self {
        Self::with_kind(NioKind::Null)
    }

    /// Build a NIO from parsed settings without any host checks.
    pub fn from_settings(settings: NioSettings) -> Self {
        match settings {
            NioSettings::Udp {
                lport,
                rhost,
                rport,
                filters,
                suspend,
            } => {
                let mut nio = Self::udp(lport, rhost, rport);
                nio.filters = filters;
                nio.suspended = suspend;
                nio
            }
            NioSettings::Tap {
                tap_device,
                filters,
            } => {
                let mut nio = Self::tap(tap_device);
                nio.filters = filters;
                nio
            }
            NioSettings::Ethernet {
                ethernet_device,
                filters,
            } => {
                let mut nio = Self::ethernet(ethernet_device);
                nio.filters = filters;
                nio
            }
            NioSettings::Null => Self::null(),
        }
    }

    /// Settings that recreate this NIO.
    pub fn settings(&self) -> NioSettings {
        match &self.kind {
            NioKind::Udp {
                lport,
                rhost,
                rport,
            } => NioSettings::Udp {
                lport: *lport,
                rhost: rhost.clone(),
                rport: *rport,
                filters: self.filters.clone(),
                suspend: self.suspended,
            },
            NioKind::Tap { device } => NioSettings::Tap {
                tap_device: device.clone(),
                filters: self.filters.clone(),
            },
            NioKind::Ethernet { device } => NioSettings::Ethernet {
                ethernet_device: device.clone(),
                filters: self.filters.clone(),
            },
            NioKind::Null => NioSettings::Null,
        }
    }

    /// Variant and addressing.
    pub fn kind(&self) -> &NioKind {
        &self.kind
    }

    /// Local UDP port, for UDP tunnels.
    pub fn lport(&self) -> Option<u16> {
        match self.kind {
            NioKind::Udp { lport, .. } => Some(lport),
            _ => None,
        }
    }

    /// Identity of the host resource this NIO occupies.
    ///
    /// Two NIOs with the same key cannot be relayed at the same time. Null
    /// endpoints occupy nothing.
    pub fn key(&self) -> Option<String> {
        match &self.kind {
            NioKind::Udp { lport, .. } => Some(format!("udp:{lport}")),
            NioKind::Tap { device } => Some(format!("tap:{device}")),
            NioKind::Ethernet { device } => Some(format!("ethernet:{device}")),
            NioKind::Null => None,
        }
    }

    /// Filters in application order.
    pub fn filters(&self) -> &[NioFilter] {
        &self.filters.0
    }

    /// Replace the filter list.
    pub fn set_filters(&mut self, filters: impl Into<NioFilters>) {
        self.filters = filters.into();
    }

    /// Whether the link is suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Suspend or resume the link.
    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    /// The active capture, if any.
    pub fn capture(&self) -> Option<&Capture> {
        self.capture.as_ref()
    }

    /// Whether a capture is active.
    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Record a capture as active.
    ///
    /// Fails with `Conflict` when a capture is already running.
    pub fn start_capture(&mut self, path: &Path, link_type: LinkType) -> ComputeResult<()> {
        if let Some(ref active) = self.capture {
            return Err(ComputeError::Conflict(format!(
                "{} is already capturing to {}",
                self,
                active.path.display()
            )));
        }
        self.capture = Some(Capture {
            path: path.to_path_buf(),
            link_type,
        });
        Ok(())
    }

    /// Clear the capture. No-op when not capturing.
    pub fn stop_capture(&mut self) -> Option<Capture> {
        self.capture.take()
    }
}

impl fmt::Display for Nio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            NioKind::Udp {
                lport,
                rhost,
                rport,
            } => write!(f, "UDP tunnel {lport}:{rhost}:{rport}"),
            NioKind::Tap { device } => write!(f, "TAP {device}"),
            NioKind::Ethernet { device } => write!(f, "Ethernet {device}"),
            NioKind::Null => f.write_str("NULL"),
        }
    }
}

impl Serialize for Nio {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.settings().serialize(serializer)
    }
}
