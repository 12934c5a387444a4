//! The bridge helper's line protocol.
//!
//! Commands are single text lines. Replies are one or more lines, each
//! starting with a three-digit status:
//!
//! ```text
//! bridge create bridge0
//! 100-bridge 'bridge0' created
//!
//! hypervisor version
//! 100-0.9.18
//!
//! bridge start bridge9
//! 209-bridge 'bridge9' doesn't exist
//! ```
//!
//! `1xx` lines carry success payload, the `100-` line terminates the reply
//! (`100-OK` carries none), a `2xx-` line is an error and also terminates it.

use std::fmt;
use std::path::PathBuf;

use crate::nio::LinkType;

/// A command understood by the bridge helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCommand {
    /// Reserve a bridge name.
    Create {
        /// Bridge name.
        name: String,
    },
    /// Remove a bridge.
    Delete {
        /// Bridge name.
        name: String,
    },
    /// Start relaying.
    Start {
        /// Bridge name.
        name: String,
    },
    /// Stop relaying.
    Stop {
        /// Bridge name.
        name: String,
    },
    /// Attach a UDP tunnel endpoint.
    AddNioUdp {
        /// Bridge name.
        name: String,
        /// Local port.
        lport: u16,
        /// Remote host.
        rhost: String,
        /// Remote port.
        rport: u16,
    },
    /// Detach a UDP tunnel endpoint.
    RemoveNioUdp {
        /// Bridge name.
        name: String,
        /// Local port.
        lport: u16,
        /// Remote host.
        rhost: String,
        /// Remote port.
        rport: u16,
    },
    /// Attach a TAP device.
    AddNioTap {
        /// Bridge name.
        name: String,
        /// TAP device (created by the helper when missing).
        tap: String,
    },
    /// Attach a host Ethernet interface.
    AddNioEthernet {
        /// Bridge name.
        name: String,
        /// Interface name.
        iface: String,
    },
    /// Start writing relayed frames to a pcap file.
    StartCapture {
        /// Bridge name.
        name: String,
        /// Output file.
        path: PathBuf,
        /// pcap link type.
        link_type: LinkType,
    },
    /// Stop the capture.
    StopCapture {
        /// Bridge name.
        name: String,
    },
    /// Remove all packet filters.
    ResetPacketFilters {
        /// Bridge name.
        name: String,
    },
    /// Append a packet filter.
    AddPacketFilter {
        /// Bridge name.
        name: String,
        /// Unique filter name within the bridge.
        filter_name: String,
        /// Filter type.
        kind: String,
        /// Pre-rendered arguments.
        args: String,
    },
    /// Move a TAP device into a process' network namespace and rename it.
    MoveToNs {
        /// Host-side TAP device.
        tap: String,
        /// Process owning the namespace.
        pid: u32,
        /// Interface name inside the namespace.
        ifname: String,
    },
    /// Ask the helper for its version.
    HypervisorVersion,
    /// Ask the helper to exit.
    HypervisorStop,
}

impl BridgeCommand {
    /// Bridge the command targets, if any.
    pub fn bridge(&self) -> Option<&str> {
        match self {
            BridgeCommand::Create { name }
            | BridgeCommand::Delete { name }
            | BridgeCommand::Start { name }
            | BridgeCommand::Stop { name }
            | BridgeCommand::AddNioUdp { name, .. }
            | BridgeCommand::RemoveNioUdp { name, .. }
            | BridgeCommand::AddNioTap { name, .. }
            | BridgeCommand::AddNioEthernet { name, .. }
            | BridgeCommand::StartCapture { name, .. }
            | BridgeCommand::StopCapture { name }
            | BridgeCommand::ResetPacketFilters { name }
            | BridgeCommand::AddPacketFilter { name, .. } => Some(name),
            BridgeCommand::MoveToNs { .. }
            | BridgeCommand::HypervisorVersion
            | BridgeCommand::HypervisorStop => None,
        }
    }
}

impl fmt::Display for BridgeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeCommand::Create { name } => write!(f, "bridge create {name}"),
            BridgeCommand::Delete { name } => write!(f, "bridge delete {name}"),
            BridgeCommand::Start { name } => write!(f, "bridge start {name}"),
            BridgeCommand::Stop { name } => write!(f, "bridge stop {name}"),
            BridgeCommand::AddNioUdp {
                name,
                lport,
                rhost,
                rport,
            } => write!(f, "bridge add_nio_udp {name} {lport} {rhost} {rport}"),
            BridgeCommand::RemoveNioUdp {
                name,
                lport,
                rhost,
                rport,
            } => write!(f, "bridge remove_nio_udp {name} {lport} {rhost} {rport}"),
            BridgeCommand::AddNioTap { name, tap } => write!(f, "bridge add_nio_tap {name} {tap}"),
            BridgeCommand::AddNioEthernet { name, iface } => {
                write!(f, "bridge add_nio_ethernet {name} {iface}")
            }
            BridgeCommand::StartCapture {
                name,
                path,
                link_type,
            } => {
                write!(f, "bridge start_capture {name} \"{}\"", path.display())?;
                if *link_type != LinkType::En10mb {
                    write!(f, " {link_type}")?;
                }
                Ok(())
            }
            BridgeCommand::StopCapture { name } => write!(f, "bridge stop_capture {name}"),
            BridgeCommand::ResetPacketFilters { name } => {
                write!(f, "bridge reset_packet_filters {name}")
            }
            BridgeCommand::AddPacketFilter {
                name,
                filter_name,
                kind,
                args,
            } => {
                write!(f, "bridge add_packet_filter {name} {filter_name} {kind}")?;
                if !args.is_empty() {
                    write!(f, " {args}")?;
                }
                Ok(())
            }
            BridgeCommand::MoveToNs { tap, pid, ifname } => {
                write!(f, "docker move_to_ns {tap} {pid} {ifname}")
            }
            BridgeCommand::HypervisorVersion => f.write_str("hypervisor version"),
            BridgeCommand::HypervisorStop => f.write_str("hypervisor stop"),
        }
    }
}

/// What a reply line means for the reply being read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyLine {
    /// Intermediate payload line; keep reading.
    Data(String),
    /// Final line with its payload (None for `100-OK`).
    Done(Option<String>),
    /// Error line; the reply is over.
    Error(String),
}

/// Split `NNN-rest` / `NNN rest` into the status code, separator and rest.
fn split_status(line: &str) -> Option<(u16, char, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 4 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let sep = bytes[3] as char;
    if sep != '-' && sep != ' ' {
        return None;
    }
    let code = line[..3].parse().ok()?;
    Some((code, sep, &line[4..]))
}

/// Classify one reply line.
pub fn parse_reply_line(line: &str) -> ReplyLine {
    let line = line.trim_end_matches(['\r', '\n']);
    match split_status(line) {
        Some((code, '-', rest)) if (200..300).contains(&code) => ReplyLine::Error(rest.to_string()),
        Some((100, '-', "OK")) => ReplyLine::Done(None),
        Some((100, '-', rest)) => ReplyLine::Done(Some(rest.to_string())),
        Some((code, _, rest)) if (100..200).contains(&code) => ReplyLine::Data(rest.to_string()),
        _ => ReplyLine::Data(line.to_string()),
    }
}

/// Accumulates reply lines into a payload.
#[derive(Debug, Default)]
pub struct ReplyParser {
    payload: Vec<String>,
}

impl ReplyParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line.
    ///
    /// Returns `Some(Ok(payload))` when the reply is complete,
    /// `Some(Err(message))` on an error line, `None` when more lines follow.
    pub fn feed(&mut self, line: &str) -> Option<Result<Vec<String>, String>> {
        match parse_reply_line(line) {
            ReplyLine::Data(data) => {
                if !data.is_empty() {
                    self.payload.push(data);
                }
                None
            }
            ReplyLine::Done(last) => {
                self.payload.extend(last);
                Some(Ok(std::mem::take(&mut self.payload)))
            }
            ReplyLine::Error(message) => Some(Err(message)),
        }
    }
}

/// Parse a helper version string (`0.9.18`, `0.9.18-dev`) into numbers.
pub fn parse_version(raw: &str) -> Option<(u32, u32, u32)> {
    let core = raw.trim().split(['-', ' ']).next()?;
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    Some((major, minor, patch))
}
