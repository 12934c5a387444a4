//! Virtual wire endpoints (NIOs).
//!
//! A NIO is one end of a virtual network link: a UDP tunnel to another
//! compute host or device, a host TAP device, a host Ethernet interface, or a
//! null endpoint. Each NIO carries an ordered list of packet filters and an
//! optional capture; the bridge relaying the NIO applies both.
//!
//! # Creation
//!
//! [`create_nio`] parses the controller's JSON settings and checks the host:
//!
//! - **UDP**: ports must be non-zero and the remote end must be routable (a
//!   throw-away UDP socket is connected to it; UDP being connectionless this
//!   only catches unresolvable hosts and missing routes)
//! - **TAP**: the bridge helper must have privileged access
//! - **Ethernet**: the interface must exist and be up
//!
//! Unknown `type` values fail with `Validation`.

mod endpoint;
mod filter;
mod settings;

pub use endpoint::{Capture, LinkType, Nio, NioKind};
pub use filter::{NioFilter, NioFilters};
pub use settings::NioSettings;

use std::path::Path;

use tokio::net::UdpSocket;
use tracing::debug;

use crate::compute::{ComputeError, ComputeResult};
use crate::manager::has_privileged_access;

/// `IFF_UP` from `<net/if.h>`.
const IFF_UP: u32 = 0x1;

/// Create a NIO from controller settings.
///
/// `ubridge_path` is the helper whose privileges gate TAP endpoints.
pub async fn create_nio(settings: &serde_json::Value, ubridge_path: &Path) -> ComputeResult<Nio> {
    let settings: NioSettings = serde_json::from_value(settings.clone())
        .map_err(|e| ComputeError::Validation(format!("Invalid NIO settings: {e}")))?;

    match &settings {
        NioSettings::Udp {
            lport,
            rhost,
            rport,
            ..
        } => {
            if *lport == 0 || *rport == 0 {
                return Err(ComputeError::Validation(
                    "UDP tunnel ports must be non-zero".to_string(),
                ));
            }
            if rhost.trim().is_empty() {
                return Err(ComputeError::Validation(
                    "UDP tunnel remote host is empty".to_string(),
                ));
            }
            probe_udp_endpoint(rhost, *rport).await?;
        }
        NioSettings::Tap { tap_device, .. } => {
            validate_device_name(tap_device)?;
            if !has_privileged_access(ubridge_path) {
                return Err(ComputeError::Forbidden(format!(
                    "{} has no privileged access to create TAP link {}",
                    ubridge_path.display(),
                    tap_device
                )));
            }
        }
        NioSettings::Ethernet {
            ethernet_device, ..
        } => {
            validate_device_name(ethernet_device)?;
            if !interface_is_up(ethernet_device) {
                return Err(ComputeError::Conflict(format!(
                    "Ethernet interface {ethernet_device} does not exist or is down"
                )));
            }
        }
        NioSettings::Null => {}
    }

    let nio = Nio::from_settings(settings);
    debug!("Created {}", nio);
    Ok(nio)
}

/// Connect a throw-away UDP socket to the remote end.
async fn probe_udp_endpoint(rhost: &str, rport: u16) -> ComputeResult<()> {
    let unreachable = |e: std::io::Error| {
        ComputeError::Validation(format!(
            "Could not create a UDP connection to {rhost}:{rport}: {e}"
        ))
    };

    let remote = tokio::net::lookup_host((rhost, rport))
        .await
        .map_err(unreachable)?
        .next()
        .ok_or_else(|| {
            ComputeError::Validation(format!("{rhost} does not resolve to any address"))
        })?;

    let bind = if remote.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    };
    let socket = UdpSocket::bind(bind).await.map_err(unreachable)?;
    socket.connect(remote).await.map_err(unreachable)?;
    Ok(())
}

fn validate_device_name(name: &str) -> ComputeResult<()> {
    if name.is_empty() || name.len() > 15 || name.contains(['/', '\0']) || name.starts_with('.') {
        return Err(ComputeError::Validation(format!(
            "'{name}' is not a valid interface name"
        )));
    }
    Ok(())
}

/// Whether a host interface exists and is administratively up.
pub fn interface_is_up(name: &str) -> bool {
    if validate_device_name(name).is_err() {
        return false;
    }
    let flags_path = Path::new("/sys/class/net").join(name).join("flags");
    let Ok(raw) = std::fs::read_to_string(&flags_path) else {
        return false;
    };
    u32::from_str_radix(raw.trim().trim_start_matches("0x"), 16)
        .is_ok_and(|flags| flags & IFF_UP != 0)
}
