//! Bridge lifecycle and link ownership.
//!
//! ```text
//!   create ──► Created ──start──► Started ◄──start── Stopped
//!                 │                 │  ▲                ▲
//!                 │                 │  └─ capture on/off │
//!                 │                 └──────stop──────────┘
//!                 └────────────── delete (any state) ──► Deleted
//! ```
//!
//! Deleting a started bridge stops it first. Capture can only be toggled
//! while the bridge is started and is dropped when it stops.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use tracing::debug;

use super::error::{UbridgeError, UbridgeResult};
use super::protocol::BridgeCommand;
use super::BridgeHelper;
use crate::nio::{Capture, LinkType, Nio, NioKind};

/// Lifecycle state of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Name reserved, endpoints being attached.
    Created,
    /// Relaying frames.
    Started,
    /// Relay paused; can be restarted.
    Stopped,
    /// Removed from the helper.
    Deleted,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BridgeState::Created => "created",
            BridgeState::Started => "started",
            BridgeState::Stopped => "stopped",
            BridgeState::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// One bridge inside a helper process.
#[derive(Debug)]
pub struct Bridge {
    name: String,
    state: BridgeState,
    /// Keys of the NIOs attached to this bridge.
    nios: Vec<String>,
    capture: Option<Capture>,
}

impl Bridge {
    /// Reserve a bridge name in the helper.
    pub async fn create(helper: &dyn BridgeHelper, name: impl Into<String>) -> UbridgeResult<Self> {
        let name = name.into();
        helper
            .send(&BridgeCommand::Create { name: name.clone() })
            .await?;
        debug!("Created bridge {}", name);
        Ok(Self {
            name,
            state: BridgeState::Created,
            nios: Vec::new(),
            capture: None,
        })
    }

    /// Bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// The active capture, if any.
    pub fn capture(&self) -> Option<&Capture> {
        self.capture.as_ref()
    }

    fn ensure_not_deleted(&self, operation: &'static str) -> UbridgeResult<()> {
        if self.state == BridgeState::Deleted {
            return Err(UbridgeError::InvalidState {
                bridge: self.name.clone(),
                state: self.state,
                operation,
            });
        }
        Ok(())
    }

    /// Attach a NIO endpoint.
    ///
    /// Null NIOs attach nothing.
    pub async fn add_nio(&mut self, helper: &dyn BridgeHelper, nio: &Nio) -> UbridgeResult<()> {
        self.ensure_not_deleted("add a NIO")?;
        let command = match nio.kind() {
            NioKind::Udp {
                lport,
                rhost,
                rport,
            } => BridgeCommand::AddNioUdp {
                name: self.name.clone(),
                lport: *lport,
                rhost: rhost.clone(),
                rport: *rport,
            },
            NioKind::Tap { device } => BridgeCommand::AddNioTap {
                name: self.name.clone(),
                tap: device.clone(),
            },
            NioKind::Ethernet { device } => BridgeCommand::AddNioEthernet {
                name: self.name.clone(),
                iface: device.clone(),
            },
            NioKind::Null => return Ok(()),
        };
        helper.send(&command).await?;
        if let Some(key) = nio.key() {
            self.nios.push(key);
        }
        Ok(())
    }

    /// Attach a TAP device created for the backend side of the link.
    pub async fn add_tap(&mut self, helper: &dyn BridgeHelper, tap: &str) -> UbridgeResult<()> {
        self.ensure_not_deleted("add a TAP")?;
        helper
            .send(&BridgeCommand::AddNioTap {
                name: self.name.clone(),
                tap: tap.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Detach a NIO, stopping the bridge first.
    ///
    /// Only UDP tunnels can be removed in place; other kinds need the bridge
    /// to be deleted and recreated, which is reported as `false`.
    pub async fn remove_nio(&mut self, helper: &dyn BridgeHelper, nio: &Nio) -> UbridgeResult<bool> {
        self.ensure_not_deleted("remove a NIO")?;
        let NioKind::Udp {
            lport,
            rhost,
            rport,
        } = nio.kind()
        else {
            return Ok(matches!(nio.kind(), NioKind::Null));
        };
        self.stop(helper).await?;
        helper
            .send(&BridgeCommand::RemoveNioUdp {
                name: self.name.clone(),
                lport: *lport,
                rhost: rhost.clone(),
                rport: *rport,
            })
            .await?;
        if let Some(key) = nio.key() {
            self.nios.retain(|k| *k != key);
        }
        Ok(true)
    }

    /// Replace the packet filters of the bridge with the NIO's active ones.
    pub async fn apply_filters(&self, helper: &dyn BridgeHelper, nio: &Nio) -> UbridgeResult<()> {
        self.ensure_not_deleted("apply filters")?;
        helper
            .send(&BridgeCommand::ResetPacketFilters {
                name: self.name.clone(),
            })
            .await?;
        for (index, filter) in nio.filters().iter().filter(|f| f.is_active()).enumerate() {
            helper
                .send(&BridgeCommand::AddPacketFilter {
                    name: self.name.clone(),
                    filter_name: format!("filter{index}"),
                    kind: filter.kind.clone(),
                    args: filter.command_args(),
                })
                .await?;
        }
        Ok(())
    }

    /// Start relaying. Starting a started bridge is a no-op.
    pub async fn start(&mut self, helper: &dyn BridgeHelper) -> UbridgeResult<()> {
        match self.state {
            BridgeState::Started => Ok(()),
            BridgeState::Deleted => Err(UbridgeError::InvalidState {
                bridge: self.name.clone(),
                state: self.state,
                operation: "start",
            }),
            BridgeState::Created | BridgeState::Stopped => {
                helper
                    .send(&BridgeCommand::Start {
                        name: self.name.clone(),
                    })
                    .await?;
                self.state = BridgeState::Started;
                debug!("Started bridge {}", self.name);
                Ok(())
            }
        }
    }

    /// Stop relaying. Stopping a bridge that is not started is a no-op.
    pub async fn stop(&mut self, helper: &dyn BridgeHelper) -> UbridgeResult<()> {
        if self.state != BridgeState::Started {
            return Ok(());
        }
        if self.capture.is_some() {
            self.stop_capture(helper).await?;
        }
        helper
            .send(&BridgeCommand::Stop {
                name: self.name.clone(),
            })
            .await?;
        self.state = BridgeState::Stopped;
        debug!("Stopped bridge {}", self.name);
        Ok(())
    }

    /// Remove the bridge, stopping it first when started.
    ///
    /// Returns the keys of the NIOs that were attached.
    pub async fn delete(&mut self, helper: &dyn BridgeHelper) -> UbridgeResult<Vec<String>> {
        if self.state == BridgeState::Deleted {
            return Ok(Vec::new());
        }
        self.stop(helper).await?;
        helper
            .send(&BridgeCommand::Delete {
                name: self.name.clone(),
            })
            .await?;
        self.state = BridgeState::Deleted;
        debug!("Deleted bridge {}", self.name);
        Ok(std::mem::take(&mut self.nios))
    }

    /// Start writing relayed frames to a pcap file.
    pub async fn start_capture(
        &mut self,
        helper: &dyn BridgeHelper,
        path: &Path,
        link_type: LinkType,
    ) -> UbridgeResult<()> {
        if self.state != BridgeState::Started {
            return Err(UbridgeError::InvalidState {
                bridge: self.name.clone(),
                state: self.state,
                operation: "start capture",
            });
        }
        if self.capture.is_some() {
            return Err(UbridgeError::CaptureActive {
                bridge: self.name.clone(),
            });
        }
        helper
            .send(&BridgeCommand::StartCapture {
                name: self.name.clone(),
                path: path.to_path_buf(),
                link_type,
            })
            .await?;
        self.capture = Some(Capture {
            path: path.to_path_buf(),
            link_type,
        });
        Ok(())
    }

    /// Stop the capture. No-op when not capturing.
    pub async fn stop_capture(&mut self, helper: &dyn BridgeHelper) -> UbridgeResult<()> {
        if self.capture.is_none() || self.state != BridgeState::Started {
            self.capture = None;
            return Ok(());
        }
        helper
            .send(&BridgeCommand::StopCapture {
                name: self.name.clone(),
            })
            .await?;
        self.capture = None;
        Ok(())
    }
}

/// Process-wide record of which bridge relays which host link.
///
/// A NIO (keyed by the host resource it occupies) can be relayed by one
/// bridge at a time.
#[derive(Debug, Default)]
pub struct LinkClaims {
    claims: Mutex<HashMap<String, String>>,
}

impl LinkClaims {
    /// Create an empty claim table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a NIO for a bridge. Re-claiming by the same owner succeeds.
    pub fn claim(&self, nio: &Nio, owner: &str) -> UbridgeResult<()> {
        let Some(key) = nio.key() else {
            return Ok(());
        };
        let mut claims = self.claims.lock().unwrap_or_else(|p| p.into_inner());
        match claims.get(&key) {
            Some(holder) if holder != owner => Err(UbridgeError::NioInUse {
                nio: key,
                bridge: holder.clone(),
            }),
            _ => {
                claims.insert(key, owner.to_string());
                Ok(())
            }
        }
    }

    /// Release a claim held by `owner`.
    pub fn release(&self, key: &str, owner: &str) {
        let mut claims = self.claims.lock().unwrap_or_else(|p| p.into_inner());
        if claims.get(key).is_some_and(|holder| holder == owner) {
            claims.remove(key);
        }
    }

    /// Current holder of a link.
    pub fn holder(&self, key: &str) -> Option<String> {
        let claims = self.claims.lock().unwrap_or_else(|p| p.into_inner());
        claims.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recorder {
        lines: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BridgeHelper for Recorder {
        async fn send(&self, command: &BridgeCommand) -> UbridgeResult<Vec<String>> {
            self.lines.lock().unwrap().push(command.to_string());
            Ok(Vec::new())
        }

        async fn shutdown(&self) -> UbridgeResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lifecycle_commands() {
        let helper = Recorder::default();
        let mut bridge = Bridge::create(&helper, "bridge0").await.unwrap();
        bridge
            .add_nio(&helper, &Nio::udp(10001, "127.0.0.1", 10002))
            .await
            .unwrap();
        bridge.start(&helper).await.unwrap();
        bridge.start(&helper).await.unwrap();

        let keys = bridge.delete(&helper).await.unwrap();
        assert_eq!(keys, vec!["udp:10001".to_string()]);
        assert_eq!(bridge.state(), BridgeState::Deleted);

        assert_eq!(
            helper.lines(),
            vec![
                "bridge create bridge0",
                "bridge add_nio_udp bridge0 10001 127.0.0.1 10002",
                "bridge start bridge0",
                "bridge stop bridge0",
                "bridge delete bridge0",
            ]
        );
    }

    #[tokio::test]
    async fn test_capture_requires_started() {
        let helper = Recorder::default();
        let mut bridge = Bridge::create(&helper, "bridge0").await.unwrap();

        let err = bridge
            .start_capture(&helper, Path::new("/tmp/x.pcap"), LinkType::En10mb)
            .await
            .unwrap_err();
        assert!(matches!(err, UbridgeError::InvalidState { .. }));

        bridge.start(&helper).await.unwrap();
        bridge
            .start_capture(&helper, Path::new("/tmp/x.pcap"), LinkType::En10mb)
            .await
            .unwrap();
        assert!(matches!(
            bridge
                .start_capture(&helper, Path::new("/tmp/y.pcap"), LinkType::En10mb)
                .await,
            Err(UbridgeError::CaptureActive { .. })
        ));

        bridge.stop(&helper).await.unwrap();
        assert!(bridge.capture().is_none());
        assert!(helper.lines().contains(&"bridge stop_capture bridge0".to_string()));
    }

    #[tokio::test]
    async fn test_deleted_bridge_rejects_start() {
        let helper = Recorder::default();
        let mut bridge = Bridge::create(&helper, "bridge0").await.unwrap();
        bridge.delete(&helper).await.unwrap();
        assert!(bridge.delete(&helper).await.unwrap().is_empty());
        assert!(matches!(
            bridge.start(&helper).await,
            Err(UbridgeError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_filters_skip_inactive() {
        use crate::nio::NioFilter;
        use serde_json::json;

        let helper = Recorder::default();
        let bridge = Bridge::create(&helper, "bridge0").await.unwrap();
        let mut nio = Nio::udp(10001, "127.0.0.1", 10002);
        nio.set_filters(vec![
            NioFilter::new("delay", vec![json!(0)]),
            NioFilter::new("packet_loss", vec![json!(25)]),
        ]);

        bridge.apply_filters(&helper, &nio).await.unwrap();
        assert_eq!(
            helper.lines()[1..],
            [
                "bridge reset_packet_filters bridge0".to_string(),
                "bridge add_packet_filter bridge0 filter0 packet_loss 25".to_string(),
            ]
        );
    }

    #[test]
    fn test_link_claims() {
        let claims = LinkClaims::new();
        let nio = Nio::udp(10001, "127.0.0.1", 10002);

        claims.claim(&nio, "n1:bridge0").unwrap();
        claims.claim(&nio, "n1:bridge0").unwrap();
        assert!(matches!(
            claims.claim(&nio, "n2:bridge0"),
            Err(UbridgeError::NioInUse { .. })
        ));

        claims.release("udp:10001", "n2:bridge0");
        assert_eq!(claims.holder("udp:10001").as_deref(), Some("n1:bridge0"));
        claims.release("udp:10001", "n1:bridge0");
        claims.claim(&nio, "n2:bridge0").unwrap();

        claims.claim(&Nio::null(), "a").unwrap();
        claims.claim(&Nio::null(), "b").unwrap();
    }
}
