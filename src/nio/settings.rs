//! JSON wire shape of NIO settings.

use serde::{Deserialize, Serialize};

use super::filter::NioFilters;

/// NIO settings as sent by a controller, dispatched on `type`.
///
/// ```json
/// {"type":"nio_udp","lport":10001,"rhost":"127.0.0.1","rport":10002,"filters":{}}
/// {"type":"nio_tap","tap_device":"tap0"}
/// {"type":"nio_ethernet","ethernet_device":"eth1"}
/// {"type":"nio_null"}
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum NioSettings {
    /// UDP tunnel.
    #[serde(rename = "nio_udp")]
    Udp {
        /// Local port on this host.
        lport: u16,
        /// Remote host.
        rhost: String,
        /// Remote port.
        rport: u16,
        /// Packet filters in application order.
        #[serde(default, skip_serializing_if = "NioFilters::is_empty")]
        filters: NioFilters,
        /// Link suspended.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        suspend: bool,
    },

    /// Host TAP device.
    #[serde(rename = "nio_tap")]
    Tap {
        /// TAP device name.
        tap_device: String,
        /// Packet filters in application order.
        #[serde(default, skip_serializing_if = "NioFilters::is_empty")]
        filters: NioFilters,
    },

    /// Host Ethernet interface.
    #[serde(rename = "nio_ethernet")]
    Ethernet {
        /// Interface name.
        ethernet_device: String,
        /// Packet filters in application order.
        #[serde(default, skip_serializing_if = "NioFilters::is_empty")]
        filters: NioFilters,
    },

    /// Unconnected endpoint.
    #[serde(rename = "nio_null")]
    Null,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_settings() {
        let settings: NioSettings = serde_json::from_str(
            r#"{"type":"nio_udp","lport":10001,"rhost":"127.0.0.1","rport":10002,
                "filters":{"delay":[10,0],"corrupt":[1]}}"#,
        )
        .unwrap();

        match settings {
            NioSettings::Udp {
                lport,
                rhost,
                rport,
                filters,
                suspend,
            } => {
                assert_eq!((lport, rhost.as_str(), rport), (10001, "127.0.0.1", 10002));
                assert_eq!(filters.0[0].kind, "delay");
                assert_eq!(filters.0[1].kind, "corrupt");
                assert!(!suspend);
            }
            other => panic!("unexpected settings: {other:?}"),
        }
    }

    #[test]
    fn test_tap_and_null_settings() {
        let tap: NioSettings =
            serde_json::from_str(r#"{"type":"nio_tap","tap_device":"tap0"}"#).unwrap();
        assert!(matches!(tap, NioSettings::Tap { ref tap_device, .. } if tap_device == "tap0"));

        let null: NioSettings = serde_json::from_str(r#"{"type":"nio_null"}"#).unwrap();
        assert_eq!(null, NioSettings::Null);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<NioSettings>(r#"{"type":"nio_vde"}"#).is_err());
    }

    #[test]
    fn test_serialize_skips_empty_filters() {
        let settings = NioSettings::Ethernet {
            ethernet_device: "eth1".to_string(),
            filters: NioFilters::default(),
        };
        assert_eq!(
            serde_json::to_string(&settings).unwrap(),
            r#"{"type":"nio_ethernet","ethernet_device":"eth1"}"#
        );
    }
}
