//! Wire protocol types for supervisor-helper communication.
//!
//! Outbound frames carry one serialized [`Command`]. Inbound frames are
//! tagged with a one-byte marker ahead of the payload: `b'r'` for the
//! response to the most recent command, `b'n'` for an unsolicited
//! interface notification.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Marker byte prefixing a response frame.
pub const RESPONSE_MARKER: u8 = b'r';

/// Marker byte prefixing a notification frame.
pub const NOTIFICATION_MARKER: u8 = b'n';

/// Commands accepted by the privileged helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// List every interface the system reports.
    Interfaces,
    Status {
        ifname: String,
    },
    Ifup {
        ifname: String,
    },
    Ifdown {
        ifname: String,
    },
    Setup {
        ifname: String,
        options: Options,
    },
    Settings {
        ifname: String,
    },
}

impl Command {
    /// Command tag, for logging and error reporting.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Interfaces => "interfaces",
            Self::Status { .. } => "status",
            Self::Ifup { .. } => "ifup",
            Self::Ifdown { .. } => "ifdown",
            Self::Setup { .. } => "setup",
            Self::Settings { .. } => "settings",
        }
    }
}

/// Configuration options for `setup`.
///
/// Keys the helper understands are typed; anything else is passed through
/// unmodified for the helper to accept or reject, so callers can hand in
/// maps that also carry options for other code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Options {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_subnet_mask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_broadcast: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Helper responses, matched to the most recent outstanding command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Interfaces {
        interfaces: Vec<String>,
    },
    Status {
        status: Status,
    },
    Settings {
        settings: Settings,
    },
    /// Errno-style failure for the command (e.g. unknown interface,
    /// rejected option value).
    Error {
        message: String,
    },
}

/// Hardware type as reported over rtnetlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Ethernet,
    Other,
}

/// RFC 2863 operational states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperState {
    Unknown,
    NotPresent,
    Down,
    LowerLayerDown,
    Testing,
    Dormant,
    Up,
}

/// Snapshot of one interface's link state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub ifname: String,
    #[serde(rename = "type")]
    pub kind: InterfaceKind,
    pub index: i32,
    pub is_up: bool,
    pub is_broadcast: bool,
    pub is_running: bool,
    pub is_lower_up: bool,
    pub is_multicast: bool,
    pub is_all_multicast: bool,
    pub mac_address: String,
    pub mac_broadcast: String,
    pub mtu: u32,
    pub operstate: OperState,
    pub stats: Stats,
}

/// Interface counters. Monotonically non-decreasing while the interface
/// exists; reset only by interface recreation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub multicast: u64,
    pub collisions: u64,
}

/// Current address configuration. Absent fields mean "not configured",
/// never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_broadcast: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_subnet_mask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

/// Identity payload for hotplug notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfIdentity {
    pub index: i64,
    pub ifname: String,
}

/// Unsolicited interface events emitted by the helper.
///
/// `Ifchanged` comes from the rtnetlink link-change socket and carries a
/// full status snapshot; the rest come from the kernel uevent socket on
/// hotplug add/rename/remove.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Notification {
    Ifchanged(Status),
    Ifadded(IfIdentity),
    Ifrenamed(IfIdentity),
    Ifremoved(IfIdentity),
}

impl Notification {
    /// Interface the event applies to; the dispatch key.
    pub fn ifname(&self) -> &str {
        match self {
            Self::Ifchanged(status) => &status.ifname,
            Self::Ifadded(id) | Self::Ifrenamed(id) | Self::Ifremoved(id) => &id.ifname,
        }
    }

    /// Event tag, for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Ifchanged(_) => "ifchanged",
            Self::Ifadded(_) => "ifadded",
            Self::Ifrenamed(_) => "ifrenamed",
            Self::Ifremoved(_) => "ifremoved",
        }
    }
}

/// Status fixture shared by codec and worker tests.
#[cfg(test)]
pub(crate) fn sample_status(ifname: &str) -> Status {
    Status {
        ifname: ifname.to_string(),
        kind: InterfaceKind::Ethernet,
        index: 2,
        is_up: true,
        is_broadcast: true,
        is_running: true,
        is_lower_up: true,
        is_multicast: true,
        is_all_multicast: false,
        mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
        mac_broadcast: "ff:ff:ff:ff:ff:ff".to_string(),
        mtu: 1500,
        operstate: OperState::Up,
        stats: Stats {
            rx_packets: 10,
            tx_packets: 7,
            rx_bytes: 2048,
            tx_bytes: 1024,
            ..Stats::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_serializes_with_tag() {
        let cmd = Command::Status {
            ifname: "eth0".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"cmd": "status", "ifname": "eth0"})
        );
    }

    #[test]
    fn setup_options_skip_absent_fields() {
        let cmd = Command::Setup {
            ifname: "eth0".to_string(),
            options: Options {
                ipv4_address: Some("192.168.1.10".to_string()),
                ipv4_subnet_mask: Some("255.255.255.0".to_string()),
                ..Options::default()
            },
        };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({
                "cmd": "setup",
                "ifname": "eth0",
                "options": {
                    "ipv4_address": "192.168.1.10",
                    "ipv4_subnet_mask": "255.255.255.0",
                }
            })
        );
    }

    #[test]
    fn unrecognized_option_keys_pass_through() {
        let parsed: Options = serde_json::from_value(json!({
            "ipv4_gateway": "192.168.1.1",
            "dhcp_hostname": "widget",
        }))
        .unwrap();
        assert_eq!(parsed.ipv4_gateway.as_deref(), Some("192.168.1.1"));
        assert_eq!(parsed.extra["dhcp_hostname"], json!("widget"));

        let back = serde_json::to_value(&parsed).unwrap();
        assert_eq!(back["dhcp_hostname"], json!("widget"));
    }

    #[test]
    fn status_response_roundtrips() {
        let resp = Response::Status {
            status: sample_status("eth0"),
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["result"], json!("status"));
        assert_eq!(value["status"]["type"], json!("ethernet"));
        assert_eq!(value["status"]["operstate"], json!("up"));

        let parsed: Response = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, resp);
    }

    #[test]
    fn settings_absent_fields_mean_unconfigured() {
        let parsed: Response = serde_json::from_value(json!({
            "result": "settings",
            "settings": {"ipv4_address": "10.0.0.5"},
        }))
        .unwrap();
        match parsed {
            Response::Settings { settings } => {
                assert_eq!(settings.ipv4_address.as_deref(), Some("10.0.0.5"));
                assert_eq!(settings.ipv4_gateway, None);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn notification_carries_event_and_data() {
        let n = Notification::Ifremoved(IfIdentity {
            index: 3,
            ifname: "wlan0".to_string(),
        });
        assert_eq!(n.ifname(), "wlan0");
        assert_eq!(n.tag(), "ifremoved");
        assert_eq!(
            serde_json::to_value(&n).unwrap(),
            json!({"event": "ifremoved", "data": {"index": 3, "ifname": "wlan0"}})
        );
    }

    #[test]
    fn operstate_uses_kernel_atom_names() {
        assert_eq!(
            serde_json::to_value(OperState::LowerLayerDown).unwrap(),
            json!("lowerlayerdown")
        );
        assert_eq!(
            serde_json::to_value(OperState::NotPresent).unwrap(),
            json!("notpresent")
        );
    }
}
