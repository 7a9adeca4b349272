//! Raw packets as the transport hands them over, and their payload bodies.
//!
//! Text payloads are plain UTF-8. Every other tagged payload is a
//! MessagePack map of one of the structs below.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{MessageId, NodeId, SignalMetrics, Timestamp, TypesError};

/// Payload type tag (the radio's port number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortNum {
    /// Undecodable payload (usually encrypted for someone else).
    Unknown,
    /// UTF-8 chat text.
    TextMessage,
    /// Position fix.
    Position,
    /// User/identity info.
    NodeInfo,
    /// Delivery ack/nak.
    Routing,
    /// Device administration (channel settings).
    Admin,
    /// Device telemetry.
    Telemetry,
    /// Neighbor report.
    NeighborInfo,
    /// Anything else.
    Other(u32),
}

impl PortNum {
    /// Map a raw tag to a port.
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            0 => Self::Unknown,
            1 => Self::TextMessage,
            3 => Self::Position,
            4 => Self::NodeInfo,
            5 => Self::Routing,
            6 => Self::Admin,
            67 => Self::Telemetry,
            71 => Self::NeighborInfo,
            other => Self::Other(other),
        }
    }

    /// The raw tag.
    pub fn tag(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::TextMessage => 1,
            Self::Position => 3,
            Self::NodeInfo => 4,
            Self::Routing => 5,
            Self::Admin => 6,
            Self::Telemetry => 67,
            Self::NeighborInfo => 71,
            Self::Other(tag) => tag,
        }
    }
}

/// One packet from the transport, before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacket {
    /// Sending node.
    pub source: NodeId,
    /// Addressee ([`NodeId::BROADCAST`] for channel traffic).
    pub destination: NodeId,
    /// Channel slot the packet was heard on.
    pub channel: u8,
    /// Payload type tag.
    pub port: u32,
    /// Payload body.
    pub payload: Vec<u8>,
    /// Receive time.
    pub timestamp: Timestamp,
    /// Link quality.
    pub signal: SignalMetrics,
    /// Transport sequence number (the packet id); 0 when unnumbered.
    pub sequence: u32,
    /// Hop limit the packet started with.
    pub hop_start: Option<u8>,
    /// Hop limit left on arrival.
    pub hop_limit: Option<u8>,
}

impl RawPacket {
    /// Hops travelled, when both hop fields are present and consistent.
    pub fn hops_away(&self) -> Option<u8> {
        match (self.hop_start, self.hop_limit) {
            (Some(start), Some(limit)) if start >= limit => Some(start - limit),
            _ => None,
        }
    }
}

/// Position payload; coordinates are in units of 1e-7 degrees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionPayload {
    /// Latitude * 1e7.
    pub latitude_i: i32,
    /// Longitude * 1e7.
    pub longitude_i: i32,
    /// Altitude in meters.
    #[serde(default)]
    pub altitude: Option<i32>,
}

/// Identity payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeInfoPayload {
    /// Display name.
    #[serde(default)]
    pub long_name: Option<String>,
    /// Short name.
    #[serde(default)]
    pub short_name: Option<String>,
    /// Hardware model.
    #[serde(default)]
    pub hw_model: Option<String>,
    /// Device role.
    #[serde(default)]
    pub role: Option<String>,
    /// Public key, when the node has completed PKI setup.
    #[serde(default)]
    pub public_key: Option<Vec<u8>>,
}

/// Device telemetry payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryPayload {
    /// Battery percent.
    #[serde(default)]
    pub battery_level: Option<u32>,
    /// Battery voltage.
    #[serde(default)]
    pub voltage: Option<f32>,
    /// Channel utilization percent.
    #[serde(default)]
    pub channel_utilization: Option<f32>,
    /// Airtime percent.
    #[serde(default)]
    pub air_util_tx: Option<f32>,
}

/// Delivery ack/nak for an earlier packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPayload {
    /// Id of the packet being acknowledged.
    pub request_id: u32,
    /// Empty or `NONE` on success.
    #[serde(default)]
    pub error_reason: String,
}

impl RoutingPayload {
    /// The failure reason, if this is a nak.
    pub fn error(&self) -> Option<&str> {
        match self.error_reason.as_str() {
            "" | "NONE" => None,
            reason => Some(reason),
        }
    }
}

/// Channel settings as carried in admin payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Slot index (validated by the registry).
    pub index: u8,
    /// Name.
    #[serde(default)]
    pub name: String,
    /// Pre-shared key bytes.
    #[serde(default)]
    pub psk: Vec<u8>,
    /// 0 disabled, 1 primary, 2 secondary.
    pub role: u8,
    /// MQTT uplink.
    #[serde(default)]
    pub uplink_enabled: bool,
    /// MQTT downlink.
    #[serde(default)]
    pub downlink_enabled: bool,
}

/// Administrative payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminPayload {
    /// Write (or report) one channel slot.
    SetChannel(ChannelSettings),
}

/// One neighbor entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NeighborEntry {
    /// Neighbor id.
    pub node_id: u32,
    /// SNR heard.
    pub snr: f32,
}

/// Neighbor report payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NeighborInfoPayload {
    /// Neighbors heard by the sender.
    #[serde(default)]
    pub neighbors: Vec<NeighborEntry>,
}

/// Encode a payload struct to MessagePack.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, TypesError> {
    rmp_serde::to_vec_named(payload).map_err(TypesError::Serialization)
}

/// Decode a MessagePack payload struct.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TypesError> {
    rmp_serde::from_slice(bytes).map_err(TypesError::Deserialization)
}

/// An outbound packet for the transport to write.
#[derive(Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Packet id; acks refer back to it.
    pub id: MessageId,
    /// Addressee ([`NodeId::BROADCAST`] for channel traffic, [`NodeId::LOCAL`]
    /// for the attached device).
    pub destination: NodeId,
    /// Channel slot.
    pub channel: u8,
    /// Payload type tag.
    pub port: u32,
    /// Payload body.
    pub payload: Vec<u8>,
    /// Request an ack.
    pub want_ack: bool,
}

impl std::fmt::Debug for OutboundFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundFrame")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("channel", &self.channel)
            .field("port", &self.port)
            .field("payload", &format_args!("[{} bytes]", self.payload.len()))
            .field("want_ack", &self.want_ack)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_tags_map_both_ways() {
        for tag in [0, 1, 3, 4, 5, 6, 67, 71, 99] {
            assert_eq!(PortNum::from_tag(tag).tag(), tag);
        }
        assert_eq!(PortNum::from_tag(99), PortNum::Other(99));
    }

    #[test]
    fn routing_error_reason() {
        let ok = RoutingPayload {
            request_id: 1,
            error_reason: "NONE".into(),
        };
        assert_eq!(ok.error(), None);
        let nak = RoutingPayload {
            request_id: 1,
            error_reason: "MAX_RETRANSMIT".into(),
        };
        assert_eq!(nak.error(), Some("MAX_RETRANSMIT"));
    }

    #[test]
    fn optional_payload_fields_default() {
        #[derive(Serialize)]
        struct Partial {
            long_name: String,
        }
        let bytes = encode_payload(&Partial {
            long_name: "Base".into(),
        })
        .unwrap();
        let info: NodeInfoPayload = decode_payload(&bytes).unwrap();
        assert_eq!(info.long_name.as_deref(), Some("Base"));
        assert_eq!(info.public_key, None);
    }

    #[test]
    fn hops_away_requires_consistent_fields() {
        let mut packet = RawPacket {
            source: NodeId::new(1),
            destination: NodeId::BROADCAST,
            channel: 0,
            port: 1,
            payload: Vec::new(),
            timestamp: Timestamp::default(),
            signal: SignalMetrics::default(),
            sequence: 1,
            hop_start: Some(3),
            hop_limit: Some(1),
        };
        assert_eq!(packet.hops_away(), Some(2));
        packet.hop_limit = Some(5);
        assert_eq!(packet.hops_away(), None);
        packet.hop_start = None;
        assert_eq!(packet.hops_away(), None);
    }

    #[test]
    fn frame_debug_hides_payload() {
        let frame = OutboundFrame {
            id: MessageId::new(7),
            destination: NodeId::BROADCAST,
            channel: 0,
            port: 1,
            payload: b"secret".to_vec(),
            want_ack: true,
        };
        let debug = format!("{:?}", frame);
        assert!(debug.contains("[6 bytes]"));
        assert!(!debug.contains("secret"));
    }
}
