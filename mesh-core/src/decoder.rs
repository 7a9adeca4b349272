//! Packet classification.
//!
//! [`classify`] is a pure function of the payload type tag: it turns one
//! [`RawPacket`] into one [`DecodedEvent`]. [`PacketDecoder`] wraps it with
//! duplicate suppression so that rebroadcast copies never reach the registry.

use std::time::{Duration, Instant};

use mesh_types::{
    decode_payload, AdminPayload, ChannelAdminEvent, ChannelIndex, DecodedEvent, Destination,
    DeviceMetrics, MessageId, NeighborEvent, NeighborInfoPayload, NeighborLink, NodeId,
    NodeInfoEvent, NodeInfoPayload, PacketMeta, PortNum, Position, PositionEvent, PositionPayload,
    RawEvent, RawPacket, ReactionEvent, RoutingEvent, RoutingPayload, TelemetryEvent,
    TelemetryPayload, TextEvent,
};
use serde::de::DeserializeOwned;

use crate::dedup::DuplicateFilter;
use crate::text::{self, TextBody};
use crate::DecodeError;

/// Scale of integer coordinates.
const COORDINATE_SCALE: f64 = 1e-7;

/// Classify one packet.
pub fn classify(packet: &RawPacket) -> Result<DecodedEvent, DecodeError> {
    let meta = PacketMeta {
        source: packet.source,
        timestamp: packet.timestamp,
        signal: packet.signal,
        hops_away: packet.hops_away(),
        sequence: packet.sequence,
    };

    match PortNum::from_tag(packet.port) {
        PortNum::Unknown => Err(DecodeError::UnknownType(packet.port)),
        PortNum::TextMessage => classify_text(packet, meta),
        PortNum::Position => {
            let payload: PositionPayload = payload(packet, "position")?;
            Ok(DecodedEvent::Position(PositionEvent {
                meta,
                position: Position {
                    latitude: f64::from(payload.latitude_i) * COORDINATE_SCALE,
                    longitude: f64::from(payload.longitude_i) * COORDINATE_SCALE,
                    altitude: payload.altitude,
                },
            }))
        }
        PortNum::NodeInfo => {
            let payload: NodeInfoPayload = payload(packet, "nodeinfo")?;
            Ok(DecodedEvent::NodeInfo(NodeInfoEvent {
                meta,
                long_name: payload.long_name,
                short_name: payload.short_name,
                hw_model: payload.hw_model,
                role: payload.role,
                has_public_key: payload.public_key.is_some_and(|key| !key.is_empty()),
            }))
        }
        PortNum::Telemetry => {
            let payload: TelemetryPayload = payload(packet, "telemetry")?;
            Ok(DecodedEvent::Telemetry(TelemetryEvent {
                meta,
                metrics: DeviceMetrics {
                    battery_level: payload.battery_level,
                    voltage: payload.voltage,
                    channel_utilization: payload.channel_utilization,
                    air_util_tx: payload.air_util_tx,
                },
            }))
        }
        PortNum::Routing => {
            let payload: RoutingPayload = payload(packet, "routing")?;
            Ok(DecodedEvent::Routing(RoutingEvent {
                meta,
                request_id: MessageId::new(payload.request_id),
                error: payload.error().map(str::to_string),
            }))
        }
        PortNum::Admin => {
            let AdminPayload::SetChannel(settings) = payload(packet, "admin")?;
            Ok(DecodedEvent::ChannelAdmin(ChannelAdminEvent { meta, settings }))
        }
        PortNum::NeighborInfo => {
            let payload: NeighborInfoPayload = payload(packet, "neighborinfo")?;
            Ok(DecodedEvent::Neighbor(NeighborEvent {
                meta,
                neighbors: payload
                    .neighbors
                    .into_iter()
                    .map(|entry| NeighborLink {
                        node: NodeId::new(entry.node_id),
                        snr: entry.snr,
                    })
                    .collect(),
            }))
        }
        PortNum::Other(port) => Ok(DecodedEvent::Raw(RawEvent { meta, port })),
    }
}

fn classify_text(packet: &RawPacket, meta: PacketMeta) -> Result<DecodedEvent, DecodeError> {
    let text = std::str::from_utf8(&packet.payload).map_err(|_| DecodeError::InvalidUtf8)?;

    match text::parse(text)? {
        TextBody::Reaction { target, emoji } => Ok(DecodedEvent::Reaction(ReactionEvent {
            meta,
            target,
            emoji,
        })),
        TextBody::Message { body, reply_to } => {
            let destination = if packet.destination.is_broadcast() {
                let index = ChannelIndex::new(packet.channel)
                    .ok_or(DecodeError::ChannelOutOfRange(packet.channel))?;
                Destination::Broadcast(index)
            } else {
                Destination::Direct(packet.destination)
            };
            Ok(DecodedEvent::Text(TextEvent {
                id: MessageId::new(packet.sequence),
                meta,
                destination,
                body,
                reply_to,
            }))
        }
    }
}

fn payload<T: DeserializeOwned>(packet: &RawPacket, port: &'static str) -> Result<T, DecodeError> {
    decode_payload(&packet.payload).map_err(|e| DecodeError::Malformed {
        port,
        reason: e.to_string(),
    })
}

/// What the decoder made of a packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A new event for the registry.
    Event(DecodedEvent),
    /// A rebroadcast copy of something already seen.
    Duplicate,
}

/// Stateful decoder: classification plus duplicate suppression.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    filter: DuplicateFilter,
}

impl PacketDecoder {
    /// Create a decoder with the given duplicate window.
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            filter: DuplicateFilter::new(window, capacity),
        }
    }

    /// Decode one packet received at `now`.
    pub fn decode(&mut self, packet: &RawPacket, now: Instant) -> Result<Decoded, DecodeError> {
        if self.filter.check(packet.source, packet.sequence, now) {
            return Ok(Decoded::Duplicate);
        }
        classify(packet).map(Decoded::Event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::{
        encode_payload, ChannelSettings, NeighborEntry, SignalMetrics, Timestamp,
    };

    fn packet(port: PortNum, payload: Vec<u8>) -> RawPacket {
        RawPacket {
            source: NodeId::new(0x1234),
            destination: NodeId::BROADCAST,
            channel: 0,
            port: port.tag(),
            payload,
            timestamp: Timestamp::from_secs(1_700_000_000),
            signal: SignalMetrics {
                snr: Some(6.5),
                rssi: Some(-90),
            },
            sequence: 1001,
            hop_start: Some(3),
            hop_limit: Some(2),
        }
    }

    #[test]
    fn text_broadcast_maps_to_channel() {
        let event = classify(&packet(PortNum::TextMessage, b"Hello".to_vec())).unwrap();
        match event {
            DecodedEvent::Text(text) => {
                assert_eq!(text.id, MessageId::new(1001));
                assert_eq!(text.body, "Hello");
                assert_eq!(text.destination, Destination::Broadcast(ChannelIndex::PRIMARY));
                assert_eq!(text.meta.hops_away, Some(1));
            }
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn direct_text_keeps_destination() {
        let mut raw = packet(PortNum::TextMessage, b"psst".to_vec());
        raw.destination = NodeId::new(0xbeef);
        let event = classify(&raw).unwrap();
        assert!(matches!(
            event,
            DecodedEvent::Text(TextEvent {
                destination: Destination::Direct(to),
                ..
            }) if to == NodeId::new(0xbeef)
        ));
    }

    #[test]
    fn text_on_bad_channel_fails() {
        let mut raw = packet(PortNum::TextMessage, b"x".to_vec());
        raw.channel = 9;
        assert_eq!(classify(&raw), Err(DecodeError::ChannelOutOfRange(9)));
    }

    #[test]
    fn invalid_utf8_fails() {
        let raw = packet(PortNum::TextMessage, vec![0xff, 0xfe]);
        assert_eq!(classify(&raw), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn reaction_text_becomes_reaction_event() {
        let raw = packet(PortNum::TextMessage, "[R:55:😂]".as_bytes().to_vec());
        match classify(&raw).unwrap() {
            DecodedEvent::Reaction(reaction) => {
                assert_eq!(reaction.target, MessageId::new(55));
                assert_eq!(reaction.emoji, "😂");
                assert_eq!(reaction.meta.source, NodeId::new(0x1234));
            }
            other => panic!("expected reaction, got {:?}", other),
        }
    }

    #[test]
    fn position_scales_integer_coordinates() {
        let bytes = encode_payload(&PositionPayload {
            latitude_i: 377_749_000,
            longitude_i: -1_224_194_000,
            altitude: Some(12),
        })
        .unwrap();
        match classify(&packet(PortNum::Position, bytes)).unwrap() {
            DecodedEvent::Position(pos) => {
                assert!((pos.position.latitude - 37.7749).abs() < 1e-6);
                assert!((pos.position.longitude + 122.4194).abs() < 1e-6);
                assert_eq!(pos.position.altitude, Some(12));
            }
            other => panic!("expected position, got {:?}", other),
        }
    }

    #[test]
    fn nodeinfo_reports_pki_from_public_key() {
        let bytes = encode_payload(&NodeInfoPayload {
            long_name: Some("Base Camp".into()),
            short_name: Some("BC".into()),
            hw_model: Some("TBEAM".into()),
            role: None,
            public_key: Some(vec![7; 32]),
        })
        .unwrap();
        match classify(&packet(PortNum::NodeInfo, bytes)).unwrap() {
            DecodedEvent::NodeInfo(info) => {
                assert_eq!(info.long_name.as_deref(), Some("Base Camp"));
                assert!(info.has_public_key);
            }
            other => panic!("expected nodeinfo, got {:?}", other),
        }
    }

    #[test]
    fn routing_nak_carries_reason() {
        let bytes = encode_payload(&RoutingPayload {
            request_id: 77,
            error_reason: "NO_RESPONSE".into(),
        })
        .unwrap();
        match classify(&packet(PortNum::Routing, bytes)).unwrap() {
            DecodedEvent::Routing(routing) => {
                assert_eq!(routing.request_id, MessageId::new(77));
                assert_eq!(routing.error.as_deref(), Some("NO_RESPONSE"));
            }
            other => panic!("expected routing, got {:?}", other),
        }
    }

    #[test]
    fn admin_payload_becomes_channel_admin() {
        let bytes = encode_payload(&AdminPayload::SetChannel(ChannelSettings {
            index: 2,
            name: "hikers".into(),
            psk: vec![1],
            role: 2,
            uplink_enabled: false,
            downlink_enabled: false,
        }))
        .unwrap();
        match classify(&packet(PortNum::Admin, bytes)).unwrap() {
            DecodedEvent::ChannelAdmin(admin) => {
                assert_eq!(admin.settings.index, 2);
                assert_eq!(admin.settings.name, "hikers");
            }
            other => panic!("expected channel admin, got {:?}", other),
        }
    }

    #[test]
    fn neighbor_report_lists_links() {
        let bytes = encode_payload(&NeighborInfoPayload {
            neighbors: vec![NeighborEntry {
                node_id: 0x99,
                snr: 3.25,
            }],
        })
        .unwrap();
        match classify(&packet(PortNum::NeighborInfo, bytes)).unwrap() {
            DecodedEvent::Neighbor(report) => {
                assert_eq!(report.neighbors.len(), 1);
                assert_eq!(report.neighbors[0].node, NodeId::new(0x99));
            }
            other => panic!("expected neighbor, got {:?}", other),
        }
    }

    #[test]
    fn unrecognized_tag_is_raw() {
        let event = classify(&packet(PortNum::Other(256), vec![1, 2, 3])).unwrap();
        assert!(matches!(event, DecodedEvent::Raw(RawEvent { port: 256, .. })));
    }

    #[test]
    fn undecodable_tag_is_an_error() {
        assert_eq!(
            classify(&packet(PortNum::Unknown, vec![1])),
            Err(DecodeError::UnknownType(0))
        );
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let err = classify(&packet(PortNum::Telemetry, vec![0xc1])).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { port: "telemetry", .. }));
    }

    #[test]
    fn decoder_suppresses_rebroadcast() {
        let now = Instant::now();
        let mut decoder = PacketDecoder::default();
        let raw = packet(PortNum::TextMessage, b"Hello".to_vec());

        assert!(matches!(decoder.decode(&raw, now).unwrap(), Decoded::Event(_)));
        assert_eq!(
            decoder.decode(&raw, now + Duration::from_secs(2)).unwrap(),
            Decoded::Duplicate
        );
    }
}
