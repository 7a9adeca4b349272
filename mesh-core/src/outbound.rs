//! Frames for outgoing commands.

use mesh_types::{
    encode_payload, AdminPayload, Channel, ChannelSettings, Destination, MessageId, NodeId,
    OutboundFrame, PortNum, TypesError,
};

use crate::text;

/// Longest text body accepted for sending, in bytes.
pub const MAX_TEXT_BYTES: usize = 200;

/// A fresh random non-zero packet id.
///
/// Falls back to a time-derived value if the OS random source fails.
pub fn random_message_id() -> MessageId {
    let mut bytes = [0u8; 4];
    let raw = match getrandom::getrandom(&mut bytes) {
        Ok(()) => u32::from_le_bytes(bytes),
        Err(_) => std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(1),
    };
    MessageId::new(raw.max(1))
}

fn route(destination: Destination) -> (NodeId, u8) {
    match destination {
        Destination::Broadcast(index) => (NodeId::BROADCAST, index.value()),
        Destination::Direct(node) => (node, 0),
    }
}

/// Frame for a chat message.
pub fn text_frame(
    id: MessageId,
    destination: Destination,
    body: &str,
    reply_to: Option<MessageId>,
) -> OutboundFrame {
    let (to, channel) = route(destination);
    OutboundFrame {
        id,
        destination: to,
        channel,
        port: PortNum::TextMessage.tag(),
        payload: text::format_message(body, reply_to).into_bytes(),
        want_ack: true,
    }
}

/// Frame for a reaction, sent to the same place as its target.
pub fn reaction_frame(
    id: MessageId,
    destination: Destination,
    target: MessageId,
    emoji: &str,
) -> OutboundFrame {
    let (to, channel) = route(destination);
    OutboundFrame {
        id,
        destination: to,
        channel,
        port: PortNum::TextMessage.tag(),
        payload: text::format_reaction(target, emoji).into_bytes(),
        want_ack: false,
    }
}

/// Wire form of a channel slot.
pub fn channel_settings(channel: &Channel) -> ChannelSettings {
    ChannelSettings {
        index: channel.index.value(),
        name: channel.name.clone(),
        psk: channel.psk.clone(),
        role: channel.role.to_wire(),
        uplink_enabled: channel.uplink_enabled,
        downlink_enabled: channel.downlink_enabled,
    }
}

/// Admin frame writing channel settings to `to` (the attached device, or a
/// remote node being invited).
pub fn channel_frame(
    id: MessageId,
    to: NodeId,
    settings: ChannelSettings,
) -> Result<OutboundFrame, TypesError> {
    Ok(OutboundFrame {
        id,
        destination: to,
        channel: 0,
        port: PortNum::Admin.tag(),
        payload: encode_payload(&AdminPayload::SetChannel(settings))?,
        want_ack: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::classify;
    use mesh_types::{
        ChannelIndex, ChannelRole, DecodedEvent, RawPacket, SignalMetrics, Timestamp,
    };

    fn as_received(frame: &OutboundFrame) -> RawPacket {
        RawPacket {
            source: NodeId::new(1),
            destination: frame.destination,
            channel: frame.channel,
            port: frame.port,
            payload: frame.payload.clone(),
            timestamp: Timestamp::from_secs(1),
            signal: SignalMetrics::default(),
            sequence: frame.id.value(),
            hop_start: None,
            hop_limit: None,
        }
    }

    #[test]
    fn random_ids_are_nonzero() {
        for _ in 0..100 {
            assert!(random_message_id().is_valid());
        }
    }

    #[test]
    fn broadcast_text_frame() {
        let frame = text_frame(
            MessageId::new(5),
            Destination::Broadcast(ChannelIndex::new(2).unwrap()),
            "hi",
            None,
        );
        assert_eq!(frame.destination, NodeId::BROADCAST);
        assert_eq!(frame.channel, 2);
        assert_eq!(frame.payload, b"hi");
        assert!(frame.want_ack);
    }

    #[test]
    fn reply_frame_decodes_to_reply() {
        let frame = text_frame(
            MessageId::new(6),
            Destination::Direct(NodeId::new(0x42)),
            "ok",
            Some(MessageId::new(5)),
        );
        match classify(&as_received(&frame)).unwrap() {
            DecodedEvent::Text(text) => {
                assert_eq!(text.body, "ok");
                assert_eq!(text.reply_to, Some(MessageId::new(5)));
            }
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn reaction_frame_decodes_to_reaction() {
        let frame = reaction_frame(
            MessageId::new(7),
            Destination::Broadcast(ChannelIndex::PRIMARY),
            MessageId::new(5),
            "👍",
        );
        assert!(matches!(
            classify(&as_received(&frame)).unwrap(),
            DecodedEvent::Reaction(_)
        ));
    }

    #[test]
    fn channel_frame_carries_settings() {
        let mut channel = Channel::factory(ChannelIndex::new(1).unwrap());
        channel.name = "ops".into();
        channel.role = ChannelRole::Secondary;
        let frame =
            channel_frame(MessageId::new(8), NodeId::LOCAL, channel_settings(&channel)).unwrap();
        match classify(&as_received(&frame)).unwrap() {
            DecodedEvent::ChannelAdmin(admin) => {
                assert_eq!(admin.settings.index, 1);
                assert_eq!(admin.settings.name, "ops");
                assert_eq!(admin.settings.role, 2);
            }
            other => panic!("expected channel admin, got {:?}", other),
        }
    }
}
