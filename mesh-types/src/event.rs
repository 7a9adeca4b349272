//! Typed domain events produced by packet classification.

use crate::{
    ChannelSettings, Destination, DeviceMetrics, MessageId, NeighborLink, NodeId, Position,
    SignalMetrics, Timestamp,
};

/// Metadata every decoded event carries from its packet.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketMeta {
    /// Sending node.
    pub source: NodeId,
    /// Packet time.
    pub timestamp: Timestamp,
    /// Link quality.
    pub signal: SignalMetrics,
    /// Hops travelled.
    pub hops_away: Option<u8>,
    /// Transport sequence number.
    pub sequence: u32,
}

impl PacketMeta {
    /// Metadata for something the attached device itself originated.
    pub fn local(source: NodeId, timestamp: Timestamp) -> Self {
        Self {
            source,
            timestamp,
            signal: SignalMetrics::default(),
            hops_away: None,
            sequence: 0,
        }
    }
}

/// A chat message.
#[derive(Debug, Clone, PartialEq)]
pub struct TextEvent {
    /// Packet metadata.
    pub meta: PacketMeta,
    /// Message id (the packet id).
    pub id: MessageId,
    /// Addressee.
    pub destination: Destination,
    /// Body with any reply prefix removed.
    pub body: String,
    /// Parent message.
    pub reply_to: Option<MessageId>,
}

/// A position fix.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionEvent {
    /// Packet metadata.
    pub meta: PacketMeta,
    /// The fix.
    pub position: Position,
}

/// Device telemetry.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    /// Packet metadata.
    pub meta: PacketMeta,
    /// Reported metrics.
    pub metrics: DeviceMetrics,
}

/// Identity info.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfoEvent {
    /// Packet metadata.
    pub meta: PacketMeta,
    /// Display name.
    pub long_name: Option<String>,
    /// Short name.
    pub short_name: Option<String>,
    /// Hardware model.
    pub hw_model: Option<String>,
    /// Device role.
    pub role: Option<String>,
    /// PKI completed.
    pub has_public_key: bool,
}

/// A reaction to an earlier message.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionEvent {
    /// Packet metadata; the source is the author.
    pub meta: PacketMeta,
    /// Target message.
    pub target: MessageId,
    /// The emoji.
    pub emoji: String,
}

/// A channel slot report or change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelAdminEvent {
    /// Packet metadata.
    pub meta: PacketMeta,
    /// New slot settings; the index is not yet range-checked.
    pub settings: ChannelSettings,
}

/// Delivery ack/nak.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingEvent {
    /// Packet metadata.
    pub meta: PacketMeta,
    /// Packet being resolved.
    pub request_id: MessageId,
    /// Failure reason, `None` on success.
    pub error: Option<String>,
}

/// Neighbor report.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborEvent {
    /// Packet metadata; the source is the reporter.
    pub meta: PacketMeta,
    /// Neighbors heard.
    pub neighbors: Vec<NeighborLink>,
}

/// A packet with an unrecognized type tag.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// Packet metadata.
    pub meta: PacketMeta,
    /// The raw tag.
    pub port: u32,
}

/// Closed set of events the registry folds.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    /// Chat text.
    Text(TextEvent),
    /// Position fix.
    Position(PositionEvent),
    /// Telemetry.
    Telemetry(TelemetryEvent),
    /// Identity.
    NodeInfo(NodeInfoEvent),
    /// Reaction.
    Reaction(ReactionEvent),
    /// Channel settings.
    ChannelAdmin(ChannelAdminEvent),
    /// Delivery ack/nak.
    Routing(RoutingEvent),
    /// Neighbor report.
    Neighbor(NeighborEvent),
    /// Unknown type.
    Raw(RawEvent),
}

impl DecodedEvent {
    /// Packet metadata of any variant.
    pub fn meta(&self) -> &PacketMeta {
        match self {
            Self::Text(e) => &e.meta,
            Self::Position(e) => &e.meta,
            Self::Telemetry(e) => &e.meta,
            Self::NodeInfo(e) => &e.meta,
            Self::Reaction(e) => &e.meta,
            Self::ChannelAdmin(e) => &e.meta,
            Self::Routing(e) => &e.meta,
            Self::Neighbor(e) => &e.meta,
            Self::Raw(e) => &e.meta,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Position(_) => "position",
            Self::Telemetry(_) => "telemetry",
            Self::NodeInfo(_) => "nodeinfo",
            Self::Reaction(_) => "reaction",
            Self::ChannelAdmin(_) => "channel-admin",
            Self::Routing(_) => "routing",
            Self::Neighbor(_) => "neighbor",
            Self::Raw(_) => "raw",
        }
    }
}
