//! # mesh-types
//!
//! Domain and wire types for the meshsync state synchronization engine.
//!
//! This crate provides the foundational types used across all meshsync crates:
//! - [`NodeId`], [`MessageId`], [`ChannelIndex`], [`Timestamp`], [`ConversationKey`] - identity
//!   and ordering
//! - [`Node`], [`Channel`], [`Message`], [`Reaction`] - the registry's entities
//! - [`RawPacket`] and payload structs - what the transport hands over
//! - [`DecodedEvent`] - the closed set of events the registry folds
//! - [`Record`], [`EntityKey`] - persisted form
//! - [`Notification`], [`Topic`] - what subscribers receive

#![warn(missing_docs)]
#![warn(clippy::all)]

mod entity;
mod error;
mod event;
mod ids;
mod model;
mod notification;
mod packet;

pub use entity::{EntityKey, EntityKind, Record};
pub use error::TypesError;
pub use event::{
    ChannelAdminEvent, DecodedEvent, NeighborEvent, NodeInfoEvent, PacketMeta, PositionEvent,
    RawEvent, ReactionEvent, RoutingEvent, TelemetryEvent, TextEvent,
};
pub use ids::{ChannelIndex, ConversationKey, MessageId, NodeId, Timestamp, MAX_CHANNELS};
pub use model::{
    is_supported_reaction, Channel, ChannelRole, DeliveryOutcome, DeliveryState, Destination,
    DeviceMetrics, FieldGroup, Message, NeighborLink, Node, Position, Reaction, SignalMetrics,
    SUPPORTED_REACTIONS,
};
pub use notification::{ChangeSummary, LinkStatus, Notification, Topic};
pub use packet::{
    decode_payload, encode_payload, AdminPayload, ChannelSettings, NeighborEntry,
    NeighborInfoPayload, NodeInfoPayload, OutboundFrame, PortNum, PositionPayload, RawPacket,
    RoutingPayload, TelemetryPayload,
};
