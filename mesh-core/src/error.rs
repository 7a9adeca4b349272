//! Decode and validation errors.

use mesh_types::{ChannelIndex, ConversationKey, DeliveryState, MessageId, NodeId};
use thiserror::Error;

/// A raw packet that could not be classified.
///
/// Always recoverable: the packet is logged, counted and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The payload type says the body is undecodable.
    #[error("unknown payload type {0}")]
    UnknownType(u32),

    /// The payload did not parse for its type.
    #[error("malformed {port} payload: {reason}")]
    Malformed {
        /// Payload type name.
        port: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// Text payload was not UTF-8.
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,

    /// Packet heard on a slot outside 0..8.
    #[error("channel {0} out of range")]
    ChannelOutOfRange(u8),

    /// Reaction with an emoji outside the supported set.
    #[error("unsupported reaction {0:?}")]
    UnsupportedReaction(String),
}

/// Data that violates a registry invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Channel slot outside 0..8.
    #[error("channel index {0} out of range")]
    ChannelOutOfRange(u8),

    /// Channel role number not recognized.
    #[error("invalid channel role {0}")]
    InvalidChannelRole(u8),

    /// Zero, broadcast or otherwise unusable id.
    #[error("malformed id: {0}")]
    MalformedId(String),

    /// Delivery state would move backward or between terminal states.
    #[error("message {id}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        /// Message.
        id: MessageId,
        /// Current state.
        from: DeliveryState,
        /// Requested state.
        to: DeliveryState,
    },

    /// Referenced message is not known.
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),

    /// Referenced node is not known.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// Reply parent lives in another thread.
    #[error("reply target {parent} is not in {conversation}")]
    ReplyOutsideConversation {
        /// The parent.
        parent: MessageId,
        /// The thread of the reply.
        conversation: ConversationKey,
    },

    /// Sending on a disabled slot.
    #[error("channel {0} is disabled")]
    ChannelDisabled(ChannelIndex),

    /// Empty text.
    #[error("message body is empty")]
    EmptyBody,

    /// Text longer than a packet allows.
    #[error("message body is {len} bytes (limit {max})")]
    BodyTooLong {
        /// Actual length.
        len: usize,
        /// Limit.
        max: usize,
    },

    /// Emoji outside the supported set.
    #[error("unsupported reaction {0:?}")]
    UnsupportedReaction(String),
}

/// Result type alias for decoding.
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Result type alias for registry validation.
pub type ValidationResult<T> = std::result::Result<T, ValidationError>;
