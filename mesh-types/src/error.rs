//! Error types for meshsync wire and identity handling.

use thiserror::Error;

/// Errors raised while parsing ids or encoding wire payloads.
#[derive(Debug, Error)]
pub enum TypesError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Text that does not name a node
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    /// Channel slot outside 0..8
    #[error("channel index out of range: {0}")]
    ChannelOutOfRange(u8),
}
