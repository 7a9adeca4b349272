//! Error types for mesh-engine.

use mesh_core::{DecodeError, QueueError, ValidationError};
use mesh_store::StorageError;
use mesh_types::{MessageId, TypesError};

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Main error type for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A packet could not be classified.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The mutation violates a registry invariant; nothing was changed.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The command was never transmitted (second write failure, timeout or
    /// cancellation). The message record carries the same reason.
    #[error("delivery of {id} failed: {reason}")]
    DeliveryFailed {
        /// Command id.
        id: MessageId,
        /// Why it failed.
        reason: String,
    },

    /// The store rejected a commit; the mutation was rolled back.
    #[error("storage error: {0}")]
    Store(#[from] StorageError),

    /// A previous commit failed and the store has not recovered yet.
    #[error("store unavailable, mutations are rejected until it recovers")]
    StoreUnavailable,

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Command queue refused the operation.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// A frame could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] TypesError),

    /// The engine was started without a packet log.
    #[error("packet log is not enabled")]
    PacketLogDisabled,

    /// The engine has shut down.
    #[error("engine is shut down")]
    Shutdown,
}

/// Result type alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
