//! Change notifications delivered to subscribers.
//!
//! A notification names what changed, never the new value: subscribers
//! re-query the registry for the authoritative state.

use serde::{Deserialize, Serialize};

use crate::{ConversationKey, DeliveryState, EntityKey, EntityKind, FieldGroup};

/// What a subscriber listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Any node change.
    AllNodes,
    /// Messages, reactions and delivery changes in one thread.
    Conversation(ConversationKey),
    /// Channel slot changes.
    Channels,
    /// Link state transitions.
    ConnectionState,
}

/// Connection state as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkStatus {
    /// No device link.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Link up and heartbeats flowing.
    Connected,
    /// Link up but heartbeats missed; commands are held.
    Degraded,
}

/// Summary of a committed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeSummary {
    /// A new entity.
    Created,
    /// Field groups that moved.
    Updated(Vec<FieldGroup>),
    /// Delivery state moved.
    Delivery {
        /// Previous state.
        from: DeliveryState,
        /// New state.
        to: DeliveryState,
    },
    /// A reaction was added to the message.
    Reacted,
    /// The entity was removed (pruning).
    Removed,
    /// The link moved.
    Link {
        /// New status.
        status: LinkStatus,
        /// Cause, for losses and failures.
        reason: Option<String>,
    },
}

/// One notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Topic it is delivered on.
    pub topic: Topic,
    /// Kind of the changed entity; `None` for link changes.
    pub kind: Option<EntityKind>,
    /// Identity of the changed entity; `None` for link changes.
    pub key: Option<EntityKey>,
    /// What changed.
    pub summary: ChangeSummary,
}

impl Notification {
    /// A notification about an entity.
    pub fn entity(topic: Topic, key: EntityKey, summary: ChangeSummary) -> Self {
        Self {
            topic,
            kind: Some(key.kind()),
            key: Some(key),
            summary,
        }
    }

    /// A link state notification.
    pub fn link(status: LinkStatus, reason: Option<String>) -> Self {
        Self {
            topic: Topic::ConnectionState,
            kind: None,
            key: None,
            summary: ChangeSummary::Link { status, reason },
        }
    }
}
