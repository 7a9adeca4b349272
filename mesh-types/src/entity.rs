//! Kind-tagged keys and records shared by the registry and the store.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Channel, ChannelIndex, Message, MessageId, Node, NodeId, Reaction};

/// The four persisted entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// [`Node`]
    Node,
    /// [`Channel`]
    Channel,
    /// [`Message`]
    Message,
    /// [`Reaction`]
    Reaction,
}

impl EntityKind {
    /// Every kind, in replay order (reactions after the messages they target).
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Node,
        EntityKind::Channel,
        EntityKind::Message,
        EntityKind::Reaction,
    ];
}

/// Identity of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKey {
    /// A node.
    Node(NodeId),
    /// A channel slot.
    Channel(ChannelIndex),
    /// A message.
    Message(MessageId),
    /// A reaction, identified by its collapse key.
    Reaction {
        /// Target message.
        message: MessageId,
        /// Author.
        author: NodeId,
        /// Emoji.
        emoji: String,
    },
}

impl EntityKey {
    /// The kind this key addresses.
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Node(_) => EntityKind::Node,
            Self::Channel(_) => EntityKind::Channel,
            Self::Message(_) => EntityKind::Message,
            Self::Reaction { .. } => EntityKind::Reaction,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "node {}", id),
            Self::Channel(index) => write!(f, "channel {}", index),
            Self::Message(id) => write!(f, "message {}", id),
            Self::Reaction {
                message,
                author,
                emoji,
            } => write!(f, "reaction {} by {} on {}", emoji, author, message),
        }
    }
}

/// One persisted entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// A node.
    Node(Node),
    /// A channel slot.
    Channel(Channel),
    /// A message (without its reactions).
    Message(Message),
    /// A reaction.
    Reaction(Reaction),
}

impl Record {
    /// The record's kind.
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Node(_) => EntityKind::Node,
            Self::Channel(_) => EntityKind::Channel,
            Self::Message(_) => EntityKind::Message,
            Self::Reaction(_) => EntityKind::Reaction,
        }
    }

    /// The record's key.
    pub fn key(&self) -> EntityKey {
        match self {
            Self::Node(node) => EntityKey::Node(node.id),
            Self::Channel(channel) => EntityKey::Channel(channel.index),
            Self::Message(message) => EntityKey::Message(message.id),
            Self::Reaction(reaction) => EntityKey::Reaction {
                message: reaction.message,
                author: reaction.author,
                emoji: reaction.emoji.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Timestamp;

    #[test]
    fn record_keys_match_kinds() {
        let node = Record::Node(Node::new(NodeId::new(5)));
        assert_eq!(node.kind(), EntityKind::Node);
        assert_eq!(node.key(), EntityKey::Node(NodeId::new(5)));
        assert_eq!(node.key().kind(), EntityKind::Node);

        let reaction = Record::Reaction(Reaction {
            message: MessageId::new(9),
            author: NodeId::new(5),
            emoji: "👍".into(),
            timestamp: Timestamp::from_secs(1),
        });
        assert_eq!(reaction.key().kind(), EntityKind::Reaction);
        assert_eq!(
            reaction.key().to_string(),
            "reaction 👍 by !00000005 on 9"
        );
    }
}
