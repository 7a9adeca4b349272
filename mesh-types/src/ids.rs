//! Identity and ordering types for meshsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::TypesError;

/// Number of channel slots a radio exposes.
pub const MAX_CHANNELS: u8 = 8;

/// A stable 32-bit radio identifier.
///
/// Displayed in the conventional `!xxxxxxxx` form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    /// The broadcast address.
    pub const BROADCAST: NodeId = NodeId(0xffff_ffff);

    /// Placeholder for "the attached device" before its real id is known.
    pub const LOCAL: NodeId = NodeId(0);

    /// Create a NodeId from its raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Whether this is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Whether this id can name a real node (not broadcast, not the placeholder).
    pub fn is_addressable(&self) -> bool {
        *self != Self::BROADCAST && *self != Self::LOCAL
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl FromStr for NodeId {
    type Err = TypesError;

    /// Parses `!a1b2c3d4` or a bare hex string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix('!').unwrap_or(s);
        if hex.is_empty() || hex.len() > 8 {
            return Err(TypesError::InvalidNodeId(s.to_string()));
        }
        u32::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| TypesError::InvalidNodeId(s.to_string()))
    }
}

/// A message (packet) identifier.
///
/// Remote messages carry the id the originating radio assigned; locally
/// authored ones are drawn at random. Zero is never a valid id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(u32);

impl MessageId {
    /// Create a MessageId from its raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Whether this id is usable (non-zero).
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

/// A channel slot index, always in `0..MAX_CHANNELS`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ChannelIndex(u8);

impl ChannelIndex {
    /// The primary channel slot.
    pub const PRIMARY: ChannelIndex = ChannelIndex(0);

    /// Create a ChannelIndex, returning None when out of range.
    pub fn new(index: u8) -> Option<Self> {
        (index < MAX_CHANNELS).then_some(Self(index))
    }

    /// Get the raw slot number.
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Iterate all slots in order.
    pub fn all() -> impl Iterator<Item = ChannelIndex> {
        (0..MAX_CHANNELS).map(ChannelIndex)
    }
}

impl TryFrom<u8> for ChannelIndex {
    type Error = TypesError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(TypesError::ChannelOutOfRange(value))
    }
}

impl From<ChannelIndex> for u8 {
    fn from(index: ChannelIndex) -> u8 {
        index.0
    }
}

impl fmt::Display for ChannelIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ChannelIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelIndex({})", self.0)
    }
}

/// Unix time in milliseconds.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a timestamp from unix milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Create a timestamp from unix seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| Self(d.as_millis() as u64))
            .unwrap_or_default()
    }

    /// Unix milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Unix seconds (truncated).
    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// This timestamp moved back by `millis`, saturating at zero.
    pub fn saturating_sub_millis(&self, millis: u64) -> Self {
        Self(self.0.saturating_sub(millis))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Partition key for messages: a broadcast channel or a DM peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConversationKey {
    /// Broadcast traffic on a channel slot.
    Channel(ChannelIndex),
    /// Direct messages with a peer node.
    Direct(NodeId),
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Channel(index) => write!(f, "ch:{}", index),
            ConversationKey::Direct(peer) => write!(f, "dm:{}", peer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_displays_bang_hex() {
        assert_eq!(NodeId::new(0xa1b2c3d4).to_string(), "!a1b2c3d4");
        assert_eq!(NodeId::new(0x42).to_string(), "!00000042");
    }

    #[test]
    fn node_id_parses_with_and_without_bang() {
        assert_eq!("!a1b2c3d4".parse::<NodeId>().unwrap(), NodeId::new(0xa1b2c3d4));
        assert_eq!("ff".parse::<NodeId>().unwrap(), NodeId::new(0xff));
        assert!("!nothex".parse::<NodeId>().is_err());
        assert!("!".parse::<NodeId>().is_err());
        assert!("!123456789".parse::<NodeId>().is_err());
    }

    #[test]
    fn node_id_addressability() {
        assert!(!NodeId::BROADCAST.is_addressable());
        assert!(!NodeId::LOCAL.is_addressable());
        assert!(NodeId::new(7).is_addressable());
    }

    #[test]
    fn channel_index_range_checked() {
        assert!(ChannelIndex::new(0).is_some());
        assert!(ChannelIndex::new(7).is_some());
        assert!(ChannelIndex::new(8).is_none());
        assert_eq!(ChannelIndex::all().count(), 8);
    }

    #[test]
    fn channel_index_deserialize_rejects_out_of_range() {
        let ok: ChannelIndex = serde_json::from_str("3").unwrap();
        assert_eq!(ok.value(), 3);
        assert!(serde_json::from_str::<ChannelIndex>("9").is_err());
    }

    #[test]
    fn conversation_keys_order_channels_first() {
        let ch = ConversationKey::Channel(ChannelIndex::PRIMARY);
        let dm = ConversationKey::Direct(NodeId::new(1));
        assert!(ch < dm);
        assert_eq!(dm.to_string(), "dm:!00000001");
    }

    #[test]
    fn timestamp_conversions() {
        let ts = Timestamp::from_secs(1_700_000_000);
        assert_eq!(ts.as_millis(), 1_700_000_000_000);
        assert_eq!(ts.as_secs(), 1_700_000_000);
        assert_eq!(Timestamp::from_millis(5).saturating_sub_millis(10), Timestamp::default());
    }
}
