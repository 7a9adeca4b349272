//! Domain entities owned by the state registry.
//!
//! Nodes keep one "last updated" stamp per field group so that packets
//! arriving out of order never roll a newer value back.

use serde::{Deserialize, Serialize};

use crate::{ChannelIndex, ConversationKey, MessageId, NodeId, Timestamp};

/// Emoji accepted as reactions.
pub const SUPPORTED_REACTIONS: [&str; 6] = ["👍", "👎", "❤️", "😂", "❗", "❓"];

/// Whether `emoji` is one of [`SUPPORTED_REACTIONS`].
pub fn is_supported_reaction(emoji: &str) -> bool {
    SUPPORTED_REACTIONS.contains(&emoji)
}

/// A geographic fix in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Altitude in meters, when reported.
    pub altitude: Option<i32>,
}

impl Position {
    /// Create a position without altitude.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
        }
    }
}

/// Link quality of the last packet heard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalMetrics {
    /// Signal-to-noise ratio in dB.
    pub snr: Option<f32>,
    /// Received signal strength in dBm.
    pub rssi: Option<i32>,
}

/// Device telemetry reported by a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    /// Battery level in percent (values above 100 mean "powered").
    pub battery_level: Option<u32>,
    /// Battery voltage.
    pub voltage: Option<f32>,
    /// Channel utilization in percent.
    pub channel_utilization: Option<f32>,
    /// Transmit airtime utilization in percent.
    pub air_util_tx: Option<f32>,
}

/// One entry of a node's neighbor report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NeighborLink {
    /// The neighbor heard.
    pub node: NodeId,
    /// SNR the reporter heard it at.
    pub snr: f32,
}

/// Field groups that carry independent update stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldGroup {
    /// Names, hardware, role, PKI flag.
    Identity,
    /// Position fix.
    Position,
    /// Battery, voltage, utilization.
    Telemetry,
    /// SNR, RSSI, hop count.
    Signal,
    /// Neighbor list.
    Neighbors,
    /// Local favorite flag.
    Favorite,
    /// Only the last-seen time moved.
    LastSeen,
}

/// A radio endpoint in the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable radio id.
    pub id: NodeId,
    /// Display name.
    pub long_name: Option<String>,
    /// Short (4 char) name.
    pub short_name: Option<String>,
    /// Hardware model name.
    pub hw_model: Option<String>,
    /// Device role as reported.
    pub role: Option<String>,
    /// The transport reported a completed key exchange.
    pub has_public_key: bool,
    /// Locally pinned.
    pub is_favorite: bool,
    /// Newest packet timestamp from this node.
    pub last_seen: Option<Timestamp>,
    /// Signal of the newest packet.
    pub signal: SignalMetrics,
    /// Hops the newest packet travelled.
    pub hops_away: Option<u8>,
    /// Newest telemetry.
    pub metrics: DeviceMetrics,
    /// Newest position.
    pub position: Option<Position>,
    /// Newest neighbor report.
    pub neighbors: Vec<NeighborLink>,
    /// Stamp of the identity group.
    pub identity_updated: Option<Timestamp>,
    /// Stamp of the position group.
    pub position_updated: Option<Timestamp>,
    /// Stamp of the telemetry group.
    pub telemetry_updated: Option<Timestamp>,
    /// Stamp of the signal group.
    pub signal_updated: Option<Timestamp>,
    /// Stamp of the neighbor group.
    pub neighbors_updated: Option<Timestamp>,
    /// Kilometers from the local position; filled in by queries only.
    #[serde(skip)]
    pub distance_km: Option<f64>,
}

impl Node {
    /// A node known only by id.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            long_name: None,
            short_name: None,
            hw_model: None,
            role: None,
            has_public_key: false,
            is_favorite: false,
            last_seen: None,
            signal: SignalMetrics::default(),
            hops_away: None,
            metrics: DeviceMetrics::default(),
            position: None,
            neighbors: Vec::new(),
            identity_updated: None,
            position_updated: None,
            telemetry_updated: None,
            signal_updated: None,
            neighbors_updated: None,
            distance_km: None,
        }
    }

    /// Best human-readable name: long name, short name, then id.
    pub fn display_name(&self) -> String {
        self.long_name
            .clone()
            .or_else(|| self.short_name.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Channel role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelRole {
    /// Slot unused.
    Disabled,
    /// The primary channel (slot 0 on a configured device).
    Primary,
    /// An additional channel.
    Secondary,
}

impl ChannelRole {
    /// Decode the device's numeric role.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Disabled),
            1 => Some(Self::Primary),
            2 => Some(Self::Secondary),
            _ => None,
        }
    }

    /// The device's numeric role.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Disabled => 0,
            Self::Primary => 1,
            Self::Secondary => 2,
        }
    }
}

/// One of the eight channel slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Slot index.
    pub index: ChannelIndex,
    /// Channel name (empty means the modem preset name).
    pub name: String,
    /// Pre-shared key as reported by the device. `[1]` is the default key,
    /// empty is no encryption.
    pub psk: Vec<u8>,
    /// Slot role.
    pub role: ChannelRole,
    /// MQTT uplink.
    pub uplink_enabled: bool,
    /// MQTT downlink.
    pub downlink_enabled: bool,
}

impl Channel {
    /// Factory state of a slot: slot 0 primary with the default key, the rest disabled.
    pub fn factory(index: ChannelIndex) -> Self {
        let primary = index == ChannelIndex::PRIMARY;
        Self {
            index,
            name: String::new(),
            psk: if primary { vec![1] } else { Vec::new() },
            role: if primary {
                ChannelRole::Primary
            } else {
                ChannelRole::Disabled
            },
            uplink_enabled: false,
            downlink_enabled: false,
        }
    }

    /// Whether traffic can be sent on this slot.
    pub fn is_enabled(&self) -> bool {
        self.role != ChannelRole::Disabled
    }
}

/// Where a message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Broadcast on a channel slot.
    Broadcast(ChannelIndex),
    /// Direct to one node.
    Direct(NodeId),
}

/// Delivery progress of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Staged, not yet written to the radio.
    Pending,
    /// Written to the radio.
    Sent,
    /// Acknowledged (or received from the mesh).
    Delivered,
    /// Gave up.
    Failed,
}

impl DeliveryState {
    /// Position in the monotonic order; delivered and failed share the terminal rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Delivered | Self::Failed => 2,
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

/// Result of a transmission attempt, as reported back to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    /// Written to the radio.
    Sent,
    /// Acknowledged by the destination.
    Delivered,
    /// Failed with a reason.
    Failed(String),
}

impl DeliveryOutcome {
    /// The state this outcome moves a message to.
    pub fn state(&self) -> DeliveryState {
        match self {
            Self::Sent => DeliveryState::Sent,
            Self::Delivered => DeliveryState::Delivered,
            Self::Failed(_) => DeliveryState::Failed,
        }
    }
}

/// A reaction on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    /// Target message.
    pub message: MessageId,
    /// Who reacted.
    pub author: NodeId,
    /// The emoji.
    pub emoji: String,
    /// When the reaction was made.
    pub timestamp: Timestamp,
}

/// A chat message in a channel or DM thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Packet id.
    pub id: MessageId,
    /// Author.
    pub from: NodeId,
    /// Addressee.
    pub destination: Destination,
    /// Thread the message belongs to.
    pub conversation: ConversationKey,
    /// Text body.
    pub body: String,
    /// Send time.
    pub timestamp: Timestamp,
    /// Delivery progress.
    pub state: DeliveryState,
    /// Why delivery failed.
    pub failure: Option<String>,
    /// Parent message, resolved lazily.
    pub reply_to: Option<MessageId>,
    /// Authored on this device.
    pub outgoing: bool,
    /// SNR at reception (remote messages).
    pub rx_snr: Option<f32>,
    /// RSSI at reception (remote messages).
    pub rx_rssi: Option<i32>,
    /// Reactions ordered by (timestamp, author, emoji). Persisted as their own records.
    #[serde(skip)]
    pub reactions: Vec<Reaction>,
}

impl Message {
    /// Ordering key within a conversation.
    pub fn sort_key(&self) -> (Timestamp, MessageId) {
        (self.timestamp, self.id)
    }
}
