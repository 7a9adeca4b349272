//! Packet history.
//!
//! Independent of the registry tables: every packet the engine accepted or
//! transmitted is appended here, and the log can be paged and searched.

use async_trait::async_trait;
use mesh_types::{MessageId, NodeId, OutboundFrame, PortNum, RawPacket, SignalMetrics, Timestamp};

use crate::StorageResult;

/// One packet as it is appended to the log.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketEntry {
    /// When the packet was heard (or handed to the radio).
    pub timestamp: Timestamp,
    /// Transport packet id; 0 when unnumbered.
    pub packet_id: u32,
    /// Sender.
    pub from: NodeId,
    /// Addressee.
    pub to: NodeId,
    /// Channel slot.
    pub channel: u8,
    /// Payload type tag.
    pub port: u32,
    /// Payload body as carried on the wire.
    pub payload: Vec<u8>,
    /// Body of text packets.
    pub text: Option<String>,
    /// Link quality (received packets only).
    pub signal: SignalMetrics,
    /// Hops travelled.
    pub hops: Option<u8>,
    /// Transmitted by the local node.
    pub outgoing: bool,
    /// Delivery result of an outgoing packet, once known.
    pub delivered: Option<bool>,
    /// Failure reason of an outgoing packet.
    pub error: Option<String>,
}

impl PacketEntry {
    /// Entry for a packet received from the mesh.
    pub fn received(packet: &RawPacket) -> Self {
        Self {
            timestamp: packet.timestamp,
            packet_id: packet.sequence,
            from: packet.source,
            to: packet.destination,
            channel: packet.channel,
            port: packet.port,
            payload: packet.payload.clone(),
            text: text_of(packet.port, &packet.payload),
            signal: packet.signal,
            hops: packet.hops_away(),
            outgoing: false,
            delivered: None,
            error: None,
        }
    }

    /// Entry for a frame the local node `from` queued for the radio.
    pub fn sent(frame: &OutboundFrame, from: NodeId, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            packet_id: frame.id.value(),
            from,
            to: frame.destination,
            channel: frame.channel,
            port: frame.port,
            payload: frame.payload.clone(),
            text: text_of(frame.port, &frame.payload),
            signal: SignalMetrics::default(),
            hops: None,
            outgoing: true,
            delivered: None,
            error: None,
        }
    }
}

fn text_of(port: u32, payload: &[u8]) -> Option<String> {
    if PortNum::from_tag(port) != PortNum::TextMessage {
        return None;
    }
    std::str::from_utf8(payload).ok().map(str::to_owned)
}

/// A logged packet with its position in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedPacket {
    /// Row id; increases with every append. Use it as the `before` cursor.
    pub row: i64,
    /// The packet.
    pub entry: PacketEntry,
}

/// Append-only packet history.
#[async_trait]
pub trait PacketLog: Send + Sync {
    /// Append one packet, returning its row id.
    async fn append(&self, entry: &PacketEntry) -> StorageResult<i64>;

    /// Up to `limit` packets older than row `before`, oldest first. An
    /// empty `ports` list matches every port.
    async fn page(
        &self,
        before: Option<i64>,
        limit: usize,
        ports: &[u32],
    ) -> StorageResult<Vec<LoggedPacket>>;

    /// Up to `limit` packets older than row `before` whose text, or the
    /// long/short name of the sender or addressee, contains `term` (ASCII
    /// case-insensitive). Newest first.
    async fn search(
        &self,
        term: &str,
        before: Option<i64>,
        limit: usize,
    ) -> StorageResult<Vec<LoggedPacket>>;

    /// Number of packets [`PacketLog::search`] would find without a limit.
    async fn count_matches(&self, term: &str) -> StorageResult<u64>;

    /// Record the delivery result of an outgoing packet. Returns the number
    /// of rows updated.
    async fn update_delivery(
        &self,
        packet_id: MessageId,
        delivered: bool,
        error: Option<&str>,
    ) -> StorageResult<u64>;

    /// Row id of the oldest packet.
    async fn oldest_row(&self) -> StorageResult<Option<i64>>;

    /// Packets logged.
    async fn count(&self) -> StorageResult<u64>;

    /// Remove every packet, returning how many were removed.
    async fn clear(&self) -> StorageResult<u64>;
}
