//! Transport abstraction for meshsync.
//!
//! This module provides a pluggable transport layer that abstracts the
//! link to the attached radio (serial, TCP, BLE, mock for testing).
//!
//! # Design
//!
//! The transport trait is async and connection-oriented:
//! - `connect()` opens the link and completes the device handshake
//! - `recv()` yields received packets and link signals
//! - `send()` writes one outbound frame
//! - `request_resync()` asks the device to replay its node database
//! - `heartbeat()` probes liveness
//! - `close()` gracefully terminates
//!
//! The supervisor owns reconnection and retries; implementations only
//! report what happened.
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new();
//! let info = transport.connect("serial:///dev/ttyUSB0").await?;
//! transport.send(&frame).await?;
//! let event = transport.recv().await?;
//! ```

mod mock;

pub use mock::MockTransport;

use async_trait::async_trait;
use mesh_types::{NodeId, OutboundFrame, RawPacket};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Operation timed out.
    #[error("transport timeout")]
    Timeout,
}

/// What the device reported during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    /// Node id of the attached radio, when it reported one.
    pub local_node: Option<NodeId>,
    /// Free-form device description for logs.
    pub description: String,
}

/// Link state change reported by the transport itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSignal {
    /// The link came up.
    Up,
    /// The link went away (device unplugged, I/O error).
    Down {
        /// What happened.
        reason: String,
    },
    /// The device finished its handshake.
    HandshakeComplete,
}

/// One item from [`Transport::recv`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A received packet.
    Packet(RawPacket),
    /// A link state change.
    Link(LinkSignal),
}

/// Transport trait for talking to the attached radio.
///
/// Implementations handle the underlying connection mechanism
/// (serial, TCP, BLE, mock, etc).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the link to the device at `address` and complete the handshake.
    async fn connect(&self, address: &str) -> Result<LinkInfo, TransportError>;

    /// Receive the next packet or link signal.
    ///
    /// Blocks until something arrives or the link closes.
    async fn recv(&self) -> Result<TransportEvent, TransportError>;

    /// Write one frame.
    async fn send(&self, frame: &OutboundFrame) -> Result<(), TransportError>;

    /// Ask the device to replay its node database.
    async fn request_resync(&self) -> Result<(), TransportError>;

    /// Liveness probe.
    async fn heartbeat(&self) -> Result<(), TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}
