//! Mock transport for testing.
//!
//! Allows injecting inbound packets and link signals, forcing failures and
//! capturing written frames for verification.

use super::{LinkInfo, LinkSignal, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use mesh_types::{
    encode_payload, NodeId, OutboundFrame, PortNum, RawPacket, RoutingPayload, SignalMetrics,
    Timestamp,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Mock transport for testing.
///
/// Clones share state, so a test keeps one handle while the engine owns
/// another.
#[derive(Debug, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    wake: Arc<Notify>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    connected: bool,
    connected_address: Option<String>,
    local_node: Option<NodeId>,
    sent_frames: Vec<OutboundFrame>,
    inbound: VecDeque<TransportEvent>,
    connects: usize,
    send_attempts: usize,
    resyncs: usize,
    auto_ack: bool,
    fail_next_connect: Option<String>,
    fail_sends: VecDeque<String>,
    fail_next_recv: Option<String>,
    fail_next_resync: Option<String>,
    resync_delay: Option<Duration>,
    heartbeat_failing: bool,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockTransportInner> {
        // A panicking test thread must not wedge every other handle.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Node id reported by the handshake.
    pub fn set_local_node(&self, id: NodeId) {
        self.lock().local_node = Some(id);
    }

    /// Answer every `want_ack` frame with a routing ack from the local node.
    pub fn set_auto_ack(&self, enabled: bool) {
        self.lock().auto_ack = enabled;
    }

    /// Queue a packet to be returned by `recv()`.
    pub fn inject_packet(&self, packet: RawPacket) {
        self.inject(TransportEvent::Packet(packet));
    }

    /// Queue any event to be returned by `recv()`.
    pub fn inject(&self, event: TransportEvent) {
        self.lock().inbound.push_back(event);
        self.wake.notify_waiters();
    }

    /// Simulate a hard link failure (device unplugged).
    pub fn drop_link(&self, reason: &str) {
        {
            let mut inner = self.lock();
            inner.connected = false;
            inner.inbound.push_back(TransportEvent::Link(LinkSignal::Down {
                reason: reason.to_string(),
            }));
        }
        self.wake.notify_waiters();
    }

    /// Get all frames that were written.
    pub fn sent_frames(&self) -> Vec<OutboundFrame> {
        self.lock().sent_frames.clone()
    }

    /// Get the last frame that was written.
    pub fn last_sent(&self) -> Option<OutboundFrame> {
        self.lock().sent_frames.last().cloned()
    }

    /// Get the address that was connected to.
    pub fn connected_address(&self) -> Option<String> {
        self.lock().connected_address.clone()
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Writes attempted while connected, failed ones included.
    pub fn send_attempts(&self) -> usize {
        self.lock().send_attempts
    }

    /// Resync requests so far.
    pub fn resync_count(&self) -> usize {
        self.lock().resyncs
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.lock().fail_next_connect = Some(error.to_string());
    }

    /// Cause the next send() to fail with the given error. Calls stack: two
    /// calls fail the next two sends.
    pub fn fail_next_send(&self, error: &str) {
        self.lock().fail_sends.push_back(error.to_string());
    }

    /// Cause the next recv() to fail with the given error.
    pub fn fail_next_recv(&self, error: &str) {
        self.lock().fail_next_recv = Some(error.to_string());
        self.wake.notify_waiters();
    }

    /// Cause the next request_resync() to fail with the given error.
    pub fn fail_next_resync(&self, error: &str) {
        self.lock().fail_next_resync = Some(error.to_string());
    }

    /// Make request_resync() take this long.
    pub fn delay_resync(&self, delay: Duration) {
        self.lock().resync_delay = Some(delay);
    }

    /// Make heartbeat() fail until turned off again.
    pub fn set_heartbeat_failing(&self, failing: bool) {
        self.lock().heartbeat_failing = failing;
    }

    /// Clear all state (frames, queue, connection, hooks).
    pub fn reset(&self) {
        *self.lock() = MockTransportInner::default();
        self.wake.notify_waiters();
    }

    fn ack_for(local: NodeId, frame: &OutboundFrame) -> Result<RawPacket, TransportError> {
        let payload = encode_payload(&RoutingPayload {
            request_id: frame.id.value(),
            error_reason: String::new(),
        })
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(RawPacket {
            source: local,
            destination: local,
            channel: frame.channel,
            port: PortNum::Routing.tag(),
            payload,
            timestamp: Timestamp::now(),
            signal: SignalMetrics::default(),
            sequence: 0,
            hop_start: None,
            hop_limit: None,
        })
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            wake: Arc::clone(&self.wake),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<LinkInfo, TransportError> {
        let mut inner = self.lock();

        // Check for forced failure
        if let Some(error) = inner.fail_next_connect.take() {
            return Err(TransportError::ConnectionFailed(error));
        }

        inner.connected = true;
        inner.connected_address = Some(address.to_string());
        inner.connects += 1;
        Ok(LinkInfo {
            local_node: inner.local_node,
            description: format!("mock radio at {}", address),
        })
    }

    async fn recv(&self) -> Result<TransportEvent, TransportError> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();

                // Check for forced failure
                if let Some(error) = inner.fail_next_recv.take() {
                    return Err(TransportError::ReceiveFailed(error));
                }
                if let Some(event) = inner.inbound.pop_front() {
                    return Ok(event);
                }
                if !inner.connected {
                    return Err(TransportError::NotConnected);
                }
            }

            notified.await;
        }
    }

    async fn send(&self, frame: &OutboundFrame) -> Result<(), TransportError> {
        {
            let mut inner = self.lock();

            if !inner.connected {
                return Err(TransportError::NotConnected);
            }
            inner.send_attempts += 1;

            // Check for forced failure
            if let Some(error) = inner.fail_sends.pop_front() {
                return Err(TransportError::SendFailed(error));
            }

            inner.sent_frames.push(frame.clone());
            if !(inner.auto_ack && frame.want_ack) {
                return Ok(());
            }
            let local = inner.local_node.unwrap_or(NodeId::LOCAL);
            let ack = Self::ack_for(local, frame)?;
            inner.inbound.push_back(TransportEvent::Packet(ack));
        }
        self.wake.notify_waiters();
        Ok(())
    }

    async fn request_resync(&self) -> Result<(), TransportError> {
        let delay = {
            let mut inner = self.lock();
            if !inner.connected {
                return Err(TransportError::NotConnected);
            }
            inner.resyncs += 1;
            if let Some(error) = inner.fail_next_resync.take() {
                return Err(TransportError::ReceiveFailed(error));
            }
            inner.resync_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn heartbeat(&self) -> Result<(), TransportError> {
        let inner = self.lock();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        if inner.heartbeat_failing {
            return Err(TransportError::Timeout);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.lock().connected = false;
        self.wake.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::{decode_payload, MessageId};

    fn frame(id: u32, want_ack: bool) -> OutboundFrame {
        OutboundFrame {
            id: MessageId::new(id),
            destination: NodeId::BROADCAST,
            channel: 0,
            port: PortNum::TextMessage.tag(),
            payload: b"hello".to_vec(),
            want_ack,
        }
    }

    fn packet(sequence: u32) -> RawPacket {
        RawPacket {
            source: NodeId::new(0x42),
            destination: NodeId::BROADCAST,
            channel: 0,
            port: PortNum::TextMessage.tag(),
            payload: b"hi".to_vec(),
            timestamp: Timestamp::from_secs(1_700_000_000),
            signal: SignalMetrics::default(),
            sequence,
            hop_start: None,
            hop_limit: None,
        }
    }

    // ===========================================
    // MockTransport Basic Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_connects() {
        let transport = MockTransport::new();
        transport.set_local_node(NodeId::new(0x10ca1));
        assert!(!transport.is_connected());

        let info = transport.connect("serial:///dev/ttyUSB0").await.unwrap();

        assert!(transport.is_connected());
        assert_eq!(info.local_node, Some(NodeId::new(0x10ca1)));
        assert_eq!(
            transport.connected_address(),
            Some("serial:///dev/ttyUSB0".to_string())
        );
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn mock_transport_records_frames() {
        let transport = MockTransport::new();
        transport.connect("radio").await.unwrap();

        transport.send(&frame(1, false)).await.unwrap();
        transport.send(&frame(2, false)).await.unwrap();

        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].id, MessageId::new(1));
        assert_eq!(transport.last_sent().unwrap().id, MessageId::new(2));
    }

    #[tokio::test]
    async fn mock_transport_receives_injected_events_in_order() {
        let transport = MockTransport::new();
        transport.connect("radio").await.unwrap();

        transport.inject_packet(packet(1));
        transport.inject_packet(packet(2));

        let first = transport.recv().await.unwrap();
        let second = transport.recv().await.unwrap();
        assert_eq!(first, TransportEvent::Packet(packet(1)));
        assert_eq!(second, TransportEvent::Packet(packet(2)));
    }

    #[tokio::test]
    async fn recv_waits_for_injection() {
        let transport = MockTransport::new();
        transport.connect("radio").await.unwrap();

        let reader = transport.clone();
        let pending = tokio::spawn(async move { reader.recv().await });
        tokio::task::yield_now().await;
        transport.inject_packet(packet(9));

        let event = pending.await.unwrap().unwrap();
        assert_eq!(event, TransportEvent::Packet(packet(9)));
    }

    #[tokio::test]
    async fn auto_ack_answers_want_ack_frames() {
        let transport = MockTransport::new();
        transport.set_local_node(NodeId::new(0x10ca1));
        transport.set_auto_ack(true);
        transport.connect("radio").await.unwrap();

        transport.send(&frame(5, false)).await.unwrap();
        transport.send(&frame(6, true)).await.unwrap();

        match transport.recv().await.unwrap() {
            TransportEvent::Packet(ack) => {
                assert_eq!(ack.port, PortNum::Routing.tag());
                assert_eq!(ack.source, NodeId::new(0x10ca1));
                let payload: RoutingPayload = decode_payload(&ack.payload).unwrap();
                assert_eq!(payload.request_id, 6);
                assert!(payload.error().is_none());
            }
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn drop_link_reports_down_then_not_connected() {
        let transport = MockTransport::new();
        transport.connect("radio").await.unwrap();

        transport.drop_link("unplugged");

        assert!(!transport.is_connected());
        assert_eq!(
            transport.recv().await.unwrap(),
            TransportEvent::Link(LinkSignal::Down {
                reason: "unplugged".into()
            })
        );
        assert!(matches!(
            transport.recv().await,
            Err(TransportError::NotConnected)
        ));
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn send_without_connect_fails() {
        let transport = MockTransport::new();

        let result = transport.send(&frame(1, false)).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn forced_connect_failure() {
        let transport = MockTransport::new();
        transport.fail_next_connect("no such device");

        let result = transport.connect("radio").await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert!(!transport.is_connected());

        transport.connect("radio").await.unwrap();
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn forced_send_failures_stack() {
        let transport = MockTransport::new();
        transport.connect("radio").await.unwrap();
        transport.fail_next_send("write error");
        transport.fail_next_send("write error");

        assert!(transport.send(&frame(1, false)).await.is_err());
        assert!(transport.send(&frame(1, false)).await.is_err());
        transport.send(&frame(1, false)).await.unwrap();
        assert_eq!(transport.sent_frames().len(), 1);
        assert_eq!(transport.send_attempts(), 3);
    }

    #[tokio::test]
    async fn forced_recv_failure() {
        let transport = MockTransport::new();
        transport.connect("radio").await.unwrap();
        transport.inject_packet(packet(3));
        transport.fail_next_recv("framing error");

        let result = transport.recv().await;
        assert!(matches!(result, Err(TransportError::ReceiveFailed(_))));

        // Next recv should work (and get the queued packet)
        assert_eq!(
            transport.recv().await.unwrap(),
            TransportEvent::Packet(packet(3))
        );
    }

    #[tokio::test]
    async fn resync_and_heartbeat_hooks() {
        let transport = MockTransport::new();
        transport.connect("radio").await.unwrap();

        transport.fail_next_resync("busy");
        assert!(transport.request_resync().await.is_err());
        transport.request_resync().await.unwrap();
        assert_eq!(transport.resync_count(), 2);

        transport.set_heartbeat_failing(true);
        assert!(matches!(
            transport.heartbeat().await,
            Err(TransportError::Timeout)
        ));
        transport.set_heartbeat_failing(false);
        transport.heartbeat().await.unwrap();
    }

    // ===========================================
    // Clone and Shared State Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_clone_shares_state() {
        let transport1 = MockTransport::new();
        let transport2 = transport1.clone();

        transport1.connect("radio").await.unwrap();
        assert!(transport2.is_connected());

        transport1.send(&frame(1, false)).await.unwrap();
        transport2.send(&frame(2, false)).await.unwrap();

        assert_eq!(transport1.sent_frames().len(), 2);
    }

    #[tokio::test]
    async fn mock_transport_reset_clears_all() {
        let transport = MockTransport::new();
        transport.connect("radio").await.unwrap();
        transport.send(&frame(1, false)).await.unwrap();
        transport.inject_packet(packet(1));

        transport.reset();

        assert!(!transport.is_connected());
        assert!(transport.sent_frames().is_empty());
        assert!(transport.connected_address().is_none());
        assert_eq!(transport.connect_count(), 0);
    }
}
