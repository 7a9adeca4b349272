//! Link supervisor task.
//!
//! Drives the pure [`LinkState`] machine against a [`Transport`]. The task
//! opens and closes the link and drains the command queue. It also probes
//! liveness and arms the reconnect timer. Received packets go to the ingest
//! task; command outcomes and the local node id go to the registry
//! executor's queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use mesh_core::{
    Action, BackoffPolicy, CommandQueue, Event, LinkState, QueueError, QueuedCommand, Retry,
};
use mesh_types::{DeliveryOutcome, LinkStatus, MessageId, Notification};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::SupervisorConfig;
use crate::error::{EngineError, EngineResult};
use crate::executor::{ExecutorHandle, Report};
use crate::fanout::Fanout;
use crate::ingest::IngestItem;
use crate::metrics::EngineMetrics;
use crate::transport::{LinkSignal, Transport, TransportError, TransportEvent};

/// Resolves once a staged command was written, or failed for good.
pub(crate) type Completion = oneshot::Sender<Result<(), String>>;

/// Reason recorded for commands that waited too long.
pub(crate) const EXPIRED_REASON: &str = "timed out waiting for the radio";

/// Reason recorded for withdrawn commands.
pub(crate) const CANCELED_REASON: &str = "canceled";

enum Command {
    Connect,
    Disconnect,
    Enqueue {
        command: QueuedCommand,
        done: Option<Completion>,
    },
    Cancel {
        id: MessageId,
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    Shutdown,
}

enum Inbound {
    Event { generation: u64, event: TransportEvent },
    Closed { generation: u64, reason: String },
}

/// Sending side of the supervisor's command channel.
#[derive(Debug, Clone)]
pub(crate) struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Connect => write!(f, "Connect"),
            Command::Disconnect => write!(f, "Disconnect"),
            Command::Enqueue { command, .. } => write!(f, "Enqueue({})", command.id()),
            Command::Cancel { id, .. } => write!(f, "Cancel({})", id),
            Command::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl SupervisorHandle {
    fn send(&self, command: Command) -> EngineResult<()> {
        self.tx.send(command).map_err(|_| EngineError::Shutdown)
    }

    pub(crate) fn connect(&self) -> EngineResult<()> {
        self.send(Command::Connect)
    }

    pub(crate) fn disconnect(&self) -> EngineResult<()> {
        self.send(Command::Disconnect)
    }

    pub(crate) fn enqueue(
        &self,
        command: QueuedCommand,
        done: Option<Completion>,
    ) -> EngineResult<()> {
        self.send(Command::Enqueue { command, done })
    }

    /// Withdraw a command that has not started writing.
    pub(crate) async fn cancel(&self, id: MessageId) -> EngineResult<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Cancel { id, reply })?;
        response.await.map_err(|_| EngineError::Shutdown)??;
        Ok(())
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Where the supervisor sends what it learns.
pub(crate) struct SupervisorOutputs {
    pub(crate) status: watch::Sender<LinkStatus>,
    pub(crate) fanout: Arc<Fanout>,
    pub(crate) executor: ExecutorHandle,
    pub(crate) packets: mpsc::UnboundedSender<IngestItem>,
    pub(crate) metrics: Arc<EngineMetrics>,
}

pub(crate) fn spawn_supervisor(
    transport: Arc<dyn Transport>,
    address: String,
    config: SupervisorConfig,
    outputs: SupervisorOutputs,
) -> (SupervisorHandle, JoinHandle<()>) {
    let (tx, commands) = mpsc::unbounded_channel();
    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let supervisor = Supervisor {
        transport,
        address,
        backoff: config.backoff(),
        queue: CommandQueue::new(config.queue_capacity),
        config,
        state: LinkState::new(),
        waiters: HashMap::new(),
        generation: 0,
        reader: None,
        resync: None,
        inbound_tx,
        reconnect_at: None,
        last_alive: Instant::now(),
        outputs,
    };
    let task = tokio::spawn(supervisor.run(commands, inbound));
    (SupervisorHandle { tx }, task)
}

struct Supervisor {
    transport: Arc<dyn Transport>,
    address: String,
    config: SupervisorConfig,
    backoff: BackoffPolicy,
    state: LinkState,
    queue: CommandQueue,
    waiters: HashMap<MessageId, Completion>,
    /// Bumped whenever the reader is replaced; older reader output is stale.
    generation: u64,
    reader: Option<JoinHandle<()>>,
    resync: Option<JoinHandle<()>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    reconnect_at: Option<Instant>,
    last_alive: Instant,
    outputs: SupervisorOutputs,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
    ) {
        let period = self.config.heartbeat_interval();
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(address = %self.address, "link supervisor started");

        loop {
            let reconnect_at = self.reconnect_at;
            let reconnect_deadline = reconnect_at.unwrap_or_else(Instant::now);
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                Some(message) = inbound.recv() => self.on_inbound(message).await,
                _ = time::sleep_until(reconnect_deadline), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    EngineMetrics::incr(&self.outputs.metrics.reconnects);
                    self.dispatch(Event::BackoffElapsed).await;
                }
                _ = heartbeat.tick() => self.on_heartbeat().await,
            }
        }

        self.dispatch(Event::StopRequested).await;
        if !self.queue.is_empty() {
            tracing::info!(queued = self.queue.len(), "commands left pending for the next start");
        }
        tracing::info!("link supervisor stopped");
    }

    /// Feed an event through the state machine, and any events its actions
    /// raise, until the machine settles.
    async fn dispatch(&mut self, event: Event) {
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            let (state, actions) = std::mem::take(&mut self.state).on_event(event);
            self.state = state;
            for action in actions {
                if let Some(next) = self.perform(action).await {
                    events.push_back(next);
                }
            }
        }
    }

    async fn perform(&mut self, action: Action) -> Option<Event> {
        match action {
            Action::Connect => self.open().await,
            Action::Close => {
                self.close().await;
                None
            }
            Action::RequestResync => {
                self.request_resync();
                None
            }
            Action::DrainQueue => self.drain().await,
            Action::ScheduleReconnect { attempt } => {
                let delay = self.backoff.delay(attempt);
                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                self.reconnect_at = Some(Instant::now() + delay);
                None
            }
            Action::CancelReconnect => {
                self.reconnect_at = None;
                None
            }
            Action::Notify { status, reason } => {
                self.publish(status, reason);
                None
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.dispatch(Event::Start).await,
            Command::Disconnect => self.dispatch(Event::StopRequested).await,
            Command::Enqueue { command, done } => {
                let id = command.id();
                if let Some(done) = done {
                    self.waiters.insert(id, done);
                }
                match self.queue.enqueue(command) {
                    Ok(()) => self.dispatch(Event::QueueReady).await,
                    Err((e, _)) => {
                        tracing::warn!(%id, error = %e, "command rejected");
                        EngineMetrics::incr(&self.outputs.metrics.commands_failed);
                        self.settle(id, Err(e.to_string())).await;
                    }
                }
            }
            Command::Cancel { id, reply } => {
                let result = match self.queue.cancel(id) {
                    Ok(_) => {
                        tracing::info!(%id, "command canceled");
                        self.settle(id, Err(CANCELED_REASON.to_string())).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Shutdown => {}
        }
    }

    async fn on_inbound(&mut self, message: Inbound) {
        match message {
            Inbound::Event { generation, event } if generation == self.generation => {
                self.last_alive = Instant::now();
                match event {
                    TransportEvent::Packet(packet) => {
                        let _ = self.outputs.packets.send(IngestItem::Packet(packet));
                    }
                    TransportEvent::Link(LinkSignal::Down { reason }) => {
                        tracing::warn!(reason = %reason, "link down");
                        self.dispatch(Event::TransportFailed { reason }).await;
                        return;
                    }
                    TransportEvent::Link(signal) => tracing::debug!(?signal, "link signal"),
                }
                if self.state == LinkState::Degraded {
                    self.dispatch(Event::HeartbeatResumed).await;
                }
            }
            Inbound::Closed { generation, reason } if generation == self.generation => {
                tracing::warn!(reason = %reason, "transport reader stopped");
                self.dispatch(Event::TransportFailed { reason }).await;
            }
            _ => tracing::trace!("stale reader output ignored"),
        }
    }

    async fn on_heartbeat(&mut self) {
        self.expire_commands().await;
        if !self.state.is_up() {
            return;
        }

        let probe = time::timeout(self.config.send_timeout(), self.transport.heartbeat()).await;
        let now = Instant::now();
        match probe {
            Ok(Ok(())) => self.last_alive = now,
            Ok(Err(e)) => tracing::debug!(error = %e, "heartbeat failed"),
            Err(_) => tracing::debug!("heartbeat timed out"),
        }

        let silent = now.saturating_duration_since(self.last_alive);
        let limit = self.config.heartbeat_interval() * self.config.heartbeat_miss_threshold.max(1);
        match self.state {
            LinkState::Connected if silent >= limit => {
                tracing::warn!(silent_ms = silent.as_millis() as u64, "heartbeat missed");
                self.dispatch(Event::HeartbeatMissed).await;
            }
            LinkState::Degraded if silent < limit => {
                self.dispatch(Event::HeartbeatResumed).await;
            }
            _ => {}
        }
    }

    async fn open(&mut self) -> Option<Event> {
        self.reconnect_at = None;
        self.stop_reader();

        let connected =
            time::timeout(self.config.connect_timeout(), self.transport.connect(&self.address))
                .await;
        match connected {
            Ok(Ok(info)) => {
                tracing::info!(
                    device = %info.description,
                    local_node = ?info.local_node,
                    "link established"
                );
                if let Some(id) = info.local_node {
                    let _ = self.outputs.executor.report(Report::LocalNode(id)).await;
                }
                self.start_reader();
                self.last_alive = Instant::now();
                Some(Event::HandshakeCompleted)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "connect failed");
                Some(Event::ConnectFailed {
                    error: e.to_string(),
                })
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.connect_timeout_ms,
                    "connect timed out"
                );
                Some(Event::ConnectFailed {
                    error: TransportError::Timeout.to_string(),
                })
            }
        }
    }

    async fn close(&mut self) {
        self.stop_reader();
        if let Some(resync) = self.resync.take() {
            resync.abort();
        }
        if let Err(e) = self.transport.close().await {
            tracing::debug!(error = %e, "close failed");
        }
    }

    fn start_reader(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let transport = Arc::clone(&self.transport);
        let inbound = self.inbound_tx.clone();
        self.reader = Some(tokio::spawn(async move {
            loop {
                match transport.recv().await {
                    Ok(event) => {
                        if inbound.send(Inbound::Event { generation, event }).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = inbound.send(Inbound::Closed {
                            generation,
                            reason: e.to_string(),
                        });
                        return;
                    }
                }
            }
        }));
    }

    fn stop_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.generation += 1;
    }

    fn request_resync(&mut self) {
        let transport = Arc::clone(&self.transport);
        let metrics = Arc::clone(&self.outputs.metrics);
        let limit = self.config.resync_timeout();
        self.resync = Some(tokio::spawn(async move {
            match time::timeout(limit, transport.request_resync()).await {
                Ok(Ok(())) => tracing::debug!("resync requested"),
                Ok(Err(e)) => tracing::warn!(error = %e, "resync request failed"),
                Err(_) => {
                    EngineMetrics::incr(&metrics.resync_timeouts);
                    tracing::warn!(
                        timeout_ms = limit.as_millis() as u64,
                        "resync request timed out"
                    );
                }
            }
        }));
    }

    /// Write queued commands while the link is healthy.
    ///
    /// A failed write ends the drain and reports the link as lost.
    async fn drain(&mut self) -> Option<Event> {
        while self.state.is_connected() {
            let command = self.queue.begin()?;
            let id = command.id();
            let written =
                time::timeout(self.config.send_timeout(), self.transport.send(&command.frame))
                    .await;
            let error = match written {
                Ok(Ok(())) => {
                    self.queue.complete(id);
                    EngineMetrics::incr(&self.outputs.metrics.commands_sent);
                    tracing::debug!(%id, attempt = command.attempts, "command written");
                    self.settle(id, Ok(())).await;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => TransportError::Timeout.to_string(),
            };

            match self.queue.fail(id) {
                Retry::Requeued => {
                    tracing::warn!(%id, error = %error, "write failed, retrying after reconnect");
                }
                Retry::Exhausted(_) => {
                    tracing::warn!(%id, error = %error, "write failed again, giving up");
                    EngineMetrics::incr(&self.outputs.metrics.commands_failed);
                    self.settle(id, Err(error.clone())).await;
                }
                Retry::Unknown => {}
            }
            return Some(Event::TransportFailed { reason: error });
        }
        None
    }

    async fn expire_commands(&mut self) {
        let now = Instant::now().into_std();
        for command in self.queue.expire(now, self.config.command_timeout()) {
            let id = command.id();
            tracing::warn!(%id, "command expired in queue");
            EngineMetrics::incr(&self.outputs.metrics.commands_failed);
            self.settle(id, Err(EXPIRED_REASON.to_string())).await;
        }
    }

    /// Resolve the caller's waiter and report the outcome to the registry.
    async fn settle(&mut self, id: MessageId, result: Result<(), String>) {
        let outcome = match &result {
            Ok(()) => DeliveryOutcome::Sent,
            Err(reason) => DeliveryOutcome::Failed(reason.clone()),
        };
        if let Some(done) = self.waiters.remove(&id) {
            let _ = done.send(result);
        }
        if self
            .outputs
            .executor
            .report(Report::Outcome { id, outcome })
            .await
            .is_err()
        {
            tracing::debug!(%id, "executor gone, outcome dropped");
        }
    }

    fn publish(&self, status: LinkStatus, reason: Option<String>) {
        tracing::info!(?status, reason = reason.as_deref().unwrap_or(""), "link status changed");
        self.outputs.status.send_replace(status);
        self.outputs
            .fanout
            .publish(&[Notification::link(status, reason)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Request;
    use crate::transport::MockTransport;
    use mesh_types::{NodeId, OutboundFrame, PortNum, RawPacket, SignalMetrics, Timestamp, Topic};
    use std::time::Duration;

    struct Harness {
        transport: MockTransport,
        handle: SupervisorHandle,
        status: watch::Receiver<LinkStatus>,
        requests: mpsc::Receiver<Request>,
        packets: mpsc::UnboundedReceiver<IngestItem>,
        fanout: Arc<Fanout>,
        metrics: Arc<EngineMetrics>,
    }

    fn test_config() -> SupervisorConfig {
        SupervisorConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1000,
            backoff_jitter_ms: 0,
            connect_timeout_ms: 1000,
            heartbeat_interval_ms: 1000,
            heartbeat_miss_threshold: 3,
            send_timeout_ms: 500,
            command_timeout_ms: 60_000,
            resync_timeout_ms: 5000,
            queue_capacity: 16,
        }
    }

    fn harness(config: SupervisorConfig) -> Harness {
        let transport = MockTransport::new();
        transport.set_local_node(NodeId::new(0x10ca1));
        let metrics = Arc::new(EngineMetrics::default());
        let fanout = Fanout::new(64, Arc::clone(&metrics));
        let (status_tx, status) = watch::channel(LinkStatus::Disconnected);
        let (requests_tx, requests) = mpsc::channel(64);
        let (packets_tx, packets) = mpsc::unbounded_channel();
        let (handle, _task) = spawn_supervisor(
            Arc::new(transport.clone()),
            "mock://radio".into(),
            config,
            SupervisorOutputs {
                status: status_tx,
                fanout: Arc::clone(&fanout),
                executor: ExecutorHandle::new(requests_tx),
                packets: packets_tx,
                metrics: Arc::clone(&metrics),
            },
        );
        Harness {
            transport,
            handle,
            status,
            requests,
            packets,
            fanout,
            metrics,
        }
    }

    fn command(id: u32) -> QueuedCommand {
        QueuedCommand::new(
            OutboundFrame {
                id: MessageId::new(id),
                destination: NodeId::BROADCAST,
                channel: 0,
                port: PortNum::TextMessage.tag(),
                payload: b"Hello everyone!".to_vec(),
                want_ack: false,
            },
            Instant::now().into_std(),
        )
    }

    fn enqueue(h: &Harness, id: u32) -> oneshot::Receiver<Result<(), String>> {
        let (done, wait) = oneshot::channel();
        h.handle.enqueue(command(id), Some(done)).unwrap();
        wait
    }

    async fn wait_status(h: &mut Harness, want: LinkStatus) {
        time::timeout(Duration::from_secs(120), h.status.wait_for(|s| *s == want))
            .await
            .expect("status not reached")
            .expect("supervisor stopped");
    }

    async fn next_outcome(h: &mut Harness) -> (MessageId, DeliveryOutcome) {
        loop {
            let request = time::timeout(Duration::from_secs(120), h.requests.recv())
                .await
                .expect("no report")
                .expect("channel closed");
            if let Request::Report(Report::Outcome { id, outcome }) = request {
                return (id, outcome);
            }
        }
    }

    // ===========================================
    // Connect and Drain Tests
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn connect_reports_local_node_and_requests_resync() {
        let mut h = harness(test_config());
        h.handle.connect().unwrap();
        wait_status(&mut h, LinkStatus::Connected).await;

        match h.requests.recv().await {
            Some(Request::Report(Report::LocalNode(id))) => assert_eq!(id, NodeId::new(0x10ca1)),
            _ => panic!("expected the local node report"),
        }
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.transport.resync_count(), 1);
        assert_eq!(h.transport.connected_address(), Some("mock://radio".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_command_waits_for_link() {
        let mut h = harness(test_config());
        let done = enqueue(&h, 1);

        time::sleep(Duration::from_secs(2)).await;
        assert!(h.transport.sent_frames().is_empty());

        h.handle.connect().unwrap();
        assert_eq!(done.await.unwrap(), Ok(()));
        assert_eq!(next_outcome(&mut h).await, (MessageId::new(1), DeliveryOutcome::Sent));
        assert_eq!(h.metrics.snapshot().commands_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_are_written_in_order() {
        let mut h = harness(test_config());
        let waits: Vec<_> = (1..=3).map(|id| enqueue(&h, id)).collect();
        h.handle.connect().unwrap();
        for wait in waits {
            assert_eq!(wait.await.unwrap(), Ok(()));
        }
        wait_status(&mut h, LinkStatus::Connected).await;

        let ids: Vec<u32> = h
            .transport
            .sent_frames()
            .iter()
            .map(|f| f.id.value())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_packets_go_to_ingest() {
        let mut h = harness(test_config());
        h.handle.connect().unwrap();
        wait_status(&mut h, LinkStatus::Connected).await;

        let packet = RawPacket {
            source: NodeId::new(0x42),
            destination: NodeId::BROADCAST,
            channel: 0,
            port: PortNum::TextMessage.tag(),
            payload: b"hi".to_vec(),
            timestamp: Timestamp::from_secs(1_700_000_000),
            signal: SignalMetrics::default(),
            sequence: 5,
            hop_start: None,
            hop_limit: None,
        };
        h.transport.inject_packet(packet.clone());

        match h.packets.recv().await {
            Some(IngestItem::Packet(received)) => assert_eq!(received, packet),
            _ => panic!("expected a packet"),
        }
    }

    // ===========================================
    // Retry Tests
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn first_write_failure_retries_once_after_reconnect() {
        let mut h = harness(test_config());
        h.handle.connect().unwrap();
        wait_status(&mut h, LinkStatus::Connected).await;

        h.transport.fail_next_send("write error");
        let done = enqueue(&h, 7);

        assert_eq!(done.await.unwrap(), Ok(()));
        assert_eq!(h.transport.send_attempts(), 2);
        assert_eq!(h.transport.connect_count(), 2);
        assert_eq!(next_outcome(&mut h).await, (MessageId::new(7), DeliveryOutcome::Sent));
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.transport.resync_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_write_failure_is_final() {
        let mut h = harness(test_config());
        h.handle.connect().unwrap();
        wait_status(&mut h, LinkStatus::Connected).await;

        h.transport.fail_next_send("write error");
        h.transport.fail_next_send("write error");
        let done = enqueue(&h, 7);

        let result = done.await.unwrap();
        assert_eq!(result, Err("send failed: write error".to_string()));
        assert_eq!(h.transport.send_attempts(), 2);
        assert!(h.transport.sent_frames().is_empty());
        assert_eq!(
            next_outcome(&mut h).await,
            (
                MessageId::new(7),
                DeliveryOutcome::Failed("send failed: write error".into())
            )
        );
        assert_eq!(h.metrics.snapshot().commands_failed, 1);

        // The link comes back and nothing is retried a third time.
        wait_status(&mut h, LinkStatus::Connected).await;
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.transport.send_attempts(), 2);
    }

    // ===========================================
    // Link Loss and Backoff Tests
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn link_drop_reconnects_with_resync() {
        let mut h = harness(test_config());
        let mut links = h.fanout.subscribe(Topic::ConnectionState);
        h.handle.connect().unwrap();
        wait_status(&mut h, LinkStatus::Connected).await;

        h.transport.drop_link("unplugged");
        time::sleep(Duration::from_secs(2)).await;

        assert_eq!(*h.status.borrow(), LinkStatus::Connected);
        assert_eq!(h.transport.connect_count(), 2);
        assert_eq!(h.transport.resync_count(), 2);
        assert_eq!(h.metrics.snapshot().reconnects, 1);

        let statuses: Vec<LinkStatus> = links
            .drain()
            .into_iter()
            .filter_map(|n| match n.summary {
                mesh_types::ChangeSummary::Link { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                LinkStatus::Connecting,
                LinkStatus::Connected,
                LinkStatus::Disconnected,
                LinkStatus::Connecting,
                LinkStatus::Connected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_backs_off_and_retries() {
        let mut h = harness(test_config());
        h.transport.fail_next_connect("no such device");
        let started = Instant::now();
        h.handle.connect().unwrap();

        wait_status(&mut h, LinkStatus::Connected).await;
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(h.transport.connect_count(), 1);
        assert_eq!(h.metrics.snapshot().reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_reconnecting() {
        let mut h = harness(test_config());
        h.handle.connect().unwrap();
        wait_status(&mut h, LinkStatus::Connected).await;

        h.handle.disconnect().unwrap();
        wait_status(&mut h, LinkStatus::Disconnected).await;
        time::sleep(Duration::from_secs(60)).await;

        assert!(!h.transport.is_connected());
        assert_eq!(h.transport.connect_count(), 1);
    }

    // ===========================================
    // Heartbeat Tests
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn silent_link_degrades_and_holds_commands() {
        let mut h = harness(test_config());
        h.handle.connect().unwrap();
        wait_status(&mut h, LinkStatus::Connected).await;

        h.transport.set_heartbeat_failing(true);
        wait_status(&mut h, LinkStatus::Degraded).await;

        let mut done = enqueue(&h, 3);
        time::sleep(Duration::from_millis(500)).await;
        assert!(h.transport.sent_frames().is_empty());
        assert!(done.try_recv().is_err());

        h.transport.set_heartbeat_failing(false);
        wait_status(&mut h, LinkStatus::Connected).await;
        assert_eq!(done.await.unwrap(), Ok(()));
        assert_eq!(h.transport.sent_frames().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_traffic_counts_as_liveness() {
        let mut h = harness(test_config());
        h.handle.connect().unwrap();
        wait_status(&mut h, LinkStatus::Connected).await;
        h.transport.set_heartbeat_failing(true);
        wait_status(&mut h, LinkStatus::Degraded).await;

        h.transport
            .inject(TransportEvent::Link(LinkSignal::HandshakeComplete));
        wait_status(&mut h, LinkStatus::Connected).await;
    }

    // ===========================================
    // Timeout and Cancellation Tests
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn queued_commands_expire() {
        let config = SupervisorConfig {
            command_timeout_ms: 3000,
            ..test_config()
        };
        let mut h = harness(config);
        let done = enqueue(&h, 9);

        assert_eq!(done.await.unwrap(), Err(EXPIRED_REASON.to_string()));
        assert_eq!(
            next_outcome(&mut h).await,
            (MessageId::new(9), DeliveryOutcome::Failed(EXPIRED_REASON.into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resync_timeout_is_counted_and_link_stays_up() {
        let config = SupervisorConfig {
            resync_timeout_ms: 1000,
            ..test_config()
        };
        let mut h = harness(config);
        h.transport.delay_resync(Duration::from_secs(60));
        h.handle.connect().unwrap();
        wait_status(&mut h, LinkStatus::Connected).await;

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.metrics.snapshot().resync_timeouts, 1);
        assert_eq!(*h.status.borrow(), LinkStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_withdraws_queued_command() {
        let mut h = harness(test_config());
        let done = enqueue(&h, 4);

        h.handle.cancel(MessageId::new(4)).await.unwrap();
        assert_eq!(done.await.unwrap(), Err(CANCELED_REASON.to_string()));
        assert_eq!(
            next_outcome(&mut h).await,
            (MessageId::new(4), DeliveryOutcome::Failed(CANCELED_REASON.into()))
        );

        let again = h.handle.cancel(MessageId::new(4)).await;
        assert!(matches!(
            again,
            Err(EngineError::Queue(QueueError::NotFound(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_fails_command_immediately() {
        let config = SupervisorConfig {
            queue_capacity: 1,
            ..test_config()
        };
        let h = harness(config);
        let _first = enqueue(&h, 1);
        let second = enqueue(&h, 2);

        let result = second.await.unwrap();
        assert!(result.unwrap_err().contains("queue full"));
    }
}
