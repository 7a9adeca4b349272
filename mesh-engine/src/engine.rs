//! The engine facade.
//!
//! [`Engine::start`] restores the registry from the store and spawns the
//! executor, supervisor, ingest and prune tasks. Reads are served from the
//! shared model snapshot; every mutation goes through the executor queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mesh_core::{
    outbound, MessageView, Model, NodeSortKey, PacketDecoder, QueuedCommand, RegistryStats,
    SortDirection, TrafficSnapshot, TrafficStats,
};
use mesh_store::{LoggedPacket, PacketLog, SqliteStore, Store};
use mesh_types::{
    Channel, ChannelIndex, ConversationKey, DecodedEvent, DeliveryOutcome, Destination,
    EntityKey, LinkStatus, Message, MessageId, Node, NodeId, RawPacket, Timestamp, Topic,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::executor::{spawn_executor, Executor, ExecutorHandle};
use crate::fanout::{Fanout, Subscription, SubscriptionId};
use crate::ingest::{spawn_ingest, Ingest, IngestItem};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::prune::{cutoff, spawn_prune_task};
use crate::supervisor::{spawn_supervisor, SupervisorHandle, SupervisorOutputs};
use crate::transport::Transport;

/// A locally originated mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandIntent {
    /// Send a chat message.
    SendText {
        /// Channel or direct peer.
        destination: Destination,
        /// Message body (1..=200 bytes, not blank).
        body: String,
        /// Message being replied to, in the same conversation.
        reply_to: Option<MessageId>,
    },
    /// React to a message as the local node.
    SendReaction {
        /// Message reacted to.
        target: MessageId,
        /// One of the supported emoji.
        emoji: String,
    },
    /// Write a channel slot on the attached radio.
    SetChannel {
        /// New slot contents.
        channel: Channel,
    },
    /// Send a channel's settings to a remote node.
    InviteToChannel {
        /// Invited node.
        node: NodeId,
        /// Channel slot to share.
        index: ChannelIndex,
    },
    /// Pin or unpin a node. Local only, nothing is transmitted.
    SetFavorite {
        /// Node.
        node: NodeId,
        /// New pin state.
        favorite: bool,
    },
}

/// Result of [`Engine::stage_outgoing`].
///
/// The local mutation is committed when this is returned. Commands that go
/// to the radio can additionally be awaited with [`StageReceipt::transmitted`].
#[derive(Debug)]
pub struct StageReceipt {
    /// Entity the intent created or changed.
    pub entity: EntityKey,
    transmission: Option<(MessageId, oneshot::Receiver<Result<(), String>>)>,
}

impl StageReceipt {
    pub(crate) fn local(entity: EntityKey) -> Self {
        Self {
            entity,
            transmission: None,
        }
    }

    pub(crate) fn queued(
        entity: EntityKey,
        id: MessageId,
        transmission: oneshot::Receiver<Result<(), String>>,
    ) -> Self {
        Self {
            entity,
            transmission: Some((id, transmission)),
        }
    }

    /// Packet id of the queued command, if anything is transmitted.
    pub fn command(&self) -> Option<MessageId> {
        self.transmission.as_ref().map(|(id, _)| *id)
    }

    /// Wait until the command has been written to the radio.
    ///
    /// # Errors
    ///
    /// [`EngineError::DeliveryFailed`] when the write failed twice, the
    /// command expired in the queue or it was canceled.
    pub async fn transmitted(self) -> EngineResult<()> {
        let Some((id, transmission)) = self.transmission else {
            return Ok(());
        };
        match transmission.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(EngineError::DeliveryFailed { id, reason }),
            Err(_) => Err(EngineError::Shutdown),
        }
    }
}

/// Registry counts plus engine health.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStats {
    /// Entity counts.
    pub registry: RegistryStats,
    /// Counters.
    pub metrics: MetricsSnapshot,
    /// Current link status.
    pub link: LinkStatus,
    /// Live subscriptions.
    pub subscribers: usize,
    /// Whether writes are being rejected after a store failure.
    pub store_degraded: bool,
    /// Packet rate and channel utilization.
    pub traffic: TrafficSnapshot,
}

struct Tasks {
    supervisor: JoinHandle<()>,
    ingest: JoinHandle<()>,
    executor: JoinHandle<()>,
    prune: JoinHandle<()>,
}

/// A running synchronization engine.
pub struct Engine {
    config: Config,
    model: Arc<RwLock<Model>>,
    executor: ExecutorHandle,
    supervisor: SupervisorHandle,
    ingest: mpsc::UnboundedSender<IngestItem>,
    fanout: Arc<Fanout>,
    metrics: Arc<EngineMetrics>,
    link: watch::Receiver<LinkStatus>,
    store_degraded: Arc<AtomicBool>,
    traffic: Arc<Mutex<TrafficStats>>,
    packet_log: Option<Arc<dyn PacketLog>>,
    tasks: Tasks,
}

impl Engine {
    /// Open the SQLite store named by the configuration and start.
    pub async fn open<T>(config: Config, transport: T) -> EngineResult<Self>
    where
        T: Transport + 'static,
    {
        let store = SqliteStore::new(&config.storage.database).await?;
        if config.storage.packet_log {
            Self::start_with_packet_log(config, transport, store.clone(), store).await
        } else {
            Self::start(config, transport, store).await
        }
    }

    /// Restore the registry from `store` and start the engine tasks,
    /// without a packet log.
    ///
    /// Pending outgoing messages found in the store are queued again. The
    /// link is opened right away when `device.autoconnect` is set.
    pub async fn start<T, S>(config: Config, transport: T, store: S) -> EngineResult<Self>
    where
        T: Transport + 'static,
        S: Store + 'static,
    {
        Self::launch(config, Arc::new(transport), Arc::new(store), None).await
    }

    /// Like [`Engine::start`], additionally appending every accepted and
    /// transmitted packet to `packet_log`.
    pub async fn start_with_packet_log<T, S, L>(
        config: Config,
        transport: T,
        store: S,
        packet_log: L,
    ) -> EngineResult<Self>
    where
        T: Transport + 'static,
        S: Store + 'static,
        L: PacketLog + 'static,
    {
        let packet_log: Arc<dyn PacketLog> = Arc::new(packet_log);
        Self::launch(config, Arc::new(transport), Arc::new(store), Some(packet_log)).await
    }

    async fn launch(
        config: Config,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Store>,
        packet_log: Option<Arc<dyn PacketLog>>,
    ) -> EngineResult<Self> {
        let records = store.load_all().await?;
        let (mut model, report) = Model::restore(records);
        model.set_manual_origin(config.location.origin());
        if report.orphaned_reactions > 0 {
            tracing::warn!(
                count = report.orphaned_reactions,
                "reactions without a stored message were skipped"
            );
        }
        let stats = model.stats();
        tracing::info!(
            records = report.records,
            nodes = stats.nodes,
            messages = stats.messages,
            pending = stats.pending,
            "registry restored"
        );
        let pending = model.pending_outgoing();

        let model = Arc::new(RwLock::new(model));
        let metrics = Arc::new(EngineMetrics::default());
        let fanout = Fanout::new(config.fanout.subscriber_capacity, Arc::clone(&metrics));
        let store_degraded = Arc::new(AtomicBool::new(false));
        let (status_tx, link) = watch::channel(LinkStatus::Disconnected);
        let (requests_tx, requests) = mpsc::channel(config.registry.mutation_queue.max(1));
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
        let executor = ExecutorHandle::new(requests_tx);

        let (supervisor, supervisor_task) = spawn_supervisor(
            transport,
            config.device.address.clone(),
            config.supervisor.clone(),
            SupervisorOutputs {
                status: status_tx,
                fanout: Arc::clone(&fanout),
                executor: executor.clone(),
                packets: ingest_tx.clone(),
                metrics: Arc::clone(&metrics),
            },
        );

        let executor_task = spawn_executor(
            Executor {
                model: Arc::clone(&model),
                store,
                fanout: Arc::clone(&fanout),
                supervisor: supervisor.clone(),
                metrics: Arc::clone(&metrics),
                degraded: Arc::clone(&store_degraded),
                store_retry: config.storage.store_retry(),
                channel_writes: Default::default(),
                deferred: Default::default(),
                packet_log: packet_log.clone(),
            },
            requests,
        );

        let decoder = PacketDecoder::new(
            config.registry.dedup_window(),
            config.registry.dedup_capacity,
        );
        let traffic = Arc::new(Mutex::new(TrafficStats::new()));
        let ingest_task = spawn_ingest(
            ingest_rx,
            Ingest {
                decoder,
                executor: executor.clone(),
                metrics: Arc::clone(&metrics),
                traffic: Arc::clone(&traffic),
                packet_log: packet_log.clone(),
            },
        );
        let prune_task = spawn_prune_task(executor.clone(), config.prune.clone());

        requeue(&supervisor, pending)?;
        if config.device.autoconnect {
            supervisor.connect()?;
        }

        Ok(Self {
            config,
            model,
            executor,
            supervisor,
            ingest: ingest_tx,
            fanout,
            metrics,
            link,
            store_degraded,
            traffic,
            packet_log,
            tasks: Tasks {
                supervisor: supervisor_task,
                ingest: ingest_task,
                executor: executor_task,
                prune: prune_task,
            },
        })
    }

    /// Configuration the engine runs with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Fold one decoded event into the registry.
    ///
    /// Returns the key of the entity the event was about.
    pub async fn apply_event(&self, event: DecodedEvent) -> EngineResult<EntityKey> {
        self.executor.apply(event).await
    }

    /// Feed a raw packet through the decoder, as if the transport had
    /// received it. Use [`Engine::flush`] to wait for it to be applied.
    pub fn ingest(&self, packet: RawPacket) -> EngineResult<()> {
        self.ingest
            .send(IngestItem::Packet(packet))
            .map_err(|_| EngineError::Shutdown)
    }

    /// Wait until every packet ingested so far has been applied.
    pub async fn flush(&self) -> EngineResult<()> {
        let (done, wait) = oneshot::channel();
        self.ingest
            .send(IngestItem::Flush(done))
            .map_err(|_| EngineError::Shutdown)?;
        wait.await.map_err(|_| EngineError::Shutdown)
    }

    /// Apply a local intent and queue its command for the radio.
    pub async fn stage_outgoing(&self, intent: CommandIntent) -> EngineResult<StageReceipt> {
        self.executor.stage(intent).await
    }

    /// Record a delivery outcome for a message.
    ///
    /// Unknown ids are ignored. Moving a message backward is rejected.
    pub async fn mark_delivery(&self, id: MessageId, outcome: DeliveryOutcome) -> EngineResult<()> {
        self.executor.mark_delivery(id, outcome).await
    }

    /// Withdraw a command that has not started writing. The message ends
    /// `failed` with reason "canceled".
    pub async fn cancel(&self, id: MessageId) -> EngineResult<()> {
        self.supervisor.cancel(id).await?;
        self.executor.barrier().await
    }

    /// Remove nodes not heard from within the configured age now.
    pub async fn prune_now(&self) -> EngineResult<usize> {
        self.executor.prune(cutoff(&self.config.prune)).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Filtered, sorted node list.
    ///
    /// The filter matches id, names, hardware model and coordinates, case
    /// insensitively. Distances are computed from the local node's position,
    /// or the configured location.
    pub async fn query_nodes(
        &self,
        filter: Option<&str>,
        key: NodeSortKey,
        direction: SortDirection,
    ) -> Vec<Node> {
        let (nodes, origin) = {
            let model = self.model.read().await;
            (model.nodes_snapshot(), model.origin())
        };
        mesh_core::registry::select_nodes(nodes, filter, key, direction, origin)
    }

    /// Up to `limit` messages of a conversation older than `before`, oldest
    /// first, with reply parents resolved.
    pub async fn query_conversation(
        &self,
        key: ConversationKey,
        before: Option<Timestamp>,
        limit: usize,
    ) -> Vec<MessageView> {
        self.model
            .read()
            .await
            .query_conversation(key, before, limit)
    }

    /// One node.
    pub async fn node(&self, id: NodeId) -> Option<Node> {
        self.model.read().await.node(id).cloned()
    }

    /// One message.
    pub async fn message(&self, id: MessageId) -> Option<Message> {
        self.model.read().await.message(id).cloned()
    }

    /// All eight channel slots.
    pub async fn channels(&self) -> Vec<Channel> {
        self.model.read().await.channels().to_vec()
    }

    /// Node id of the attached radio, once known.
    pub async fn local_node(&self) -> Option<NodeId> {
        self.model.read().await.local_node()
    }

    /// Entity counts and engine health.
    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            registry: self.model.read().await.stats(),
            metrics: self.metrics.snapshot(),
            link: self.link_status(),
            subscribers: self.fanout.subscriber_count(),
            store_degraded: self.is_store_degraded(),
            traffic: self.traffic().await,
        }
    }

    /// Packet rate over the last minute and reported channel utilization.
    pub async fn traffic(&self) -> TrafficSnapshot {
        let now = tokio::time::Instant::now().into_std();
        self.traffic.lock().await.snapshot(now)
    }

    /// Counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Whether writes are being rejected after a store failure.
    pub fn is_store_degraded(&self) -> bool {
        self.store_degraded.load(Ordering::Acquire)
    }

    // =========================================================================
    // Packet log
    // =========================================================================

    fn log(&self) -> EngineResult<&Arc<dyn PacketLog>> {
        self.packet_log.as_ref().ok_or(EngineError::PacketLogDisabled)
    }

    /// Up to `limit` logged packets older than row `before`, oldest first,
    /// restricted to the given port tags when `ports` is not empty.
    pub async fn packet_history(
        &self,
        before: Option<i64>,
        limit: usize,
        ports: &[u32],
    ) -> EngineResult<Vec<LoggedPacket>> {
        Ok(self.log()?.page(before, limit, ports).await?)
    }

    /// Logged packets whose text, or the sender's or addressee's name,
    /// contains `term`. Newest first.
    pub async fn search_packets(
        &self,
        term: &str,
        before: Option<i64>,
        limit: usize,
    ) -> EngineResult<Vec<LoggedPacket>> {
        Ok(self.log()?.search(term, before, limit).await?)
    }

    /// Number of logged packets [`Engine::search_packets`] can find.
    pub async fn count_packet_matches(&self, term: &str) -> EngineResult<u64> {
        Ok(self.log()?.count_matches(term).await?)
    }

    /// Empty the packet log. The registry is not touched.
    pub async fn clear_packet_log(&self) -> EngineResult<u64> {
        let removed = self.log()?.clear().await?;
        tracing::info!(removed, "packet log cleared");
        Ok(removed)
    }

    // =========================================================================
    // Subscriptions and link
    // =========================================================================

    /// Register interest in a topic.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.fanout.subscribe(topic)
    }

    /// Unregister a subscription by id.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.fanout.unsubscribe(id)
    }

    /// Current link status.
    pub fn link_status(&self) -> LinkStatus {
        *self.link.borrow()
    }

    /// Watch channel following the link status.
    pub fn watch_link(&self) -> watch::Receiver<LinkStatus> {
        self.link.clone()
    }

    /// Open the link (no-op when already up or connecting).
    pub fn connect(&self) -> EngineResult<()> {
        self.supervisor.connect()
    }

    /// Close the link and stop reconnecting.
    pub fn disconnect(&self) -> EngineResult<()> {
        self.supervisor.disconnect()
    }

    /// Stop the engine.
    ///
    /// The link is closed first, then every mutation already queued is
    /// applied and written before the executor stops. Subscriptions end.
    pub async fn shutdown(self) -> EngineResult<()> {
        let Engine {
            executor,
            supervisor,
            ingest,
            fanout,
            tasks,
            ..
        } = self;

        tasks.prune.abort();
        supervisor.shutdown();
        if let Err(e) = tasks.supervisor.await {
            tracing::warn!(error = %e, "supervisor task ended abnormally");
        }
        drop(ingest);
        if let Err(e) = tasks.ingest.await {
            tracing::warn!(error = %e, "ingest task ended abnormally");
        }
        executor.shutdown().await;
        if let Err(e) = tasks.executor.await {
            tracing::warn!(error = %e, "executor task ended abnormally");
        }
        fanout.close_all();
        tracing::info!("engine stopped");
        Ok(())
    }
}

/// Queue restored pending messages, keeping their original age.
fn requeue(supervisor: &SupervisorHandle, pending: Vec<Message>) -> EngineResult<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let now = Timestamp::now();
    let clock = tokio::time::Instant::now().into_std();
    tracing::info!(count = pending.len(), "re-queueing pending messages");
    for message in pending {
        let age = Duration::from_millis(
            now.as_millis()
                .saturating_sub(message.timestamp.as_millis()),
        );
        let enqueued_at = clock.checked_sub(age).unwrap_or(clock);
        let frame = outbound::text_frame(
            message.id,
            message.destination,
            &message.body,
            message.reply_to,
        );
        supervisor.enqueue(QueuedCommand::new(frame, enqueued_at), None)?;
    }
    Ok(())
}
