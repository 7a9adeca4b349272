//! Sequential mutation executor.
//!
//! The executor task is the only writer of the registry model. Requests
//! arrive on one bounded queue (API calls, decoded packets from the ingest
//! task, command outcomes from the supervisor) and are handled strictly in
//! arrival order. Each mutation is planned under a read lock, written to
//! the store, and only then installed and published.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mesh_core::{outbound, Change, Model, QueuedCommand, ValidationError};
use mesh_store::{PacketEntry, PacketLog, Store};
use mesh_types::{
    ChannelSettings, DecodedEvent, DeliveryOutcome, DeliveryState, EntityKey, MessageId, NodeId,
    OutboundFrame, Record, Timestamp,
};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::engine::{CommandIntent, StageReceipt};
use crate::error::{EngineError, EngineResult};
use crate::fanout::Fanout;
use crate::metrics::EngineMetrics;
use crate::supervisor::SupervisorHandle;

pub(crate) type Reply<T> = oneshot::Sender<EngineResult<T>>;

/// A radio outcome that could not be recorded while the store was down.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Deferred {
    Delivery(MessageId, DeliveryOutcome),
    ChannelWrite(MessageId, ChannelSettings),
}

/// What the supervisor tells the executor.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Report {
    /// A command was written, or failed for good.
    Outcome {
        id: MessageId,
        outcome: DeliveryOutcome,
    },
    /// The handshake named the attached radio.
    LocalNode(NodeId),
}

pub(crate) enum Request {
    Apply {
        event: DecodedEvent,
        reply: Option<Reply<EntityKey>>,
    },
    Stage {
        intent: CommandIntent,
        reply: Reply<StageReceipt>,
    },
    MarkDelivery {
        id: MessageId,
        outcome: DeliveryOutcome,
        reply: Reply<()>,
    },
    Prune {
        cutoff: Timestamp,
        reply: Reply<usize>,
    },
    Report(Report),
    Barrier(oneshot::Sender<()>),
    Shutdown,
}

/// Sending side of the mutation queue.
#[derive(Debug, Clone)]
pub(crate) struct ExecutorHandle {
    tx: mpsc::Sender<Request>,
}

impl ExecutorHandle {
    pub(crate) fn new(tx: mpsc::Sender<Request>) -> Self {
        Self { tx }
    }

    async fn call<T>(&self, request: impl FnOnce(Reply<T>) -> Request) -> EngineResult<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(request(reply))
            .await
            .map_err(|_| EngineError::Shutdown)?;
        response.await.map_err(|_| EngineError::Shutdown)?
    }

    pub(crate) async fn apply(&self, event: DecodedEvent) -> EngineResult<EntityKey> {
        self.call(|reply| Request::Apply {
            event,
            reply: Some(reply),
        })
        .await
    }

    /// Queue an event without waiting for its result.
    pub(crate) async fn submit(&self, event: DecodedEvent) -> EngineResult<()> {
        self.tx
            .send(Request::Apply { event, reply: None })
            .await
            .map_err(|_| EngineError::Shutdown)
    }

    pub(crate) async fn stage(&self, intent: CommandIntent) -> EngineResult<StageReceipt> {
        self.call(|reply| Request::Stage { intent, reply }).await
    }

    pub(crate) async fn mark_delivery(
        &self,
        id: MessageId,
        outcome: DeliveryOutcome,
    ) -> EngineResult<()> {
        self.call(|reply| Request::MarkDelivery { id, outcome, reply })
            .await
    }

    pub(crate) async fn prune(&self, cutoff: Timestamp) -> EngineResult<usize> {
        self.call(|reply| Request::Prune { cutoff, reply }).await
    }

    pub(crate) async fn report(&self, report: Report) -> EngineResult<()> {
        self.tx
            .send(Request::Report(report))
            .await
            .map_err(|_| EngineError::Shutdown)
    }

    /// Resolves once everything queued before it has been handled.
    pub(crate) async fn barrier(&self) -> EngineResult<()> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Request::Barrier(done))
            .await
            .map_err(|_| EngineError::Shutdown)?;
        wait.await.map_err(|_| EngineError::Shutdown)
    }

    pub(crate) async fn shutdown(&self) {
        let _ = self.tx.send(Request::Shutdown).await;
    }
}

pub(crate) struct Executor {
    pub(crate) model: Arc<RwLock<Model>>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) fanout: Arc<Fanout>,
    pub(crate) supervisor: SupervisorHandle,
    pub(crate) metrics: Arc<EngineMetrics>,
    pub(crate) degraded: Arc<AtomicBool>,
    pub(crate) store_retry: Duration,
    /// Channel writes waiting for the radio to accept them.
    pub(crate) channel_writes: HashMap<MessageId, ChannelSettings>,
    /// Outcomes replayed in order once the store recovers.
    pub(crate) deferred: VecDeque<Deferred>,
    pub(crate) packet_log: Option<Arc<dyn PacketLog>>,
}

pub(crate) fn spawn_executor(
    executor: Executor,
    requests: mpsc::Receiver<Request>,
) -> JoinHandle<()> {
    tokio::spawn(executor.run(requests))
}

impl Executor {
    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        let mut probe = time::interval_at(Instant::now() + self.store_retry, self.store_retry);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!("registry executor started");

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle(request).await,
                },
                _ = probe.tick() => self.probe_store().await,
            }
        }

        tracing::info!("registry executor stopped");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Apply { event, reply } => {
                let result = self.apply(event).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Request::Stage { intent, reply } => {
                let result = self.stage(intent).await;
                if let Err(EngineError::Validation(_)) = &result {
                    EngineMetrics::incr(&self.metrics.validation_rejects);
                }
                let _ = reply.send(result);
            }
            Request::MarkDelivery { id, outcome, reply } => {
                let _ = reply.send(self.mark_delivery(id, outcome).await);
            }
            Request::Prune { cutoff, reply } => {
                let _ = reply.send(self.prune(cutoff).await);
            }
            Request::Report(report) => self.on_report(report).await,
            Request::Barrier(done) => {
                let _ = done.send(());
            }
            Request::Shutdown => {}
        }
    }

    /// Persist, install and publish a planned change.
    async fn commit(&mut self, change: Change) -> EngineResult<EntityKey> {
        if !change.is_noop() {
            if self.degraded.load(Ordering::Acquire) {
                return Err(EngineError::StoreUnavailable);
            }
            if let Err(e) = self.store.commit(&change.writes, &change.deletes).await {
                self.degraded.store(true, Ordering::Release);
                EngineMetrics::incr(&self.metrics.store_failures);
                tracing::error!(
                    error = %e,
                    entity = ?change.entity,
                    "store commit failed, rejecting writes until it recovers"
                );
                return Err(EngineError::Store(e));
            }
        }

        let entity = change.entity.clone();
        let resolved: Vec<(MessageId, bool, Option<String>)> = change
            .writes
            .iter()
            .filter_map(|record| match record {
                Record::Message(m) if m.outgoing && m.state == DeliveryState::Delivered => {
                    Some((m.id, true, None))
                }
                Record::Message(m) if m.outgoing && m.state == DeliveryState::Failed => {
                    Some((m.id, false, m.failure.clone()))
                }
                _ => None,
            })
            .collect();
        let notifications = self.model.write().await.install(change);
        self.fanout.publish(&notifications);

        for (id, delivered, error) in resolved {
            self.log_delivery(id, delivered, error.as_deref()).await;
        }
        Ok(entity)
    }

    async fn log_sent(&self, frame: &OutboundFrame) {
        let Some(log) = &self.packet_log else {
            return;
        };
        let from = self.model.read().await.author();
        if let Err(e) = log.append(&PacketEntry::sent(frame, from, Timestamp::now())).await {
            EngineMetrics::incr(&self.metrics.packet_log_failures);
            tracing::warn!(id = %frame.id, error = %e, "outgoing packet not logged");
        }
    }

    async fn log_delivery(&self, id: MessageId, delivered: bool, error: Option<&str>) {
        let Some(log) = &self.packet_log else {
            return;
        };
        if let Err(e) = log.update_delivery(id, delivered, error).await {
            EngineMetrics::incr(&self.metrics.packet_log_failures);
            tracing::warn!(%id, error = %e, "delivery not logged");
        }
    }

    async fn probe_store(&mut self) {
        if !self.degraded.load(Ordering::Acquire) {
            return;
        }
        match self.store.health_check().await {
            Ok(()) => {
                self.degraded.store(false, Ordering::Release);
                tracing::info!("store reachable again, accepting writes");
                self.replay_deferred().await;
            }
            Err(e) => tracing::debug!(error = %e, "store still unavailable"),
        }
    }

    /// Record outcomes held back while the store was down, oldest first.
    /// Stops at the first one the store refuses again.
    async fn replay_deferred(&mut self) {
        if !self.deferred.is_empty() {
            tracing::info!(count = self.deferred.len(), "replaying held delivery outcomes");
        }
        while let Some(item) = self.deferred.pop_front() {
            let result = match item.clone() {
                Deferred::Delivery(id, outcome) => self.record_delivery(id, outcome).await,
                Deferred::ChannelWrite(id, settings) => {
                    self.apply_channel_write(id, settings, DeliveryOutcome::Sent)
                        .await
                }
            };
            if let Err(e) = result {
                if is_store_error(&e) {
                    self.deferred.push_front(item);
                    return;
                }
                tracing::debug!(error = %e, "held outcome no longer applies");
            }
        }
    }

    async fn apply(&mut self, event: DecodedEvent) -> EngineResult<EntityKey> {
        let planned = self.model.read().await.plan_event(&event);
        match planned {
            Ok(change) => {
                let entity = match self.commit(change).await {
                    Ok(entity) => entity,
                    Err(e) => {
                        if let (DecodedEvent::Routing(ack), true) = (&event, is_store_error(&e)) {
                            let outcome = match &ack.error {
                                None => DeliveryOutcome::Delivered,
                                Some(reason) => DeliveryOutcome::Failed(reason.clone()),
                            };
                            self.defer(Deferred::Delivery(ack.request_id, outcome));
                        }
                        return Err(e);
                    }
                };
                EngineMetrics::incr(&self.metrics.events_applied);
                tracing::debug!(
                    kind = event.kind(),
                    source = %event.meta().source,
                    "event applied"
                );
                Ok(entity)
            }
            Err(e) => {
                EngineMetrics::incr(&self.metrics.validation_rejects);
                tracing::debug!(kind = event.kind(), error = %e, "event rejected");
                Err(e.into())
            }
        }
    }

    async fn stage(&mut self, intent: CommandIntent) -> EngineResult<StageReceipt> {
        match intent {
            CommandIntent::SendText {
                destination,
                body,
                reply_to,
            } => {
                let (id, change) = {
                    let model = self.model.read().await;
                    let id = fresh_id(&model, &self.channel_writes);
                    let change =
                        model.plan_stage_text(id, destination, &body, reply_to, Timestamp::now())?;
                    (id, change)
                };
                let entity = self.commit(change).await?;
                tracing::info!(%id, ?destination, "text staged");
                let frame = outbound::text_frame(id, destination, &body, reply_to);
                Ok(self.transmit(entity, frame).await)
            }
            CommandIntent::SendReaction { target, emoji } => {
                let (id, change, destination) = {
                    let model = self.model.read().await;
                    let (change, destination) =
                        model.plan_local_reaction(target, &emoji, Timestamp::now())?;
                    (fresh_id(&model, &self.channel_writes), change, destination)
                };
                let entity = self.commit(change).await?;
                let frame = outbound::reaction_frame(id, destination, target, &emoji);
                Ok(self.transmit(entity, frame).await)
            }
            CommandIntent::SetChannel { channel } => {
                let settings = outbound::channel_settings(&channel);
                Model::validate_channel(&settings)?;
                let (id, device) = {
                    let model = self.model.read().await;
                    (
                        fresh_id(&model, &self.channel_writes),
                        model.local_node().unwrap_or(NodeId::LOCAL),
                    )
                };
                let frame = outbound::channel_frame(id, device, settings.clone())?;
                self.channel_writes.insert(id, settings);
                tracing::info!(%id, index = %channel.index, "channel write staged");
                Ok(self.transmit(EntityKey::Channel(channel.index), frame).await)
            }
            CommandIntent::InviteToChannel { node, index } => {
                if !node.is_addressable() {
                    return Err(ValidationError::MalformedId(node.to_string()).into());
                }
                let (id, settings) = {
                    let model = self.model.read().await;
                    let channel = model.channel(index);
                    if !channel.is_enabled() {
                        return Err(ValidationError::ChannelDisabled(index).into());
                    }
                    (
                        fresh_id(&model, &self.channel_writes),
                        outbound::channel_settings(channel),
                    )
                };
                let frame = outbound::channel_frame(id, node, settings)?;
                tracing::info!(%id, %node, %index, "channel invite staged");
                Ok(self.transmit(EntityKey::Node(node), frame).await)
            }
            CommandIntent::SetFavorite { node, favorite } => {
                let change = self.model.read().await.plan_favorite(node, favorite)?;
                let entity = self.commit(change).await?;
                Ok(StageReceipt::local(entity))
            }
        }
    }

    /// Log a frame and hand it to the supervisor's queue.
    async fn transmit(&self, entity: EntityKey, frame: OutboundFrame) -> StageReceipt {
        self.log_sent(&frame).await;
        let id = frame.id;
        let (done, transmission) = oneshot::channel();
        let command = QueuedCommand::new(frame, Instant::now().into_std());
        if let Err(e) = self.supervisor.enqueue(command, Some(done)) {
            tracing::warn!(%id, error = %e, "supervisor gone, command not queued");
        }
        StageReceipt::queued(entity, id, transmission)
    }

    async fn mark_delivery(&mut self, id: MessageId, outcome: DeliveryOutcome) -> EngineResult<()> {
        let planned = self.model.read().await.plan_delivery(id, &outcome);
        match planned {
            Ok(Some(change)) => self.commit(change).await.map(|_| ()),
            Ok(None) => {
                tracing::debug!(%id, ?outcome, "delivery outcome changes nothing");
                Ok(())
            }
            Err(e) => {
                EngineMetrics::incr(&self.metrics.validation_rejects);
                Err(e.into())
            }
        }
    }

    async fn on_report(&mut self, report: Report) {
        match report {
            Report::LocalNode(id) => {
                self.model.write().await.set_local_node(id);
                tracing::info!(local_node = %id, "local node identified");
            }
            Report::Outcome { id, outcome } => {
                if let Some(settings) = self.channel_writes.remove(&id) {
                    let index = settings.index;
                    if let Err(e) = self.apply_channel_write(id, settings.clone(), outcome).await {
                        tracing::warn!(%id, index, error = %e, "channel write not applied");
                        if is_store_error(&e) {
                            self.defer(Deferred::ChannelWrite(id, settings));
                        }
                    }
                    return;
                }
                if let Err(e) = self.record_delivery(id, outcome.clone()).await {
                    tracing::warn!(%id, error = %e, "delivery outcome not recorded");
                    if is_store_error(&e) {
                        self.defer(Deferred::Delivery(id, outcome));
                    }
                }
            }
        }
    }

    /// Move a message along its delivery states. Stale outcomes (a late
    /// `sent` after the ack already arrived) are ignored.
    async fn record_delivery(
        &mut self,
        id: MessageId,
        outcome: DeliveryOutcome,
    ) -> EngineResult<()> {
        let planned = self.model.read().await.plan_delivery(id, &outcome);
        match planned {
            Ok(Some(change)) => self.commit(change).await.map(|_| ()),
            Ok(None) => Ok(()),
            Err(e) => {
                tracing::debug!(%id, error = %e, "stale delivery outcome ignored");
                Ok(())
            }
        }
    }

    fn defer(&mut self, item: Deferred) {
        tracing::info!(?item, "store unavailable, holding outcome until it recovers");
        self.deferred.push_back(item);
    }

    async fn apply_channel_write(
        &mut self,
        id: MessageId,
        settings: ChannelSettings,
        outcome: DeliveryOutcome,
    ) -> EngineResult<()> {
        if let DeliveryOutcome::Failed(reason) = outcome {
            tracing::warn!(%id, index = settings.index, reason = %reason, "channel write failed");
            return Ok(());
        }
        let change = self.model.read().await.plan_channel(&settings)?;
        self.commit(change).await?;
        tracing::debug!(%id, index = settings.index, "channel write applied");
        Ok(())
    }

    async fn prune(&mut self, cutoff: Timestamp) -> EngineResult<usize> {
        let stale = self.model.read().await.stale_nodes(cutoff);
        let mut removed = 0;
        for id in stale {
            let planned = self.model.read().await.plan_remove_node(id);
            let Some(change) = planned else {
                continue;
            };
            self.commit(change).await?;
            removed += 1;
        }
        Ok(removed)
    }
}

fn is_store_error(e: &EngineError) -> bool {
    matches!(e, EngineError::Store(_) | EngineError::StoreUnavailable)
}

/// A random packet id not used by any message or pending channel write.
fn fresh_id(model: &Model, channel_writes: &HashMap<MessageId, ChannelSettings>) -> MessageId {
    loop {
        let id = outbound::random_message_id();
        if !model.has_message(id) && !channel_writes.contains_key(&id) {
            return id;
        }
    }
}
