//! Subscription fan-out.
//!
//! Every subscriber owns a bounded queue. Publishing never blocks: when a
//! queue is full its oldest notification is dropped and counted. Slow
//! subscribers therefore lose history instead of stalling the executor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dashmap::DashMap;
use mesh_types::{Notification, Topic};
use tokio::sync::Notify;

use crate::metrics::EngineMetrics;

/// Identifies a subscription for [`Fanout::unsubscribe`].
pub type SubscriptionId = u64;

#[derive(Debug)]
struct SubscriberQueue {
    topic: Topic,
    capacity: usize,
    pending: Mutex<VecDeque<Notification>>,
    ready: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn pending(&self) -> MutexGuard<'_, VecDeque<Notification>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns true when the oldest entry had to go.
    fn push(&self, notification: Notification) -> bool {
        let overflowed = {
            let mut pending = self.pending();
            pending.push_back(notification);
            if pending.len() > self.capacity {
                pending.pop_front();
                true
            } else {
                false
            }
        };
        if overflowed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        overflowed
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_one();
    }
}

/// Registry of subscribers.
#[derive(Debug)]
pub struct Fanout {
    next_id: AtomicU64,
    capacity: usize,
    subscribers: DashMap<SubscriptionId, Arc<SubscriberQueue>>,
    metrics: Arc<EngineMetrics>,
}

impl Fanout {
    /// Create a fan-out whose subscribers each buffer up to `capacity`
    /// notifications.
    pub fn new(capacity: usize, metrics: Arc<EngineMetrics>) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            subscribers: DashMap::new(),
            metrics,
        })
    }

    /// Register interest in `topic`.
    pub fn subscribe(self: &Arc<Self>, topic: Topic) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue {
            topic,
            capacity: self.capacity,
            pending: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.subscribers.insert(id, Arc::clone(&queue));
        tracing::debug!(id, ?topic, "subscriber registered");
        Subscription {
            id,
            queue,
            fanout: Arc::downgrade(self),
        }
    }

    /// Unregister a subscription. Its handle then yields what is already
    /// queued and ends. Returns false for unknown ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscribers.remove(&id) {
            Some((_, queue)) => {
                queue.close();
                tracing::debug!(id, "subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Deliver the notifications of one committed mutation.
    ///
    /// Each subscriber receives at most one of them: the first on its topic.
    pub fn publish(&self, notifications: &[Notification]) {
        if notifications.is_empty() {
            return;
        }
        for entry in self.subscribers.iter() {
            let queue = entry.value();
            let Some(notification) = notifications.iter().find(|n| n.topic == queue.topic)
            else {
                continue;
            };
            if queue.push(notification.clone()) {
                EngineMetrics::incr(&self.metrics.notifications_dropped);
                tracing::warn!(
                    id = *entry.key(),
                    dropped = queue.dropped.load(Ordering::Relaxed),
                    "subscriber queue full, dropped oldest notification"
                );
            }
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// End every subscription (engine shutdown).
    pub fn close_all(&self) {
        for entry in self.subscribers.iter() {
            entry.value().close();
        }
        self.subscribers.clear();
    }
}

/// Handle to one subscription. Dropping it unregisters.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    queue: Arc<SubscriberQueue>,
    fanout: Weak<Fanout>,
}

impl Subscription {
    /// Subscription id.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Topic this handle listens to.
    pub fn topic(&self) -> Topic {
        self.queue.topic
    }

    /// Wait for the next notification. `None` once the subscription is
    /// closed and drained.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            if let Some(notification) = self.queue.pending().pop_front() {
                return Some(notification);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.ready.notified().await;
        }
    }

    /// Next notification if one is queued.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.queue.pending().pop_front()
    }

    /// Everything queued right now.
    pub fn drain(&mut self) -> Vec<Notification> {
        self.queue.pending().drain(..).collect()
    }

    /// Notifications lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.subscribers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::{ChangeSummary, ChannelIndex, ConversationKey, EntityKey, NodeId};

    fn node_note(id: u32) -> Notification {
        Notification::entity(
            Topic::AllNodes,
            EntityKey::Node(NodeId::new(id)),
            ChangeSummary::Created,
        )
    }

    fn primary() -> Topic {
        Topic::Conversation(ConversationKey::Channel(ChannelIndex::PRIMARY))
    }

    fn fanout(capacity: usize) -> (Arc<Fanout>, Arc<EngineMetrics>) {
        let metrics = Arc::new(EngineMetrics::default());
        (Fanout::new(capacity, Arc::clone(&metrics)), metrics)
    }

    #[tokio::test]
    async fn delivers_only_matching_topic() {
        let (fanout, _) = fanout(8);
        let mut nodes = fanout.subscribe(Topic::AllNodes);
        let mut channel = fanout.subscribe(primary());

        fanout.publish(&[node_note(1)]);

        assert_eq!(nodes.recv().await, Some(node_note(1)));
        assert!(channel.try_recv().is_none());
    }

    #[tokio::test]
    async fn one_notification_per_subscriber_per_mutation() {
        let (fanout, _) = fanout(8);
        let mut nodes = fanout.subscribe(Topic::AllNodes);

        fanout.publish(&[node_note(1), node_note(2)]);

        assert_eq!(nodes.drain(), vec![node_note(1)]);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let (fanout, metrics) = fanout(2);
        let mut slow = fanout.subscribe(Topic::AllNodes);

        for id in 1..=5 {
            fanout.publish(&[node_note(id)]);
        }

        assert_eq!(slow.dropped(), 3);
        assert_eq!(slow.drain(), vec![node_note(4), node_note(5)]);
        assert_eq!(metrics.snapshot().notifications_dropped, 3);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_affect_others() {
        let (fanout, _) = fanout(1);
        let _slow = fanout.subscribe(Topic::AllNodes);
        let mut fast = fanout.subscribe(Topic::AllNodes);

        for id in 1..=3 {
            fanout.publish(&[node_note(id)]);
            assert_eq!(fast.recv().await, Some(node_note(id)));
        }
        assert_eq!(fast.dropped(), 0);
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let (fanout, _) = fanout(8);
        let mut sub = fanout.subscribe(Topic::AllNodes);

        let publisher = Arc::clone(&fanout);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish(&[node_note(7)]);
        });

        assert_eq!(sub.recv().await, Some(node_note(7)));
    }

    #[tokio::test]
    async fn unsubscribe_ends_the_stream() {
        let (fanout, _) = fanout(8);
        let mut sub = fanout.subscribe(Topic::AllNodes);
        fanout.publish(&[node_note(1)]);

        assert!(fanout.unsubscribe(sub.id()));
        assert!(!fanout.unsubscribe(sub.id()));
        fanout.publish(&[node_note(2)]);

        assert_eq!(sub.recv().await, Some(node_note(1)));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn dropping_handle_unregisters() {
        let (fanout, _) = fanout(8);
        let sub = fanout.subscribe(Topic::ConnectionState);
        assert_eq!(fanout.subscriber_count(), 1);

        drop(sub);
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_all_ends_every_subscription() {
        let (fanout, _) = fanout(8);
        let mut a = fanout.subscribe(Topic::AllNodes);
        let mut b = fanout.subscribe(Topic::Channels);

        fanout.close_all();

        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, None);
        assert_eq!(fanout.subscriber_count(), 0);
    }
}
