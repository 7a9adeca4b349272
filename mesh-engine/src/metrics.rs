//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the engine tasks.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Events folded into the registry.
    pub events_applied: AtomicU64,
    /// Packets that could not be classified.
    pub decode_errors: AtomicU64,
    /// Rebroadcast copies dropped by the decoder.
    pub duplicates_suppressed: AtomicU64,
    /// Mutations rejected for violating an invariant.
    pub validation_rejects: AtomicU64,
    /// Commits the store refused.
    pub store_failures: AtomicU64,
    /// Notifications dropped from full subscriber queues.
    pub notifications_dropped: AtomicU64,
    /// Commands written to the radio.
    pub commands_sent: AtomicU64,
    /// Commands that were never written.
    pub commands_failed: AtomicU64,
    /// Resync requests that got no answer in time.
    pub resync_timeouts: AtomicU64,
    /// Reconnect attempts after backoff.
    pub reconnects: AtomicU64,
    /// Packet log appends and updates that failed.
    pub packet_log_failures: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// See [`EngineMetrics::events_applied`].
    pub events_applied: u64,
    /// See [`EngineMetrics::decode_errors`].
    pub decode_errors: u64,
    /// See [`EngineMetrics::duplicates_suppressed`].
    pub duplicates_suppressed: u64,
    /// See [`EngineMetrics::validation_rejects`].
    pub validation_rejects: u64,
    /// See [`EngineMetrics::store_failures`].
    pub store_failures: u64,
    /// See [`EngineMetrics::notifications_dropped`].
    pub notifications_dropped: u64,
    /// See [`EngineMetrics::commands_sent`].
    pub commands_sent: u64,
    /// See [`EngineMetrics::commands_failed`].
    pub commands_failed: u64,
    /// See [`EngineMetrics::resync_timeouts`].
    pub resync_timeouts: u64,
    /// See [`EngineMetrics::reconnects`].
    pub reconnects: u64,
    /// See [`EngineMetrics::packet_log_failures`].
    pub packet_log_failures: u64,
}

impl EngineMetrics {
    /// Bump a counter by one.
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_applied: self.events_applied.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            validation_rejects: self.validation_rejects.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            resync_timeouts: self.resync_timeouts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            packet_log_failures: self.packet_log_failures.load(Ordering::Relaxed),
        }
    }
}
