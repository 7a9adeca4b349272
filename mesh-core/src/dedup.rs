//! Duplicate suppression for rebroadcast packets.
//!
//! A mesh rebroadcasts every packet, so the same (source, sequence) pair
//! is often heard several times within seconds. The filter remembers pairs
//! for a retention window and reports repeats.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use mesh_types::NodeId;

/// Default retention window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(600);

/// Default number of remembered pairs.
pub const DEFAULT_CAPACITY: usize = 4096;

type PacketKey = (NodeId, u32);

/// Time-windowed set of recently seen (source, sequence) pairs.
#[derive(Debug)]
pub struct DuplicateFilter {
    window: Duration,
    capacity: usize,
    seen: HashMap<PacketKey, Instant>,
    order: VecDeque<(PacketKey, Instant)>,
}

impl DuplicateFilter {
    /// Create a filter with the given window and capacity.
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record a packet; returns true if it was already seen inside the window.
    ///
    /// Sequence 0 means "unnumbered" and is never a duplicate.
    pub fn check(&mut self, source: NodeId, sequence: u32, now: Instant) -> bool {
        if sequence == 0 {
            return false;
        }
        self.evict_expired(now);

        let key = (source, sequence);
        if self.seen.contains_key(&key) {
            return true;
        }

        while self.seen.len() >= self.capacity {
            match self.order.pop_front() {
                Some((old, at)) => {
                    if self.seen.get(&old) == Some(&at) {
                        self.seen.remove(&old);
                    }
                }
                None => break,
            }
        }

        self.seen.insert(key, now);
        self.order.push_back((key, now));
        false
    }

    /// Number of remembered pairs.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(&(key, at)) = self.order.front() {
            if now.saturating_duration_since(at) < self.window {
                break;
            }
            self.order.pop_front();
            if self.seen.get(&key) == Some(&at) {
                self.seen.remove(&key);
            }
        }
    }
}

impl Default for DuplicateFilter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_CAPACITY)
    }
}
