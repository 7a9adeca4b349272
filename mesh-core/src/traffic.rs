//! Mesh traffic statistics.
//!
//! Packet rate over the last minute and the channel utilization most
//! recently reported in telemetry, per channel slot.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use mesh_types::{ChannelIndex, DecodedEvent, MAX_CHANNELS};

/// Window the packet rate is measured over.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Rolling traffic counters.
#[derive(Debug, Clone, Default)]
pub struct TrafficStats {
    arrivals: VecDeque<Instant>,
    utilization: [Option<f32>; MAX_CHANNELS as usize],
}

/// Point-in-time copy of [`TrafficStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrafficSnapshot {
    /// Packets accepted within the last [`RATE_WINDOW`].
    pub packets_per_minute: usize,
    /// Newest reported channel utilization in percent, by slot.
    pub channel_utilization: [Option<f32>; MAX_CHANNELS as usize],
}

impl TrafficStats {
    /// Empty counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an accepted packet heard on slot `channel` at `now`.
    pub fn record(&mut self, now: Instant, channel: u8, event: &DecodedEvent) {
        self.expire(now);
        self.arrivals.push_back(now);

        if let DecodedEvent::Telemetry(telemetry) = event {
            if let (Some(slot), Some(percent)) = (
                self.utilization.get_mut(channel as usize),
                telemetry.metrics.channel_utilization,
            ) {
                *slot = Some(percent);
            }
        }
    }

    /// Packets accepted within the last minute before `now`.
    pub fn packets_per_minute(&mut self, now: Instant) -> usize {
        self.expire(now);
        self.arrivals.len()
    }

    /// Newest reported utilization of a slot.
    pub fn channel_utilization(&self, channel: ChannelIndex) -> Option<f32> {
        self.utilization[channel.value() as usize]
    }

    /// Copy the counters as of `now`.
    pub fn snapshot(&mut self, now: Instant) -> TrafficSnapshot {
        TrafficSnapshot {
            packets_per_minute: self.packets_per_minute(now),
            channel_utilization: self.utilization,
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&oldest) = self.arrivals.front() {
            if now.saturating_duration_since(oldest) < RATE_WINDOW {
                break;
            }
            self.arrivals.pop_front();
        }
    }
}
