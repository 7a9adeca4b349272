//! Device link state machine for meshsync.
//!
//! This module provides a pure, side-effect-free state machine for managing
//! the radio link lifecycle. The state machine takes events as input and
//! produces a new state plus a list of actions to execute.
//!
//! The actual I/O (connecting, heartbeats, writing frames) is performed by
//! the engine's supervisor task, not by this module.

use std::time::Duration;

use mesh_types::LinkStatus;

/// Link state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// No link. `attempt` counts failed connects since the last good link.
    Disconnected {
        /// Failed attempts so far.
        attempt: u32,
    },
    /// Connect + handshake in progress.
    Connecting {
        /// Failed attempts before this one.
        attempt: u32,
    },
    /// Link up, heartbeats flowing, queue draining.
    Connected,
    /// Link up but heartbeats missed; commands are held.
    Degraded,
}

impl LinkState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected { attempt: 0 }
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The supervisor is
    /// responsible for executing the returned actions.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        match (self, event) {
            // From Disconnected
            (Self::Disconnected { attempt }, Event::Start)
            | (Self::Disconnected { attempt }, Event::BackoffElapsed) => (
                Self::Connecting { attempt },
                vec![
                    Action::Notify {
                        status: LinkStatus::Connecting,
                        reason: None,
                    },
                    Action::Connect,
                ],
            ),

            // From Connecting
            (Self::Connecting { .. }, Event::HandshakeCompleted) => (
                Self::Connected,
                vec![
                    Action::Notify {
                        status: LinkStatus::Connected,
                        reason: None,
                    },
                    Action::RequestResync,
                    Action::DrainQueue,
                ],
            ),
            (Self::Connecting { attempt }, Event::ConnectFailed { error }) => {
                let next_attempt = attempt.saturating_add(1);
                (
                    Self::Disconnected {
                        attempt: next_attempt,
                    },
                    vec![
                        Action::Notify {
                            status: LinkStatus::Disconnected,
                            reason: Some(error),
                        },
                        Action::ScheduleReconnect {
                            attempt: next_attempt,
                        },
                    ],
                )
            }

            // From Connected
            (Self::Connected, Event::HeartbeatMissed) => (
                Self::Degraded,
                vec![Action::Notify {
                    status: LinkStatus::Degraded,
                    reason: Some("heartbeat missed".into()),
                }],
            ),
            (Self::Connected, Event::QueueReady) => (Self::Connected, vec![Action::DrainQueue]),

            // From Degraded
            (Self::Degraded, Event::HeartbeatResumed) => (
                Self::Connected,
                vec![
                    Action::Notify {
                        status: LinkStatus::Connected,
                        reason: None,
                    },
                    Action::DrainQueue,
                ],
            ),

            // Hard failure while up
            (Self::Connected, Event::TransportFailed { reason })
            | (Self::Degraded, Event::TransportFailed { reason }) => (
                Self::Disconnected { attempt: 1 },
                vec![
                    Action::Close,
                    Action::Notify {
                        status: LinkStatus::Disconnected,
                        reason: Some(reason),
                    },
                    Action::ScheduleReconnect { attempt: 1 },
                ],
            ),

            // Stop from anywhere
            (Self::Disconnected { .. }, Event::StopRequested) => (
                Self::Disconnected { attempt: 0 },
                vec![Action::CancelReconnect],
            ),
            (_, Event::StopRequested) => (
                Self::Disconnected { attempt: 0 },
                vec![
                    Action::CancelReconnect,
                    Action::Close,
                    Action::Notify {
                        status: LinkStatus::Disconnected,
                        reason: Some("stopped".into()),
                    },
                ],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if frames may be written.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if a device link exists (possibly degraded).
    pub fn is_up(&self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }

    /// Subscriber-facing status.
    pub fn status(&self) -> LinkStatus {
        match self {
            Self::Disconnected { .. } => LinkStatus::Disconnected,
            Self::Connecting { .. } => LinkStatus::Connecting,
            Self::Connected => LinkStatus::Connected,
            Self::Degraded => LinkStatus::Degraded,
        }
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

/// Events that can occur in the link lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Caller asked for a link.
    Start,
    /// Reconnect timer fired.
    BackoffElapsed,
    /// Transport connected and finished its handshake.
    HandshakeCompleted,
    /// Connect or handshake failed (or timed out).
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// No liveness within the heartbeat threshold.
    HeartbeatMissed,
    /// Liveness came back.
    HeartbeatResumed,
    /// Device unplugged, I/O error, or a write failure.
    TransportFailed {
        /// Reason for the failure.
        reason: String,
    },
    /// New commands were queued.
    QueueReady,
    /// Caller asked to stop.
    StopRequested,
}

/// Actions to be executed by the supervisor.
///
/// These are instructions, not side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the transport and run its handshake.
    Connect,
    /// Close the transport.
    Close,
    /// Ask the device for its node database.
    RequestResync,
    /// Write queued commands in order.
    DrainQueue,
    /// Arm the reconnect timer for the given attempt.
    ScheduleReconnect {
        /// Attempt number the delay is computed for.
        attempt: u32,
    },
    /// Disarm the reconnect timer.
    CancelReconnect,
    /// Publish a link status change.
    Notify {
        /// New status.
        status: LinkStatus,
        /// Cause, if any.
        reason: Option<String>,
    },
}

/// Reconnect delay policy.
///
/// Formula: min(max, base * 2^(attempt-1)) + random(0..=jitter)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay for the first attempt.
    pub base: Duration,
    /// Cap on the exponential part.
    pub max: Duration,
    /// Upper bound of the random jitter.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: Duration::from_millis(1000),
        }
    }
}

impl BackoffPolicy {
    /// Delay without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay including random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            random_u64() % (jitter_ms + 1)
        };
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }
}

/// Random u64 from the OS; falls back to 0 if the OS source fails.
fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes),
        Err(_) => 0,
    }
}
