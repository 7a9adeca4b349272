//! Outgoing command queue for meshsync.
//!
//! This module provides a queue for outgoing frames with:
//! - FIFO ordering for delivery
//! - In-flight tracking (the frame currently being written)
//! - At most one automatic retry, re-queued at the front
//! - Max size limits to prevent unbounded memory growth
//!
//! The queue is owned by the supervisor. Commands are enqueued, begun
//! (moved in flight), then either completed or failed. A failed command
//! goes back to the front once; the second failure is final.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use mesh_types::{MessageId, OutboundFrame};

/// Total attempts a command gets (the first write plus one retry).
pub const MAX_ATTEMPTS: u32 = 2;

/// Error type for queue operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Queue is at capacity.
    Full {
        /// Current queue capacity.
        capacity: usize,
    },
    /// Command is being written and can no longer be withdrawn.
    InFlight(MessageId),
    /// No such command.
    NotFound(MessageId),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Full { capacity } => {
                write!(f, "command queue full (capacity: {})", capacity)
            }
            QueueError::InFlight(id) => write!(f, "command {} already in flight", id),
            QueueError::NotFound(id) => write!(f, "command {} not queued", id),
        }
    }
}

impl std::error::Error for QueueError {}

/// A command waiting to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    /// The frame to write.
    pub frame: OutboundFrame,
    /// When the command was staged; drives the command timeout.
    pub enqueued_at: Instant,
    /// Writes attempted so far.
    pub attempts: u32,
}

impl QueuedCommand {
    /// Create a new queued command.
    pub fn new(frame: OutboundFrame, enqueued_at: Instant) -> Self {
        Self {
            frame,
            enqueued_at,
            attempts: 0,
        }
    }

    /// Command id (the frame's packet id).
    pub fn id(&self) -> MessageId {
        self.frame.id
    }
}

/// What happened to a command whose write failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retry {
    /// Back at the front of the queue for one more attempt.
    Requeued,
    /// Out of attempts; the command is returned for failure reporting.
    Exhausted(QueuedCommand),
    /// The id was not in flight.
    Unknown,
}

/// FIFO command queue with in-flight tracking.
///
/// Commands flow through the queue in this order:
/// 1. `enqueue()` - add to the back
/// 2. `begin()` - remove from the front, mark in flight
/// 3. `complete()` - write succeeded
///
/// If the write fails, call `fail()`: the first failure moves the command
/// back to the front, the second returns it as exhausted.
#[derive(Debug)]
pub struct CommandQueue {
    /// Maximum number of commands (queued + in flight).
    max_size: usize,
    /// Commands waiting to be written.
    queue: VecDeque<QueuedCommand>,
    /// Command being written.
    in_flight: Option<QueuedCommand>,
}

impl CommandQueue {
    /// Create a new queue with the given maximum size.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            queue: VecDeque::new(),
            in_flight: None,
        }
    }

    /// Add a command to the back of the queue.
    ///
    /// Returns the command back inside the error if the queue is full.
    pub fn enqueue(&mut self, cmd: QueuedCommand) -> Result<(), (QueueError, QueuedCommand)> {
        if self.total_count() >= self.max_size {
            return Err((
                QueueError::Full {
                    capacity: self.max_size,
                },
                cmd,
            ));
        }
        self.queue.push_back(cmd);
        Ok(())
    }

    /// Take the next command and mark it in flight.
    ///
    /// Returns None when the queue is empty or a write is already in flight.
    pub fn begin(&mut self) -> Option<QueuedCommand> {
        if self.in_flight.is_some() {
            return None;
        }
        let mut cmd = self.queue.pop_front()?;
        cmd.attempts += 1;
        self.in_flight = Some(cmd.clone());
        Some(cmd)
    }

    /// The write for `id` succeeded.
    pub fn complete(&mut self, id: MessageId) -> Option<QueuedCommand> {
        match &self.in_flight {
            Some(cmd) if cmd.id() == id => self.in_flight.take(),
            _ => None,
        }
    }

    /// The write for `id` failed.
    pub fn fail(&mut self, id: MessageId) -> Retry {
        let cmd = match self.in_flight.take() {
            Some(cmd) if cmd.id() == id => cmd,
            other => {
                self.in_flight = other;
                return Retry::Unknown;
            }
        };
        if cmd.attempts >= MAX_ATTEMPTS {
            Retry::Exhausted(cmd)
        } else {
            self.queue.push_front(cmd);
            Retry::Requeued
        }
    }

    /// Withdraw a command that has not started writing.
    pub fn cancel(&mut self, id: MessageId) -> Result<QueuedCommand, QueueError> {
        if self.in_flight.as_ref().map(QueuedCommand::id) == Some(id) {
            return Err(QueueError::InFlight(id));
        }
        let position = self
            .queue
            .iter()
            .position(|cmd| cmd.id() == id)
            .ok_or(QueueError::NotFound(id))?;
        self.queue.remove(position).ok_or(QueueError::NotFound(id))
    }

    /// Remove queued commands staged more than `timeout` before `now`.
    ///
    /// The in-flight command is never expired; its write carries its own timeout.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<QueuedCommand> {
        let mut expired = Vec::new();
        self.queue.retain(|cmd| {
            let stale = now.saturating_duration_since(cmd.enqueued_at) >= timeout;
            if stale {
                expired.push(cmd.clone());
            }
            !stale
        });
        expired
    }

    /// Whether `id` is waiting or in flight.
    pub fn contains(&self, id: MessageId) -> bool {
        self.in_flight.as_ref().map(QueuedCommand::id) == Some(id)
            || self.queue.iter().any(|cmd| cmd.id() == id)
    }

    /// Number of commands waiting (not including in flight).
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether a write is in flight.
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Total number of commands (queued + in flight).
    pub fn total_count(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    /// Ids of everything queued, in order.
    pub fn queued_ids(&self) -> Vec<MessageId> {
        self.queue.iter().map(QueuedCommand::id).collect()
    }
}
