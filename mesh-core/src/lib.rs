//! # mesh-core
//!
//! Pure logic for meshsync (no I/O, instant tests).
//!
//! This crate implements the classification, folding and link-state
//! algorithms of the engine without any radio or disk I/O.
//!
//! ## Design Philosophy
//!
//! Every module here takes input and produces output without side effects:
//! - [`decoder`] turns raw packets into typed events, dropping duplicates
//! - [`registry`] plans mutations as [`Change`]s and installs them on request
//! - [`state`] maps link events to a new state plus a list of actions
//! - [`queue`] orders outgoing commands and enforces the single retry
//! - [`traffic`] keeps the packet rate and reported channel utilization
//!
//! The actual I/O (transport, SQLite) is performed by `mesh-engine`, which
//! interprets the changes and actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod decoder;
pub mod dedup;
pub mod error;
pub mod outbound;
pub mod queue;
pub mod registry;
pub mod state;
pub mod text;
pub mod traffic;

pub use decoder::{classify, Decoded, PacketDecoder};
pub use dedup::DuplicateFilter;
pub use error::{DecodeError, DecodeResult, ValidationError, ValidationResult};
pub use outbound::{random_message_id, MAX_TEXT_BYTES};
pub use queue::{CommandQueue, QueueError, QueuedCommand, Retry, MAX_ATTEMPTS};
pub use registry::{
    Change, MessageView, Model, NodeSortKey, RegistryStats, RestoreReport, SortDirection,
};
pub use state::{Action, BackoffPolicy, Event, LinkState};
pub use traffic::{TrafficSnapshot, TrafficStats};
