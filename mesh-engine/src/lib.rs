//! # mesh-engine
//!
//! Runtime of the meshsync state synchronization engine.
//!
//! An [`Engine`] keeps a local mirror of a mesh radio network (nodes,
//! channels, messages and reactions) consistent with the packets the
//! attached radio hears, and turns local intents into radio commands.
//!
//! ## Architecture
//!
//! ```text
//!   Transport ──▶ supervisor ──▶ ingest (decode, dedup) ──┐
//!       ▲             │                                   ▼
//!       │             └── outcomes, local node ──▶ executor ──▶ Store
//!       │                                            │    │
//!       └──── command queue ◀── stage_outgoing ──────┘    └──▶ Fanout
//! ```
//!
//! - The **executor** task is the single writer of the registry. Every
//!   mutation is planned, persisted, installed and published in order.
//! - The **supervisor** task owns the link: connect, heartbeat, backoff,
//!   resync and the outgoing command queue.
//! - The **fanout** delivers change notifications to bounded per-subscriber
//!   queues, dropping the oldest entry on overflow.
//! - The **ingest** task also keeps the traffic statistics and, when the
//!   engine has one, appends every accepted packet to the [`PacketLog`].
//!
//! ## Example
//!
//! ```no_run
//! use meshsync_engine::{CommandIntent, Config, Engine, MockTransport};
//! use mesh_types::{ChannelIndex, Destination};
//!
//! # async fn run() -> meshsync_engine::EngineResult<()> {
//! let engine = Engine::open(Config::default(), MockTransport::new()).await?;
//! let receipt = engine
//!     .stage_outgoing(CommandIntent::SendText {
//!         destination: Destination::Broadcast(ChannelIndex::PRIMARY),
//!         body: "Hello everyone!".into(),
//!         reply_to: None,
//!     })
//!     .await?;
//! receipt.transmitted().await?;
//! engine.shutdown().await
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
mod executor;
pub mod fanout;
mod ingest;
pub mod logging;
pub mod metrics;
mod prune;
mod supervisor;
pub mod transport;

pub use config::{
    Config, ConfigError, DeviceConfig, FanoutConfig, LocationConfig, LoggingConfig, PruneConfig,
    RegistryConfig, StorageConfig, SupervisorConfig,
};
pub use engine::{CommandIntent, Engine, EngineStats, StageReceipt};
pub use error::{EngineError, EngineResult};
pub use fanout::{Fanout, Subscription, SubscriptionId};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use transport::{
    LinkInfo, LinkSignal, MockTransport, Transport, TransportError, TransportEvent,
};

pub use mesh_core::{MessageView, NodeSortKey, RegistryStats, SortDirection, TrafficSnapshot};
pub use mesh_store::{LoggedPacket, PacketEntry, PacketLog};
