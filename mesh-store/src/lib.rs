//! # mesh-store
//!
//! Durable mirror of the meshsync state registry.
//!
//! The registry writes every committed mutation through a [`Store`] before
//! it is considered committed, and rebuilds itself from [`Store::load_all`]
//! at startup. [`SqliteStore`] is the production backend.
//!
//! [`PacketLog`] is the packet history kept next to the registry tables;
//! [`SqliteStore`] implements it as well.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod packet_log;
mod sqlite;

pub use error::{StorageError, StorageResult};
pub use packet_log::{LoggedPacket, PacketEntry, PacketLog};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use mesh_types::{EntityKey, EntityKind, Record};

/// Filter applied to records of one kind.
pub type Predicate<'a> = &'a (dyn Fn(&Record) -> bool + Send + Sync);

/// Trait for persistence backends.
///
/// Implementations must be crash-safe: a batch is either fully visible to
/// later reads or not at all.
#[async_trait]
pub trait Store: Send + Sync {
    /// Atomically upsert `writes` and remove `deletes`.
    async fn commit(&self, writes: &[Record], deletes: &[EntityKey]) -> StorageResult<()>;

    /// Fetch one record.
    async fn get(&self, key: &EntityKey) -> StorageResult<Option<Record>>;

    /// Every record of `kind` matching `predicate`.
    async fn query(&self, kind: EntityKind, predicate: Predicate<'_>) -> StorageResult<Vec<Record>>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> StorageResult<()>;

    /// Upsert one record.
    async fn put(&self, record: &Record) -> StorageResult<()> {
        self.commit(std::slice::from_ref(record), &[]).await
    }

    /// Upsert several records in one transaction.
    async fn put_batch(&self, records: &[Record]) -> StorageResult<()> {
        self.commit(records, &[]).await
    }

    /// Remove one record. Removing a message also removes its reactions.
    async fn delete(&self, key: &EntityKey) -> StorageResult<()> {
        self.commit(&[], std::slice::from_ref(key)).await
    }

    /// Every stored record, nodes and channels first, reactions last.
    async fn load_all(&self) -> StorageResult<Vec<Record>> {
        let mut records = Vec::new();
        for kind in EntityKind::ALL {
            records.extend(self.query(kind, &|_| true).await?);
        }
        Ok(records)
    }
}
