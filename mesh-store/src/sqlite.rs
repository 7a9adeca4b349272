//! SQLite storage backend for mesh-store.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use mesh_types::{
    EntityKey, EntityKind, MessageId, NodeId, PortNum, Record, SignalMetrics, Timestamp,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Sqlite};
use tracing::debug;

use crate::{
    LoggedPacket, PacketEntry, PacketLog, Predicate, StorageError, StorageResult, Store,
};

/// SQLite-based record storage.
///
/// One table per entity kind; the record itself is a JSON body next to the
/// key columns. Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub async fn new(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|_| StorageError::InvalidPath {
                path: path.to_path_buf(),
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        debug!(path = %path.display(), "opened store");
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(":memory:")?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // A single connection that never idles out: each in-memory
        // connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Close the pool, waiting for connections to finish.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn run_migrations(&self) -> StorageResult<()> {
        const TABLES: [&str; 5] = [
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id INTEGER PRIMARY KEY,
                last_seen INTEGER,
                data TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS channels (
                slot INTEGER PRIMARY KEY,
                data TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY,
                conversation TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                state TEXT NOT NULL,
                data TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS reactions (
                message_id INTEGER NOT NULL,
                author INTEGER NOT NULL,
                emoji TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (message_id, author, emoji)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS packets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                packet_id INTEGER NOT NULL,
                from_node INTEGER NOT NULL,
                to_node INTEGER NOT NULL,
                channel INTEGER NOT NULL,
                port INTEGER NOT NULL,
                payload BLOB NOT NULL,
                text TEXT,
                snr REAL,
                rssi INTEGER,
                hops INTEGER,
                outgoing INTEGER NOT NULL DEFAULT 0,
                delivered INTEGER,
                error TEXT
            )
            "#,
        ];
        for ddl in TABLES {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }

        const INDEXES: [&str; 5] = [
            "CREATE INDEX IF NOT EXISTS idx_messages_thread \
             ON messages(conversation, timestamp, id)",
            "CREATE INDEX IF NOT EXISTS idx_packets_port ON packets(port)",
            "CREATE INDEX IF NOT EXISTS idx_packets_from ON packets(from_node)",
            "CREATE INDEX IF NOT EXISTS idx_packets_to ON packets(to_node)",
            "CREATE INDEX IF NOT EXISTS idx_packets_packet_id ON packets(packet_id)",
        ];
        for ddl in INDEXES {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }

        Ok(())
    }
}

fn table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Node => "nodes",
        EntityKind::Channel => "channels",
        EntityKind::Message => "messages",
        EntityKind::Reaction => "reactions",
    }
}

async fn write_record(conn: &mut SqliteConnection, record: &Record) -> StorageResult<()> {
    match record {
        Record::Node(node) => {
            sqlx::query(
                r#"
                INSERT INTO nodes (id, last_seen, data) VALUES (?1, ?2, ?3)
                ON CONFLICT(id) DO UPDATE SET last_seen = ?2, data = ?3
                "#,
            )
            .bind(node.id.value() as i64)
            .bind(node.last_seen.map(|ts| ts.as_millis() as i64))
            .bind(serde_json::to_string(node)?)
            .execute(&mut *conn)
            .await?;
        }
        Record::Channel(channel) => {
            sqlx::query(
                r#"
                INSERT INTO channels (slot, data) VALUES (?1, ?2)
                ON CONFLICT(slot) DO UPDATE SET data = ?2
                "#,
            )
            .bind(channel.index.value() as i64)
            .bind(serde_json::to_string(channel)?)
            .execute(&mut *conn)
            .await?;
        }
        Record::Message(message) => {
            sqlx::query(
                r#"
                INSERT INTO messages (id, conversation, timestamp, state, data)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO UPDATE SET
                    conversation = ?2, timestamp = ?3, state = ?4, data = ?5
                "#,
            )
            .bind(message.id.value() as i64)
            .bind(message.conversation.to_string())
            .bind(message.timestamp.as_millis() as i64)
            .bind(format!("{:?}", message.state))
            .bind(serde_json::to_string(message)?)
            .execute(&mut *conn)
            .await?;
        }
        Record::Reaction(reaction) => {
            sqlx::query(
                r#"
                INSERT INTO reactions (message_id, author, emoji, timestamp, data)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(message_id, author, emoji) DO UPDATE SET timestamp = ?4, data = ?5
                "#,
            )
            .bind(reaction.message.value() as i64)
            .bind(reaction.author.value() as i64)
            .bind(&reaction.emoji)
            .bind(reaction.timestamp.as_millis() as i64)
            .bind(serde_json::to_string(reaction)?)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

async fn delete_record(conn: &mut SqliteConnection, key: &EntityKey) -> StorageResult<()> {
    match key {
        EntityKey::Node(id) => {
            sqlx::query("DELETE FROM nodes WHERE id = ?1")
                .bind(id.value() as i64)
                .execute(&mut *conn)
                .await?;
        }
        EntityKey::Channel(index) => {
            sqlx::query("DELETE FROM channels WHERE slot = ?1")
                .bind(index.value() as i64)
                .execute(&mut *conn)
                .await?;
        }
        EntityKey::Message(id) => {
            sqlx::query("DELETE FROM reactions WHERE message_id = ?1")
                .bind(id.value() as i64)
                .execute(&mut *conn)
                .await?;
            sqlx::query("DELETE FROM messages WHERE id = ?1")
                .bind(id.value() as i64)
                .execute(&mut *conn)
                .await?;
        }
        EntityKey::Reaction {
            message,
            author,
            emoji,
        } => {
            sqlx::query(
                "DELETE FROM reactions WHERE message_id = ?1 AND author = ?2 AND emoji = ?3",
            )
            .bind(message.value() as i64)
            .bind(author.value() as i64)
            .bind(emoji)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn commit(&self, writes: &[Record], deletes: &[EntityKey]) -> StorageResult<()> {
        if writes.is_empty() && deletes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in writes {
            write_record(&mut *tx, record).await?;
        }
        for key in deletes {
            delete_record(&mut *tx, key).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, key: &EntityKey) -> StorageResult<Option<Record>> {
        let query = match key {
            EntityKey::Node(id) => {
                sqlx::query_as::<_, DataRow>("SELECT data FROM nodes WHERE id = ?1")
                    .bind(id.value() as i64)
            }
            EntityKey::Channel(index) => {
                sqlx::query_as::<_, DataRow>("SELECT data FROM channels WHERE slot = ?1")
                    .bind(index.value() as i64)
            }
            EntityKey::Message(id) => {
                sqlx::query_as::<_, DataRow>("SELECT data FROM messages WHERE id = ?1")
                    .bind(id.value() as i64)
            }
            EntityKey::Reaction {
                message,
                author,
                emoji,
            } => sqlx::query_as::<_, DataRow>(
                "SELECT data FROM reactions WHERE message_id = ?1 AND author = ?2 AND emoji = ?3",
            )
            .bind(message.value() as i64)
            .bind(author.value() as i64)
            .bind(emoji.clone()),
        };

        match query.fetch_optional(&self.pool).await? {
            Some(row) => Ok(Some(row.into_record(key.kind())?)),
            None => Ok(None),
        }
    }

    async fn query(
        &self,
        kind: EntityKind,
        predicate: Predicate<'_>,
    ) -> StorageResult<Vec<Record>> {
        let sql = match kind {
            EntityKind::Message => "SELECT data FROM messages ORDER BY conversation, timestamp, id",
            EntityKind::Reaction => {
                "SELECT data FROM reactions ORDER BY message_id, timestamp, author, emoji"
            }
            EntityKind::Node => "SELECT data FROM nodes ORDER BY id",
            EntityKind::Channel => "SELECT data FROM channels ORDER BY slot",
        };
        let rows = sqlx::query_as::<_, DataRow>(sql)
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = row.into_record(kind)?;
            if predicate(&record) {
                records.push(record);
            }
        }
        debug!(table = table(kind), count = records.len(), "queried store");
        Ok(records)
    }

    async fn health_check(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Internal row type for SQLite queries.
#[derive(sqlx::FromRow)]
struct DataRow {
    data: String,
}

impl DataRow {
    fn into_record(self, kind: EntityKind) -> StorageResult<Record> {
        Ok(match kind {
            EntityKind::Node => Record::Node(serde_json::from_str(&self.data)?),
            EntityKind::Channel => Record::Channel(serde_json::from_str(&self.data)?),
            EntityKind::Message => Record::Message(serde_json::from_str(&self.data)?),
            EntityKind::Reaction => Record::Reaction(serde_json::from_str(&self.data)?),
        })
    }
}

const PACKET_COLUMNS: &str = "id, timestamp, packet_id, from_node, to_node, channel, port, \
    payload, text, snr, rssi, hops, outgoing, delivered, error";

/// Text packets containing `?1`, or packets from/to a node whose name does.
const SEARCH_FILTER: &str = r#"
    (
        (port = ?2 AND text LIKE ?1 ESCAPE '\')
        OR from_node IN named
        OR to_node IN named
    )
"#;

const NAMED_NODES: &str = r#"
    WITH named AS (
        SELECT id FROM nodes
        WHERE json_extract(data, '$.long_name') LIKE ?1 ESCAPE '\'
           OR json_extract(data, '$.short_name') LIKE ?1 ESCAPE '\'
    )
"#;

/// `%term%` with LIKE wildcards in `term` taken literally.
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[async_trait]
impl PacketLog for SqliteStore {
    async fn append(&self, entry: &PacketEntry) -> StorageResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO packets (
                timestamp, packet_id, from_node, to_node, channel, port, payload, text,
                snr, rssi, hops, outgoing, delivered, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(entry.timestamp.as_millis() as i64)
        .bind(i64::from(entry.packet_id))
        .bind(i64::from(entry.from.value()))
        .bind(i64::from(entry.to.value()))
        .bind(i64::from(entry.channel))
        .bind(i64::from(entry.port))
        .bind(&entry.payload)
        .bind(&entry.text)
        .bind(entry.signal.snr.map(f64::from))
        .bind(entry.signal.rssi.map(i64::from))
        .bind(entry.hops.map(i64::from))
        .bind(entry.outgoing)
        .bind(entry.delivered)
        .bind(&entry.error)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn page(
        &self,
        before: Option<i64>,
        limit: usize,
        ports: &[u32],
    ) -> StorageResult<Vec<LoggedPacket>> {
        let select = format!("SELECT {} FROM packets WHERE 1 = 1", PACKET_COLUMNS);
        let mut query = QueryBuilder::<Sqlite>::new(select);
        if !ports.is_empty() {
            query.push(" AND port IN (");
            let mut list = query.separated(", ");
            for port in ports {
                list.push_bind(i64::from(*port));
            }
            list.push_unseparated(")");
        }
        if let Some(before) = before {
            query.push(" AND id < ").push_bind(before);
        }
        query.push(" ORDER BY id DESC LIMIT ").push_bind(limit as i64);

        let rows = query
            .build_query_as::<PacketRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().rev().map(PacketRow::into_logged).collect())
    }

    async fn search(
        &self,
        term: &str,
        before: Option<i64>,
        limit: usize,
    ) -> StorageResult<Vec<LoggedPacket>> {
        let sql = format!(
            "{} SELECT {} FROM packets WHERE {} AND (?3 IS NULL OR id < ?3) \
             ORDER BY id DESC LIMIT ?4",
            NAMED_NODES, PACKET_COLUMNS, SEARCH_FILTER
        );
        let rows = sqlx::query_as::<_, PacketRow>(&sql)
            .bind(like_pattern(term))
            .bind(i64::from(PortNum::TextMessage.tag()))
            .bind(before)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        debug!(term, count = rows.len(), "searched packet log");
        Ok(rows.into_iter().map(PacketRow::into_logged).collect())
    }

    async fn count_matches(&self, term: &str) -> StorageResult<u64> {
        let sql = format!(
            "{} SELECT COUNT(*) FROM packets WHERE {}",
            NAMED_NODES, SEARCH_FILTER
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(like_pattern(term))
            .bind(i64::from(PortNum::TextMessage.tag()))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn update_delivery(
        &self,
        packet_id: MessageId,
        delivered: bool,
        error: Option<&str>,
    ) -> StorageResult<u64> {
        let result = sqlx::query(
            "UPDATE packets SET delivered = ?1, error = ?2 WHERE packet_id = ?3 AND outgoing = 1",
        )
        .bind(delivered)
        .bind(error)
        .bind(i64::from(packet_id.value()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn oldest_row(&self) -> StorageResult<Option<i64>> {
        let oldest: Option<i64> = sqlx::query_scalar("SELECT MIN(id) FROM packets")
            .fetch_one(&self.pool)
            .await?;
        Ok(oldest)
    }

    async fn count(&self) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM packets")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn clear(&self) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM packets")
            .execute(&self.pool)
            .await?;
        debug!(removed = result.rows_affected(), "cleared packet log");
        Ok(result.rows_affected())
    }
}

/// Internal row type for packet log queries.
#[derive(sqlx::FromRow)]
struct PacketRow {
    id: i64,
    timestamp: i64,
    packet_id: i64,
    from_node: i64,
    to_node: i64,
    channel: i64,
    port: i64,
    payload: Vec<u8>,
    text: Option<String>,
    snr: Option<f64>,
    rssi: Option<i64>,
    hops: Option<i64>,
    outgoing: bool,
    delivered: Option<bool>,
    error: Option<String>,
}

impl PacketRow {
    fn into_logged(self) -> LoggedPacket {
        LoggedPacket {
            row: self.id,
            entry: PacketEntry {
                timestamp: Timestamp::from_millis(self.timestamp as u64),
                packet_id: self.packet_id as u32,
                from: NodeId::new(self.from_node as u32),
                to: NodeId::new(self.to_node as u32),
                channel: self.channel as u8,
                port: self.port as u32,
                payload: self.payload,
                text: self.text,
                signal: SignalMetrics {
                    snr: self.snr.map(|snr| snr as f32),
                    rssi: self.rssi.map(|rssi| rssi as i32),
                },
                hops: self.hops.map(|hops| hops as u8),
                outgoing: self.outgoing,
                delivered: self.delivered,
                error: self.error,
            },
        }
    }
}
