//! Packet ingest task.
//!
//! Owns the [`PacketDecoder`] (and with it the duplicate filter), turning
//! raw packets into events for the executor's queue. Decode failures and
//! duplicates are counted and dropped here; they never reach the registry.
//! Accepted packets are also counted for the traffic statistics and
//! appended to the packet log.

use std::sync::Arc;

use mesh_core::{Decoded, PacketDecoder, TrafficStats};
use mesh_store::{PacketEntry, PacketLog};
use mesh_types::RawPacket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::executor::ExecutorHandle;
use crate::metrics::EngineMetrics;

pub(crate) enum IngestItem {
    Packet(RawPacket),
    /// Answered once every earlier packet has been applied.
    Flush(oneshot::Sender<()>),
}

pub(crate) struct Ingest {
    pub(crate) decoder: PacketDecoder,
    pub(crate) executor: ExecutorHandle,
    pub(crate) metrics: Arc<EngineMetrics>,
    pub(crate) traffic: Arc<Mutex<TrafficStats>>,
    pub(crate) packet_log: Option<Arc<dyn PacketLog>>,
}

pub(crate) fn spawn_ingest(
    mut items: mpsc::UnboundedReceiver<IngestItem>,
    mut ingest: Ingest,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = items.recv().await {
            match item {
                IngestItem::Packet(packet) => {
                    if !ingest.accept(packet).await {
                        break;
                    }
                }
                IngestItem::Flush(done) => {
                    let _ = ingest.executor.barrier().await;
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("ingest task stopped");
    })
}

impl Ingest {
    /// Decode one packet and hand its event on. `false` once the executor
    /// is gone.
    async fn accept(&mut self, packet: RawPacket) -> bool {
        let now = Instant::now().into_std();
        let event = match self.decoder.decode(&packet, now) {
            Ok(Decoded::Event(event)) => event,
            Ok(Decoded::Duplicate) => {
                EngineMetrics::incr(&self.metrics.duplicates_suppressed);
                tracing::debug!(
                    source = %packet.source,
                    sequence = packet.sequence,
                    "duplicate packet dropped"
                );
                return true;
            }
            Err(e) => {
                EngineMetrics::incr(&self.metrics.decode_errors);
                tracing::debug!(
                    source = %packet.source,
                    port = packet.port,
                    error = %e,
                    "undecodable packet dropped"
                );
                return true;
            }
        };

        self.traffic.lock().await.record(now, packet.channel, &event);
        if let Some(log) = &self.packet_log {
            if let Err(e) = log.append(&PacketEntry::received(&packet)).await {
                EngineMetrics::incr(&self.metrics.packet_log_failures);
                tracing::warn!(source = %packet.source, error = %e, "packet not logged");
            }
        }
        self.executor.submit(event).await.is_ok()
    }
}
