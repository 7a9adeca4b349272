//! Background pruning of silent nodes.
//!
//! Runs periodically and removes nodes not heard from within
//! `node_max_age_days`. Favorites, the local node and nodes only known
//! from neighbor reports are kept.

use std::time::Duration;

use mesh_types::Timestamp;
use tokio::time::interval;

use crate::config::PruneConfig;
use crate::executor::ExecutorHandle;

/// Spawn the pruning task.
///
/// Returns a handle that can be used to abort the task.
pub(crate) fn spawn_prune_task(
    executor: ExecutorHandle,
    config: PruneConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Prune task disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!(
            "Prune task started (interval: {}s, max age: {} days)",
            interval_secs,
            config.node_max_age_days
        );

        let mut timer = interval(Duration::from_secs(interval_secs));
        // Skip the immediate first tick
        timer.tick().await;

        loop {
            timer.tick().await;

            match executor.prune(cutoff(&config)).await {
                Ok(removed) => {
                    if removed > 0 {
                        tracing::info!("Prune: removed {} silent nodes", removed);
                    } else {
                        tracing::debug!("Prune: no silent nodes");
                    }
                }
                Err(e) => {
                    tracing::error!("Prune error: {}", e);
                    if matches!(e, crate::EngineError::Shutdown) {
                        return;
                    }
                }
            }
        }
    })
}

/// Oldest `last_seen` that survives pruning.
pub(crate) fn cutoff(config: &PruneConfig) -> Timestamp {
    Timestamp::now().saturating_sub_millis(config.max_age().as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn disabled_task_exits_immediately() {
        let (tx, _rx) = mpsc::channel(1);
        let config = PruneConfig {
            enabled: false,
            ..PruneConfig::default()
        };

        let handle = spawn_prune_task(ExecutorHandle::new(tx), config);
        // Should complete immediately since disabled
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("Task should complete quickly when disabled")
            .expect("Task should not panic");
    }

    #[tokio::test(start_paused = true)]
    async fn task_stops_when_executor_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let config = PruneConfig {
            interval_secs: 10,
            ..PruneConfig::default()
        };

        let handle = spawn_prune_task(ExecutorHandle::new(tx), config);
        tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .expect("Task should stop once its executor is gone")
            .expect("Task should not panic");
    }

    #[test]
    fn cutoff_is_max_age_in_the_past() {
        let config = PruneConfig {
            node_max_age_days: 1,
            ..PruneConfig::default()
        };
        let now = Timestamp::now();
        let cutoff = cutoff(&config);
        let age = now.as_millis() - cutoff.as_millis();
        assert!((86_400_000..86_400_000 + 5_000).contains(&age));
    }
}
