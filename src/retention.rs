use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::RetentionConfig;
use crate::health::HealthMetrics;
use crate::model::time_bucket::{time_bucket, Granularity};
use crate::model::Schema;
use crate::remote::topology::ClusterTopology;
use crate::storage::Storage;
use crate::worker::persistence::delete_history;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Periodically removes metric rows older than their time-to-live.
///
/// Only the first node of the topology deletes, so a cluster issues each
/// delete once.
pub struct RetentionKeeper {
    cfg: RetentionConfig,
    storage: Arc<Storage>,
    tables: Vec<(String, Granularity)>,
    topology: Arc<ClusterTopology>,
    health: Option<Arc<HealthMetrics>>,
    run_task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl RetentionKeeper {
    pub fn new(
        cfg: RetentionConfig,
        storage: Arc<Storage>,
        schemas: &[Arc<Schema>],
        granularities: &[Granularity],
        topology: Arc<ClusterTopology>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let tables = schemas
            .iter()
            .flat_map(|s| granularities.iter().map(move |&g| (s.table_name(g), g)))
            .collect();
        Self {
            cfg,
            storage,
            tables,
            topology,
            health,
            run_task: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    fn ttl_days(&self, granularity: Granularity) -> u32 {
        match granularity {
            Granularity::Minute => self.cfg.minute_ttl_days,
            _ => self.cfg.metrics_ttl_days,
        }
    }

    /// Newest bucket to delete per table at `now_ms`.
    ///
    /// The bucket containing the cutoff instant is kept whole, so the
    /// threshold is the value just below it.
    pub fn thresholds(&self, now_ms: i64) -> Vec<(String, i64)> {
        self.tables
            .iter()
            .filter_map(|(table, g)| {
                let cutoff = now_ms - i64::from(self.ttl_days(*g)) * DAY_MS;
                let bucket = time_bucket(cutoff, *g)?;
                Some((table.clone(), bucket - 1))
            })
            .collect()
    }

    /// Deletes expired rows of every table. Returns how many tables were
    /// cleaned without error.
    pub async fn run_once(&self, now_ms: i64) -> usize {
        if !self.topology.is_first() {
            debug!("not the first node, skipping retention");
            return 0;
        }

        let mut cleaned = 0;
        for (table, before) in self.thresholds(now_ms) {
            match delete_history(&self.storage, &table, before, self.health.as_deref()).await {
                Ok(()) => cleaned += 1,
                Err(e) => error!(table = %table, before, error = %e, "deleting expired rows failed"),
            }
        }
        cleaned
    }

    pub async fn start(&self, ctx: CancellationToken) {
        if !self.cfg.enabled {
            info!("retention disabled");
            return;
        }

        let keeper = Self {
            cfg: self.cfg.clone(),
            storage: Arc::clone(&self.storage),
            tables: self.tables.clone(),
            topology: Arc::clone(&self.topology),
            health: self.health.clone(),
            run_task: Arc::clone(&self.run_task),
        };
        let interval = self.cfg.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = ticker.tick() => {
                        keeper.run_once(Utc::now().timestamp_millis()).await;
                    }
                }
            }
        });
        *self.run_task.lock().await = Some(handle);

        info!(
            interval = ?self.cfg.interval,
            metrics_ttl_days = self.cfg.metrics_ttl_days,
            minute_ttl_days = self.cfg.minute_ttl_days,
            tables = self.tables.len(),
            "retention keeper started"
        );
    }

    pub async fn wait_for_shutdown(&self) {
        let handle = { self.run_task.lock().await.take() };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::Record;
    use crate::storage::memory::MemoryStorage;
    use crate::worker::tests::calls_schema;

    // 2024-01-10 12:34:56 UTC
    const NOW: i64 = 1_704_890_096_000;

    fn cfg() -> RetentionConfig {
        RetentionConfig {
            enabled: true,
            interval: Duration::from_secs(60),
            metrics_ttl_days: 7,
            minute_ttl_days: 1,
        }
    }

    fn keeper(memory: &MemoryStorage, self_addr: &str, nodes: &[&str]) -> RetentionKeeper {
        let topology = Arc::new(ClusterTopology::new(self_addr, None));
        topology.update(nodes.iter().map(|n| n.to_string()).collect());
        RetentionKeeper::new(
            cfg(),
            Arc::new(Storage::Memory(memory.clone())),
            &[calls_schema()],
            &[Granularity::Minute, Granularity::Day, Granularity::Month],
            topology,
            None,
        )
    }

    #[test]
    fn test_thresholds_per_granularity() {
        let keeper = keeper(&MemoryStorage::new(), "a:1", &["a:1"]);
        let thresholds = keeper.thresholds(NOW);
        assert_eq!(
            thresholds,
            vec![
                ("endpoint_calls_minute".to_string(), 202401091233),
                ("endpoint_calls_day".to_string(), 20240102),
                ("endpoint_calls_month".to_string(), 202400),
            ]
        );
    }

    #[tokio::test]
    async fn test_first_node_deletes_expired_rows() {
        let memory = MemoryStorage::new();
        let schema = calls_schema();
        for bucket in [20240101, 20240102, 20240103, 20240110] {
            memory.seed(
                "endpoint_calls_day",
                Record::new(Arc::clone(&schema), format!("{bucket}_A"), bucket),
            );
        }

        let keeper = keeper(&memory, "a:1", &["a:1", "b:1"]);
        assert_eq!(keeper.run_once(NOW).await, 3);
        assert_eq!(memory.table_len("endpoint_calls_day"), 2);
        assert!(memory.row("endpoint_calls_day", "20240103_A").is_some());
    }

    #[tokio::test]
    async fn test_other_nodes_skip() {
        let memory = MemoryStorage::new();
        memory.seed(
            "endpoint_calls_day",
            Record::new(calls_schema(), "20240101_A", 20240101),
        );

        let keeper = keeper(&memory, "b:1", &["a:1", "b:1"]);
        assert_eq!(keeper.run_once(NOW).await, 0);
        assert_eq!(memory.table_len("endpoint_calls_day"), 1);
    }
}
