use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::PipelineError;
use crate::health::HealthMetrics;
use crate::model::Record;
use crate::storage::batch::BatchGateway;
use crate::storage::{Storage, StorageError, WriteOp, TIME_BUCKET_COLUMN};

use super::aggregation::QueueStage;
use super::{FlushHandler, QueuedWorker, WorkerHandle};

/// Reconciles flushed aggregates with stored state and writes them.
struct PersistFlush {
    role: String,
    need_merge: bool,
    gateway: Arc<BatchGateway>,
    /// Aggregates whose stored state could not be read, retried next tick.
    carried: HashMap<String, Record>,
    health: Option<Arc<HealthMetrics>>,
}

impl PersistFlush {
    /// Folds new arrivals into records carried from a failed read. The
    /// carried record is the older observation.
    fn take_with_carried(&mut self, batch: Vec<Record>) -> HashMap<String, Record> {
        let mut records = std::mem::take(&mut self.carried);
        for record in batch {
            match records.get_mut(record.id()) {
                Some(existing) => {
                    if let Err(e) = existing.merge_from(record) {
                        warn!(role = %self.role, error = %e, "dropping aggregate that cannot merge");
                    }
                }
                None => {
                    records.insert(record.id().to_string(), record);
                }
            }
        }
        records
    }

    async fn prepare(&mut self, id: String, table: String, record: Record) -> Option<WriteOp> {
        if !self.need_merge {
            return Some(self.gateway.prepare_insert(&table, record));
        }

        let storage = Arc::clone(self.gateway.storage());
        match storage.get(&table, record.schema(), &id).await {
            Ok(Some(mut stored)) => match stored.merge_from(record) {
                Ok(()) => Some(self.gateway.prepare_update(&table, stored)),
                Err(e) => {
                    warn!(role = %self.role, table = %table, error = %e, "stored record does not match aggregate");
                    None
                }
            },
            Ok(None) => Some(self.gateway.prepare_insert(&table, record)),
            Err(e) => {
                self.report_read_failure(&id, &table, &e);
                self.carried.insert(id, record);
                None
            }
        }
    }

    fn report_read_failure(&self, id: &str, table: &str, reason: &StorageError) {
        let err = PipelineError::StorageReadFailure {
            id: id.to_string(),
            table: table.to_string(),
            reason: reason.to_string(),
        };
        warn!(role = %self.role, id, table, error = %err, "keeping aggregate for the next tick");
        if let Some(h) = &self.health {
            h.storage_read_failures.with_label_values(&[table]).inc();
        }
    }
}

impl FlushHandler<Record> for PersistFlush {
    async fn flush(&mut self, batch: Vec<Record>) {
        let records = self.take_with_carried(batch);
        let mut ops = Vec::with_capacity(records.len());

        for (id, record) in records {
            let Some(table) = record.table_name() else {
                warn!(role = %self.role, id = %id, time_bucket = record.time_bucket(), "dropping aggregate with malformed time bucket");
                continue;
            };
            if let Some(op) = self.prepare(id, table, record).await {
                ops.push(op);
            }
        }

        // Settles before the next tick reads these ids back.
        let submitted = ops.len();
        let report = self.gateway.submit_batch(ops).await;
        debug!(
            role = %self.role,
            submitted,
            written = report.written,
            failed = report.failed,
            queued = report.queued,
            carried = self.carried.len(),
            "persistence flush done"
        );
    }

    fn has_pending(&self) -> bool {
        !self.carried.is_empty()
    }
}

/// Terminal worker of a metric stream: merges aggregates per id and writes
/// them through the batch gateway on every tick.
pub struct PersistenceWorker {
    inner: QueuedWorker<Record>,
    gateway: Arc<BatchGateway>,
    health: Option<Arc<HealthMetrics>>,
}

impl PersistenceWorker {
    pub fn new(
        role: &str,
        cfg: WorkerConfig,
        gateway: Arc<BatchGateway>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            inner: QueuedWorker::new(role, cfg, health.clone()),
            gateway,
            health,
        }
    }

    pub fn role(&self) -> &str {
        self.inner.role()
    }

    pub fn handle(&self) -> WorkerHandle<Record> {
        self.inner.handle()
    }

    pub fn stage(&self) -> QueueStage {
        QueueStage::new(self.inner.handle())
    }

    pub async fn start(&mut self, ctx: CancellationToken) {
        let handler = PersistFlush {
            role: self.inner.role().to_string(),
            need_merge: self.inner.config().need_merge_db_data,
            gateway: Arc::clone(&self.gateway),
            carried: HashMap::new(),
            health: self.health.clone(),
        };
        self.inner.start(handler, ctx).await;
    }

    pub async fn wait_for_shutdown(&self) {
        self.inner.wait_for_shutdown().await;
    }
}

/// Removes every record of `table` whose time bucket is at or before
/// `before_bucket`.
pub async fn delete_history(
    storage: &Storage,
    table: &str,
    before_bucket: i64,
    health: Option<&HealthMetrics>,
) -> Result<(), StorageError> {
    storage
        .delete_by_time_range(table, TIME_BUCKET_COLUMN, 0, before_bucket)
        .await?;

    if let Some(h) = health {
        h.history_deletes.with_label_values(&[table]).inc();
    }
    info!(table, before_bucket, engine = storage.name(), "history deleted");

    Ok(())
}
