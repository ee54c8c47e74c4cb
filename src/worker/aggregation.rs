use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::graph::{Next, Stage};
use crate::health::HealthMetrics;
use crate::model::Record;

use super::{FlushHandler, QueuedWorker, WorkerHandle};

/// Emits each flushed aggregate to the node's downstream stages.
struct EmitDownstream {
    next: Next<Record>,
}

impl FlushHandler<Record> for EmitDownstream {
    async fn flush(&mut self, batch: Vec<Record>) {
        for record in batch {
            self.next.execute(record);
        }
    }
}

/// Pre-aggregates records in memory before they are routed to their owner.
pub struct AggregationWorker {
    inner: QueuedWorker<Record>,
}

impl AggregationWorker {
    pub fn new(role: &str, cfg: WorkerConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            inner: QueuedWorker::new(role, cfg, health),
        }
    }

    pub fn role(&self) -> &str {
        self.inner.role()
    }

    pub fn handle(&self) -> WorkerHandle<Record> {
        self.inner.handle()
    }

    /// Graph stage feeding this worker's queue.
    pub fn stage(&self) -> QueueStage {
        QueueStage::new(self.inner.handle())
    }

    /// Starts the consumer; flushed aggregates go to `next`.
    pub async fn start(&mut self, next: Next<Record>, ctx: CancellationToken) {
        self.inner.start(EmitDownstream { next }, ctx).await;
    }

    pub async fn wait_for_shutdown(&self) {
        self.inner.wait_for_shutdown().await;
    }
}

/// Stage that enqueues into a worker. Output appears on the stage's node
/// when the worker flushes, not during `process`.
pub struct QueueStage {
    handle: WorkerHandle<Record>,
}

impl QueueStage {
    pub fn new(handle: WorkerHandle<Record>) -> Self {
        Self { handle }
    }
}

impl Stage for QueueStage {
    type Input = Record;
    type Output = Record;

    fn name(&self) -> &str {
        self.handle.role()
    }

    fn process(&self, input: Record, _next: &Next<Record>) -> Result<()> {
        self.handle.enqueue(input)?;
        Ok(())
    }
}
