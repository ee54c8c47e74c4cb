use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BatchConfig, BatchMode};
use crate::error::PipelineError;
use crate::health::HealthMetrics;
use crate::model::Record;

use super::{Storage, WriteOp};

/// Outcome of one [`BatchGateway::submit_batch`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    /// Ops the engine confirmed.
    pub written: usize,
    /// Ops the engine refused or that could not be delivered.
    pub failed: usize,
    /// Ops that went through the buffered queue.
    pub queued: usize,
    /// Ops dropped because the buffered queue was full.
    pub dropped: usize,
}

/// A queued op and where to report its outcome.
struct Pending {
    op: WriteOp,
    ack: mpsc::UnboundedSender<bool>,
}

/// Applies prepared write ops to the storage engine.
///
/// In immediate mode every call is one bulk request. In buffered mode ops are
/// queued and a background accumulator flushes them by count, size or time,
/// with a bounded number of requests in flight and backoff on transient
/// errors. Either way `submit_batch` returns once its own ops are settled,
/// so a caller that reads back what it wrote sees its last write.
pub struct BatchGateway {
    storage: Arc<Storage>,
    cfg: Arc<BatchConfig>,
    health: Option<Arc<HealthMetrics>>,
    tx: Option<mpsc::Sender<Pending>>,
    run_task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl BatchGateway {
    pub fn new(storage: Arc<Storage>, cfg: BatchConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            storage,
            cfg: Arc::new(cfg),
            health,
            tx: None,
            run_task: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn mode(&self) -> BatchMode {
        self.cfg.mode
    }

    pub fn prepare_insert(&self, table: &str, record: Record) -> WriteOp {
        self.storage.prepare_insert(table, record)
    }

    pub fn prepare_update(&self, table: &str, record: Record) -> WriteOp {
        self.storage.prepare_update(table, record)
    }

    /// Spawns the accumulator when running in buffered mode.
    pub async fn start(&mut self, ctx: CancellationToken) {
        if self.cfg.mode != BatchMode::Buffered || self.tx.is_some() {
            return;
        }

        let (tx, rx) = mpsc::channel::<Pending>(self.cfg.queue_size);
        self.tx = Some(tx);

        let accumulator = Accumulator {
            storage: Arc::clone(&self.storage),
            cfg: Arc::clone(&self.cfg),
            health: self.health.clone(),
            semaphore: Arc::new(Semaphore::new(self.cfg.concurrent_requests)),
        };
        let handle = tokio::spawn(accumulator.run(rx, ctx));
        *self.run_task.lock().await = Some(handle);

        info!(
            engine = self.storage.name(),
            max_actions = self.cfg.max_actions,
            concurrent_requests = self.cfg.concurrent_requests,
            "buffered batch gateway started",
        );
    }

    /// Hands ops to the engine and waits for their outcome.
    ///
    /// Immediate mode sends one request. Buffered mode queues the ops and
    /// waits until the accumulator has applied them, which may share a
    /// request with other callers. Ops that do not fit in the queue are
    /// dropped and reported as write failures.
    pub async fn submit_batch(&self, ops: Vec<WriteOp>) -> BatchReport {
        if ops.is_empty() {
            return BatchReport::default();
        }

        let Some(tx) = &self.tx else {
            let outcomes = apply(&self.storage, &self.cfg, self.health.as_deref(), &ops, false).await;
            return BatchReport::from_outcomes(&outcomes);
        };

        let mut report = BatchReport::default();
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        for op in ops {
            let pending = Pending {
                op,
                ack: ack_tx.clone(),
            };
            match tx.try_send(pending) {
                Ok(()) => report.queued += 1,
                Err(e) => {
                    let reason = e.to_string();
                    report_failure(self.health.as_deref(), &e.into_inner().op, &reason);
                    report.dropped += 1;
                }
            }
        }
        drop(ack_tx);

        while let Some(written) = ack_rx.recv().await {
            if written {
                report.written += 1;
            } else {
                report.failed += 1;
            }
        }
        let unsettled = report.queued - report.written - report.failed;
        if unsettled > 0 {
            warn!(unsettled, "write ops discarded without an outcome");
            report.failed += unsettled;
        }
        report
    }

    /// Waits for the accumulator to drain after its token is cancelled.
    pub async fn wait_for_shutdown(&self) {
        if let Some(handle) = self.run_task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

struct Accumulator {
    storage: Arc<Storage>,
    cfg: Arc<BatchConfig>,
    health: Option<Arc<HealthMetrics>>,
    semaphore: Arc<Semaphore>,
}

impl BatchReport {
    fn from_outcomes(outcomes: &[bool]) -> Self {
        let written = outcomes.iter().filter(|w| **w).count();
        Self {
            written,
            failed: outcomes.len() - written,
            ..Self::default()
        }
    }
}

impl Accumulator {
    async fn run(self, mut rx: mpsc::Receiver<Pending>, ctx: CancellationToken) {
        let mut batch: Vec<Pending> = Vec::with_capacity(self.cfg.max_actions);
        let mut bytes = 0usize;
        let mut in_flight = JoinSet::new();
        let mut interval = tokio::time::interval(self.cfg.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    rx.close();
                    while let Ok(pending) = rx.try_recv() {
                        bytes += pending.op.size_bytes();
                        batch.push(pending);
                        if self.is_full(batch.len(), bytes) {
                            self.spawn_flush(&mut in_flight, &mut batch, &mut bytes);
                        }
                    }
                    self.spawn_flush(&mut in_flight, &mut batch, &mut bytes);
                    while let Some(joined) = in_flight.join_next().await {
                        if let Err(e) = joined {
                            debug!(error = %e, "batch flush task join failed");
                        }
                    }
                    return;
                }

                pending = rx.recv() => {
                    let Some(pending) = pending else {
                        self.spawn_flush(&mut in_flight, &mut batch, &mut bytes);
                        while in_flight.join_next().await.is_some() {}
                        return;
                    };
                    bytes += pending.op.size_bytes();
                    batch.push(pending);

                    while !self.is_full(batch.len(), bytes) {
                        match rx.try_recv() {
                            Ok(pending) => {
                                bytes += pending.op.size_bytes();
                                batch.push(pending);
                            }
                            Err(_) => break,
                        }
                    }

                    if self.is_full(batch.len(), bytes) {
                        self.spawn_flush(&mut in_flight, &mut batch, &mut bytes);
                    }
                }

                _ = interval.tick() => {
                    self.spawn_flush(&mut in_flight, &mut batch, &mut bytes);
                }

                joined = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Some(Err(e)) = joined {
                        debug!(error = %e, "batch flush task join failed");
                    }
                }
            }
        }
    }

    fn is_full(&self, actions: usize, bytes: usize) -> bool {
        actions >= self.cfg.max_actions || bytes >= self.cfg.max_bytes
    }

    fn spawn_flush(
        &self,
        in_flight: &mut JoinSet<()>,
        batch: &mut Vec<Pending>,
        bytes: &mut usize,
    ) {
        if batch.is_empty() {
            return;
        }
        let (ops, acks): (Vec<WriteOp>, Vec<_>) =
            std::mem::replace(batch, Vec::with_capacity(self.cfg.max_actions))
                .into_iter()
                .map(|p| (p.op, p.ack))
                .unzip();
        *bytes = 0;

        let storage = Arc::clone(&self.storage);
        let cfg = Arc::clone(&self.cfg);
        let health = self.health.clone();
        let semaphore = Arc::clone(&self.semaphore);

        in_flight.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                warn!("batch semaphore closed");
                return;
            };
            let outcomes = apply(&storage, &cfg, health.as_deref(), &ops, true).await;
            for (ack, written) in acks.into_iter().zip(outcomes) {
                // The submitter may have gone away; its outcome is already logged.
                let _ = ack.send(written);
            }
        });
    }
}

/// Exponential backoff for the given retry attempt, capped at `max_backoff`.
fn backoff(cfg: &BatchConfig, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(10);
    cfg.initial_backoff
        .saturating_mul(factor)
        .min(cfg.max_backoff)
}

/// Submits `ops` and returns whether each was written.
///
/// With `retry` set, a transient whole-request failure is retried up to
/// `max_retries` times. Item failures are never retried.
async fn apply(
    storage: &Storage,
    cfg: &BatchConfig,
    health: Option<&HealthMetrics>,
    ops: &[WriteOp],
    retry: bool,
) -> Vec<bool> {
    let engine = storage.name();
    let mut attempt = 0u32;

    loop {
        let started = Instant::now();
        let outcome = storage.submit_batch(ops).await;
        if let Some(h) = health {
            h.batch_duration
                .with_label_values(&[engine])
                .observe(started.elapsed().as_secs_f64());
        }

        match outcome {
            Ok(results) => {
                if let Some(h) = health {
                    h.batch_size.with_label_values(&[engine]).observe(ops.len() as f64);
                }
                let mut outcomes = vec![false; ops.len()];
                for ((op, result), written) in ops.iter().zip(results).zip(outcomes.iter_mut()) {
                    match result {
                        Ok(()) => *written = true,
                        Err(e) => report_failure(health, op, &e),
                    }
                }
                debug!(
                    engine,
                    written = outcomes.iter().filter(|w| **w).count(),
                    ops = ops.len(),
                    "batch applied"
                );
                return outcomes;
            }
            Err(e) if retry && e.is_transient() && attempt < cfg.max_retries => {
                let delay = backoff(cfg, attempt);
                attempt += 1;
                if let Some(h) = health {
                    h.batch_retries.with_label_values(&[engine]).inc();
                }
                warn!(
                    engine,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "batch request failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(engine, ops = ops.len(), error = %e, "batch request failed");
                for op in ops {
                    report_failure(health, op, &e);
                }
                return vec![false; ops.len()];
            }
        }
    }
}

fn report_failure(health: Option<&HealthMetrics>, op: &WriteOp, reason: &dyn std::fmt::Display) {
    let err = PipelineError::StorageWriteFailure {
        id: op.id.clone(),
        table: op.table.clone(),
        time_bucket: op.time_bucket,
        reason: reason.to_string(),
    };
    error!(
        id = %op.id,
        table = %op.table,
        time_bucket = op.time_bucket,
        error = %err,
        "write op failed"
    );
    if let Some(h) = health {
        h.storage_write_failures
            .with_label_values(&[op.table.as_str()])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::worker::tests::calls;

    fn buffered_cfg() -> BatchConfig {
        BatchConfig {
            mode: BatchMode::Buffered,
            max_actions: 100,
            flush_interval: Duration::from_secs(1),
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            ..BatchConfig::default()
        }
    }

    fn ops(storage: &Storage, ids: &[&str]) -> Vec<WriteOp> {
        ids.iter()
            .map(|id| storage.prepare_insert("t", calls(id, 1)))
            .collect()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let cfg = BatchConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            ..BatchConfig::default()
        };
        assert_eq!(backoff(&cfg, 0), Duration::from_millis(100));
        assert_eq!(backoff(&cfg, 1), Duration::from_millis(200));
        assert_eq!(backoff(&cfg, 3), Duration::from_millis(800));
        assert_eq!(backoff(&cfg, 4), Duration::from_millis(1000));
        assert_eq!(backoff(&cfg, 40), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_immediate_failed_item_leaves_others_applied() {
        let memory = MemoryStorage::new();
        memory.fail_writes_for("b");
        let storage = Arc::new(Storage::Memory(memory.clone()));
        let gateway = BatchGateway::new(Arc::clone(&storage), BatchConfig::default(), None);

        let report = gateway.submit_batch(ops(&storage, &["a", "b", "c"])).await;
        assert_eq!(
            report,
            BatchReport {
                written: 2,
                failed: 1,
                ..Default::default()
            }
        );
        assert!(memory.row("t", "a").is_some());
        assert!(memory.row("t", "c").is_some());
        assert!(memory.row("t", "b").is_none());
    }

    #[tokio::test]
    async fn test_immediate_mode_does_not_retry() {
        let memory = MemoryStorage::new();
        memory.fail_next_submits(1);
        let storage = Arc::new(Storage::Memory(memory.clone()));
        let gateway = BatchGateway::new(Arc::clone(&storage), BatchConfig::default(), None);

        let report = gateway.submit_batch(ops(&storage, &["a"])).await;
        assert_eq!(report.failed, 1);
        assert_eq!(memory.submit_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_retries_transient_failure() {
        let memory = MemoryStorage::new();
        memory.fail_next_submits(2);
        let storage = Arc::new(Storage::Memory(memory.clone()));
        let mut gateway = BatchGateway::new(Arc::clone(&storage), buffered_cfg(), None);
        let ctx = CancellationToken::new();
        gateway.start(ctx.clone()).await;

        // One tick to flush, then 100ms + 200ms of backoff.
        let report = gateway.submit_batch(ops(&storage, &["a", "b"])).await;
        assert_eq!(report.queued, 2);
        assert_eq!(report.written, 2);
        assert_eq!(memory.submit_calls(), 3);
        assert_eq!(memory.table_len("t"), 2);

        ctx.cancel();
        gateway.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_permanent_failure_not_retried() {
        let memory = MemoryStorage::new();
        memory.reject_next_submits(1);
        let storage = Arc::new(Storage::Memory(memory.clone()));
        let mut gateway = BatchGateway::new(Arc::clone(&storage), buffered_cfg(), None);
        let ctx = CancellationToken::new();
        gateway.start(ctx.clone()).await;

        let report = gateway.submit_batch(ops(&storage, &["a"])).await;
        assert_eq!(report.failed, 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(memory.submit_calls(), 1);
        assert_eq!(memory.table_len("t"), 0);

        ctx.cancel();
        gateway.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_gives_up_after_max_retries() {
        let memory = MemoryStorage::new();
        memory.fail_next_submits(10);
        let storage = Arc::new(Storage::Memory(memory.clone()));
        let mut gateway = BatchGateway::new(Arc::clone(&storage), buffered_cfg(), None);
        let ctx = CancellationToken::new();
        gateway.start(ctx.clone()).await;

        gateway.submit_batch(ops(&storage, &["a"])).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(memory.submit_calls(), 4);
        assert_eq!(memory.table_len("t"), 0);

        ctx.cancel();
        gateway.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_flushes_on_action_count() {
        let memory = MemoryStorage::new();
        let storage = Arc::new(Storage::Memory(memory.clone()));
        let cfg = BatchConfig {
            max_actions: 2,
            flush_interval: Duration::from_secs(3600),
            ..buffered_cfg()
        };
        let mut gateway = BatchGateway::new(Arc::clone(&storage), cfg, None);
        let ctx = CancellationToken::new();
        gateway.start(ctx.clone()).await;

        gateway.submit_batch(ops(&storage, &["a", "b"])).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(memory.table_len("t"), 2);

        ctx.cancel();
        gateway.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_queue() {
        let memory = MemoryStorage::new();
        let storage = Arc::new(Storage::Memory(memory.clone()));
        let cfg = BatchConfig {
            flush_interval: Duration::from_secs(3600),
            ..buffered_cfg()
        };
        let mut gateway = BatchGateway::new(Arc::clone(&storage), cfg, None);
        let ctx = CancellationToken::new();
        gateway.start(ctx.clone()).await;
        let gateway = Arc::new(gateway);

        let submit = tokio::spawn({
            let gateway = Arc::clone(&gateway);
            let ops = ops(&storage, &["a", "b", "c"]);
            async move { gateway.submit_batch(ops).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(memory.table_len("t"), 0);

        ctx.cancel();
        gateway.wait_for_shutdown().await;
        assert_eq!(memory.table_len("t"), 3);
        let report = submit.await.expect("submit task");
        assert_eq!(report.written, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_waits_for_buffered_write() {
        let memory = MemoryStorage::new();
        let storage = Arc::new(Storage::Memory(memory.clone()));
        let cfg = BatchConfig {
            flush_interval: Duration::from_secs(5),
            concurrent_requests: 2,
            ..buffered_cfg()
        };
        let mut gateway = BatchGateway::new(Arc::clone(&storage), cfg, None);
        let ctx = CancellationToken::new();
        gateway.start(ctx.clone()).await;

        let started = tokio::time::Instant::now();
        let report = gateway.submit_batch(ops(&storage, &["a"])).await;
        assert_eq!(report.written, 1);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(memory.row("t", "a").is_some());

        ctx.cancel();
        gateway.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_queue_full_drops() {
        let memory = MemoryStorage::new();
        let storage = Arc::new(Storage::Memory(memory.clone()));
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let cfg = BatchConfig {
            queue_size: 1,
            ..buffered_cfg()
        };
        let mut gateway = BatchGateway::new(Arc::clone(&storage), cfg, Some(Arc::clone(&health)));
        let ctx = CancellationToken::new();
        gateway.start(ctx.clone()).await;

        let report = gateway.submit_batch(ops(&storage, &["a", "b", "c"])).await;
        assert_eq!(
            report,
            BatchReport {
                written: 1,
                queued: 1,
                dropped: 2,
                ..Default::default()
            }
        );
        assert!(memory.row("t", "a").is_some());
        assert_eq!(
            health.storage_write_failures.with_label_values(&["t"]).get(),
            2.0
        );

        ctx.cancel();
        gateway.wait_for_shutdown().await;
    }
}
