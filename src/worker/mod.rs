pub mod aggregation;
pub mod persistence;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::PipelineError;
use crate::health::HealthMetrics;
use crate::model::Record;

/// Messages drained per wakeup before the loop re-checks its tick.
const DRAIN_BATCH: usize = 256;

/// A value that can be folded into another value sharing its key.
pub trait Mergeable: Send + 'static {
    fn key(&self) -> &str;

    /// Folds `other` into `self`. On error `self` must be unchanged.
    fn merge_from(&mut self, other: Self) -> Result<(), PipelineError>;
}

impl Mergeable for Record {
    fn key(&self) -> &str {
        self.id()
    }

    fn merge_from(&mut self, other: Self) -> Result<(), PipelineError> {
        Record::merge_from(self, other)
    }
}

/// Receives the merged contents of a flush buffer.
pub trait FlushHandler<T>: Send + 'static {
    fn flush(&mut self, batch: Vec<T>) -> impl Future<Output = ()> + Send;

    /// True when the handler carries work over from an earlier flush, so a
    /// tick must reach it even with an empty buffer.
    fn has_pending(&self) -> bool {
        false
    }
}

/// Producer side of a worker queue. Cheap to clone.
pub struct WorkerHandle<T> {
    role: Arc<str>,
    capacity: usize,
    tx: mpsc::Sender<T>,
    health: Option<Arc<HealthMetrics>>,
}

impl<T> Clone for WorkerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            role: Arc::clone(&self.role),
            capacity: self.capacity,
            tx: self.tx.clone(),
            health: self.health.clone(),
        }
    }
}

impl<T: Mergeable> WorkerHandle<T> {
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Appends to the queue without waiting.
    pub fn enqueue(&self, item: T) -> Result<(), PipelineError> {
        match self.tx.try_send(item) {
            Ok(()) => {
                if let Some(health) = &self.health {
                    health.records_enqueued.with_label_values(&[&*self.role]).inc();
                }
                Ok(())
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                if let Some(health) = &self.health {
                    health.queue_saturated.with_label_values(&[&*self.role]).inc();
                }
                Err(PipelineError::QueueSaturated {
                    role: self.role.to_string(),
                    capacity: self.capacity,
                })
            }
        }
    }
}

/// Single-consumer bounded-queue actor that merges same-key messages between
/// flush ticks.
pub struct QueuedWorker<T> {
    role: Arc<str>,
    cfg: WorkerConfig,
    tx: mpsc::Sender<T>,
    /// Queue receiver, taken by `start`.
    rx: Option<mpsc::Receiver<T>>,
    health: Option<Arc<HealthMetrics>>,
    /// Handle for the worker run task.
    run_task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl<T: Mergeable> QueuedWorker<T> {
    pub fn new(role: &str, cfg: WorkerConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        if let Some(health) = &health {
            health
                .worker_queue_capacity
                .with_label_values(&[role])
                .set(cfg.queue_capacity as f64);
        }

        Self {
            role: Arc::from(role),
            cfg,
            tx,
            rx: Some(rx),
            health,
            run_task: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.cfg
    }

    pub fn handle(&self) -> WorkerHandle<T> {
        WorkerHandle {
            role: Arc::clone(&self.role),
            capacity: self.cfg.queue_capacity,
            tx: self.tx.clone(),
            health: self.health.clone(),
        }
    }

    /// Spawns the consumer loop. Cancelling `ctx` drains the queue, flushes
    /// the buffer and ends the task.
    pub async fn start<H>(&mut self, mut handler: H, ctx: CancellationToken)
    where
        H: FlushHandler<T>,
    {
        let mut rx = self.rx.take().expect("start called more than once");
        let role = Arc::clone(&self.role);
        let health = self.health.clone();
        let interval = self.cfg.flush_interval;

        let run_task = tokio::spawn(async move {
            let mut buffer: HashMap<String, T> = HashMap::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Consume the immediate first tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        while let Ok(item) = rx.try_recv() {
                            absorb(&mut buffer, item, &role, health.as_deref());
                        }
                        let flushed = on_flush_tick(&mut buffer, &mut handler, &role, health.as_deref()).await;
                        info!(role = %role, records = flushed, "worker final flush");
                        return;
                    }

                    item = rx.recv() => {
                        let Some(item) = item else {
                            on_flush_tick(&mut buffer, &mut handler, &role, health.as_deref()).await;
                            return;
                        };
                        absorb(&mut buffer, item, &role, health.as_deref());

                        // Drain more items without blocking.
                        for _ in 0..DRAIN_BATCH - 1 {
                            match rx.try_recv() {
                                Ok(item) => absorb(&mut buffer, item, &role, health.as_deref()),
                                Err(_) => break,
                            }
                        }
                    }

                    _ = ticker.tick() => {
                        on_flush_tick(&mut buffer, &mut handler, &role, health.as_deref()).await;
                    }
                }
            }
        });
        *self.run_task.lock().await = Some(run_task);

        info!(
            role = %self.role,
            queue_capacity = self.cfg.queue_capacity,
            flush_interval = ?self.cfg.flush_interval,
            "worker started"
        );
    }

    /// Waits for the worker run task to finish.
    pub async fn wait_for_shutdown(&self) {
        let run_task = { self.run_task.lock().await.take() };
        if let Some(run_task) = run_task {
            if let Err(e) = run_task.await {
                warn!(role = %self.role, error = %e, "worker task join failed");
            }
        }
    }
}

/// Inserts `item` or merges it into the buffered value with the same key.
fn absorb<T: Mergeable>(
    buffer: &mut HashMap<String, T>,
    item: T,
    role: &str,
    health: Option<&HealthMetrics>,
) {
    if let Some(existing) = buffer.get_mut(item.key()) {
        if let Err(e) = existing.merge_from(item) {
            warn!(role, error = %e, "dropping message that cannot merge");
            if let Some(health) = health {
                health.merge_mismatches.with_label_values(&[role]).inc();
            }
        }
        return;
    }
    buffer.insert(item.key().to_owned(), item);
}

/// Swaps the buffer for an empty one and hands the old contents downstream.
async fn on_flush_tick<T, H>(
    buffer: &mut HashMap<String, T>,
    handler: &mut H,
    role: &str,
    health: Option<&HealthMetrics>,
) -> usize
where
    T: Mergeable,
    H: FlushHandler<T>,
{
    if buffer.is_empty() && !handler.has_pending() {
        return 0;
    }

    let started = Instant::now();
    let batch: Vec<T> = std::mem::take(buffer).into_values().collect();
    let count = batch.len();
    handler.flush(batch).await;

    if let Some(health) = health {
        health.worker_flushes.with_label_values(&[role]).inc();
        health
            .worker_flushed_records
            .with_label_values(&[role])
            .inc_by(count as f64);
        health
            .worker_flush_duration
            .with_label_values(&[role])
            .observe(started.elapsed().as_secs_f64());
    }
    debug!(role, records = count, "buffer flushed");

    count
}
