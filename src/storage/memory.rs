use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};

use crate::model::Record;

use super::{ItemResults, StorageError, WriteOp, WriteRequest, TIME_BUCKET_COLUMN};

#[derive(Default)]
struct Inner {
    /// table -> id -> record
    tables: DashMap<String, HashMap<String, Record>>,
    failing_reads: DashSet<String>,
    failing_writes: DashSet<String>,
    unavailable_submits: AtomicU32,
    rejected_submits: AtomicU32,
    submit_calls: AtomicU64,
}

/// In-process storage for single-node runs and tests.
///
/// Clones share the same tables. Failures can be injected per id or per
/// submit call to exercise error paths.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn get(&self, table: &str, id: &str) -> Result<Option<Record>, StorageError> {
        if self.inner.failing_reads.contains(id) {
            return Err(StorageError::Unavailable(format!("injected read failure for {id}")));
        }
        Ok(self
            .inner
            .tables
            .get(table)
            .and_then(|rows| rows.get(id).cloned()))
    }

    pub(super) fn submit_batch(&self, ops: &[WriteOp]) -> Result<ItemResults, StorageError> {
        self.inner.submit_calls.fetch_add(1, Ordering::Relaxed);
        if take_one(&self.inner.unavailable_submits) {
            return Err(StorageError::Unavailable("injected outage".to_string()));
        }
        if take_one(&self.inner.rejected_submits) {
            return Err(StorageError::Rejected("injected rejection".to_string()));
        }

        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let WriteRequest::Record(record) = &op.request else {
                results.push(Err(StorageError::WrongRequest { engine: "memory" }));
                continue;
            };
            if self.inner.failing_writes.contains(&op.id) {
                results.push(Err(StorageError::Rejected(format!(
                    "injected write failure for {}",
                    op.id
                ))));
                continue;
            }
            self.inner
                .tables
                .entry(op.table.clone())
                .or_default()
                .insert(op.id.clone(), record.clone());
            results.push(Ok(()));
        }
        Ok(results)
    }

    pub(super) fn delete_by_time_range(
        &self,
        table: &str,
        column: &str,
        from: i64,
        to: i64,
    ) -> Result<(), StorageError> {
        if column != TIME_BUCKET_COLUMN {
            return Err(StorageError::Rejected(format!("unknown column {column}")));
        }
        if let Some(mut rows) = self.inner.tables.get_mut(table) {
            rows.retain(|_, r| r.time_bucket() < from || r.time_bucket() > to);
        }
        Ok(())
    }

    /// Stores a record directly, bypassing the write path.
    pub fn seed(&self, table: &str, record: Record) {
        self.inner
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(record.id().to_string(), record);
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Record> {
        self.inner
            .tables
            .get(table)
            .and_then(|rows| rows.get(id).cloned())
    }

    pub fn table_len(&self, table: &str) -> usize {
        self.inner.tables.get(table).map_or(0, |rows| rows.len())
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.tables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Makes every read of `id` fail until cleared.
    pub fn fail_reads_for(&self, id: &str) {
        self.inner.failing_reads.insert(id.to_string());
    }

    pub fn clear_read_failures(&self) {
        self.inner.failing_reads.clear();
    }

    /// Makes every write of `id` fail as a per-item error.
    pub fn fail_writes_for(&self, id: &str) {
        self.inner.failing_writes.insert(id.to_string());
    }

    /// Fails the next `n` submit calls with a transient error.
    pub fn fail_next_submits(&self, n: u32) {
        self.inner.unavailable_submits.store(n, Ordering::Relaxed);
    }

    /// Fails the next `n` submit calls with a permanent error.
    pub fn reject_next_submits(&self, n: u32) {
        self.inner.rejected_submits.store(n, Ordering::Relaxed);
    }

    pub fn submit_calls(&self) -> u64 {
        self.inner.submit_calls.load(Ordering::Relaxed)
    }
}

/// Decrements `counter` if positive; true when a unit was taken.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::worker::tests::{calls, calls_schema};

    fn minute_record(bucket: i64) -> Record {
        Record::new(calls_schema(), format!("{bucket}_svc"), bucket)
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let memory = MemoryStorage::new();
        let storage = Storage::Memory(memory.clone());
        let op = storage.prepare_insert("t", calls("A|2024010110", 3));

        let results = storage.submit_batch(&[op]).await.expect("submit");
        assert_eq!(results, vec![Ok(())]);

        let stored = storage
            .get("t", &calls_schema(), "A|2024010110")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.get("calls"), Some(&crate::model::Value::Long(3)));
        assert_eq!(memory.table_len("t"), 1);
        assert!(storage
            .get("t", &calls_schema(), "missing")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn test_per_item_failure_leaves_others() {
        let memory = MemoryStorage::new();
        memory.fail_writes_for("b");
        let storage = Storage::Memory(memory.clone());
        let ops = vec![
            storage.prepare_insert("t", calls("a", 1)),
            storage.prepare_insert("t", calls("b", 1)),
            storage.prepare_insert("t", calls("c", 1)),
        ];

        let results = storage.submit_batch(&ops).await.expect("submit");
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
        assert!(memory.row("t", "a").is_some());
        assert!(memory.row("t", "b").is_none());
        assert!(memory.row("t", "c").is_some());
    }

    #[tokio::test]
    async fn test_injected_submit_failures_are_consumed() {
        let memory = MemoryStorage::new();
        memory.fail_next_submits(1);
        let storage = Storage::Memory(memory.clone());
        let op = storage.prepare_insert("t", calls("a", 1));

        let err = storage.submit_batch(std::slice::from_ref(&op)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(storage.submit_batch(&[op]).await.is_ok());
        assert_eq!(memory.submit_calls(), 2);
    }

    #[tokio::test]
    async fn test_delete_by_time_range_inclusive() {
        let memory = MemoryStorage::new();
        for bucket in [202401011159, 202401011200, 202401011201] {
            memory.seed("t", minute_record(bucket));
        }
        let storage = Storage::Memory(memory.clone());

        storage
            .delete_by_time_range("t", TIME_BUCKET_COLUMN, 0, 202401011200)
            .await
            .expect("delete");
        assert_eq!(memory.table_len("t"), 1);
        assert!(memory.row("t", "202401011201_svc").is_some());
    }

    #[tokio::test]
    async fn test_read_failure_injection() {
        let memory = MemoryStorage::new();
        memory.fail_reads_for("a");
        let storage = Storage::Memory(memory.clone());
        assert!(storage.get("t", &calls_schema(), "a").await.is_err());
        memory.clear_read_failures();
        assert!(storage.get("t", &calls_schema(), "a").await.is_ok());
    }
}
