pub mod batch;
pub mod clickhouse;
pub mod elasticsearch;
pub mod memory;

use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;

use crate::model::time_bucket::Granularity;
use crate::model::{Record, Schema};

use self::clickhouse::ClickHouseStorage;
use self::elasticsearch::ElasticsearchStorage;
use self::memory::MemoryStorage;

/// Column every table carries with the record's time bucket.
pub const TIME_BUCKET_COLUMN: &str = "time_bucket";

/// Failures reported by a storage engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The engine could not be reached or was overloaded. Worth retrying.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The engine refused the request. Retrying will not help.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The engine answered with something we could not interpret.
    #[error("unreadable response: {0}")]
    Decode(String),

    /// A write op prepared for a different engine reached this one.
    #[error("write prepared for another engine, {engine} cannot apply it")]
    WrongRequest { engine: &'static str },
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Whether an op creates a row or replaces a merged one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
}

impl WriteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
        }
    }
}

/// Engine-specific body of a write op.
#[derive(Debug, Clone)]
pub enum WriteRequest {
    /// In-process engines store the record itself.
    Record(Record),
    /// One SQL `VALUES` tuple.
    Row(String),
    /// Action and source lines of a bulk request, newline terminated.
    Bulk(String),
}

/// One prepared write, translated but not yet applied.
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub kind: WriteKind,
    pub table: String,
    pub id: String,
    pub time_bucket: i64,
    pub request: WriteRequest,
}

impl WriteOp {
    /// Approximate payload size used for byte-bounded batching.
    pub fn size_bytes(&self) -> usize {
        let body = match &self.request {
            WriteRequest::Record(r) => r
                .values()
                .iter()
                .map(|v| match v {
                    crate::model::Value::Str(s) => s.len(),
                    crate::model::Value::Bytes(b) => b.len(),
                    _ => 8,
                })
                .sum(),
            WriteRequest::Row(s) | WriteRequest::Bulk(s) => s.len(),
        };
        body + self.id.len() + self.table.len()
    }
}

/// Outcome of each op in a submitted batch, in submission order.
pub type ItemResults = Vec<Result<(), StorageError>>;

/// Storage engine adapter.
///
/// Uses enum dispatch rather than trait objects so the async methods need no
/// boxing.
pub enum Storage {
    Memory(MemoryStorage),
    ClickHouse(ClickHouseStorage),
    Elasticsearch(ElasticsearchStorage),
}

impl Storage {
    /// Returns the engine name for logging and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::ClickHouse(_) => "clickhouse",
            Self::Elasticsearch(_) => "elasticsearch",
        }
    }

    /// Verifies connectivity and creates a table per schema and granularity.
    pub async fn start(&self, schemas: &[Arc<Schema>], granularities: &[Granularity]) -> Result<()> {
        match self {
            Self::Memory(_) => Ok(()),
            Self::ClickHouse(s) => s.start(schemas, granularities).await,
            Self::Elasticsearch(s) => s.start().await,
        }
    }

    /// Loads a stored record by id. `Ok(None)` means absent.
    pub async fn get(
        &self,
        table: &str,
        schema: &Arc<Schema>,
        id: &str,
    ) -> Result<Option<Record>, StorageError> {
        match self {
            Self::Memory(s) => s.get(table, id),
            Self::ClickHouse(s) => s.get(table, schema, id).await,
            Self::Elasticsearch(s) => s.get(table, schema, id).await,
        }
    }

    /// Translates a new record into a write op. No I/O.
    pub fn prepare_insert(&self, table: &str, record: Record) -> WriteOp {
        self.prepare(WriteKind::Insert, table, record)
    }

    /// Translates a merged record into a write op replacing the stored one.
    pub fn prepare_update(&self, table: &str, record: Record) -> WriteOp {
        self.prepare(WriteKind::Update, table, record)
    }

    fn prepare(&self, kind: WriteKind, table: &str, record: Record) -> WriteOp {
        let id = record.id().to_string();
        let time_bucket = record.time_bucket();
        let request = match self {
            Self::Memory(_) => WriteRequest::Record(record),
            Self::ClickHouse(_) => WriteRequest::Row(clickhouse::format_row(&record)),
            Self::Elasticsearch(s) => WriteRequest::Bulk(s.format_action(kind, table, &record)),
        };
        WriteOp {
            kind,
            table: table.to_string(),
            id,
            time_bucket,
            request,
        }
    }

    /// Applies ops in one round-trip.
    ///
    /// `Err` means the whole request failed; `Ok` carries one result per op.
    pub async fn submit_batch(&self, ops: &[WriteOp]) -> Result<ItemResults, StorageError> {
        match self {
            Self::Memory(s) => s.submit_batch(ops),
            Self::ClickHouse(s) => s.submit_batch(ops).await,
            Self::Elasticsearch(s) => s.submit_batch(ops).await,
        }
    }

    /// Removes rows of `table` whose `column` lies in `[from, to]`.
    pub async fn delete_by_time_range(
        &self,
        table: &str,
        column: &str,
        from: i64,
        to: i64,
    ) -> Result<(), StorageError> {
        match self {
            Self::Memory(s) => s.delete_by_time_range(table, column, from, to),
            Self::ClickHouse(s) => s.delete_by_time_range(table, column, from, to).await,
            Self::Elasticsearch(s) => s.delete_by_time_range(table, column, from, to).await,
        }
    }

    /// Releases connections.
    pub async fn stop(&self) -> Result<()> {
        Ok(())
    }
}
