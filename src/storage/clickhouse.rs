use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::errors::Error as DriverError;
use clickhouse_rs::types::{Block, Complex};
use clickhouse_rs::Pool;
use tracing::{debug, info};

use crate::config::ClickHouseConfig;
use crate::health::HealthMetrics;
use crate::model::time_bucket::Granularity;
use crate::model::{Record, Schema, Value, ValueKind};

use super::{ItemResults, StorageError, WriteOp, WriteRequest, TIME_BUCKET_COLUMN};

const ENGINE: &str = "clickhouse";

/// ClickHouse adapter over the native TCP protocol.
///
/// Each table is a `ReplacingMergeTree` keyed by id, so an update is an
/// insert with a newer `update_time` and reads use `FINAL`.
pub struct ClickHouseStorage {
    cfg: ClickHouseConfig,
    pool: Pool,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseStorage {
    /// Creates the adapter. No connection is opened until [`start`](Self::start).
    pub fn new(cfg: ClickHouseConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        let pool = Pool::new(build_dsn(&cfg));
        Self { cfg, pool, health }
    }

    /// Pings the server and creates one table per schema and granularity.
    pub(super) async fn start(
        &self,
        schemas: &[Arc<Schema>],
        granularities: &[Granularity],
    ) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("opening ClickHouse connection")?;

        handle.ping().await.context("pinging ClickHouse")?;

        for schema in schemas {
            for &g in granularities {
                let table = schema.table_name(g);
                let ddl = create_table_sql(&self.cfg.database, &table, schema);
                handle
                    .execute(ddl.as_str())
                    .await
                    .with_context(|| format!("creating table {table}"))?;
                debug!(table = %table, "ClickHouse table ready");
            }
        }

        if let Some(h) = &self.health {
            h.storage_connected.with_label_values(&[ENGINE]).set(1.0);
        }

        info!(endpoint = %self.cfg.endpoint, database = %self.cfg.database, "ClickHouse storage connected");

        Ok(())
    }

    pub(super) async fn get(
        &self,
        table: &str,
        schema: &Arc<Schema>,
        id: &str,
    ) -> Result<Option<Record>, StorageError> {
        let mut handle = self.handle().await?;

        let sql = select_sql(&self.cfg.database, table, schema, id);
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .map_err(classify)?;

        if block.row_count() == 0 {
            return Ok(None);
        }

        decode_first_row(&block, schema, id).map(Some)
    }

    /// Sends one multi-row INSERT per table.
    ///
    /// A failed INSERT fails only the ops of its own table.
    pub(super) async fn submit_batch(&self, ops: &[WriteOp]) -> Result<ItemResults, StorageError> {
        let mut by_table: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (idx, op) in ops.iter().enumerate() {
            by_table.entry(op.table.as_str()).or_default().push(idx);
        }

        let mut results: ItemResults = vec![Ok(()); ops.len()];
        let mut handle = self.handle().await?;

        for (table, indices) in by_table {
            let mut sql = String::with_capacity(64 + indices.len() * 128);
            let _ = write!(sql, "INSERT INTO {}.{table} VALUES ", self.cfg.database);

            let mut rows = 0usize;
            for &idx in &indices {
                let WriteRequest::Row(row) = &ops[idx].request else {
                    results[idx] = Err(StorageError::WrongRequest { engine: ENGINE });
                    continue;
                };
                if rows > 0 {
                    sql.push_str(", ");
                }
                sql.push_str(row);
                rows += 1;
            }
            if rows == 0 {
                continue;
            }

            if let Err(e) = handle.execute(sql.as_str()).await {
                let err = classify(e);
                for &idx in &indices {
                    if results[idx].is_ok() {
                        results[idx] = Err(err.clone());
                    }
                }
            }
        }

        Ok(results)
    }

    pub(super) async fn delete_by_time_range(
        &self,
        table: &str,
        column: &str,
        from: i64,
        to: i64,
    ) -> Result<(), StorageError> {
        let mut handle = self.handle().await?;
        let sql = format!(
            "ALTER TABLE {}.{table} DELETE WHERE {column} >= {from} AND {column} <= {to}",
            self.cfg.database
        );
        handle.execute(sql.as_str()).await.map_err(classify)
    }

    async fn handle(&self) -> Result<clickhouse_rs::ClientHandle, StorageError> {
        self.pool.get_handle().await.map_err(|e| {
            if let Some(h) = &self.health {
                h.storage_connected.with_label_values(&[ENGINE]).set(0.0);
            }
            StorageError::Unavailable(e.to_string())
        })
    }
}

/// Server-side errors mean the statement was refused; everything else is a
/// transport problem.
fn classify(e: DriverError) -> StorageError {
    match e {
        DriverError::Server(_) => StorageError::Rejected(e.to_string()),
        DriverError::FromSql(_) => StorageError::Decode(e.to_string()),
        other => StorageError::Unavailable(other.to_string()),
    }
}

fn decode_first_row(
    block: &Block<Complex>,
    schema: &Arc<Schema>,
    id: &str,
) -> Result<Record, StorageError> {
    let Some(row) = block.rows().next() else {
        return Err(StorageError::Decode(format!("no row for {id}")));
    };
    let decode = |e: DriverError| StorageError::Decode(e.to_string());

    let time_bucket: i64 = row.get(TIME_BUCKET_COLUMN).map_err(decode)?;
    let mut values = Vec::with_capacity(schema.attributes().len());
    for attr in schema.attributes() {
        let name = attr.name.as_str();
        let value = match attr.kind {
            ValueKind::Str => Value::Str(row.get::<String, _>(name).map_err(decode)?),
            ValueKind::Int => Value::Int(row.get::<i32, _>(name).map_err(decode)?),
            ValueKind::Long => Value::Long(row.get::<i64, _>(name).map_err(decode)?),
            ValueKind::Double => Value::Double(row.get::<f64, _>(name).map_err(decode)?),
            ValueKind::Bytes => {
                let hex: String = row.get(name).map_err(decode)?;
                Value::Bytes(decode_hex(&hex).ok_or_else(|| {
                    StorageError::Decode(format!("column {name} is not hex"))
                })?)
            }
        };
        values.push(value);
    }

    Record::from_values(Arc::clone(schema), id, time_bucket, values)
        .map_err(|e| StorageError::Decode(e.to_string()))
}

/// Builds a clickhouse-rs compatible TCP DSN from configuration.
///
/// Format: `tcp://[user[:pass]@]host:port/database?options`
fn build_dsn(cfg: &ClickHouseConfig) -> String {
    let mut dsn = "tcp://".to_string();

    if !cfg.username.is_empty() {
        dsn.push_str(&cfg.username);
        if !cfg.password.is_empty() {
            dsn.push(':');
            dsn.push_str(&cfg.password);
        }
        dsn.push('@');
    }

    dsn.push_str(&cfg.endpoint);
    dsn.push('/');
    dsn.push_str(&cfg.database);
    dsn.push_str("?compression=lz4&pool_min=2&pool_max=5");

    dsn
}

// --- SQL formatting helpers ---

fn column_type(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Str | ValueKind::Bytes => "String",
        ValueKind::Int => "Int32",
        ValueKind::Long => "Int64",
        ValueKind::Double => "Float64",
    }
}

fn create_table_sql(database: &str, table: &str, schema: &Schema) -> String {
    let mut sql = String::with_capacity(160 + schema.attributes().len() * 32);
    let _ = write!(
        sql,
        "CREATE TABLE IF NOT EXISTS {database}.{table} (id String, {TIME_BUCKET_COLUMN} Int64"
    );
    for attr in schema.attributes() {
        let _ = write!(sql, ", `{}` {}", attr.name, column_type(attr.kind));
    }
    sql.push_str(
        ", update_time DateTime64(3)) ENGINE = ReplacingMergeTree(update_time) ORDER BY id",
    );
    sql
}

fn select_sql(database: &str, table: &str, schema: &Schema, id: &str) -> String {
    let mut sql = format!("SELECT {TIME_BUCKET_COLUMN}");
    for attr in schema.attributes() {
        let _ = write!(sql, ", `{}`", attr.name);
    }
    let _ = write!(
        sql,
        " FROM {database}.{table} FINAL WHERE id = '{}' LIMIT 1",
        escape_sql(id)
    );
    sql
}

/// Formats a record as one `VALUES` tuple in table column order.
pub fn format_row(record: &Record) -> String {
    let mut row = String::with_capacity(64 + record.values().len() * 16);
    let _ = write!(
        row,
        "('{}', {}",
        escape_sql(record.id()),
        record.time_bucket()
    );
    for value in record.values() {
        match value {
            Value::Str(s) => {
                let _ = write!(row, ", '{}'", escape_sql(s));
            }
            Value::Int(v) => {
                let _ = write!(row, ", {v}");
            }
            Value::Long(v) => {
                let _ = write!(row, ", {v}");
            }
            Value::Double(v) => {
                let _ = write!(row, ", {v:?}");
            }
            Value::Bytes(b) => {
                let _ = write!(row, ", '{}'", encode_hex(b));
            }
        }
    }
    let _ = write!(row, ", {})", format_datetime(SystemTime::now()));
    row
}

/// Formats a SystemTime as a ClickHouse DateTime64(3) literal.
fn format_datetime(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
