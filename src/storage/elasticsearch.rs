use std::fmt::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use serde_json::{json, Map};
use tracing::{debug, info};

use crate::compression::{compress, content_encoding};
use crate::config::ElasticsearchConfig;
use crate::health::HealthMetrics;
use crate::model::{Record, Schema, Value, ValueKind};

use super::{ItemResults, StorageError, WriteKind, WriteOp, WriteRequest, TIME_BUCKET_COLUMN};

const ENGINE: &str = "elasticsearch";

/// Elasticsearch adapter over the REST API.
///
/// One index per table, named `{index_prefix}{table}`. Writes go through
/// `_bulk` as NDJSON.
pub struct ElasticsearchStorage {
    cfg: ElasticsearchConfig,
    client: reqwest::Client,
    health: Option<Arc<HealthMetrics>>,
}

impl ElasticsearchStorage {
    pub fn new(cfg: ElasticsearchConfig, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let mut client_builder = reqwest::Client::builder().timeout(cfg.timeout);

        if !cfg.keep_alive {
            client_builder = client_builder.pool_max_idle_per_host(0);
        }

        let client = client_builder
            .build()
            .context("building Elasticsearch client")?;

        Ok(Self {
            cfg,
            client,
            health,
        })
    }

    /// Checks the cluster answers.
    pub(super) async fn start(&self) -> Result<()> {
        let resp = self
            .request(reqwest::Method::GET, "/")
            .send()
            .await
            .context("connecting to Elasticsearch")?;

        let status = resp.status();
        let _ = resp.bytes().await;
        if !status.is_success() {
            bail!("Elasticsearch answered {status}");
        }

        if let Some(h) = &self.health {
            h.storage_connected.with_label_values(&[ENGINE]).set(1.0);
        }

        info!(address = %self.cfg.address, prefix = %self.cfg.index_prefix, "Elasticsearch storage connected");

        Ok(())
    }

    pub(super) async fn get(
        &self,
        table: &str,
        schema: &Arc<Schema>,
        id: &str,
    ) -> Result<Option<Record>, StorageError> {
        let path = format!("/{}/_doc/{}", self.index(table), encode_path(id));
        let resp = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            let _ = resp.bytes().await;
            return Ok(None);
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(status_error(status));
        }

        let doc: serde_json::Value =
            serde_json::from_slice(&body).map_err(|e| StorageError::Decode(e.to_string()))?;
        if doc.get("found").and_then(serde_json::Value::as_bool) == Some(false) {
            return Ok(None);
        }
        let source = doc
            .get("_source")
            .ok_or_else(|| StorageError::Decode(format!("document {id} has no _source")))?;

        decode_document(source, schema, id).map(Some)
    }

    /// Builds the bulk action and source lines for one record.
    pub(super) fn format_action(&self, kind: WriteKind, table: &str, record: &Record) -> String {
        let meta = json!({ "_index": self.index(table), "_id": record.id() });
        let doc = encode_document(record);

        let mut out = String::with_capacity(128 + record.values().len() * 24);
        match kind {
            WriteKind::Insert => {
                let _ = writeln!(out, "{}", json!({ "index": meta }));
                let _ = writeln!(out, "{doc}");
            }
            WriteKind::Update => {
                let _ = writeln!(out, "{}", json!({ "update": meta }));
                let _ = writeln!(out, "{}", json!({ "doc": doc, "doc_as_upsert": true }));
            }
        }
        out
    }

    pub(super) async fn submit_batch(&self, ops: &[WriteOp]) -> Result<ItemResults, StorageError> {
        let mut body = String::with_capacity(ops.iter().map(WriteOp::size_bytes).sum());
        let mut sent = Vec::with_capacity(ops.len());
        let mut results: ItemResults = vec![Ok(()); ops.len()];

        for (idx, op) in ops.iter().enumerate() {
            match &op.request {
                WriteRequest::Bulk(lines) => {
                    body.push_str(lines);
                    sent.push(idx);
                }
                _ => results[idx] = Err(StorageError::WrongRequest { engine: ENGINE }),
            }
        }
        if sent.is_empty() {
            return Ok(results);
        }

        let raw_len = body.len();
        let payload = compress(body.as_bytes(), &self.cfg.compression)
            .map_err(|e| StorageError::Rejected(format!("{e:#}")))?;

        let mut request = self
            .request(reqwest::Method::POST, "/_bulk")
            .header("Content-Type", "application/x-ndjson")
            .body(payload);
        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        let resp = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(status_error(status));
        }

        let item_results = parse_bulk_response(&bytes, sent.len())?;
        for (idx, result) in sent.into_iter().zip(item_results) {
            results[idx] = result;
        }

        debug!(items = ops.len(), bytes = raw_len, "bulk request applied");

        Ok(results)
    }

    pub(super) async fn delete_by_time_range(
        &self,
        table: &str,
        column: &str,
        from: i64,
        to: i64,
    ) -> Result<(), StorageError> {
        let path = format!("/{}/_delete_by_query?conflicts=proceed", self.index(table));
        let query = json!({ "query": { "range": { column: { "gte": from, "lte": to } } } });

        let resp = self
            .request(reqwest::Method::POST, &path)
            .header("Content-Type", "application/json")
            .body(query.to_string())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        let _ = resp.bytes().await;
        // No index yet means nothing to delete.
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(status_error(status))
        }
    }

    fn index(&self, table: &str) -> String {
        format!("{}{table}", self.cfg.index_prefix)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.cfg.address.trim_end_matches('/'));
        let mut request = self.client.request(method, url);

        if !self.cfg.username.is_empty() {
            request = request.basic_auth(&self.cfg.username, Some(&self.cfg.password));
        }
        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        request
    }

    fn transport_error(&self, e: reqwest::Error) -> StorageError {
        if e.is_connect() {
            if let Some(h) = &self.health {
                h.storage_connected.with_label_values(&[ENGINE]).set(0.0);
            }
        }
        StorageError::Unavailable(e.to_string())
    }
}

/// Overload and server faults are retryable; other statuses are refusals.
fn status_error(status: StatusCode) -> StorageError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StorageError::Unavailable(format!("status {status}"))
    } else {
        StorageError::Rejected(format!("status {status}"))
    }
}

/// Splits a bulk response into one result per submitted action.
fn parse_bulk_response(body: &[u8], expected: usize) -> Result<ItemResults, StorageError> {
    let parsed: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| StorageError::Decode(e.to_string()))?;
    let items = parsed
        .get("items")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| StorageError::Decode("bulk response has no items".to_string()))?;
    if items.len() != expected {
        return Err(StorageError::Decode(format!(
            "bulk response has {} items, expected {expected}",
            items.len()
        )));
    }

    Ok(items
        .iter()
        .map(|item| {
            let Some(result) = item.as_object().and_then(|o| o.values().next()) else {
                return Err(StorageError::Decode("empty bulk item".to_string()));
            };
            let status = result
                .get("status")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0);
            if (200..300).contains(&status) {
                return Ok(());
            }
            let reason = result
                .get("error")
                .and_then(|e| e.get("reason").or_else(|| e.get("type")))
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown error");
            if status == 429 || status >= 500 {
                Err(StorageError::Unavailable(format!("{status}: {reason}")))
            } else {
                Err(StorageError::Rejected(format!("{status}: {reason}")))
            }
        })
        .collect())
}

fn encode_document(record: &Record) -> serde_json::Value {
    let mut doc = Map::with_capacity(record.values().len() + 1);
    doc.insert(TIME_BUCKET_COLUMN.to_string(), json!(record.time_bucket()));
    for (attr, value) in record.schema().attributes().iter().zip(record.values()) {
        let encoded = match value {
            Value::Str(s) => json!(s),
            Value::Int(v) => json!(v),
            Value::Long(v) => json!(v),
            Value::Double(v) => json!(v),
            Value::Bytes(b) => json!(b),
        };
        doc.insert(attr.name.clone(), encoded);
    }
    serde_json::Value::Object(doc)
}

fn decode_document(
    source: &serde_json::Value,
    schema: &Arc<Schema>,
    id: &str,
) -> Result<Record, StorageError> {
    let missing = |name: &str| StorageError::Decode(format!("document {id} lacks {name}"));

    let time_bucket = source
        .get(TIME_BUCKET_COLUMN)
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| missing(TIME_BUCKET_COLUMN))?;

    let mut values = Vec::with_capacity(schema.attributes().len());
    for attr in schema.attributes() {
        let field = source.get(&attr.name).ok_or_else(|| missing(&attr.name))?;
        let value = match attr.kind {
            ValueKind::Str => field.as_str().map(|s| Value::Str(s.to_string())),
            ValueKind::Int => field
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Value::Int),
            ValueKind::Long => field.as_i64().map(Value::Long),
            ValueKind::Double => field.as_f64().map(Value::Double),
            ValueKind::Bytes => serde_json::from_value::<Vec<u8>>(field.clone())
                .ok()
                .map(Value::Bytes),
        };
        values.push(value.ok_or_else(|| missing(&attr.name))?);
    }

    Record::from_values(Arc::clone(schema), id, time_bucket, values)
        .map_err(|e| StorageError::Decode(e.to_string()))
}

/// Percent-encodes characters that cannot appear in a path segment.
fn encode_path(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for b in id.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::routing::{get, post};
    use axum::Router;

    use super::*;
    use crate::storage::Storage;
    use crate::worker::tests::{calls, calls_schema};

    fn cfg(address: &str) -> ElasticsearchConfig {
        ElasticsearchConfig {
            address: address.to_string(),
            index_prefix: "bk_".to_string(),
            timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_format_insert_and_update() {
        let es = ElasticsearchStorage::new(cfg("http://localhost:9200"), None).expect("client");
        let record = calls("2024010110_A", 4);

        let insert = es.format_action(WriteKind::Insert, "endpoint_calls_hour", &record);
        let lines: Vec<&str> = insert.lines().collect();
        assert_eq!(lines.len(), 2);
        let action: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(action["index"]["_index"], "bk_endpoint_calls_hour");
        assert_eq!(action["index"]["_id"], "2024010110_A");
        let doc: serde_json::Value = serde_json::from_str(lines[1]).expect("json");
        assert_eq!(doc["calls"], 4);
        assert_eq!(doc["endpoint"], "A");
        assert_eq!(doc["time_bucket"], 2024010110);

        let update = es.format_action(WriteKind::Update, "endpoint_calls_hour", &record);
        let lines: Vec<&str> = update.lines().collect();
        let body: serde_json::Value = serde_json::from_str(lines[1]).expect("json");
        assert!(lines[0].starts_with("{\"update\""));
        assert_eq!(body["doc_as_upsert"], true);
        assert_eq!(body["doc"]["calls"], 4);
    }

    #[test]
    fn test_document_round_trip_through_source() {
        let record = calls("2024010110_A", 9);
        let source = encode_document(&record);
        let decoded = decode_document(&source, &calls_schema(), "2024010110_A").expect("decode");
        assert_eq!(decoded.values(), record.values());
        assert_eq!(decoded.time_bucket(), 2024010110);
    }

    #[test]
    fn test_parse_bulk_response_with_failed_item() {
        let body = br#"{"took":3,"errors":true,"items":[
            {"index":{"_id":"a","status":201}},
            {"index":{"_id":"b","status":400,"error":{"type":"mapper_parsing_exception","reason":"failed to parse"}}},
            {"update":{"_id":"c","status":429,"error":{"type":"es_rejected_execution_exception"}}}
        ]}"#;
        let results = parse_bulk_response(body, 3).expect("parse");
        assert!(results[0].is_ok());
        assert_eq!(
            results[1],
            Err(StorageError::Rejected("400: failed to parse".to_string()))
        );
        assert!(results[2].as_ref().unwrap_err().is_transient());
    }

    #[test]
    fn test_parse_bulk_response_count_mismatch() {
        let body = br#"{"errors":false,"items":[{"index":{"status":201}}]}"#;
        assert!(matches!(
            parse_bulk_response(body, 2),
            Err(StorageError::Decode(_))
        ));
    }

    #[test]
    fn test_status_classification() {
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(!status_error(StatusCode::BAD_REQUEST).is_transient());
    }

    #[test]
    fn test_encode_path() {
        assert_eq!(encode_path("2024010110_A"), "2024010110_A");
        assert_eq!(encode_path("a/b c"), "a%2Fb%20c");
    }

    #[tokio::test]
    async fn test_bulk_submit_against_server() {
        let app = Router::new().route(
            "/_bulk",
            post(|body: String| async move {
                assert_eq!(body.lines().count(), 4);
                r#"{"errors":true,"items":[{"index":{"status":201}},{"index":{"status":409,"error":{"reason":"version conflict"}}}]}"#
            }),
        );
        let address = serve(app).await;
        let storage = Storage::Elasticsearch(ElasticsearchStorage::new(cfg(&address), None).expect("client"));

        let ops = vec![
            storage.prepare_insert("t", calls("a", 1)),
            storage.prepare_insert("t", calls("b", 1)),
        ];
        let results = storage.submit_batch(&ops).await.expect("submit");
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(StorageError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_get_missing_document_is_none() {
        let app = Router::new().route(
            "/bk_t/_doc/:id",
            get(|| async { (axum::http::StatusCode::NOT_FOUND, r#"{"found":false}"#) }),
        );
        let address = serve(app).await;
        let storage = Storage::Elasticsearch(ElasticsearchStorage::new(cfg(&address), None).expect("client"));

        let found = storage.get("t", &calls_schema(), "a").await.expect("get");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_overloaded_bulk_is_transient() {
        let app = Router::new().route(
            "/_bulk",
            post(|| async { (axum::http::StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let address = serve(app).await;
        let storage = Storage::Elasticsearch(ElasticsearchStorage::new(cfg(&address), None).expect("client"));

        let ops = vec![storage.prepare_insert("t", calls("a", 1))];
        let err = storage.submit_batch(&ops).await.unwrap_err();
        assert!(err.is_transient());
    }
}
