use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bucketeer::analysis::{register_schemas, INSTANCE_HEARTBEAT};
use bucketeer::collector::Collector;
use bucketeer::config::{BatchConfig, Config, WorkerConfig};
use bucketeer::graph::{FnStage, GraphManager};
use bucketeer::model::registry::SchemaRegistry;
use bucketeer::model::{AttributeDef, MergeOp, Record, Schema, Value, ValueKind};
use bucketeer::storage::batch::BatchGateway;
use bucketeer::storage::memory::MemoryStorage;
use bucketeer::storage::Storage;
use bucketeer::worker::aggregation::AggregationWorker;
use bucketeer::worker::persistence::{delete_history, PersistenceWorker};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

const HOUR_TABLE: &str = "endpoint_calls_hour";

fn schema() -> Arc<Schema> {
    Arc::new(
        Schema::new(
            7,
            "endpoint_calls",
            vec![
                AttributeDef::new("endpoint", ValueKind::Str, MergeOp::Non),
                AttributeDef::new("calls", ValueKind::Long, MergeOp::Add),
            ],
        )
        .expect("valid schema"),
    )
}

fn calls(schema: &Arc<Schema>, id: &str, n: i64) -> Record {
    Record::new(Arc::clone(schema), id, 2024010110)
        .with("endpoint", "A")
        .and_then(|r| r.with("calls", n))
        .expect("valid record")
}

fn worker_cfg(flush_interval: Duration, need_merge: bool) -> WorkerConfig {
    WorkerConfig {
        queue_capacity: 4096,
        flush_interval,
        need_merge_db_data: need_merge,
    }
}

/// Aggregation worker whose flushed output is collected.
async fn collecting_worker(
    flush_interval: Duration,
    ctx: CancellationToken,
) -> (AggregationWorker, Arc<Mutex<Vec<Record>>>) {
    let manager = GraphManager::new(None);
    let graph = manager.create_if_absent::<Record>(1);
    let mut worker = AggregationWorker::new("calls_aggregation", worker_cfg(flush_interval, false), None);
    let node = graph.add_node(worker.stage());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    node.add_next(FnStage::new("collect", move |r: Record| {
        sink.lock().push(r);
        Ok(Vec::<()>::new())
    }));

    worker.start(node.next(), ctx).await;
    (worker, seen)
}

async fn persistence(
    memory: &MemoryStorage,
    flush_interval: Duration,
    need_merge: bool,
    ctx: CancellationToken,
) -> PersistenceWorker {
    let storage = Arc::new(Storage::Memory(memory.clone()));
    let gateway = Arc::new(BatchGateway::new(storage, BatchConfig::default(), None));
    let mut worker = PersistenceWorker::new(
        "calls_persistence",
        worker_cfg(flush_interval, need_merge),
        gateway,
        None,
    );
    worker.start(ctx).await;
    worker
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enqueues_flush_as_one_sum() {
    let ctx = CancellationToken::new();
    let (worker, seen) = collecting_worker(Duration::from_secs(3600), ctx.clone()).await;
    let schema = schema();

    let mut producers = Vec::new();
    for _ in 0..8 {
        let handle = worker.handle();
        let schema = Arc::clone(&schema);
        producers.push(tokio::spawn(async move {
            for _ in 0..100 {
                handle
                    .enqueue(calls(&schema, "2024010110_A", 1))
                    .expect("enqueue");
            }
        }));
    }
    for p in producers {
        p.await.expect("producer");
    }

    ctx.cancel();
    worker.wait_for_shutdown().await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get("calls"), Some(&Value::Long(800)));
}

#[tokio::test(start_paused = true)]
async fn three_arrivals_one_tick_one_emission() {
    let ctx = CancellationToken::new();
    let (worker, seen) = collecting_worker(Duration::from_secs(1), ctx.clone()).await;
    let schema = schema();

    for _ in 0..3 {
        worker
            .handle()
            .enqueue(calls(&schema, "2024010110_A", 1))
            .expect("enqueue");
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;
    tokio::task::yield_now().await;

    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id(), "2024010110_A");
        assert_eq!(seen[0].get("calls"), Some(&Value::Long(3)));
    }

    ctx.cancel();
    worker.wait_for_shutdown().await;
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn failing_branch_does_not_starve_siblings() {
    let manager = GraphManager::new(None);
    let graph = manager.create_if_absent::<i64>(3);
    let entry = graph.add_node(FnStage::new("identity", |v: i64| Ok(vec![v])));

    let first = Arc::new(Mutex::new(Vec::new()));
    let third = Arc::new(Mutex::new(Vec::new()));
    let (f, t) = (Arc::clone(&first), Arc::clone(&third));
    entry.add_next(FnStage::new("first", move |v: i64| {
        f.lock().push(v);
        Ok(Vec::<()>::new())
    }));
    entry.add_next(FnStage::new("second", |_: i64| -> anyhow::Result<Vec<()>> {
        Err(anyhow!("broken stage"))
    }));
    entry.add_next(FnStage::new("third", move |v: i64| {
        t.lock().push(v);
        Ok(Vec::<()>::new())
    }));

    for v in 1..=10 {
        graph.start(v);
    }

    let expected: Vec<i64> = (1..=10).collect();
    assert_eq!(*first.lock(), expected);
    assert_eq!(*third.lock(), expected);
}

#[tokio::test]
async fn merge_with_stored_value_only_when_enabled() {
    let schema = schema();
    for (need_merge, expected) in [(true, 8), (false, 3)] {
        let memory = MemoryStorage::new();
        memory.seed(HOUR_TABLE, calls(&schema, "2024010110_A", 5));

        let ctx = CancellationToken::new();
        let worker = persistence(&memory, Duration::from_secs(3600), need_merge, ctx.clone()).await;
        worker
            .handle()
            .enqueue(calls(&schema, "2024010110_A", 3))
            .expect("enqueue");

        ctx.cancel();
        worker.wait_for_shutdown().await;

        let row = memory.row(HOUR_TABLE, "2024010110_A").expect("row");
        assert_eq!(row.get("calls"), Some(&Value::Long(expected)), "need_merge={need_merge}");
    }
}

#[tokio::test(start_paused = true)]
async fn read_failure_defers_write_to_next_tick() {
    let schema = schema();
    let memory = MemoryStorage::new();
    memory.seed(HOUR_TABLE, calls(&schema, "2024010110_A", 5));
    memory.fail_reads_for("2024010110_A");

    let ctx = CancellationToken::new();
    let worker = persistence(&memory, Duration::from_secs(1), true, ctx.clone()).await;

    worker
        .handle()
        .enqueue(calls(&schema, "2024010110_A", 3))
        .expect("enqueue");
    tokio::time::sleep(Duration::from_millis(1500)).await;
    tokio::task::yield_now().await;

    assert_eq!(memory.submit_calls(), 0);
    assert_eq!(
        memory.row(HOUR_TABLE, "2024010110_A").and_then(|r| r.get("calls").cloned()),
        Some(Value::Long(5))
    );

    memory.clear_read_failures();
    worker
        .handle()
        .enqueue(calls(&schema, "2024010110_A", 2))
        .expect("enqueue");
    tokio::time::sleep(Duration::from_secs(1)).await;
    tokio::task::yield_now().await;

    assert_eq!(
        memory.row(HOUR_TABLE, "2024010110_A").and_then(|r| r.get("calls").cloned()),
        Some(Value::Long(10))
    );

    ctx.cancel();
    worker.wait_for_shutdown().await;
}

#[tokio::test]
async fn history_delete_removes_buckets_up_to_threshold() {
    let schema = schema();
    let memory = MemoryStorage::new();
    for hour in 0..24i64 {
        for minute in 0..60i64 {
            let bucket = 202401010000 + hour * 100 + minute;
            memory.seed(
                "endpoint_calls_minute",
                Record::new(Arc::clone(&schema), format!("{bucket}_A"), bucket),
            );
        }
    }
    let storage = Storage::Memory(memory.clone());

    delete_history(&storage, "endpoint_calls_minute", 202401011200, None)
        .await
        .expect("delete");

    // 12:01 through 23:59 survive.
    assert_eq!(memory.table_len("endpoint_calls_minute"), 719);
    assert!(memory.row("endpoint_calls_minute", "202401011200_A").is_none());
    assert!(memory.row("endpoint_calls_minute", "202401011201_A").is_some());
    assert!(memory.row("endpoint_calls_minute", "202401010000_A").is_none());
}

fn local_config() -> Config {
    let mut cfg = Config::default();
    cfg.health.addr = "127.0.0.1:0".into();
    cfg.remote.listen_addr = "127.0.0.1:0".into();
    cfg.receiver.addr = "127.0.0.1:0".into();
    cfg
}

#[tokio::test]
async fn spans_flow_from_receiver_to_storage() {
    let memory = MemoryStorage::new();
    let mut registry = SchemaRegistry::new();
    register_schemas(&mut registry).expect("schemas");
    let heartbeat = registry.by_name(INSTANCE_HEARTBEAT).expect("heartbeat schema");
    memory.seed(
        "instance_heartbeat_minute",
        Record::new(Arc::clone(heartbeat), "202401011234_checkout_checkout-1", 202401011234)
            .with("service", "checkout")
            .and_then(|r| r.with("instance", "checkout-1"))
            .and_then(|r| r.with("heartbeat_time", 1_704_112_440_000i64))
            .expect("stored heartbeat"),
    );

    let mut collector = Collector::new(local_config())
        .expect("collector")
        .with_storage(Storage::Memory(memory.clone()));
    collector.start().await.expect("start");
    let addr = collector.receiver_addr().expect("receiver enabled");

    // 2024-01-01 12:34:56 UTC
    let body = r#"[
        {"service":"checkout","instance":"checkout-1","parent_service":"gateway","endpoint":"/pay","start_time":1704112496000,"end_time":1704112496040},
        {"service":"checkout","instance":"checkout-1","endpoint":"/pay","start_time":1704112496100,"end_time":1704112496160,"is_error":true},
        {"service":"checkout","instance":"checkout-1","parent_service":"gateway","endpoint":"/cart","start_time":1704112497000,"end_time":1704112497010},
        {"service":"checkout","instance":"checkout-1","endpoint":"/pay","kind":"exit","start_time":1704112497000,"end_time":1704112497500}
    ]"#;
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/spans"))
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

    collector.stop().await.expect("stop");

    let service = memory
        .row("service_metric_minute", "202401011234_checkout")
        .expect("service minute row");
    assert_eq!(service.get("calls"), Some(&Value::Long(3)));
    assert_eq!(service.get("error_calls"), Some(&Value::Long(1)));
    assert_eq!(service.get("duration_sum"), Some(&Value::Long(110)));
    assert_eq!(service.get("error_duration_sum"), Some(&Value::Long(60)));

    let month = memory
        .row("service_metric_month", "202401_checkout")
        .expect("service month row");
    assert_eq!(month.get("calls"), Some(&Value::Long(3)));

    let pay = memory
        .row("endpoint_metric_hour", "2024010112_checkout_/pay")
        .expect("endpoint hour row");
    assert_eq!(pay.get("calls"), Some(&Value::Long(2)));
    assert_eq!(pay.get("endpoint"), Some(&Value::Str("/pay".into())));

    // The newest heartbeat replaces the stored one instead of adding to it.
    let beat = memory
        .row("instance_heartbeat_minute", "202401011234_checkout_checkout-1")
        .expect("heartbeat minute row");
    assert_eq!(beat.get("heartbeat_time"), Some(&Value::Long(1_704_112_497_500)));
    assert_eq!(beat.get("instance"), Some(&Value::Str("checkout-1".into())));
    let day_beat = memory
        .row("instance_heartbeat_day", "20240101_checkout_checkout-1")
        .expect("heartbeat day row");
    assert_eq!(day_beat.get("heartbeat_time"), Some(&Value::Long(1_704_112_497_500)));

    let from_gateway = memory
        .row("service_relation_metric_minute", "202401011234_gateway_checkout")
        .expect("relation row");
    assert_eq!(from_gateway.get("calls"), Some(&Value::Long(2)));
    assert_eq!(from_gateway.get("duration_sum"), Some(&Value::Long(50)));
    let from_user = memory
        .row("service_relation_metric_minute", "202401011234_User_checkout")
        .expect("user relation row");
    assert_eq!(from_user.get("error_calls"), Some(&Value::Long(1)));
}
