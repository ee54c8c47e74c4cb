use std::sync::Arc;

use bucketeer::analysis::{register_schemas, Dimension, SpanEvent, SpanKind, SpanTransformStage, SERVICE_METRIC};
use bucketeer::model::id::derive_id;
use bucketeer::model::registry::SchemaRegistry;
use bucketeer::model::time_bucket::Granularity;
use bucketeer::model::{AttributeDef, MergeOp, Record, Schema, ValueKind};
use bucketeer::remote::selector::Selector;
use bucketeer::remote::wire::{decode, encode, RemoteMessage};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn schema() -> Arc<Schema> {
    Arc::new(
        Schema::new(
            1,
            "endpoint_traffic",
            vec![
                AttributeDef::new("service", ValueKind::Str, MergeOp::Non),
                AttributeDef::new("calls", ValueKind::Long, MergeOp::Add),
                AttributeDef::new("duration_sum", ValueKind::Long, MergeOp::Add),
                AttributeDef::new("latest_latency", ValueKind::Double, MergeOp::Cover),
            ],
        )
        .expect("valid schema"),
    )
}

fn traffic(schema: &Arc<Schema>, calls: i64) -> Record {
    Record::new(Arc::clone(schema), "202401011234_checkout_POST:/orders", 202401011234)
        .with("service", "checkout")
        .and_then(|r| r.with("calls", calls))
        .and_then(|r| r.with("duration_sum", calls * 40))
        .and_then(|r| r.with("latest_latency", 12.5))
        .expect("valid record")
}

fn bench_merge(c: &mut Criterion) {
    let schema = schema();
    let incoming = traffic(&schema, 3);

    c.bench_function("record/merge_from", |b| {
        let mut existing = traffic(&schema, 1);
        b.iter(|| {
            existing
                .merge_from(black_box(incoming.clone()))
                .expect("merge");
        })
    });
}

fn bench_ids(c: &mut Criterion) {
    c.bench_function("id/derive_two_parts", |b| {
        b.iter(|| derive_id(black_box(202401011234), black_box(&["checkout", "POST:/orders"])))
    });

    let nodes: Vec<String> = (0..8).map(|i| format!("10.0.0.{i}:11800")).collect();
    c.bench_function("selector/hash_code_8_nodes", |b| {
        b.iter(|| {
            Selector::HashCode
                .select(black_box("202401011234_checkout_POST:/orders"), &nodes)
                .cloned()
        })
    });
}

fn bench_wire(c: &mut Criterion) {
    let schema = schema();
    let message = RemoteMessage::from_record("endpoint_traffic_persistence", &traffic(&schema, 3));

    for algorithm in ["none", "zstd", "snappy"] {
        let payload = encode(&message, algorithm).expect("encode");
        c.bench_function(&format!("wire/encode_{algorithm}"), |b| {
            b.iter(|| encode(black_box(&message), algorithm).expect("encode"))
        });
        c.bench_function(&format!("wire/decode_{algorithm}"), |b| {
            b.iter(|| decode(black_box(&payload), algorithm).expect("decode"))
        });
    }
}

fn bench_transform(c: &mut Criterion) {
    let mut registry = SchemaRegistry::new();
    register_schemas(&mut registry).expect("schemas");
    let schema = Arc::clone(registry.by_name(SERVICE_METRIC).expect("schema"));
    let stage = SpanTransformStage::new(schema, Dimension::Service, &Granularity::ALL);
    let span = SpanEvent {
        service: "checkout".into(),
        instance: "checkout-1".into(),
        endpoint: "POST:/orders".into(),
        parent_service: Some("gateway".into()),
        kind: SpanKind::Entry,
        start_time: 1_704_112_496_000,
        end_time: 1_704_112_496_120,
        is_error: false,
    };

    c.bench_function("analysis/service_span_all_granularities", |b| {
        b.iter(|| stage.transform(black_box(&span)).expect("transform").len())
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_merge(c);
    bench_ids(c);
    bench_wire(c);
    bench_transform(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
