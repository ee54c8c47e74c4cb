//! Span analysis: turns raw span events into keyed metric records for every
//! configured granularity.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::graph::{Next, Stage};
use crate::model::id::{derive_id, escape_part};
use crate::model::registry::SchemaRegistry;
use crate::model::time_bucket::{time_bucket, Granularity};
use crate::model::{AttributeDef, MergeOp, Record, Schema, ValueKind};

pub const SERVICE_METRIC: &str = "service_metric";
pub const ENDPOINT_METRIC: &str = "endpoint_metric";
pub const INSTANCE_HEARTBEAT: &str = "instance_heartbeat";
pub const SERVICE_RELATION_METRIC: &str = "service_relation_metric";

const SERVICE_METRIC_ID: u32 = 1;
const ENDPOINT_METRIC_ID: u32 = 2;
const INSTANCE_HEARTBEAT_ID: u32 = 3;
const SERVICE_RELATION_METRIC_ID: u32 = 4;

/// Caller recorded for entry spans that carry no parent service.
pub const USER_SERVICE: &str = "User";

/// Role of a span inside a trace segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    /// Server side of a call; the only kind counted as traffic.
    #[default]
    Entry,
    Exit,
    Local,
}

/// One finished span as reported by an agent.
///
/// Names may contain any character. Inside aggregation ids they are
/// escaped with [`escape_part`]; stored attributes keep them verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct SpanEvent {
    pub service: String,
    /// Reporting instance of `service`; no heartbeat when empty.
    #[serde(default)]
    pub instance: String,
    pub endpoint: String,
    /// Calling service of an entry span.
    #[serde(default)]
    pub parent_service: Option<String>,
    #[serde(default)]
    pub kind: SpanKind,
    /// Unix milliseconds.
    pub start_time: i64,
    /// Unix milliseconds.
    pub end_time: i64,
    #[serde(default)]
    pub is_error: bool,
}

impl SpanEvent {
    fn duration_ms(&self) -> Result<i64> {
        let Some(duration) = self.end_time.checked_sub(self.start_time) else {
            bail!(
                "span of {} has an unrepresentable duration ({} - {})",
                self.service,
                self.end_time,
                self.start_time
            );
        };
        if duration < 0 {
            bail!(
                "span of {} ends before it starts ({} < {})",
                self.service,
                self.end_time,
                self.start_time
            );
        }
        Ok(duration)
    }

    fn caller(&self) -> &str {
        self.parent_service.as_deref().unwrap_or(USER_SERVICE)
    }
}

fn traffic_attributes() -> [AttributeDef; 4] {
    [
        AttributeDef::new("calls", ValueKind::Long, MergeOp::Add),
        AttributeDef::new("error_calls", ValueKind::Long, MergeOp::Add),
        AttributeDef::new("duration_sum", ValueKind::Long, MergeOp::Add),
        AttributeDef::new("error_duration_sum", ValueKind::Long, MergeOp::Add),
    ]
}

/// Registers the metric schemas produced by span analysis.
pub fn register_schemas(registry: &mut SchemaRegistry) -> Result<()> {
    let mut service = vec![AttributeDef::new("service", ValueKind::Str, MergeOp::Non)];
    service.extend(traffic_attributes());
    registry
        .register(Schema::new(SERVICE_METRIC_ID, SERVICE_METRIC, service)?)
        .context("registering service metric")?;

    let mut endpoint = vec![
        AttributeDef::new("service", ValueKind::Str, MergeOp::Non),
        AttributeDef::new("endpoint", ValueKind::Str, MergeOp::Non),
    ];
    endpoint.extend(traffic_attributes());
    registry
        .register(Schema::new(ENDPOINT_METRIC_ID, ENDPOINT_METRIC, endpoint)?)
        .context("registering endpoint metric")?;

    let heartbeat = vec![
        AttributeDef::new("service", ValueKind::Str, MergeOp::Non),
        AttributeDef::new("instance", ValueKind::Str, MergeOp::Non),
        AttributeDef::new("heartbeat_time", ValueKind::Long, MergeOp::Cover),
    ];
    registry
        .register(Schema::new(INSTANCE_HEARTBEAT_ID, INSTANCE_HEARTBEAT, heartbeat)?)
        .context("registering instance heartbeat")?;

    let mut relation = vec![
        AttributeDef::new("source_service", ValueKind::Str, MergeOp::Non),
        AttributeDef::new("dest_service", ValueKind::Str, MergeOp::Non),
    ];
    relation.extend(traffic_attributes());
    registry
        .register(Schema::new(
            SERVICE_RELATION_METRIC_ID,
            SERVICE_RELATION_METRIC,
            relation,
        )?)
        .context("registering service relation metric")?;

    Ok(())
}

/// Which dimensions of a span key a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Service,
    Endpoint,
    /// Service and instance; latest heartbeat wins.
    Instance,
    /// Caller and callee service.
    Relation,
}

/// Metrics derived from spans and the dimensions keying each.
pub const METRICS: [(&str, Dimension); 4] = [
    (SERVICE_METRIC, Dimension::Service),
    (ENDPOINT_METRIC, Dimension::Endpoint),
    (INSTANCE_HEARTBEAT, Dimension::Instance),
    (SERVICE_RELATION_METRIC, Dimension::Relation),
];

/// Derives one metric record per granularity from each span.
///
/// The minute record is built first and coarser ones are down-sampled from
/// it, so every granularity carries the same values under its own bucket.
pub struct SpanTransformStage {
    name: String,
    schema: Arc<Schema>,
    dimension: Dimension,
    granularities: Vec<Granularity>,
}

impl SpanTransformStage {
    pub fn new(schema: Arc<Schema>, dimension: Dimension, granularities: &[Granularity]) -> Self {
        let mut granularities = granularities.to_vec();
        granularities.sort();
        granularities.dedup();
        Self {
            name: format!("{}_transform", schema.name()),
            schema,
            dimension,
            granularities,
        }
    }

    /// Builds the records for one span. Traffic metrics only count entry
    /// spans; heartbeats come from any span that names its instance.
    pub fn transform(&self, span: &SpanEvent) -> Result<Vec<Record>> {
        let record = match self.dimension {
            Dimension::Instance => self.heartbeat(span)?,
            _ => self.traffic(span)?,
        };
        let Some(record) = record else {
            return Ok(Vec::new());
        };

        let mut out = Vec::with_capacity(self.granularities.len());
        for &g in &self.granularities {
            if g == Granularity::Minute {
                out.push(record.clone());
            } else if let Some(coarse) = record.down_sampled(g) {
                out.push(coarse);
            }
        }
        Ok(out)
    }

    fn traffic(&self, span: &SpanEvent) -> Result<Option<Record>> {
        if span.kind != SpanKind::Entry {
            return Ok(None);
        }

        let duration = span.duration_ms()?;
        let minute = minute_bucket(span.start_time)?;
        let service = escape_part(&span.service);

        let id = match self.dimension {
            Dimension::Endpoint => derive_id(minute, &[&*service, &*escape_part(&span.endpoint)])?,
            Dimension::Relation => derive_id(minute, &[&*escape_part(span.caller()), &*service])?,
            _ => derive_id(minute, &[&*service])?,
        };

        let (errors, error_duration) = if span.is_error { (1i64, duration) } else { (0, 0) };
        let mut record = Record::new(Arc::clone(&self.schema), id, minute)
            .with("calls", 1i64)?
            .with("error_calls", errors)?
            .with("duration_sum", duration)?
            .with("error_duration_sum", error_duration)?;
        match self.dimension {
            Dimension::Relation => {
                record.set("source_service", span.caller())?;
                record.set("dest_service", span.service.as_str())?;
            }
            Dimension::Endpoint => {
                record.set("service", span.service.as_str())?;
                record.set("endpoint", span.endpoint.as_str())?;
            }
            _ => record.set("service", span.service.as_str())?,
        }
        Ok(Some(record))
    }

    fn heartbeat(&self, span: &SpanEvent) -> Result<Option<Record>> {
        if span.instance.is_empty() {
            return Ok(None);
        }

        let minute = minute_bucket(span.end_time)?;
        let id = derive_id(
            minute,
            &[&*escape_part(&span.service), &*escape_part(&span.instance)],
        )?;
        let record = Record::new(Arc::clone(&self.schema), id, minute)
            .with("service", span.service.as_str())?
            .with("instance", span.instance.as_str())?
            .with("heartbeat_time", span.end_time)?;
        Ok(Some(record))
    }
}

fn minute_bucket(millis: i64) -> Result<i64> {
    match time_bucket(millis, Granularity::Minute) {
        Some(minute) => Ok(minute),
        None => bail!("span time {millis} is out of range"),
    }
}

impl Stage for SpanTransformStage {
    type Input = SpanEvent;
    type Output = Record;

    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, input: SpanEvent, next: &Next<Record>) -> Result<()> {
        for record in self.transform(&input)? {
            next.execute(record);
        }
        Ok(())
    }
}
