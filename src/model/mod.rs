pub mod id;
pub mod registry;
pub mod time_bucket;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

use self::time_bucket::Granularity;

/// How an attribute combines when two records with the same id meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeOp {
    /// Identity data. The value already buffered is kept.
    Non,
    /// Point-in-time state. The incoming value replaces the buffered one.
    Cover,
    /// Counters and sums. The incoming value is added.
    Add,
}

impl MergeOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Non => "non",
            Self::Cover => "cover",
            Self::Add => "add",
        }
    }
}

/// Semantic type of an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Str,
    Int,
    Long,
    Double,
    Bytes,
}

impl ValueKind {
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Long | Self::Double)
    }

    /// Zero value used when a record is created before any observation.
    pub fn zero(self) -> Value {
        match self {
            Self::Str => Value::Str(String::new()),
            Self::Int => Value::Int(0),
            Self::Long => Value::Long(0),
            Self::Double => Value::Double(0.0),
            Self::Bytes => Value::Bytes(Vec::new()),
        }
    }
}

/// One attribute value carried by a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    Int(i32),
    Long(i64),
    Double(f64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Str(_) => ValueKind::Str,
            Self::Int(_) => ValueKind::Int,
            Self::Long(_) => ValueKind::Long,
            Self::Double(_) => ValueKind::Double,
            Self::Bytes(_) => ValueKind::Bytes,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(i64::from(*v)),
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Adds `other` in place. Kinds are validated by the schema before this
    /// runs, so a mismatch leaves the value untouched.
    fn add_assign(&mut self, other: &Value) {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => *a = a.saturating_add(*b),
            (Self::Long(a), Self::Long(b)) => *a = a.saturating_add(*b),
            (Self::Double(a), Self::Double(b)) => *a += *b,
            _ => {}
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// Stable numeric identity of a schema on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaId(pub u32);

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name, type and merge policy of one attribute position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDef {
    pub name: String,
    pub kind: ValueKind,
    pub op: MergeOp,
}

impl AttributeDef {
    pub fn new(name: impl Into<String>, kind: ValueKind, op: MergeOp) -> Self {
        Self {
            name: name.into(),
            kind,
            op,
        }
    }
}

/// Ordered attribute layout shared by every record of one kind.
#[derive(Debug, PartialEq, Eq)]
pub struct Schema {
    id: SchemaId,
    name: String,
    attributes: Vec<AttributeDef>,
}

impl Schema {
    /// Builds a schema, rejecting duplicate attribute names and additive
    /// attributes on non-numeric kinds.
    pub fn new(
        id: u32,
        name: impl Into<String>,
        attributes: Vec<AttributeDef>,
    ) -> Result<Self, PipelineError> {
        let name = name.into();
        let mut seen = HashSet::with_capacity(attributes.len());
        for attr in &attributes {
            if !seen.insert(attr.name.as_str()) {
                return Err(PipelineError::InvalidAttribute {
                    schema: name,
                    name: attr.name.clone(),
                    reason: "duplicate attribute name",
                });
            }
            if attr.op == MergeOp::Add && !attr.kind.is_numeric() {
                return Err(PipelineError::InvalidAttribute {
                    schema: name,
                    name: attr.name.clone(),
                    reason: "add operation requires a numeric kind",
                });
            }
        }

        Ok(Self {
            id: SchemaId(id),
            name,
            attributes,
        })
    }

    pub fn id(&self) -> SchemaId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &[AttributeDef] {
        &self.attributes
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }

    /// Storage table holding this schema at one granularity.
    pub fn table_name(&self, granularity: Granularity) -> String {
        format!("{}_{}", self.name, granularity.as_str())
    }
}

/// Keyed, time-bucketed record flowing through the pipeline.
#[derive(Debug, Clone)]
pub struct Record {
    schema: Arc<Schema>,
    id: String,
    time_bucket: i64,
    values: Vec<Value>,
}

impl Record {
    /// Creates a record with every attribute at its zero value.
    pub fn new(schema: Arc<Schema>, id: impl Into<String>, time_bucket: i64) -> Self {
        let values = schema.attributes.iter().map(|a| a.kind.zero()).collect();
        Self {
            schema,
            id: id.into(),
            time_bucket,
            values,
        }
    }

    /// Creates a record from values in schema order.
    pub fn from_values(
        schema: Arc<Schema>,
        id: impl Into<String>,
        time_bucket: i64,
        values: Vec<Value>,
    ) -> Result<Self, PipelineError> {
        if values.len() != schema.attributes.len() {
            return Err(PipelineError::InvalidAttribute {
                schema: schema.name.clone(),
                name: String::new(),
                reason: "value count does not match schema",
            });
        }
        for (attr, value) in schema.attributes.iter().zip(&values) {
            if attr.kind != value.kind() {
                return Err(PipelineError::InvalidAttribute {
                    schema: schema.name.clone(),
                    name: attr.name.clone(),
                    reason: "value kind does not match schema",
                });
            }
        }

        Ok(Self {
            schema,
            id: id.into(),
            time_bucket,
            values,
        })
    }

    /// Sets one attribute by name.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), PipelineError> {
        let value = value.into();
        let Some(pos) = self.schema.position(name) else {
            return Err(PipelineError::InvalidAttribute {
                schema: self.schema.name.clone(),
                name: name.to_string(),
                reason: "unknown attribute",
            });
        };
        if self.schema.attributes[pos].kind != value.kind() {
            return Err(PipelineError::InvalidAttribute {
                schema: self.schema.name.clone(),
                name: name.to_string(),
                reason: "value kind does not match schema",
            });
        }
        self.values[pos] = value;
        Ok(())
    }

    /// Builder form of [`Record::set`].
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Result<Self, PipelineError> {
        self.set(name, value)?;
        Ok(self)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn time_bucket(&self) -> i64 {
        self.time_bucket
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.schema.position(name).map(|pos| &self.values[pos])
    }

    /// Granularity implied by the record's time bucket.
    pub fn granularity(&self) -> Option<Granularity> {
        Granularity::of(self.time_bucket)
    }

    /// Storage table for this record, or `None` when the bucket is malformed.
    pub fn table_name(&self) -> Option<String> {
        self.granularity().map(|g| self.schema.table_name(g))
    }

    /// Copy of this record re-keyed into a coarser bucket.
    pub fn down_sampled(&self, target: Granularity) -> Option<Record> {
        let bucket = time_bucket::down_sample(self.time_bucket, target)?;
        let id = id::rebucket(&self.id, bucket)?;
        Some(Self {
            schema: Arc::clone(&self.schema),
            id,
            time_bucket: bucket,
            values: self.values.clone(),
        })
    }

    /// Folds `incoming` into `self` using each attribute's merge policy.
    ///
    /// On error `self` is left untouched.
    pub fn merge_from(&mut self, incoming: Record) -> Result<(), PipelineError> {
        if self.schema.id != incoming.schema.id
            || self.id != incoming.id
            || self.values.len() != incoming.values.len()
        {
            return Err(PipelineError::MergeSchemaMismatch {
                id: incoming.id,
                existing: self.schema.name.clone(),
                incoming: incoming.schema.name.clone(),
            });
        }

        for ((attr, current), next) in self
            .schema
            .attributes
            .iter()
            .zip(self.values.iter_mut())
            .zip(incoming.values)
        {
            match attr.op {
                MergeOp::Non => {}
                MergeOp::Cover => *current = next,
                MergeOp::Add => current.add_assign(&next),
            }
        }

        Ok(())
    }
}

/// Merges `incoming` into `existing`; `existing` becomes the canonical value.
pub fn merge(existing: &mut Record, incoming: Record) -> Result<(), PipelineError> {
    existing.merge_from(incoming)
}
