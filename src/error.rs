use thiserror::Error;

/// Failures raised inside the ingestion pipeline.
///
/// Every variant is handled where it occurs (logged and counted); none of them
/// stops a worker loop or a sibling graph branch.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("queue for role {role} is full (capacity {capacity})")]
    QueueSaturated { role: String, capacity: usize },

    #[error("cannot merge {id}: buffered schema {existing} differs from incoming {incoming}")]
    MergeSchemaMismatch {
        id: String,
        existing: String,
        incoming: String,
    },

    #[error("dispatch of role {role} to {target} failed: {reason}")]
    RemoteDispatchFailure {
        role: String,
        target: String,
        reason: String,
    },

    #[error("loading {id} from {table} failed: {reason}")]
    StorageReadFailure {
        id: String,
        table: String,
        reason: String,
    },

    #[error("writing {id} (bucket {time_bucket}) to {table} failed: {reason}")]
    StorageWriteFailure {
        id: String,
        table: String,
        time_bucket: i64,
        reason: String,
    },

    #[error("id part {part:?} contains the reserved separator")]
    InvalidIdPart { part: String },

    #[error("schema {schema}: attribute {name}: {reason}")]
    InvalidAttribute {
        schema: String,
        name: String,
        reason: &'static str,
    },

    #[error("unknown schema id {schema_id}")]
    UnknownSchema { schema_id: u32 },

    #[error("no receiver registered for role {role}")]
    UnknownRole { role: String },

    #[error("wire codec: {reason}")]
    Codec { reason: String },
}

impl PipelineError {
    /// Short label used for metric dimensions.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueSaturated { .. } => "queue_saturated",
            Self::MergeSchemaMismatch { .. } => "merge_schema_mismatch",
            Self::RemoteDispatchFailure { .. } => "remote_dispatch_failure",
            Self::StorageReadFailure { .. } => "storage_read_failure",
            Self::StorageWriteFailure { .. } => "storage_write_failure",
            Self::InvalidIdPart { .. } => "invalid_id_part",
            Self::InvalidAttribute { .. } => "invalid_attribute",
            Self::UnknownSchema { .. } => "unknown_schema",
            Self::UnknownRole { .. } => "unknown_role",
            Self::Codec { .. } => "codec",
        }
    }
}
