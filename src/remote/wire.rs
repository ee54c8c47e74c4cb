//! Peer-to-peer message format.
//!
//! A frame is a 4-byte big-endian payload length followed by the payload: a
//! bincode-encoded [`RemoteMessage`], compressed with the cluster-wide
//! algorithm.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::compression::{compress, decompress};
use crate::error::PipelineError;
use crate::model::registry::SchemaRegistry;
use crate::model::{Record, SchemaId, Value};

/// Largest payload a peer accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A record addressed to a role on another node. Schemas travel by numeric
/// id so both ends only need the same registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub role: String,
    pub schema_id: u32,
    pub id: String,
    pub time_bucket: i64,
    pub values: Vec<Value>,
}

impl RemoteMessage {
    pub fn from_record(role: &str, record: &Record) -> Self {
        Self {
            role: role.to_string(),
            schema_id: record.schema().id().0,
            id: record.id().to_string(),
            time_bucket: record.time_bucket(),
            values: record.values().to_vec(),
        }
    }

    /// Rebuilds the record against the local schema registry.
    pub fn into_record(self, schemas: &SchemaRegistry) -> Result<Record, PipelineError> {
        let schema = schemas
            .get(SchemaId(self.schema_id))
            .ok_or(PipelineError::UnknownSchema {
                schema_id: self.schema_id,
            })?;
        Record::from_values(std::sync::Arc::clone(schema), self.id, self.time_bucket, self.values)
    }
}

pub fn encode(message: &RemoteMessage, compression: &str) -> Result<Vec<u8>, PipelineError> {
    let raw = bincode::serialize(message).map_err(|e| PipelineError::Codec {
        reason: e.to_string(),
    })?;
    compress(&raw, compression).map_err(|e| PipelineError::Codec {
        reason: format!("{e:#}"),
    })
}

pub fn decode(payload: &[u8], compression: &str) -> Result<RemoteMessage, PipelineError> {
    let raw = decompress(payload, compression).map_err(|e| PipelineError::Codec {
        reason: format!("{e:#}"),
    })?;
    bincode::deserialize(&raw).map_err(|e| PipelineError::Codec {
        reason: e.to_string(),
    })
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&n| n as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large")
        })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await
}

/// Reads one frame. `Ok(None)` is a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
