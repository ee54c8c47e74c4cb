//! Aggregation id composition.
//!
//! Ids have the shape `timeBucket_part1_part2...`. The separator is reserved:
//! `derive_id` rejects parts that contain it. Callers holding free-form names
//! pass them through [`escape_part`] first.

use std::borrow::Cow;
use std::fmt::Write;

use crate::error::PipelineError;

/// Separator between the time bucket and each id part.
pub const ID_SEPARATOR: char = '_';

/// Percent-encodes `%` and the separator so `part` can sit inside an id.
/// Parts without either are returned as is.
pub fn escape_part(part: &str) -> Cow<'_, str> {
    if !part.contains([ID_SEPARATOR, '%']) {
        return Cow::Borrowed(part);
    }
    let mut escaped = String::with_capacity(part.len() + 8);
    for c in part.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ID_SEPARATOR => escaped.push_str("%5F"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

/// Composes an aggregation id from a time bucket and ordered parts.
pub fn derive_id(time_bucket: i64, parts: &[&str]) -> Result<String, PipelineError> {
    let mut id = String::with_capacity(16 + parts.iter().map(|p| p.len() + 1).sum::<usize>());
    let _ = write!(id, "{time_bucket}");
    for part in parts {
        if part.contains(ID_SEPARATOR) {
            return Err(PipelineError::InvalidIdPart {
                part: (*part).to_string(),
            });
        }
        id.push(ID_SEPARATOR);
        id.push_str(part);
    }
    Ok(id)
}

/// Splits an id into its time bucket and the entity remainder.
pub fn split_id(id: &str) -> Option<(i64, &str)> {
    let (bucket, rest) = id.split_once(ID_SEPARATOR)?;
    Some((bucket.parse().ok()?, rest))
}

/// Replaces the time bucket prefix of `id`.
pub fn rebucket(id: &str, time_bucket: i64) -> Option<String> {
    let (_, rest) = split_id(id)?;
    Some(format!("{time_bucket}{ID_SEPARATOR}{rest}"))
}
