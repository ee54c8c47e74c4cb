//! Streaming ingestion and time-bucketed aggregation backbone.
//!
//! Spans come in over HTTP, are analysed into keyed metric records, merged
//! in memory, routed to the node owning each id and persisted in batches.

pub mod analysis;
pub mod collector;
pub mod compression;
pub mod config;
pub mod error;
pub mod graph;
pub mod health;
pub mod model;
pub mod receiver;
pub mod remote;
pub mod retention;
pub mod storage;
pub mod worker;
