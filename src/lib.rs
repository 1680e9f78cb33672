//! Reader-side ingestion and window alignment for search-node metrics.
//!
//! A separate writer process drops per-thread and per-request metric files
//! into time buckets on disk. The [`reader`] pipeline parses them into
//! in-memory snapshots, aligns those to fixed reader windows, correlates
//! OS thread samples with the requests they served and commits one
//! aggregated output bucket per window.

pub mod align;
pub mod clock;
pub mod config;
pub mod emit;
pub mod export;
pub mod output;
pub mod parser;
pub mod protocol;
pub mod reader;
pub mod store;
pub mod topology;
