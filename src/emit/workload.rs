use std::hash::Hash;

use anyhow::Result;

use super::aggregate::GroupedStats;
use super::dimension::{HttpDimension, ShardDimension, HTTP_DIMENSIONS, SHARD_DIMENSIONS};
use crate::output::MetricBatch;
use crate::store::request::RequestRecord;

pub const LATENCY: &str = "latency";
pub const SHARD_EVENTS: &str = "shard_events";
pub const SHARD_DOC_COUNT: &str = "shard_doc_count";

pub const HTTP_LATENCY: &str = "http_latency";
pub const HTTP_TOTAL_REQUESTS: &str = "http_total_requests";
pub const HTTP_REQUEST_DOCS: &str = "http_request_docs";

/// Latency (ms), completion count and document count of shard operations
/// completed in one request snapshot.
pub fn emit_shard_workload(requests: &[RequestRecord], batch: &mut MetricBatch) -> Result<usize> {
    emit_workload(
        requests,
        ShardDimension::of_request,
        ShardDimension::into_values,
        [LATENCY, SHARD_EVENTS, SHARD_DOC_COUNT],
        SHARD_DIMENSIONS,
        batch,
    )
}

/// Same as [`emit_shard_workload`] for HTTP requests, keyed by operation,
/// status and exception.
pub fn emit_http_workload(requests: &[RequestRecord], batch: &mut MetricBatch) -> Result<usize> {
    emit_workload(
        requests,
        HttpDimension::of_request,
        HttpDimension::into_values,
        [HTTP_LATENCY, HTTP_TOTAL_REQUESTS, HTTP_REQUEST_DOCS],
        HTTP_DIMENSIONS,
        batch,
    )
}

fn emit_workload<K: Hash + Eq + Ord + Clone>(
    requests: &[RequestRecord],
    key_of: impl Fn(&RequestRecord) -> K,
    values_of: impl Fn(K) -> Vec<Option<String>>,
    metrics: [&'static str; 3],
    dimensions: &'static [&'static str],
    batch: &mut MetricBatch,
) -> Result<usize> {
    let mut grouped: GroupedStats<K> = GroupedStats::new(metrics.len());

    for rec in requests {
        let Some(latency) = rec.latency() else {
            continue;
        };

        let key = key_of(rec);
        grouped.record(&key, 0, latency);
        grouped.record(&key, 1, 1.0);
        if let Some(docs) = rec.doc_count {
            grouped.record(&key, 2, docs);
        }
    }

    let mut emitted = 0;
    for (key, idx, stats) in grouped.drain_sorted() {
        batch.push(metrics[idx], dimensions, values_of(key), stats)?;
        emitted += 1;
    }

    Ok(emitted)
}
