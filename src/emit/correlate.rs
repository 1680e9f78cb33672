use std::collections::HashMap;

use anyhow::Result;

use super::aggregate::GroupedStats;
use super::dimension::{ShardDimension, SHARD_DIMENSIONS};
use crate::clock::Window;
use crate::output::MetricBatch;
use crate::store::request::RequestRecord;
use crate::store::schema::{OS_THREADS, SHARD_REQUESTS, TID};
use crate::store::Row;

/// Attribute aligned per-thread OS metrics to the shard requests those
/// threads were servicing during `window`.
///
/// Every request present in the window is joined to its thread's OS row on
/// `tid`; each OS metric is scaled by the request's utilization ratio and
/// aggregated per shard dimension. Returns the number of output rows.
pub fn correlate_threads(
    os_rows: &[Row],
    requests: &[RequestRecord],
    window: Window,
    batch: &mut MetricBatch,
) -> Result<usize> {
    let Some(tid_idx) = SHARD_REQUESTS.dimension_index(TID) else {
        return Ok(0);
    };

    let mut by_tid: HashMap<&str, &Row> = HashMap::with_capacity(os_rows.len());
    for row in os_rows {
        if let Some(tid) = row.dim(0) {
            by_tid.entry(tid).or_insert(row);
        }
    }

    let mut grouped: GroupedStats<ShardDimension> = GroupedStats::new(OS_THREADS.metrics.len());
    for rec in requests {
        let Some(ratio) = rec.utilization(window) else {
            continue;
        };
        let Some(os) = rec.dim(tid_idx).and_then(|tid| by_tid.get(tid)) else {
            continue;
        };

        let key = ShardDimension::of_request(rec);
        for idx in 0..OS_THREADS.metrics.len() {
            if let Some(value) = os.metric(idx) {
                grouped.record(&key, idx, value * ratio);
            }
        }
    }

    let mut emitted = 0;
    for (key, idx, stats) in grouped.drain_sorted() {
        batch.push(
            OS_THREADS.metrics[idx],
            SHARD_DIMENSIONS,
            key.into_values(),
            stats,
        )?;
        emitted += 1;
    }

    Ok(emitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::aggregate::StatSnapshot;

    fn s(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    fn os_row(tid: &str, cpu: f64) -> Row {
        let mut metrics = vec![None; OS_THREADS.metrics.len()];
        metrics[0] = Some(cpu);
        Row::new(vec![s(tid), s("elasticsearch[n][search][T#1]")], metrics)
    }

    fn request(rid: &str, tid: &str, shard: &str, start: i64, finish: Option<i64>) -> RequestRecord {
        RequestRecord {
            dims: vec![s(rid), s(tid), s("shardquery"), s("logs"), s(shard), s("primary")],
            start: Some(start),
            finish,
            doc_count: None,
        }
    }

    #[test]
    fn test_metrics_scaled_by_utilization() {
        let window = Window::new(10_000, 20_000);
        let os = vec![os_row("1", 0.8), os_row("2", 0.4)];
        let requests = vec![
            // Half the window on thread 1.
            request("a", "1", "0", 5_000, Some(15_000)),
            // The whole window on thread 2, still running.
            request("b", "2", "0", 9_000, None),
            // Different shard, quarter of the window on thread 1.
            request("c", "1", "1", 17_500, None),
            // Thread without OS data.
            request("d", "9", "0", 10_000, None),
            // Finished before the window.
            request("e", "2", "0", 1_000, Some(2_000)),
        ];

        let mut batch = MetricBatch::new(window.start);
        let emitted = correlate_threads(&os, &requests, window, &mut batch).expect("correlate");
        assert_eq!(emitted, 2);

        let table = batch.table("cpu_utilization").expect("cpu table");
        assert_eq!(table.rows.len(), 2);

        let shard0 = &table.rows[0];
        assert_eq!(shard0.dims, vec![s("0"), s("logs"), s("shardquery"), s("primary")]);
        assert_eq!(
            shard0.stats,
            StatSnapshot {
                sum: 0.8,
                avg: 0.4,
                min: 0.4,
                max: 0.4
            }
        );

        let shard1 = &table.rows[1];
        assert_eq!(shard1.dims[0], s("1"));
        assert_eq!(shard1.stats, StatSnapshot::single(0.2));
    }

    #[test]
    fn test_no_requests_no_rows() {
        let mut batch = MetricBatch::new(0);
        let emitted = correlate_threads(&[os_row("1", 1.0)], &[], Window::new(0, 5_000), &mut batch)
            .expect("correlate");
        assert_eq!(emitted, 0);
        assert!(batch.is_empty());
    }
}
