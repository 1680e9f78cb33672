use anyhow::Result;

use super::aggregate::StatSnapshot;
use crate::output::MetricBatch;
use crate::store::{Snapshot, SnapshotStore, Stat};

/// Copy an aligned node-family snapshot into the batch, one row per
/// dimension value and metric. Rows carry the family's own dimension
/// columns and every statistic equals the aligned value.
pub fn emit_node_family(
    store: &SnapshotStore,
    aligned: &Snapshot,
    batch: &mut MetricBatch,
) -> Result<usize> {
    let schema = aligned.family().schema();
    let rows = store.select_aggregate(aligned, schema.dimensions, Stat::Avg, schema.metrics)?;

    let mut emitted = 0;
    for row in rows {
        for (idx, metric) in schema.metrics.iter().copied().enumerate() {
            if let Some(value) = row.metric(idx) {
                batch.push(
                    metric,
                    schema.dimensions,
                    row.dims.clone(),
                    StatSnapshot::single(value),
                )?;
                emitted += 1;
            }
        }
    }

    Ok(emitted)
}
