//! Emission procedures turning aligned snapshots into output rows.
//!
//! Every procedure appends to the cycle's [`MetricBatch`](crate::output::MetricBatch);
//! nothing reaches the output store until the driver commits the batch.

pub mod aggregate;
pub mod categorize;
pub mod check;
pub mod correlate;
pub mod dimension;
pub mod node;
pub mod workload;

/// Output rows produced by each procedure in one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitCounts {
    pub correlated: usize,
    pub categorized: usize,
    pub workload: usize,
    pub node: usize,
}

impl EmitCounts {
    pub fn total(&self) -> usize {
        self.correlated + self.categorized + self.workload + self.node
    }

    /// `(procedure label, rows)` pairs for metrics.
    pub fn by_procedure(&self) -> [(&'static str, usize); 4] {
        [
            ("correlation", self.correlated),
            ("categorization", self.categorized),
            ("workload", self.workload),
            ("node", self.node),
        ]
    }
}
