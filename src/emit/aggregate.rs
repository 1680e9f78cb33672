use std::collections::HashMap;
use std::hash::Hash;

/// Tracks sum/count/min/max of one metric for one dimension tuple.
///
/// Emission runs on the pipeline thread only, so this is plain state rather
/// than atomics.
#[derive(Debug, Clone, Copy)]
pub struct StatAggregate {
    sum: f64,
    count: u32,
    min: f64,
    max: f64,
}

impl StatAggregate {
    /// Creates an empty aggregate with min at +inf and max at -inf.
    pub fn new() -> Self {
        Self {
            sum: 0.0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn record(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Point-in-time view; `None` when nothing was recorded.
    pub fn snapshot(&self) -> Option<StatSnapshot> {
        if self.count == 0 {
            return None;
        }

        Some(StatSnapshot {
            sum: self.sum,
            avg: self.sum / f64::from(self.count),
            min: self.min,
            max: self.max,
        })
    }
}

impl Default for StatAggregate {
    fn default() -> Self {
        Self::new()
    }
}

/// Final statistics written to one output row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatSnapshot {
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl StatSnapshot {
    /// All four statistics equal to one observed value.
    pub fn single(value: f64) -> Self {
        Self {
            sum: value,
            avg: value,
            min: value,
            max: value,
        }
    }
}

/// Per-dimension-key aggregates for a fixed list of metrics.
#[derive(Debug)]
pub struct GroupedStats<K> {
    width: usize,
    groups: HashMap<K, Vec<StatAggregate>>,
}

impl<K: Hash + Eq + Ord + Clone> GroupedStats<K> {
    pub fn new(width: usize) -> Self {
        Self {
            width,
            groups: HashMap::new(),
        }
    }

    /// Record `value` for metric `metric` under `key`. Out-of-range metric
    /// indexes are ignored.
    pub fn record(&mut self, key: &K, metric: usize, value: f64) {
        if metric >= self.width {
            return;
        }

        if let Some(aggs) = self.groups.get_mut(key) {
            aggs[metric].record(value);
            return;
        }

        let mut aggs = vec![StatAggregate::new(); self.width];
        aggs[metric].record(value);
        self.groups.insert(key.clone(), aggs);
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Drain into `(key, metric index, stats)` triples in key order, skipping
    /// metrics that never saw a value.
    pub fn drain_sorted(self) -> Vec<(K, usize, StatSnapshot)> {
        let mut groups: Vec<(K, Vec<StatAggregate>)> = self.groups.into_iter().collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::new();
        for (key, aggs) in groups {
            for (idx, agg) in aggs.iter().enumerate() {
                if let Some(stats) = agg.snapshot() {
                    out.push((key.clone(), idx, stats));
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_aggregate_snapshot() {
        let mut agg = StatAggregate::new();
        assert!(agg.snapshot().is_none());

        for v in [4.0, 1.0, 7.0] {
            agg.record(v);
        }

        let snap = agg.snapshot().expect("recorded");
        assert_eq!(agg.count(), 3);
        assert_eq!(snap.sum, 12.0);
        assert_eq!(snap.avg, 4.0);
        assert_eq!(snap.min, 1.0);
        assert_eq!(snap.max, 7.0);
    }

    #[test]
    fn test_grouped_stats_drain_order_and_sparse_metrics() {
        let mut grouped: GroupedStats<&str> = GroupedStats::new(2);
        grouped.record(&"b", 0, 1.0);
        grouped.record(&"a", 1, 2.0);
        grouped.record(&"a", 1, 4.0);
        grouped.record(&"a", 9, 100.0);

        assert_eq!(grouped.len(), 2);

        let drained = grouped.drain_sorted();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, "a");
        assert_eq!(drained[0].1, 1);
        assert_eq!(drained[0].2.avg, 3.0);
        assert_eq!(drained[1].0, "b");
        assert_eq!(drained[1].2, StatSnapshot::single(1.0));
    }
}
