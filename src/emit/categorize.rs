use anyhow::{Context, Result};
use regex::Regex;

use super::aggregate::StatSnapshot;
use super::dimension::{ShardDimension, SHARD_DIMENSIONS};
use crate::output::MetricBatch;
use crate::store::schema::OS_THREADS;
use crate::store::Row;

/// Thread pools whose threads are attributed through request correlation.
const REQUEST_POOLS: [&str; 3] = ["[search]", "[bulk]", "[write]"];

const GC_PATTERNS: [&str; 4] = ["GC", "Gang worker", "G1", "VM Thread"];

const REFRESH_POOL: &str = "[refresh]";
const MANAGEMENT_POOL: &str = "[management]";

/// Matches `...[[<index>][<shard>]: Lucene Merge Thread #<n>]`.
const MERGE_PATTERN: &str = r"\[\[([^\]]+)\]\[([^\]]+)\]: Lucene Merge Thread #\d+\]";

/// Category of a background thread, derived from its display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadCategory {
    /// Request-servicing thread, handled by correlation instead.
    Uncategorized,
    Gc,
    Refresh,
    Management,
    Merge { index: String, shard: String },
    Other,
}

impl ThreadCategory {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Uncategorized => "uncategorized",
            Self::Gc => "GC",
            Self::Refresh => "refresh",
            Self::Management => "management",
            Self::Merge { .. } => "merge",
            Self::Other => "other",
        }
    }
}

/// Ordered thread-name rule set.
#[derive(Debug, Clone)]
pub struct Categorizer {
    merge: Regex,
}

impl Categorizer {
    pub fn new() -> Result<Self> {
        let merge = Regex::new(MERGE_PATTERN).context("compiling merge thread pattern")?;
        Ok(Self { merge })
    }

    /// Whether `name` belongs to a request-servicing pool.
    pub fn is_request_pool(name: &str) -> bool {
        REQUEST_POOLS.iter().any(|p| name.contains(p))
    }

    /// Classify a thread name; the first matching rule wins.
    pub fn categorize(&self, name: &str) -> ThreadCategory {
        if Self::is_request_pool(name) {
            return ThreadCategory::Uncategorized;
        }
        if GC_PATTERNS.iter().any(|p| name.contains(p)) {
            return ThreadCategory::Gc;
        }
        if name.contains(REFRESH_POOL) {
            return ThreadCategory::Refresh;
        }
        if name.contains(MANAGEMENT_POOL) {
            return ThreadCategory::Management;
        }
        if let Some(caps) = self.merge.captures(name) {
            return ThreadCategory::Merge {
                index: caps[1].to_string(),
                shard: caps[2].to_string(),
            };
        }

        ThreadCategory::Other
    }
}

/// Emit OS metrics of every non-request thread, one row per thread.
///
/// `os_rows` are aligned OS thread rows grouped by `(tid, thread_name)`
/// with every OS metric column in schema order.
pub fn emit_categorized(
    categorizer: &Categorizer,
    os_rows: &[Row],
    batch: &mut MetricBatch,
) -> Result<usize> {
    let mut emitted = 0;

    for row in os_rows {
        let category = match row.dim(1) {
            Some(name) => categorizer.categorize(name),
            None => ThreadCategory::Other,
        };
        if category == ThreadCategory::Uncategorized {
            continue;
        }

        let mut key = ShardDimension {
            operation: Some(category.label().to_string()),
            ..ShardDimension::default()
        };
        if let ThreadCategory::Merge { index, shard } = category {
            key.index_name = Some(index);
            key.shard_id = Some(shard);
        }

        for (idx, metric) in OS_THREADS.metrics.iter().copied().enumerate() {
            if let Some(value) = row.metric(idx) {
                batch.push(
                    metric,
                    SHARD_DIMENSIONS,
                    key.clone().into_values(),
                    StatSnapshot::single(value),
                )?;
                emitted += 1;
            }
        }
    }

    Ok(emitted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categorizer() -> Categorizer {
        Categorizer::new().expect("patterns compile")
    }

    #[test]
    fn test_categorize_rules() {
        let c = categorizer();

        assert_eq!(c.categorize("GC Thread#3"), ThreadCategory::Gc);
        assert_eq!(c.categorize("G1 Conc#0"), ThreadCategory::Gc);
        assert_eq!(c.categorize("Gang worker#1 (Parallel GC Threads)"), ThreadCategory::Gc);
        assert_eq!(c.categorize("VM Thread"), ThreadCategory::Gc);
        assert_eq!(
            c.categorize("elasticsearch[node-1][refresh][T#2]"),
            ThreadCategory::Refresh
        );
        assert_eq!(
            c.categorize("elasticsearch[node-1][management][T#1]"),
            ThreadCategory::Management
        );
        assert_eq!(
            c.categorize("elasticsearch[node-1][[logs-2024][3]: Lucene Merge Thread #17]"),
            ThreadCategory::Merge {
                index: "logs-2024".to_string(),
                shard: "3".to_string()
            }
        );
        assert_eq!(c.categorize("Signal Dispatcher"), ThreadCategory::Other);
    }

    #[test]
    fn test_request_pools_are_uncategorized() {
        let c = categorizer();
        for name in [
            "elasticsearch[node-1][search][T#4]",
            "elasticsearch[node-1][bulk][T#1]",
            "elasticsearch[node-1][write][T#9]",
        ] {
            let category = c.categorize(name);
            assert_eq!(category, ThreadCategory::Uncategorized, "{name}");
            assert_eq!(category.label(), "uncategorized");
        }
    }

    #[test]
    fn test_emit_categorized_one_row_per_thread() {
        let c = categorizer();
        let mut metrics = vec![None; OS_THREADS.metrics.len()];
        metrics[0] = Some(0.4);

        let rows = vec![
            Row::new(
                vec![Some("1".into()), Some("elasticsearch[n][search][T#1]".into())],
                metrics.clone(),
            ),
            Row::new(
                vec![
                    Some("2".into()),
                    Some("elasticsearch[n][[idx][0]: Lucene Merge Thread #1]".into()),
                ],
                metrics.clone(),
            ),
            Row::new(vec![Some("3".into()), Some("GC Thread#0".into())], metrics.clone()),
            Row::new(vec![Some("4".into()), Some("GC Thread#1".into())], metrics),
        ];

        let mut batch = MetricBatch::new(0);
        let emitted = emit_categorized(&c, &rows, &mut batch).expect("emit");
        assert_eq!(emitted, 3);

        let table = batch.table("cpu_utilization").expect("cpu table");
        assert_eq!(table.rows.len(), 3);
        assert_eq!(
            table.rows[0].dims,
            vec![Some("0".into()), Some("idx".into()), Some("merge".into()), None]
        );
        assert_eq!(table.rows[1].dims[2].as_deref(), Some("GC"));
        assert_eq!(table.rows[1].stats, StatSnapshot::single(0.4));
    }
}
