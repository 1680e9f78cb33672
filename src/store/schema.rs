use std::fmt;

use serde::Deserialize;

/// Metric families tracked by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    OsThreads,
    ShardRequests,
    HttpRequests,
    Disk,
    Tcp,
    CircuitBreaker,
    ThreadPool,
    Heap,
}

impl Family {
    /// Families whose rows are already dimensioned per node and are copied
    /// to the output store after alignment.
    pub const NODE: [Family; 5] = [
        Family::Disk,
        Family::Tcp,
        Family::CircuitBreaker,
        Family::ThreadPool,
        Family::Heap,
    ];

    /// Lifecycle families built from start/finish event files.
    pub const REQUEST: [Family; 2] = [Family::ShardRequests, Family::HttpRequests];

    /// Canonical label used in table names, logs and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OsThreads => "os_threads",
            Self::ShardRequests => "shard_requests",
            Self::HttpRequests => "http_requests",
            Self::Disk => "disk",
            Self::Tcp => "tcp",
            Self::CircuitBreaker => "circuit_breaker",
            Self::ThreadPool => "thread_pool",
            Self::Heap => "heap",
        }
    }

    /// Whether snapshots of this family are request lifecycle snapshots.
    pub const fn is_request(self) -> bool {
        matches!(self, Self::ShardRequests | Self::HttpRequests)
    }

    /// Column layout for this family.
    pub fn schema(self) -> &'static FamilySchema {
        match self {
            Self::OsThreads => &OS_THREADS,
            Self::ShardRequests => &SHARD_REQUESTS,
            Self::HttpRequests => &HTTP_REQUESTS,
            Self::Disk => &DISK,
            Self::Tcp => &TCP,
            Self::CircuitBreaker => &CIRCUIT_BREAKER,
            Self::ThreadPool => &THREAD_POOL,
            Self::Heap => &HEAP,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative column layout of one family: TEXT dimension columns
/// followed by REAL metric columns.
#[derive(Debug)]
pub struct FamilySchema {
    pub dimensions: &'static [&'static str],
    pub metrics: &'static [&'static str],
}

impl FamilySchema {
    pub fn dimension_index(&self, name: &str) -> Option<usize> {
        self.dimensions.iter().position(|d| *d == name)
    }

    pub fn metric_index(&self, name: &str) -> Option<usize> {
        self.metrics.iter().position(|m| *m == name)
    }

    /// Whether `name` is any column of this family.
    pub fn has_column(&self, name: &str) -> bool {
        self.dimension_index(name).is_some() || self.metric_index(name).is_some()
    }

    pub fn width(&self) -> usize {
        self.dimensions.len() + self.metrics.len()
    }
}

// Dimension names shared with the output store.
pub const TID: &str = "tid";
pub const THREAD_NAME: &str = "thread_name";
pub const RID: &str = "rid";
pub const OPERATION: &str = "operation";
pub const INDEX_NAME: &str = "index_name";
pub const SHARD_ID: &str = "shard_id";
pub const SHARD_ROLE: &str = "shard_role";
pub const INDICES: &str = "indices";
pub const STATUS: &str = "status";
pub const EXCEPTION: &str = "exception";

// Lifecycle metric columns, in the order both request schemas use.
pub const START_TIME: &str = "start_time";
pub const FINISH_TIME: &str = "finish_time";
pub const DOC_COUNT: &str = "doc_count";

pub static OS_THREADS: FamilySchema = FamilySchema {
    dimensions: &[TID, THREAD_NAME],
    metrics: &[
        "cpu_utilization",
        "paging_majflt_rate",
        "paging_minflt_rate",
        "paging_rss",
        "sched_runtime",
        "sched_waittime",
        "sched_ctx_rate",
        "heap_alloc_rate",
        "io_read_throughput",
        "io_write_throughput",
        "io_tot_throughput",
        "io_read_syscall_rate",
        "io_write_syscall_rate",
        "io_total_syscall_rate",
        "thread_blocked_time",
        "thread_blocked_event",
    ],
};

pub static SHARD_REQUESTS: FamilySchema = FamilySchema {
    dimensions: &[RID, TID, OPERATION, INDEX_NAME, SHARD_ID, SHARD_ROLE],
    metrics: &[START_TIME, FINISH_TIME, DOC_COUNT],
};

pub static HTTP_REQUESTS: FamilySchema = FamilySchema {
    dimensions: &[RID, OPERATION, INDICES, STATUS, EXCEPTION],
    metrics: &[START_TIME, FINISH_TIME, DOC_COUNT],
};

pub static DISK: FamilySchema = FamilySchema {
    dimensions: &["disk_name"],
    metrics: &["disk_utilization", "disk_wait_time", "disk_service_rate"],
};

pub static TCP: FamilySchema = FamilySchema {
    dimensions: &["dest_addr"],
    metrics: &[
        "net_tcp_num_flows",
        "net_tcp_txq",
        "net_tcp_rxq",
        "net_tcp_lost",
        "net_tcp_send_cwnd",
        "net_tcp_ssthresh",
    ],
};

pub static CIRCUIT_BREAKER: FamilySchema = FamilySchema {
    dimensions: &["cb_type"],
    metrics: &["cb_estimated_size", "cb_configured_size", "cb_tripped_events"],
};

pub static THREAD_POOL: FamilySchema = FamilySchema {
    dimensions: &["thread_pool_type"],
    metrics: &[
        "thread_pool_queue_size",
        "thread_pool_rejected_reqs",
        "thread_pool_total_threads",
        "thread_pool_active_threads",
        "thread_pool_queue_capacity",
    ],
};

pub static HEAP: FamilySchema = FamilySchema {
    dimensions: &["mem_type"],
    metrics: &[
        "gc_collection_event",
        "gc_collection_time",
        "heap_committed",
        "heap_init",
        "heap_max",
        "heap_used",
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_schemas_share_metric_layout() {
        for family in Family::REQUEST {
            let schema = family.schema();
            assert_eq!(schema.metric_index(START_TIME), Some(0));
            assert_eq!(schema.metric_index(FINISH_TIME), Some(1));
            assert_eq!(schema.metric_index(DOC_COUNT), Some(2));
            assert_eq!(schema.dimension_index(RID), Some(0));
        }
    }

    #[test]
    fn test_family_deserializes_snake_case() {
        let families: Vec<Family> =
            serde_yaml::from_str("[disk, circuit_breaker, thread_pool]").expect("valid yaml");
        assert_eq!(
            families,
            vec![Family::Disk, Family::CircuitBreaker, Family::ThreadPool]
        );
    }

    #[test]
    fn test_column_names_unique_per_family() {
        for family in [Family::OsThreads, Family::ShardRequests, Family::HttpRequests]
            .into_iter()
            .chain(Family::NODE)
        {
            let schema = family.schema();
            let mut all: Vec<&str> = schema
                .dimensions
                .iter()
                .chain(schema.metrics.iter())
                .copied()
                .collect();
            all.sort_unstable();
            all.dedup();
            assert_eq!(all.len(), schema.width(), "duplicate column in {family}");
        }
    }
}
