use std::collections::BTreeSet;

use anyhow::Result;
use thiserror::Error;

use crate::clock::Window;
use crate::store::request::RequestRecord;
use crate::store::schema::{SHARD_REQUESTS, TID};
use crate::store::{Snapshot, SnapshotStore};

/// Thread cross-check failure between request events and OS samples.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("window {window_start}: request threads missing from OS snapshot {missing:?}")]
    MissingThreads {
        window_start: i64,
        /// Request thread ids with no OS row at all.
        missing: Vec<String>,
    },
}

/// Check that every thread servicing a shard request in `window` was
/// sampled by the OS collector.
///
/// Only presence is checked. The pool a thread was sampled under is not,
/// since shard work also runs on pools outside the categorizer's list.
pub fn check_threads(
    store: &SnapshotStore,
    os: &Snapshot,
    requests: &[RequestRecord],
    window: Window,
) -> Result<Option<ConsistencyError>> {
    let Some(tid_idx) = SHARD_REQUESTS.dimension_index(TID) else {
        return Ok(None);
    };

    let tids: BTreeSet<&str> = requests
        .iter()
        .filter(|r| r.utilization(window).is_some())
        .filter_map(|r| r.dim(tid_idx))
        .collect();

    let mut missing = Vec::new();
    for tid in tids {
        if store.select_by_dimension_equals(os, TID, tid)?.is_empty() {
            missing.push(tid.to_string());
        }
    }

    if missing.is_empty() {
        return Ok(None);
    }

    Ok(Some(ConsistencyError::MissingThreads {
        window_start: window.start,
        missing,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::{Family, OS_THREADS};
    use crate::store::Row;

    fn s(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    fn request(tid: &str) -> RequestRecord {
        RequestRecord {
            dims: vec![s("r"), s(tid), s("shardquery"), None, None, None],
            start: Some(0),
            finish: None,
            doc_count: None,
        }
    }

    #[test]
    fn test_check_threads_reports_missing() {
        let mut store = SnapshotStore::open().expect("open store");
        let os = store.create(Family::OsThreads, 1).expect("create");
        let metrics = vec![None; OS_THREADS.metrics.len()];
        store
            .bulk_insert(
                &os,
                &[
                    Row::new(vec![s("1"), s("es[n][search][T#1]")], metrics.clone()),
                    Row::new(vec![s("2"), s("es[n][search_throttled][T#1]")], metrics),
                ],
            )
            .expect("insert");

        let window = Window::new(0, 5_000);

        let ok = check_threads(&store, &os, &[request("1")], window).expect("check");
        assert!(ok.is_none());

        let err = check_threads(&store, &os, &[request("1"), request("2"), request("3")], window)
            .expect("check")
            .expect("violation");
        assert_eq!(
            err,
            ConsistencyError::MissingThreads {
                window_start: 0,
                missing: vec!["3".to_string()],
            }
        );
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_check_threads_accepts_any_sampled_pool() {
        let mut store = SnapshotStore::open().expect("open store");
        let os = store.create(Family::OsThreads, 1).expect("create");
        let metrics = vec![None; OS_THREADS.metrics.len()];
        store
            .bulk_insert(
                &os,
                &[
                    Row::new(vec![s("4"), s("es[n][get][T#2]")], metrics.clone()),
                    Row::new(vec![s("5"), s("es[n][search_throttled][T#1]")], metrics),
                ],
            )
            .expect("insert");

        let found = check_threads(&store, &os, &[request("4"), request("5")], Window::new(0, 5_000))
            .expect("check");
        assert!(found.is_none());
    }

    #[test]
    fn test_check_threads_ignores_requests_outside_window() {
        let store = SnapshotStore::open().expect("open store");
        let os = store.create(Family::OsThreads, 1).expect("create");

        let later = RequestRecord {
            start: Some(9_000),
            ..request("7")
        };
        let found = check_threads(&store, &os, &[later], Window::new(0, 5_000)).expect("check");
        assert!(found.is_none());
    }
}
