use anyhow::{bail, Context, Result};

use super::schema::{DOC_COUNT, FINISH_TIME, RID, START_TIME};
use super::{column_list, Snapshot, SnapshotStore};
use crate::clock::Window;

/// One request folded from its start and finish halves.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    /// Family dimensions in schema order, `rid` first.
    pub dims: Vec<Option<String>>,
    pub start: Option<i64>,
    pub finish: Option<i64>,
    pub doc_count: Option<f64>,
}

impl RequestRecord {
    pub fn dim(&self, idx: usize) -> Option<&str> {
        self.dims.get(idx).and_then(|d| d.as_deref())
    }

    pub fn rid(&self) -> Option<&str> {
        self.dim(0)
    }

    pub fn is_completed(&self) -> bool {
        self.start.is_some() && self.finish.is_some()
    }

    /// Fraction of `window` the request spent running, in `[0, 1]`.
    ///
    /// In-flight requests are treated as running until the window end.
    /// Returns `None` when the request has no start or does not overlap the
    /// window at all.
    pub fn utilization(&self, window: Window) -> Option<f64> {
        let start = self.start?;
        let finish = self.finish.unwrap_or(window.end);
        let overlap = window.overlap(start, finish.min(window.end));
        if overlap <= 0 || window.len_ms() <= 0 {
            return None;
        }

        Some((overlap as f64 / window.len_ms() as f64).clamp(0.0, 1.0))
    }

    /// Latency of a completed request, in milliseconds.
    ///
    /// Rollover only carries in-flight requests, so a completed record is
    /// seen in exactly one request snapshot: the one whose parse received
    /// its finish half, even when the writer flushed that file after the
    /// `finish_time` boundary.
    pub fn latency(&self) -> Option<f64> {
        let (start, finish) = (self.start?, self.finish?);

        Some((finish - start).max(0) as f64)
    }
}

impl SnapshotStore {
    /// Fold a request snapshot into one record per request id.
    ///
    /// Start and finish halves are merged by taking the non-null value of
    /// every dimension, the earliest start and the latest finish.
    pub fn request_view(&self, snap: &Snapshot) -> Result<Vec<RequestRecord>> {
        let schema = snap.family().schema();
        ensure_request_layout(snap)?;

        let dims: Vec<String> = schema
            .dimensions
            .iter()
            .map(|d| {
                if *d == RID {
                    format!("\"{d}\"")
                } else {
                    format!("MAX(\"{d}\")")
                }
            })
            .collect();

        let sql = format!(
            "SELECT {}, MIN(\"{START_TIME}\"), MAX(\"{FINISH_TIME}\"), MAX(\"{DOC_COUNT}\") \
             FROM \"{}\" WHERE \"{RID}\" IS NOT NULL GROUP BY \"{RID}\" ORDER BY \"{RID}\"",
            dims.join(", "),
            snap.table(),
        );

        let rows = self.query_rows(&sql, &[], schema.dimensions.len(), 3)?;

        Ok(rows
            .into_iter()
            .map(|row| RequestRecord {
                start: row.metric(0).map(|v| v as i64),
                finish: row.metric(1).map(|v| v as i64),
                doc_count: row.metric(2),
                dims: row.dims,
            })
            .collect())
    }

    /// Carry in-flight requests of `from` into `to`.
    ///
    /// A request is in flight when it has a start and no finish. Requests
    /// that started before `expire_before` are dropped instead of carried.
    /// The carried row keeps its original start time and dimensions.
    pub fn rollover(&mut self, from: &Snapshot, to: &Snapshot, expire_before: i64) -> Result<usize> {
        if from.family() != to.family() {
            bail!("cannot roll {} over into {}", from.family(), to.family());
        }
        ensure_request_layout(from)?;

        let schema = from.family().schema();
        let dims: Vec<String> = schema
            .dimensions
            .iter()
            .map(|d| {
                if *d == RID {
                    format!("\"{d}\"")
                } else {
                    format!("MAX(\"{d}\")")
                }
            })
            .collect();

        let sql = format!(
            "INSERT INTO \"{}\" ({}) \
             SELECT {}, MIN(\"{START_TIME}\"), NULL, MAX(\"{DOC_COUNT}\") FROM \"{}\" \
             WHERE \"{RID}\" IS NOT NULL GROUP BY \"{RID}\" \
             HAVING MIN(\"{START_TIME}\") IS NOT NULL \
                AND MAX(\"{FINISH_TIME}\") IS NULL \
                AND MIN(\"{START_TIME}\") >= ?1",
            to.table(),
            column_list(schema.dimensions.iter().chain(schema.metrics.iter())),
            dims.join(", "),
            from.table(),
        );

        let tx = self
            .conn
            .transaction()
            .context("starting rollover transaction")?;
        let carried = tx
            .execute(&sql, [expire_before as f64])
            .with_context(|| format!("rolling {} over into {}", from.table(), to.table()))?;
        tx.commit().context("committing rollover")?;

        Ok(carried)
    }
}

fn ensure_request_layout(snap: &Snapshot) -> Result<()> {
    let schema = snap.family().schema();
    if !snap.family().is_request()
        || schema.metric_index(START_TIME) != Some(0)
        || schema.metric_index(FINISH_TIME) != Some(1)
        || schema.metric_index(DOC_COUNT) != Some(2)
    {
        bail!("{} is not a request family", snap.family());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::Family;
    use crate::store::Row;

    fn s(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    fn start(rid: &str, tid: &str, at: f64) -> Row {
        Row::new(
            vec![s(rid), s(tid), s("shardquery"), s("logs"), s("3"), s("primary")],
            vec![Some(at), None, Some(12.0)],
        )
    }

    fn finish(rid: &str, tid: &str, at: f64) -> Row {
        Row::new(
            vec![s(rid), s(tid), s("shardquery"), None, None, None],
            vec![None, Some(at), None],
        )
    }

    #[test]
    fn test_request_view_merges_halves() {
        let mut store = SnapshotStore::open().expect("open store");
        let snap = store.create(Family::ShardRequests, 0).expect("create");
        store
            .bulk_insert(
                &snap,
                &[start("r1", "7", 1_000.0), finish("r1", "7", 3_500.0), start("r2", "8", 2_000.0)],
            )
            .expect("insert");

        let view = store.request_view(&snap).expect("view");
        assert_eq!(view.len(), 2);

        let r1 = &view[0];
        assert_eq!(r1.rid(), Some("r1"));
        assert_eq!(r1.dim(3), Some("logs"));
        assert_eq!(r1.start, Some(1_000));
        assert_eq!(r1.finish, Some(3_500));
        assert_eq!(r1.doc_count, Some(12.0));
        assert!(r1.is_completed());

        assert!(!view[1].is_completed());
    }

    #[test]
    fn test_rollover_keeps_start_and_completes_later() {
        let mut store = SnapshotStore::open().expect("open store");
        let n = store.create(Family::ShardRequests, 0).expect("create");
        let next = store.create(Family::ShardRequests, 5_000).expect("create");

        store
            .bulk_insert(
                &n,
                &[
                    start("done", "1", 100.0),
                    finish("done", "1", 200.0),
                    start("open", "2", 4_200.0),
                    start("stale", "3", -700_000.0),
                ],
            )
            .expect("insert");

        let carried = store.rollover(&n, &next, -600_000).expect("rollover");
        assert_eq!(carried, 1);

        store
            .bulk_insert(&next, &[finish("open", "2", 6_000.0)])
            .expect("insert");

        let view = store.request_view(&next).expect("view");
        assert_eq!(view.len(), 1);
        let open = &view[0];
        assert_eq!(open.rid(), Some("open"));
        assert_eq!(open.start, Some(4_200));
        assert_eq!(open.finish, Some(6_000));
        assert_eq!(open.dim(3), Some("logs"));
        assert_eq!(open.latency(), Some(1_800.0));
    }

    #[test]
    fn test_rollover_rejects_non_request_family() {
        let mut store = SnapshotStore::open().expect("open store");
        let a = store.create(Family::Disk, 0).expect("create");
        let b = store.create(Family::Disk, 1).expect("create");
        assert!(store.rollover(&a, &b, 0).is_err());
    }

    #[test]
    fn test_utilization_ratio() {
        let w = Window::new(10_000, 15_000);
        let rec = |start: Option<i64>, finish: Option<i64>| RequestRecord {
            dims: vec![s("r")],
            start,
            finish,
            doc_count: None,
        };

        assert_eq!(rec(Some(9_000), Some(12_500)).utilization(w), Some(0.5));
        assert_eq!(rec(Some(14_000), None).utilization(w), Some(0.2));
        assert_eq!(rec(Some(1_000), None).utilization(w), Some(1.0));
        assert_eq!(rec(Some(1_000), Some(2_000)).utilization(w), None);
        assert_eq!(rec(None, Some(12_000)).utilization(w), None);
        assert_eq!(rec(Some(16_000), None).utilization(w), None);
    }
}
