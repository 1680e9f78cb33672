//! Reader-window alignment of writer snapshots.
//!
//! Writer snapshots end whenever the writer happened to sample, so a reader
//! window `[a, b)` usually straddles two of them. Alignment picks the
//! bracketing pair from a family's retention index and, when needed,
//! materializes a duration-weighted blend as a synthetic snapshot.

use anyhow::Result;
use tracing::debug;

use crate::clock::Window;
use crate::store::index::RetentionIndex;
use crate::store::{Snapshot, SnapshotStore};

/// Why a window could not be aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoData {
    /// No snapshot ends at or after the window start.
    NoLeftWindow,
    /// The snapshot after the left one ends inside the window: the writer
    /// skipped a sample, and the window is dropped rather than guessed.
    WriterGap { left: i64, right: i64 },
}

impl NoData {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoLeftWindow => "no_left_window",
            Self::WriterGap { .. } => "writer_gap",
        }
    }
}

/// Result of aligning one family to one reader window.
#[derive(Debug, Clone, PartialEq)]
pub enum Alignment {
    /// The window starts on a writer boundary; the right snapshot already
    /// covers it.
    Exact(Snapshot),
    /// Only one snapshot at or after the window start exists, used as is.
    Degraded(Snapshot),
    /// Synthetic blend of the left and right snapshots, owned by the cycle.
    Blended(Snapshot),
    NoData(NoData),
}

impl Alignment {
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            Self::Exact(s) | Self::Degraded(s) | Self::Blended(s) => Some(s),
            Self::NoData(_) => None,
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Exact(_) => "exact",
            Self::Degraded(_) => "degraded",
            Self::Blended(_) => "blended",
            Self::NoData(reason) => reason.as_str(),
        }
    }

    /// Drop the synthetic table, if this alignment created one. Indexed
    /// snapshots are left to retention.
    pub fn release(self, store: &SnapshotStore) -> Result<()> {
        if let Self::Blended(snap) = self {
            store.dispose(snap)?;
        }
        Ok(())
    }
}

/// Align the snapshots in `index` to `window`.
pub fn align(
    store: &mut SnapshotStore,
    index: &RetentionIndex<Snapshot>,
    window: Window,
) -> Result<Alignment> {
    let Some((t1, left)) = index.ceiling(window.start) else {
        return Ok(Alignment::NoData(NoData::NoLeftWindow));
    };

    let Some((t2, right)) = index.higher(t1) else {
        debug!(
            family = %left.family(),
            window_start = window.start,
            left = t1,
            "no right snapshot, using left as is",
        );
        return Ok(Alignment::Degraded(left.clone()));
    };

    if t1 == window.start {
        return Ok(Alignment::Exact(right.clone()));
    }

    // TODO: blend across more than two snapshots instead of dropping the
    // window when the writer skipped a sample.
    if t2 <= window.end {
        return Ok(Alignment::NoData(NoData::WriterGap {
            left: t1,
            right: t2,
        }));
    }

    let left_weight = (t1 - window.start) as f64;
    let right_weight = (window.end - t1) as f64;

    let target = store.create_synthetic(left.family(), window.start)?;
    let rows = store.blend_into(&target, &[(left, left_weight), (right, right_weight)])?;

    debug!(
        family = %left.family(),
        window_start = window.start,
        left = t1,
        right = t2,
        rows,
        "blended snapshot",
    );

    Ok(Alignment::Blended(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::Family;
    use crate::store::{Row, Stat};

    fn heap_row(mem: &str, used: f64) -> Row {
        Row::new(
            vec![Some(mem.to_string())],
            vec![None, None, None, None, None, Some(used)],
        )
    }

    fn indexed(store: &mut SnapshotStore, snaps: &[(i64, &[Row])]) -> RetentionIndex<Snapshot> {
        let mut index = RetentionIndex::new();
        for (key, rows) in snaps {
            let snap = store.create(Family::Heap, *key).expect("create");
            store.bulk_insert(&snap, rows).expect("insert");
            index.insert(*key, snap).expect("index");
        }
        index
    }

    fn heap_used(store: &SnapshotStore, snap: &Snapshot) -> Vec<(String, Option<f64>)> {
        store
            .select_aggregate(snap, &["mem_type"], Stat::Avg, &["heap_used"])
            .expect("select")
            .into_iter()
            .map(|r| (r.dims[0].clone().unwrap_or_default(), r.metric(0)))
            .collect()
    }

    #[test]
    fn test_blend_weights_match_overlap() {
        let mut store = SnapshotStore::open().expect("open store");
        // Reader window [10_000, 15_000); writer ends at 11_000 and 16_000.
        let index = indexed(
            &mut store,
            &[
                (11_000, &[heap_row("young", 10.0), heap_row("old", 4.0)]),
                (16_000, &[heap_row("young", 20.0)]),
            ],
        );

        let aligned = align(&mut store, &index, Window::new(10_000, 15_000)).expect("align");
        assert_eq!(aligned.kind(), "blended");

        let snap = aligned.snapshot().expect("snapshot").clone();
        let values = heap_used(&store, &snap);
        assert_eq!(
            values,
            vec![("old".to_string(), Some(4.0)), ("young".to_string(), Some(18.0))]
        );

        let tables = store.table_count().expect("count");
        aligned.release(&store).expect("release");
        assert_eq!(store.table_count().expect("count"), tables - 1);
    }

    #[test]
    fn test_exact_boundary_returns_right_snapshot() {
        let mut store = SnapshotStore::open().expect("open store");
        let index = indexed(
            &mut store,
            &[
                (10_000, &[heap_row("young", 1.0)]),
                (15_000, &[heap_row("young", 2.0)]),
            ],
        );

        let aligned = align(&mut store, &index, Window::new(10_000, 15_000)).expect("align");
        let right = index.get(15_000).expect("right");
        assert_eq!(aligned, Alignment::Exact(right.clone()));
        assert_eq!(heap_used(&store, right), vec![("young".to_string(), Some(2.0))]);

        // Releasing a non-synthetic alignment keeps the indexed table.
        aligned.release(&store).expect("release");
        assert_eq!(store.row_count(right).expect("count"), 1);
    }

    #[test]
    fn test_no_left_window_is_no_data() {
        let mut store = SnapshotStore::open().expect("open store");
        let index = indexed(&mut store, &[(9_000, &[heap_row("young", 1.0)])]);

        let aligned = align(&mut store, &index, Window::new(10_000, 15_000)).expect("align");
        assert_eq!(aligned, Alignment::NoData(NoData::NoLeftWindow));
        assert!(aligned.snapshot().is_none());
    }

    #[test]
    fn test_missing_right_window_falls_back_to_left() {
        let mut store = SnapshotStore::open().expect("open store");
        let index = indexed(&mut store, &[(12_000, &[heap_row("young", 1.0)])]);

        let aligned = align(&mut store, &index, Window::new(10_000, 15_000)).expect("align");
        assert_eq!(aligned.kind(), "degraded");
        assert_eq!(aligned.snapshot().map(Snapshot::key), Some(12_000));
    }

    #[test]
    fn test_right_window_inside_reader_window_is_dropped() {
        let mut store = SnapshotStore::open().expect("open store");
        let index = indexed(
            &mut store,
            &[
                (11_000, &[heap_row("young", 1.0)]),
                (15_000, &[heap_row("young", 2.0)]),
            ],
        );

        let tables = store.table_count().expect("count");
        let aligned = align(&mut store, &index, Window::new(10_000, 15_000)).expect("align");
        assert_eq!(
            aligned,
            Alignment::NoData(NoData::WriterGap {
                left: 11_000,
                right: 15_000
            })
        );
        assert_eq!(store.table_count().expect("count"), tables);
    }
}
