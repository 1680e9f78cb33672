//! Rolling on-disk store of aggregated output rows.
//!
//! Each emitted reader window becomes one SQLite file `metricsdb_<key>`
//! holding one table per metric. A bucket is written to a temporary file in
//! a single transaction and renamed into place, so a bucket is either fully
//! present or absent. The shared `latest` pointer moves only after the
//! rename.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use tracing::{debug, info, warn};

use crate::emit::aggregate::StatSnapshot;
use crate::store::index::RetentionIndex;
use crate::store::Stat;

const FILE_PREFIX: &str = "metricsdb_";
const TMP_SUFFIX: &str = ".tmp";
const NO_BUCKET: i64 = i64::MIN;

/// One aggregated row of one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRow {
    pub dims: Vec<Option<String>>,
    pub stats: StatSnapshot,
}

/// All rows of one metric in a batch.
#[derive(Debug, Clone)]
pub struct MetricTable {
    pub dimensions: &'static [&'static str],
    pub rows: Vec<OutputRow>,
}

/// Rows buffered for one output bucket, committed in one shot.
#[derive(Debug, Clone)]
pub struct MetricBatch {
    key: i64,
    tables: BTreeMap<&'static str, MetricTable>,
}

impl MetricBatch {
    pub fn new(key: i64) -> Self {
        Self {
            key,
            tables: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    /// Append a row to `metric`. Every row of a metric must use the same
    /// dimension set.
    pub fn push(
        &mut self,
        metric: &'static str,
        dimensions: &'static [&'static str],
        dims: Vec<Option<String>>,
        stats: StatSnapshot,
    ) -> Result<()> {
        if dims.len() != dimensions.len() {
            bail!(
                "{metric}: {} dimension values for {} columns",
                dims.len(),
                dimensions.len()
            );
        }

        let table = self.tables.entry(metric).or_insert_with(|| MetricTable {
            dimensions,
            rows: Vec::new(),
        });
        if table.dimensions != dimensions {
            bail!(
                "{metric}: dimension set {:?} conflicts with {:?}",
                dimensions,
                table.dimensions
            );
        }

        table.rows.push(OutputRow { dims, stats });

        Ok(())
    }

    pub fn table(&self, metric: &str) -> Option<&MetricTable> {
        self.tables.get(metric)
    }

    pub fn tables(&self) -> impl Iterator<Item = (&'static str, &MetricTable)> {
        self.tables.iter().map(|(k, v)| (*k, v))
    }

    /// Total number of rows across all metrics.
    pub fn len(&self) -> usize {
        self.tables.values().map(|t| t.rows.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a commit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { rows: usize },
    /// The bucket already exists; nothing was written.
    AlreadyCommitted,
    /// The batch had no rows; no bucket was created.
    Empty,
    /// The key is older than the newest indexed bucket.
    Stale,
}

/// Writer side of the output store, owned by the pipeline thread.
pub struct OutputStore {
    dir: PathBuf,
    bound: usize,
    index: RetentionIndex<PathBuf>,
    latest: Arc<AtomicI64>,
}

impl OutputStore {
    /// Open `dir`, re-indexing buckets left by a previous run and removing
    /// partial temporary files.
    pub fn open(dir: &Path, bound: usize) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;

        let mut found = Vec::new();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("reading output directory {}", dir.display()))?
        {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();

            if name.starts_with(FILE_PREFIX) && name.ends_with(TMP_SUFFIX) {
                debug!(path = %path.display(), "removing partial output bucket");
                remove_quietly(&path);
                continue;
            }

            if !path.is_file() {
                continue;
            }

            if let Some(key) = parse_bucket_file(&name) {
                found.push((key, path));
            }
        }

        found.sort_by_key(|(k, _)| *k);

        let mut index = RetentionIndex::new();
        for (key, path) in found {
            index.insert(key, path)?;
        }

        let latest = index.last_key().unwrap_or(NO_BUCKET);
        let mut store = Self {
            dir: dir.to_path_buf(),
            bound: bound.max(1),
            index,
            latest: Arc::new(AtomicI64::new(latest)),
        };

        if !store.index.is_empty() {
            info!(
                dir = %dir.display(),
                buckets = store.index.len(),
                latest,
                "re-indexed existing output buckets",
            );
        }
        store.trim()?;

        Ok(store)
    }

    pub fn contains(&self, key: i64) -> bool {
        self.index.contains(key)
    }

    pub fn keys(&self) -> Vec<i64> {
        self.index.keys().collect()
    }

    pub fn latest(&self) -> Option<i64> {
        load_latest(&self.latest)
    }

    /// Shareable read handle.
    pub fn reader(&self) -> OutputReader {
        OutputReader {
            dir: self.dir.clone(),
            latest: Arc::clone(&self.latest),
        }
    }

    /// Write `batch` as one bucket.
    pub fn commit(&mut self, batch: &MetricBatch) -> Result<CommitOutcome> {
        let key = batch.key();

        if self.index.contains(key) {
            return Ok(CommitOutcome::AlreadyCommitted);
        }
        if batch.is_empty() {
            return Ok(CommitOutcome::Empty);
        }
        if self.index.last_key().is_some_and(|last| key < last) {
            warn!(key, "output bucket older than newest bucket, not written");
            return Ok(CommitOutcome::Stale);
        }

        let target = bucket_path(&self.dir, key);
        let temp = self.dir.join(format!("{FILE_PREFIX}{key}{TMP_SUFFIX}"));
        remove_quietly(&temp);

        let written = write_bucket(&temp, batch).and_then(|rows| {
            fs::rename(&temp, &target).with_context(|| {
                format!("renaming {} to {}", temp.display(), target.display())
            })?;
            Ok(rows)
        });

        let rows = match written {
            Ok(rows) => rows,
            Err(e) => {
                remove_quietly(&temp);
                return Err(e.context(format!("committing output bucket {key}")));
            }
        };

        self.index.insert(key, target)?;
        self.latest.fetch_max(key, Ordering::AcqRel);

        Ok(CommitOutcome::Committed { rows })
    }

    /// Delete the oldest buckets beyond the retention bound.
    pub fn trim(&mut self) -> Result<Vec<i64>> {
        let evicted = self.index.trim_to(self.bound);
        let mut keys = Vec::with_capacity(evicted.len());

        for (key, path) in evicted {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("removing output bucket {}", path.display()))
                }
            }
            keys.push(key);
        }

        Ok(keys)
    }
}

fn write_bucket(path: &Path, batch: &MetricBatch) -> Result<usize> {
    let mut conn =
        Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
    let tx = conn.transaction().context("starting output transaction")?;

    let mut rows = 0;
    for (metric, table) in batch.tables() {
        let dims: Vec<String> = table.dimensions.iter().map(|d| format!("\"{d}\"")).collect();
        let mut columns: Vec<String> = table
            .dimensions
            .iter()
            .map(|d| format!("\"{d}\" TEXT"))
            .collect();
        columns.extend(Stat::ALL.iter().map(|s| format!("\"{}\" REAL", s.column())));

        tx.execute_batch(&format!(
            "CREATE TABLE \"{metric}\" ({});",
            columns.join(", ")
        ))
        .with_context(|| format!("creating output table {metric}"))?;

        let mut all = dims.clone();
        all.extend(Stat::ALL.iter().map(|s| format!("\"{}\"", s.column())));
        let placeholders = vec!["?"; all.len()].join(", ");

        let mut stmt = tx
            .prepare(&format!(
                "INSERT INTO \"{metric}\" ({}) VALUES ({placeholders})",
                all.join(", ")
            ))
            .with_context(|| format!("preparing insert into {metric}"))?;

        for row in &table.rows {
            let values = row
                .dims
                .iter()
                .map(|d| d as &dyn rusqlite::ToSql)
                .chain([
                    &row.stats.sum as &dyn rusqlite::ToSql,
                    &row.stats.avg,
                    &row.stats.min,
                    &row.stats.max,
                ]);
            stmt.execute(params_from_iter(values))
                .with_context(|| format!("inserting into {metric}"))?;
            rows += 1;
        }
    }

    tx.commit().context("committing output transaction")?;

    Ok(rows)
}

/// One row of a query against an output bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub dims: Vec<Option<String>>,
    pub value: Option<f64>,
}

/// Read handle for downstream consumers. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OutputReader {
    dir: PathBuf,
    latest: Arc<AtomicI64>,
}

impl OutputReader {
    /// Reader over a directory written by another process, positioned at
    /// the newest complete bucket found on disk.
    pub fn discover(dir: &Path) -> Result<Self> {
        let mut latest = NO_BUCKET;
        for entry in
            fs::read_dir(dir).with_context(|| format!("reading output directory {}", dir.display()))?
        {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if let Some(key) = parse_bucket_file(&entry.file_name().to_string_lossy()) {
                latest = latest.max(key);
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            latest: Arc::new(AtomicI64::new(latest)),
        })
    }

    /// Key of the newest fully committed bucket.
    pub fn latest(&self) -> Option<i64> {
        load_latest(&self.latest)
    }

    /// Metric tables present in a bucket.
    pub fn metrics(&self, key: i64) -> Result<Vec<String>> {
        let conn = self.open_bucket(key)?;
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .context("listing output tables")?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for name in names {
            out.push(name?);
        }
        Ok(out)
    }

    /// Aggregate `stat` of `metric` in bucket `key`, grouped by `group_by`.
    ///
    /// Each statistic combines with its own kind: sums add up, averages
    /// average, minimums take the minimum and maximums the maximum.
    pub fn query(
        &self,
        key: i64,
        metric: &str,
        group_by: &[&str],
        stat: Stat,
    ) -> Result<Vec<QueryRow>> {
        let conn = self.open_bucket(key)?;

        let columns = table_columns(&conn, metric)?;
        if columns.is_empty() {
            bail!("metric {metric} not found in bucket {key}");
        }
        for d in group_by {
            let is_stat = Stat::ALL.iter().any(|s| s.column() == *d);
            if is_stat || !columns.iter().any(|c| c == d) {
                bail!("metric {metric} has no dimension {d}");
            }
        }

        let dims: Vec<String> = group_by.iter().map(|d| format!("\"{d}\"")).collect();
        let aggregate = format!("{}(\"{}\")", stat.sql_fn(), stat.column());
        let mut sql = if dims.is_empty() {
            format!("SELECT {aggregate} FROM \"{metric}\"")
        } else {
            format!("SELECT {}, {aggregate} FROM \"{metric}\"", dims.join(", "))
        };
        if !dims.is_empty() {
            let group = dims.join(", ");
            sql.push_str(&format!(" GROUP BY {group} ORDER BY {group}"));
        }

        let mut stmt = conn
            .prepare(&sql)
            .with_context(|| format!("preparing query on {metric}"))?;
        let n = group_by.len();
        let rows = stmt.query_map([], |r| {
            let mut dims = Vec::with_capacity(n);
            for i in 0..n {
                dims.push(r.get::<_, Option<String>>(i)?);
            }
            Ok(QueryRow {
                dims,
                value: r.get::<_, Option<f64>>(n)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn open_bucket(&self, key: i64) -> Result<Connection> {
        let path = bucket_path(&self.dir, key);
        if !path.is_file() {
            bail!("output bucket {key} not found in {}", self.dir.display());
        }

        Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("opening {}", path.display()))
    }
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info(?1)")
        .context("reading table info")?;
    let names = stmt.query_map([table], |row| row.get::<_, String>(0))?;

    let mut out = Vec::new();
    for name in names {
        out.push(name?);
    }
    Ok(out)
}

fn bucket_path(dir: &Path, key: i64) -> PathBuf {
    dir.join(format!("{FILE_PREFIX}{key}"))
}

fn parse_bucket_file(name: &str) -> Option<i64> {
    let key = name.strip_prefix(FILE_PREFIX)?;
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

fn load_latest(latest: &AtomicI64) -> Option<i64> {
    match latest.load(Ordering::Acquire) {
        NO_BUCKET => None,
        key => Some(key),
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove file");
        }
    }
}
