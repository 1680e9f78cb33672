//! Short-lived relational snapshots of parsed writer data.
//!
//! Every snapshot is a table in one in-memory SQLite connection owned by
//! the pipeline thread. Tables are named `<family>_<key>`; synthetic
//! (aligned) tables carry an `aligned` infix so they can never collide
//! with a parsed snapshot of the same key.

pub mod index;
pub mod request;
pub mod schema;

use anyhow::{bail, Context, Result};
use rusqlite::types::ToSql;
use rusqlite::{params_from_iter, Connection};

use self::schema::{Family, FamilySchema};

/// Aggregation statistic applied to metric columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Stat {
    Sum,
    Avg,
    Min,
    Max,
}

impl Stat {
    pub const ALL: [Stat; 4] = [Stat::Sum, Stat::Avg, Stat::Min, Stat::Max];

    /// SQL aggregate function name.
    pub const fn sql_fn(self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }

    /// Output column holding this statistic.
    pub const fn column(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

/// One parsed or selected row: dimension values then metric values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub dims: Vec<Option<String>>,
    pub metrics: Vec<Option<f64>>,
}

impl Row {
    pub fn new(dims: Vec<Option<String>>, metrics: Vec<Option<f64>>) -> Self {
        Self { dims, metrics }
    }

    pub fn dim(&self, idx: usize) -> Option<&str> {
        self.dims.get(idx).and_then(|d| d.as_deref())
    }

    pub fn metric(&self, idx: usize) -> Option<f64> {
        self.metrics.get(idx).copied().flatten()
    }
}

/// Handle to one snapshot table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    family: Family,
    key: i64,
    table: String,
}

impl Snapshot {
    pub fn family(&self) -> Family {
        self.family
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn schema(&self) -> &'static FamilySchema {
        self.family.schema()
    }
}

/// Embedded relational store for raw and aligned snapshots.
pub struct SnapshotStore {
    conn: Connection,
}

impl SnapshotStore {
    /// Open an empty in-memory store.
    pub fn open() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory snapshot store")?;

        Ok(Self { conn })
    }

    /// Create the snapshot table for a parsed writer bucket.
    pub fn create(&self, family: Family, key: i64) -> Result<Snapshot> {
        self.create_table(family, key, format!("{}_{}", family.as_str(), table_key(key)))
    }

    /// Create a table for a synthetic snapshot produced by alignment.
    pub fn create_synthetic(&self, family: Family, key: i64) -> Result<Snapshot> {
        self.create_table(
            family,
            key,
            format!("{}_aligned_{}", family.as_str(), table_key(key)),
        )
    }

    fn create_table(&self, family: Family, key: i64, table: String) -> Result<Snapshot> {
        let schema = family.schema();
        let columns: Vec<String> = schema
            .dimensions
            .iter()
            .map(|d| format!("\"{d}\" TEXT"))
            .chain(schema.metrics.iter().map(|m| format!("\"{m}\" REAL")))
            .collect();

        // A leftover table from an aborted cycle is replaced, never appended to.
        let sql = format!(
            "DROP TABLE IF EXISTS \"{table}\"; CREATE TABLE \"{table}\" ({});",
            columns.join(", ")
        );
        self.conn
            .execute_batch(&sql)
            .with_context(|| format!("creating snapshot table {table}"))?;

        Ok(Snapshot { family, key, table })
    }

    /// Insert rows in a single transaction through one cached statement.
    pub fn bulk_insert(&mut self, snap: &Snapshot, rows: &[Row]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let schema = snap.schema();
        for row in rows {
            if row.dims.len() != schema.dimensions.len() || row.metrics.len() != schema.metrics.len()
            {
                bail!(
                    "row shape {}x{} does not match {} schema {}x{}",
                    row.dims.len(),
                    row.metrics.len(),
                    snap.family,
                    schema.dimensions.len(),
                    schema.metrics.len(),
                );
            }
        }

        let placeholders = vec!["?"; schema.width()].join(", ");
        let sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({placeholders})",
            snap.table,
            column_list(schema.dimensions.iter().chain(schema.metrics.iter())),
        );

        let tx = self
            .conn
            .transaction()
            .context("starting snapshot insert transaction")?;
        {
            let mut stmt = tx
                .prepare_cached(&sql)
                .with_context(|| format!("preparing insert into {}", snap.table))?;
            for row in rows {
                let values = row
                    .dims
                    .iter()
                    .map(|d| d as &dyn ToSql)
                    .chain(row.metrics.iter().map(|m| m as &dyn ToSql));
                stmt.execute(params_from_iter(values))
                    .with_context(|| format!("inserting into {}", snap.table))?;
            }
        }
        tx.commit()
            .with_context(|| format!("committing insert into {}", snap.table))?;

        Ok(rows.len())
    }

    /// Group by `dimensions` and apply `stat` to each of `metrics`.
    ///
    /// Returned rows carry the grouped dimensions and the aggregated metrics
    /// in the order requested.
    pub fn select_aggregate(
        &self,
        snap: &Snapshot,
        dimensions: &[&str],
        stat: Stat,
        metrics: &[&str],
    ) -> Result<Vec<Row>> {
        let schema = snap.schema();
        for d in dimensions {
            if schema.dimension_index(d).is_none() {
                bail!("{} has no dimension {d}", snap.family);
            }
        }
        for m in metrics {
            if schema.metric_index(m).is_none() {
                bail!("{} has no metric {m}", snap.family);
            }
        }

        let select: Vec<String> = dimensions
            .iter()
            .map(|d| format!("\"{d}\""))
            .chain(
                metrics
                    .iter()
                    .map(|m| format!("{}(\"{m}\")", stat.sql_fn())),
            )
            .collect();

        let mut sql = format!("SELECT {} FROM \"{}\"", select.join(", "), snap.table);
        if !dimensions.is_empty() {
            let group = column_list(dimensions.iter());
            sql.push_str(&format!(" GROUP BY {group} ORDER BY {group}"));
        }

        self.query_rows(&sql, &[], dimensions.len(), metrics.len())
    }

    /// Every row whose `dimension` equals `value`, in full schema layout.
    pub fn select_by_dimension_equals(
        &self,
        snap: &Snapshot,
        dimension: &str,
        value: &str,
    ) -> Result<Vec<Row>> {
        let schema = snap.schema();
        if schema.dimension_index(dimension).is_none() {
            bail!("{} has no dimension {dimension}", snap.family);
        }

        let sql = format!(
            "SELECT {} FROM \"{}\" WHERE \"{dimension}\" = ?1",
            column_list(schema.dimensions.iter().chain(schema.metrics.iter())),
            snap.table,
        );

        self.query_rows(
            &sql,
            &[&value as &dyn ToSql],
            schema.dimensions.len(),
            schema.metrics.len(),
        )
    }

    /// Every row of a snapshot, in full schema layout.
    pub fn select_all(&self, snap: &Snapshot) -> Result<Vec<Row>> {
        let schema = snap.schema();
        let sql = format!(
            "SELECT {} FROM \"{}\"",
            column_list(schema.dimensions.iter().chain(schema.metrics.iter())),
            snap.table,
        );

        self.query_rows(&sql, &[], schema.dimensions.len(), schema.metrics.len())
    }

    pub fn row_count(&self, snap: &Snapshot) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", snap.table);
        let count: i64 = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .with_context(|| format!("counting rows of {}", snap.table))?;

        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Fill `target` with the weighted blend of `sources`, grouped by the
    /// full dimension tuple.
    ///
    /// Each source is first collapsed to one averaged row per tuple, so a
    /// side carries one weight however many samples it holds. Each metric
    /// then becomes `Σ(value × weight) / Σ(weight)` over the sources holding
    /// a non-null value for that tuple, so a tuple seen on one side only
    /// keeps that side's value.
    pub fn blend_into(&mut self, target: &Snapshot, sources: &[(&Snapshot, f64)]) -> Result<usize> {
        let schema = target.schema();
        if sources.is_empty() {
            return Ok(0);
        }
        if let Some((s, _)) = sources.iter().find(|(s, _)| s.family != target.family) {
            bail!("cannot blend {} into {}", s.family, target.family);
        }

        let dims = column_list(schema.dimensions.iter());
        let all = column_list(schema.dimensions.iter().chain(schema.metrics.iter()));

        let averages: Vec<String> = schema
            .metrics
            .iter()
            .map(|m| format!("AVG(\"{m}\") AS \"{m}\""))
            .collect();
        let averaged = format!("{dims}, {}", averages.join(", "));

        let union: Vec<String> = sources
            .iter()
            .enumerate()
            .map(|(i, (s, _))| {
                format!(
                    "SELECT {averaged}, ?{} AS w FROM \"{}\" GROUP BY {dims}",
                    i + 1,
                    s.table
                )
            })
            .collect();

        let blended: Vec<String> = schema
            .metrics
            .iter()
            .map(|m| {
                format!(
                    "SUM(\"{m}\" * w) / SUM(CASE WHEN \"{m}\" IS NULL THEN 0 ELSE w END)"
                )
            })
            .collect();

        let sql = format!(
            "INSERT INTO \"{}\" ({all}) SELECT {dims}, {} FROM ({}) GROUP BY {dims}",
            target.table,
            blended.join(", "),
            union.join(" UNION ALL "),
        );

        let tx = self
            .conn
            .transaction()
            .context("starting blend transaction")?;
        let inserted = tx
            .execute(&sql, params_from_iter(sources.iter().map(|(_, w)| *w)))
            .with_context(|| format!("blending into {}", target.table))?;
        tx.commit().context("committing blend")?;

        Ok(inserted)
    }

    /// Drop a snapshot table.
    pub fn dispose(&self, snap: Snapshot) -> Result<()> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS \"{}\"", snap.table))
            .with_context(|| format!("dropping snapshot table {}", snap.table))
    }

    /// Number of tables currently held, parsed and synthetic.
    pub fn table_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .context("counting snapshot tables")?;

        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn query_rows(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
        n_dims: usize,
        n_metrics: usize,
    ) -> Result<Vec<Row>> {
        let mut stmt = self
            .conn
            .prepare_cached(sql)
            .with_context(|| format!("preparing query: {sql}"))?;

        let rows = stmt.query_map(params, |r| {
            let mut dims = Vec::with_capacity(n_dims);
            for i in 0..n_dims {
                dims.push(r.get::<_, Option<String>>(i)?);
            }
            let mut metrics = Vec::with_capacity(n_metrics);
            for i in 0..n_metrics {
                metrics.push(r.get::<_, Option<f64>>(n_dims + i)?);
            }
            Ok(Row { dims, metrics })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }

        Ok(result)
    }
}

fn column_list<S: AsRef<str>>(names: impl Iterator<Item = S>) -> String {
    names
        .map(|n| format!("\"{}\"", n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn table_key(key: i64) -> String {
    if key < 0 {
        format!("m{}", key.unsigned_abs())
    } else {
        key.to_string()
    }
}
