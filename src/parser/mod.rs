//! Writer file parsing.
//!
//! Scans one family's part of the writer tree for a set of buckets and turns
//! every leaf whose modification time falls inside the requested window into
//! a snapshot row. Per-file failures are contained here: a vanished file is
//! skipped quietly, a corrupt one is logged and skipped.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::system_time_millis;
use crate::protocol::{
    self, Header, Phase, HTTP_DIR, OS_METRICS_FILE, SHARD_OPERATIONS, THREADS_DIR, TMP_DIR,
};
use crate::store::schema::{Family, FamilySchema, THREAD_NAME};
use crate::store::Row;

/// Errors reading a single leaf file.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}: missing header line", path.display())]
    MissingHeader { path: PathBuf },

    #[error("{}: invalid header: {source}", path.display())]
    InvalidHeader {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ParseError {
    /// Whether the file disappeared between listing and reading.
    pub fn is_vanished(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// A parsed leaf: header time plus its `key:value` fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub current_time: i64,
    fields: HashMap<String, String>,
}

impl Leaf {
    pub fn parse(path: &Path, body: &str) -> Result<Self, ParseError> {
        let mut lines = body.lines().skip_while(|l| l.trim().is_empty());

        let header_line = lines.next().ok_or_else(|| ParseError::MissingHeader {
            path: path.to_path_buf(),
        })?;
        let header: Header =
            serde_json::from_str(header_line.trim()).map_err(|source| ParseError::InvalidHeader {
                path: path.to_path_buf(),
                source,
            })?;

        let mut fields = HashMap::new();
        for line in lines {
            // Split at the first colon only; values may contain colons.
            if let Some((k, v)) = line.split_once(':') {
                let key = k.trim();
                if !key.is_empty() {
                    fields.insert(key.to_string(), v.trim().to_string());
                }
            }
        }

        Ok(Self {
            current_time: header.current_time,
            fields,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Numeric field, or `None` when absent or not a finite number.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.get(key)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }

    /// Timestamp field, falling back to the header time.
    pub fn time_or_current(&self, key: &str) -> i64 {
        self.number(key)
            .map(|v| v as i64)
            .unwrap_or(self.current_time)
    }
}

/// Read and parse one leaf file.
pub fn read_leaf(path: &Path) -> Result<Leaf, ParseError> {
    let body = fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    Leaf::parse(path, &body)
}

/// Half-open modification-time window `(after, until]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtimeFilter {
    pub after: i64,
    pub until: i64,
}

impl MtimeFilter {
    pub fn new(after: i64, until: i64) -> Self {
        Self { after, until }
    }

    pub fn accepts(&self, mtime: i64) -> bool {
        mtime > self.after && mtime <= self.until
    }
}

/// Per-scan file counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub parsed: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// Rows produced by one scan.
#[derive(Debug, Default)]
pub struct Parsed {
    pub rows: Vec<Row>,
    /// Newest accepted modification time, the snapshot key for sampled families.
    pub newest_mtime: Option<i64>,
    pub stats: ParseStats,
}

impl Parsed {
    fn accept(&mut self, row: Row, mtime: i64) {
        self.rows.push(row);
        self.newest_mtime = Some(self.newest_mtime.map_or(mtime, |m| m.max(mtime)));
    }
}

/// Stateless scanner over the writer root.
#[derive(Debug, Clone)]
pub struct FileParser {
    root: PathBuf,
}

impl FileParser {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Parse every file of `family` in `buckets` whose mtime passes `filter`.
    pub fn parse(&self, family: Family, buckets: &[i64], filter: MtimeFilter) -> Parsed {
        let mut out = Parsed::default();

        for bucket in buckets {
            let dir = protocol::bucket_dir(&self.root, *bucket);
            match family {
                Family::OsThreads => self.scan_os_threads(&dir, filter, &mut out),
                Family::ShardRequests => self.scan_shard_requests(&dir, filter, &mut out),
                Family::HttpRequests => self.scan_http_requests(&dir, filter, &mut out),
                node => self.scan_node_family(node, &dir, filter, &mut out),
            }
        }

        debug!(
            family = %family,
            rows = out.rows.len(),
            parsed = out.stats.parsed,
            skipped = out.stats.skipped,
            errors = out.stats.errors,
            "parsed writer files",
        );

        out
    }

    fn scan_os_threads(&self, bucket: &Path, filter: MtimeFilter, out: &mut Parsed) {
        let schema = Family::OsThreads.schema();

        for (tid, tid_dir) in thread_dirs(bucket) {
            let path = tid_dir.join(OS_METRICS_FILE);
            let Some((leaf, mtime)) = visit(&path, filter, &mut out.stats) else {
                continue;
            };

            let mut dims = vec![None; schema.dimensions.len()];
            dims[0] = Some(tid);
            dims[1] = leaf.get(THREAD_NAME).map(str::to_string);

            out.accept(Row::new(dims, metric_values(schema, &leaf)), mtime);
        }
    }

    fn scan_shard_requests(&self, bucket: &Path, filter: MtimeFilter, out: &mut Parsed) {
        for (tid, tid_dir) in thread_dirs(bucket) {
            for op in SHARD_OPERATIONS {
                for (rid, rid_dir) in list_dir(&tid_dir.join(op)) {
                    for phase in [Phase::Start, Phase::Finish] {
                        let path = rid_dir.join(phase.file_name());
                        let Some((leaf, mtime)) = visit(&path, filter, &mut out.stats) else {
                            continue;
                        };
                        out.accept(shard_row(&rid, &tid, op, phase, &leaf), mtime);
                    }
                }
            }
        }
    }

    fn scan_http_requests(&self, bucket: &Path, filter: MtimeFilter, out: &mut Parsed) {
        let http_dir = bucket.join(THREADS_DIR).join(HTTP_DIR);

        for (op, op_dir) in list_dir(&http_dir) {
            for (rid, rid_dir) in list_dir(&op_dir) {
                for phase in [Phase::Start, Phase::Finish] {
                    let path = rid_dir.join(phase.file_name());
                    let Some((leaf, mtime)) = visit(&path, filter, &mut out.stats) else {
                        continue;
                    };
                    out.accept(http_row(&rid, &op, phase, &leaf), mtime);
                }
            }
        }
    }

    fn scan_node_family(&self, family: Family, bucket: &Path, filter: MtimeFilter, out: &mut Parsed) {
        let Some(dir_name) = protocol::node_family_dir(family) else {
            return;
        };
        let schema = family.schema();

        for (value, path) in list_dir(&bucket.join(dir_name)) {
            let Some((leaf, mtime)) = visit(&path, filter, &mut out.stats) else {
                continue;
            };
            out.accept(
                Row::new(vec![Some(value)], metric_values(schema, &leaf)),
                mtime,
            );
        }
    }
}

fn shard_row(rid: &str, tid: &str, op: &str, phase: Phase, leaf: &Leaf) -> Row {
    let s = |v: &str| Some(v.to_string());
    match phase {
        Phase::Start => Row::new(
            vec![
                s(rid),
                s(tid),
                s(op),
                leaf.get("index_name").map(str::to_string),
                leaf.get("shard_id").map(str::to_string),
                leaf.get("shard_role").map(str::to_string),
            ],
            vec![
                Some(leaf.time_or_current("start_time") as f64),
                None,
                leaf.number("doc_count"),
            ],
        ),
        Phase::Finish => Row::new(
            vec![s(rid), s(tid), s(op), None, None, None],
            vec![None, Some(leaf.time_or_current("finish_time") as f64), None],
        ),
    }
}

fn http_row(rid: &str, op: &str, phase: Phase, leaf: &Leaf) -> Row {
    let s = |v: &str| Some(v.to_string());
    match phase {
        Phase::Start => Row::new(
            vec![
                s(rid),
                s(op),
                leaf.get("indices").map(str::to_string),
                None,
                None,
            ],
            vec![
                Some(leaf.time_or_current("start_time") as f64),
                None,
                leaf.number("doc_count"),
            ],
        ),
        Phase::Finish => Row::new(
            vec![
                s(rid),
                s(op),
                None,
                leaf.get("status").map(str::to_string),
                leaf.get("exception").map(str::to_string),
            ],
            vec![None, Some(leaf.time_or_current("finish_time") as f64), None],
        ),
    }
}

fn metric_values(schema: &FamilySchema, leaf: &Leaf) -> Vec<Option<f64>> {
    schema.metrics.iter().map(|m| leaf.number(m)).collect()
}

/// Stat, filter and read one leaf. Returns `None` for anything skipped.
fn visit(path: &Path, filter: MtimeFilter, stats: &mut ParseStats) -> Option<(Leaf, i64)> {
    let mtime = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(t) => system_time_millis(t),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "stat failed, skipping");
            stats.skipped += 1;
            return None;
        }
    };

    if !filter.accepts(mtime) {
        stats.skipped += 1;
        return None;
    }

    match read_leaf(path) {
        Ok(leaf) => {
            stats.parsed += 1;
            Some((leaf, mtime))
        }
        Err(e) if e.is_vanished() => {
            debug!(path = %path.display(), "file vanished before read");
            stats.skipped += 1;
            None
        }
        Err(e) => {
            warn!(error = %e, "skipping corrupt metrics file");
            stats.errors += 1;
            None
        }
    }
}

/// Per-thread directories of a bucket, excluding the HTTP and scratch dirs.
fn thread_dirs(bucket: &Path) -> Vec<(String, PathBuf)> {
    list_dir(&bucket.join(THREADS_DIR))
        .into_iter()
        .filter(|(name, path)| name != HTTP_DIR && path.is_dir())
        .collect()
}

/// Entries of `dir` sorted by name. A missing directory is empty; scratch
/// directories are never listed.
fn list_dir(dir: &Path) -> Vec<(String, PathBuf)> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "failed to list directory");
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };

        let name = entry.file_name().to_string_lossy().into_owned();
        if name == TMP_DIR || name.starts_with('.') {
            continue;
        }

        out.push((name, entry.path()));
    }

    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}
