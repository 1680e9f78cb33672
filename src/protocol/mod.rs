//! On-disk layout shared with the metrics writer.
//!
//! ```text
//! <root>/<bucket>/threads/<tid>/os_metrics
//! <root>/<bucket>/threads/<tid>/<shard op>/<rid>/{start,finish}
//! <root>/<bucket>/threads/http/<op>/<rid>/{start,finish}
//! <root>/<bucket>/<node family dir>/<dimension value>
//! ```
//!
//! `<bucket>` is the decimal epoch-millisecond floor of the write time to
//! the rotation interval. Every leaf starts with a JSON header line
//! `{"current_time": <ms>}` followed by `key:value` lines.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::store::schema::Family;

pub const THREADS_DIR: &str = "threads";
pub const HTTP_DIR: &str = "http";
pub const OS_METRICS_FILE: &str = "os_metrics";
pub const START_FILE: &str = "start";
pub const FINISH_FILE: &str = "finish";

/// Scratch directory the writer stages files in before renaming them.
pub const TMP_DIR: &str = "tmp";

/// First line of every leaf file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Writer sample time in epoch milliseconds.
    pub current_time: i64,
}

/// Shard-level operations tracked per thread.
pub const SHARD_OPERATIONS: [&str; 3] = ["shardbulk", "shardquery", "shardfetch"];

/// Lifecycle half of a request event file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Finish,
}

impl Phase {
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Start => START_FILE,
            Self::Finish => FINISH_FILE,
        }
    }
}

/// Directory holding one file per dimension value for node families.
pub const fn node_family_dir(family: Family) -> Option<&'static str> {
    match family {
        Family::Disk => Some("disk_metrics"),
        Family::Tcp => Some("tcp_metrics"),
        Family::CircuitBreaker => Some("circuit_breaker"),
        Family::ThreadPool => Some("thread_pool"),
        Family::Heap => Some("heap_metrics"),
        Family::OsThreads | Family::ShardRequests | Family::HttpRequests => None,
    }
}

/// Directory of one writer bucket.
pub fn bucket_dir(root: &Path, bucket: i64) -> PathBuf {
    root.join(bucket.to_string())
}

/// Parse a bucket directory name back into its key.
pub fn parse_bucket_name(name: &str) -> Option<i64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// Relative path of a thread's OS metrics file.
pub fn os_metrics_path(tid: &str) -> PathBuf {
    [THREADS_DIR, tid, OS_METRICS_FILE].iter().collect()
}

/// Relative path of one half of a shard request event.
pub fn shard_event_path(tid: &str, operation: &str, rid: &str, phase: Phase) -> PathBuf {
    [THREADS_DIR, tid, operation, rid, phase.file_name()]
        .iter()
        .collect()
}

/// Relative path of one half of an HTTP request event.
pub fn http_event_path(operation: &str, rid: &str, phase: Phase) -> PathBuf {
    [THREADS_DIR, HTTP_DIR, operation, rid, phase.file_name()]
        .iter()
        .collect()
}

/// Relative path of a node family file.
pub fn node_metrics_path(family: Family, dimension: &str) -> Option<PathBuf> {
    node_family_dir(family).map(|dir| [dir, dimension].iter().collect())
}

/// Render a leaf body: header line then one `key:value` line per field.
pub fn render_leaf(current_time: i64, fields: &[(&str, String)]) -> Result<String> {
    let mut body = serde_json::to_string(&Header { current_time }).context("encoding leaf header")?;
    for (k, v) in fields {
        body.push('\n');
        body.push_str(k);
        body.push(':');
        body.push_str(v);
    }
    body.push('\n');
    Ok(body)
}

/// Write a leaf into a bucket the way the writer does: stage it in the
/// bucket's scratch directory, then rename it into place.
pub fn write_leaf(bucket: &Path, relative: &Path, body: &str) -> Result<PathBuf> {
    let target = bucket.join(relative);
    let parent = target
        .parent()
        .with_context(|| format!("leaf path {} has no parent", target.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;

    let scratch = bucket.join(TMP_DIR);
    fs::create_dir_all(&scratch).with_context(|| format!("creating {}", scratch.display()))?;

    let staged_name = relative.to_string_lossy().replace(['/', '\\'], "_");
    let staged = scratch.join(format!("{staged_name}.{}", std::process::id()));

    let mut file =
        fs::File::create(&staged).with_context(|| format!("creating {}", staged.display()))?;
    file.write_all(body.as_bytes())
        .with_context(|| format!("writing {}", staged.display()))?;
    drop(file);

    fs::rename(&staged, &target)
        .with_context(|| format!("renaming {} to {}", staged.display(), target.display()))?;

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        assert_eq!(
            shard_event_path("42", "shardbulk", "r-1", Phase::Finish),
            PathBuf::from("threads/42/shardbulk/r-1/finish")
        );
        assert_eq!(
            http_event_path("search", "h-9", Phase::Start),
            PathBuf::from("threads/http/search/h-9/start")
        );
        assert_eq!(
            node_metrics_path(Family::ThreadPool, "search"),
            Some(PathBuf::from("thread_pool/search"))
        );
        assert!(node_metrics_path(Family::OsThreads, "x").is_none());
    }

    #[test]
    fn test_parse_bucket_name() {
        assert_eq!(parse_bucket_name("1700000005000"), Some(1_700_000_005_000));
        assert_eq!(parse_bucket_name("tmp"), None);
        assert_eq!(parse_bucket_name("-5"), None);
        assert_eq!(parse_bucket_name(""), None);
    }

    #[test]
    fn test_render_leaf() {
        let body = render_leaf(1_000, &[("thread_name", "x:y".to_string())]).expect("render");
        assert_eq!(body, "{\"current_time\":1000}\nthread_name:x:y\n");
    }

    #[test]
    fn test_write_leaf_leaves_no_scratch_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = write_leaf(dir.path(), &os_metrics_path("7"), "{\"current_time\":1}\n")
            .expect("write");

        assert!(target.ends_with("threads/7/os_metrics"));
        assert!(target.exists());
        let leftovers = fs::read_dir(dir.path().join(TMP_DIR))
            .expect("scratch dir")
            .count();
        assert_eq!(leftovers, 0);
    }
}
