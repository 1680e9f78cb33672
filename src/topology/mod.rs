//! Cluster topology feed.
//!
//! Periodically reloads a JSON list of cluster nodes so a cluster-level
//! reader can merge metrics across nodes. A failed reload keeps the last
//! known list.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

/// One cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeDetails {
    pub id: String,
    pub address: String,
}

/// Shared, read-only view of the last loaded node list.
#[derive(Debug, Clone, Default)]
pub struct TopologyHandle {
    nodes: Arc<RwLock<Vec<NodeDetails>>>,
}

impl TopologyHandle {
    pub fn nodes(&self) -> Vec<NodeDetails> {
        self.nodes.read().clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

/// Refreshes the node list from a file on its own interval.
#[derive(Debug)]
pub struct TopologyFeed {
    path: PathBuf,
    refresh_ms: i64,
    last_refresh: Option<i64>,
    handle: TopologyHandle,
}

impl TopologyFeed {
    pub fn new(path: &Path, refresh_interval: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            refresh_ms: i64::try_from(refresh_interval.as_millis()).unwrap_or(i64::MAX),
            last_refresh: None,
            handle: TopologyHandle::default(),
        }
    }

    pub fn handle(&self) -> TopologyHandle {
        self.handle.clone()
    }

    /// Reload if the refresh interval elapsed since the last attempt.
    /// Returns whether a reload was attempted.
    pub fn refresh_if_due(&mut self, now: i64) -> bool {
        if let Some(last) = self.last_refresh {
            if now - last < self.refresh_ms {
                return false;
            }
        }

        self.last_refresh = Some(now);
        if let Err(e) = self.refresh() {
            warn!(
                path = %self.path.display(),
                error = %e,
                nodes = self.handle.len(),
                "topology refresh failed, keeping last known nodes",
            );
        }

        true
    }

    /// Reload the node list, replacing it only on success.
    pub fn refresh(&self) -> Result<usize> {
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading topology file {}", self.path.display()))?;
        let nodes: Vec<NodeDetails> = serde_json::from_str(&data)
            .with_context(|| format!("parsing topology file {}", self.path.display()))?;

        let count = nodes.len();
        *self.handle.nodes.write() = nodes;

        debug!(nodes = count, "topology refreshed");

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_keeps_last_list_on_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nodes.json");
        std::fs::write(
            &path,
            r#"[{"id": "n1", "address": "10.0.0.1"}, {"id": "n2", "address": "10.0.0.2"}]"#,
        )
        .expect("write");

        let mut feed = TopologyFeed::new(&path, Duration::from_secs(60));
        let handle = feed.handle();
        assert!(feed.refresh_if_due(0));
        assert_eq!(handle.len(), 2);
        assert_eq!(handle.nodes()[1].address, "10.0.0.2");

        std::fs::write(&path, "{ not json").expect("write");
        assert!(feed.refresh().is_err());
        assert!(feed.refresh_if_due(60_000));
        assert_eq!(handle.len(), 2);

        std::fs::remove_file(&path).expect("remove");
        assert!(feed.refresh_if_due(120_000));
        assert_eq!(handle.nodes()[0].id, "n1");
    }

    #[test]
    fn test_refresh_if_due_respects_interval() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nodes.json");
        std::fs::write(&path, "[]").expect("write");

        let mut feed = TopologyFeed::new(&path, Duration::from_secs(10));
        assert!(feed.refresh_if_due(1_000));
        assert!(!feed.refresh_if_due(5_000));
        assert!(feed.refresh_if_due(11_000));
        assert!(feed.handle().is_empty());
    }
}
