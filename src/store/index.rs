use std::collections::BTreeMap;
use std::ops::Bound;

use anyhow::{bail, Result};

/// Ordered mapping from bucket key to a retained value.
///
/// Keys are the writer's last observed update time (or the reader window
/// start for request snapshots) and must be inserted in strictly
/// increasing order. Trimming removes the oldest prefix.
#[derive(Debug)]
pub struct RetentionIndex<T> {
    entries: BTreeMap<i64, T>,
}

impl<T> RetentionIndex<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Insert a value under a key newer than every key already indexed.
    pub fn insert(&mut self, key: i64, value: T) -> Result<()> {
        if let Some(last) = self.last_key() {
            if key <= last {
                bail!("retention key {key} is not newer than last key {last}");
            }
        }

        self.entries.insert(key, value);

        Ok(())
    }

    pub fn get(&self, key: i64) -> Option<&T> {
        self.entries.get(&key)
    }

    pub fn contains(&self, key: i64) -> bool {
        self.entries.contains_key(&key)
    }

    /// Smallest entry with key `>= key`.
    pub fn ceiling(&self, key: i64) -> Option<(i64, &T)> {
        self.entries.range(key..).next().map(|(k, v)| (*k, v))
    }

    /// Smallest entry with key `> key`.
    pub fn higher(&self, key: i64) -> Option<(i64, &T)> {
        self.entries
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, v)| (*k, v))
    }

    pub fn last_key(&self) -> Option<i64> {
        self.entries.keys().next_back().copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = i64> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove the oldest entries until at most `bound` remain, returning
    /// what was evicted so the caller can release it.
    pub fn trim_to(&mut self, bound: usize) -> Vec<(i64, T)> {
        let mut evicted = Vec::new();

        while self.entries.len() > bound {
            match self.entries.pop_first() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }

        evicted
    }
}

impl<T> Default for RetentionIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}
