//! Per-stream buffer of records that may still join.
//!
//! Entries are kept in insertion order and indexed by every correlation key
//! other streams probe them with. Memory is bounded by a retention window
//! (time based) and by an optional entry capacity (FIFO eviction).

use crate::core::StreamRecord;
use crate::expression::CorrelationKey;
use crate::topology::IndexId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Identifier of a buffered entry. Ids grow with insertion order.
pub type EntryId = u64;

/// A buffered record with its join bookkeeping.
#[derive(Debug, Clone)]
pub struct BufferedEntry {
    pub id: EntryId,
    pub record: Arc<StreamRecord>,
    /// Correlation keys under which this entry is indexed.
    pub keys: Vec<(IndexId, CorrelationKey)>,
    /// Number of tuples this record took part in.
    pub emitted: u64,
    pub inserted_at: i64,
}

impl BufferedEntry {
    pub fn new(
        id: EntryId,
        record: Arc<StreamRecord>,
        keys: Vec<(IndexId, CorrelationKey)>,
        inserted_at: i64,
    ) -> Self {
        Self { id, record, keys, emitted: 0, inserted_at }
    }

    pub fn key(&self, index: IndexId) -> Option<&CorrelationKey> {
        self.keys.iter().find(|(id, _)| *id == index).map(|(_, key)| key)
    }

    pub fn is_matched(&self) -> bool {
        self.emitted > 0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub inserted: u64,
    pub expired: u64,
    /// Entries dropped by the capacity safety valve.
    pub evicted: u64,
    pub removed: u64,
}

#[derive(Debug)]
pub struct WindowBuffer {
    stream: String,
    window: Option<u64>,
    capacity: Option<usize>,
    entries: BTreeMap<EntryId, BufferedEntry>,
    index: HashMap<IndexId, HashMap<CorrelationKey, Vec<EntryId>>>,
    stats: BufferStats,
}

impl WindowBuffer {
    pub fn new(stream: &str, window: Option<u64>, capacity: Option<usize>) -> Self {
        WindowBuffer {
            stream: stream.to_string(),
            window,
            capacity,
            entries: BTreeMap::new(),
            index: HashMap::new(),
            stats: BufferStats::default(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn window(&self) -> Option<u64> {
        self.window
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &BufferedEntry> {
        self.entries.values()
    }

    pub fn get(&self, id: EntryId) -> Option<&BufferedEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut BufferedEntry> {
        self.entries.get_mut(&id)
    }

    /// Insert an entry under each of its keys. Returns the entries evicted to
    /// stay within capacity, oldest first.
    pub fn insert(&mut self, entry: BufferedEntry) -> Vec<BufferedEntry> {
        debug_assert!(
            self.entries.values().next_back().map_or(true, |last| last.id < entry.id
                && last.inserted_at <= entry.inserted_at),
            "entries must be inserted in id and time order"
        );

        for (index_id, key) in &entry.keys {
            self.index
                .entry(*index_id)
                .or_default()
                .entry(key.clone())
                .or_default()
                .push(entry.id);
        }
        self.entries.insert(entry.id, entry);
        self.stats.inserted += 1;

        let mut evicted = Vec::new();
        if let Some(capacity) = self.capacity {
            while self.entries.len() > capacity {
                match self.pop_oldest() {
                    Some(oldest) => evicted.push(oldest),
                    None => break,
                }
            }
        }
        self.stats.evicted += evicted.len() as u64;
        evicted
    }

    /// Entries indexed under `key` for `index`, oldest first.
    pub fn lookup(&self, index: IndexId, key: &CorrelationKey) -> Vec<&BufferedEntry> {
        self.index
            .get(&index)
            .and_then(|keys| keys.get(key))
            .map(|ids| ids.iter().filter_map(|id| self.entries.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, id: EntryId) -> Option<BufferedEntry> {
        let entry = self.entries.remove(&id)?;
        self.unindex(&entry);
        self.stats.removed += 1;
        Some(entry)
    }

    /// Remove every entry with `now - inserted_at > window_duration`.
    pub fn expire(&mut self, now: i64, window_duration: u64) -> Vec<BufferedEntry> {
        let window = i64::try_from(window_duration).unwrap_or(i64::MAX);
        let mut expired = Vec::new();

        // Insertion times never decrease, so expired entries form a prefix.
        while let Some(oldest) = self.entries.values().next() {
            if now.saturating_sub(oldest.inserted_at) <= window {
                break;
            }
            match self.pop_oldest() {
                Some(entry) => expired.push(entry),
                None => break,
            }
        }

        self.stats.expired += expired.len() as u64;
        expired
    }

    /// Expire against this buffer's own window, if it has one.
    pub fn expire_due(&mut self, now: i64) -> Vec<BufferedEntry> {
        match self.window {
            Some(window) => self.expire(now, window),
            None => Vec::new(),
        }
    }

    /// Remove everything, oldest first.
    pub fn take_all(&mut self) -> Vec<BufferedEntry> {
        self.index.clear();
        let entries = std::mem::take(&mut self.entries);
        self.stats.removed += entries.len() as u64;
        entries.into_values().collect()
    }

    /// Move every entry's insertion time to `at`. Used once, when the clock
    /// starts after entries were already buffered.
    pub(crate) fn restamp(&mut self, at: i64) {
        for entry in self.entries.values_mut() {
            entry.inserted_at = at;
        }
    }

    fn pop_oldest(&mut self) -> Option<BufferedEntry> {
        let (_, entry) = self.entries.pop_first()?;
        self.unindex(&entry);
        Some(entry)
    }

    fn unindex(&mut self, entry: &BufferedEntry) {
        for (index_id, key) in &entry.keys {
            if let Some(keys) = self.index.get_mut(index_id) {
                if let Some(ids) = keys.get_mut(key) {
                    ids.retain(|id| *id != entry.id);
                    if ids.is_empty() {
                        keys.remove(key);
                    }
                }
            }
        }
    }
}
