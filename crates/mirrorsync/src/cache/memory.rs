//! In-memory cache tier.
//!
//! A bounded LRU map with per-entry TTL. Lookup, insert and eviction are
//! all O(1) amortized; the whole tier sits behind one mutex because entries
//! are small and the critical sections are short.

use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    payload: serde_json::Value,
    stored_at: Instant,
    ttl: Duration,
    /// Generation counter for O(1) LRU bookkeeping.
    touched: u64,
}

/// Bounded LRU + TTL map. A bound of 0 means unbounded.
pub struct MemoryTier {
    entries: HashMap<String, Entry>,
    max_entries: usize,
    clock: u64,
}

impl MemoryTier {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(max_entries.min(1024)),
            max_entries,
            clock: 0,
        }
    }

    /// Look up a fingerprint. Expired entries are removed and count as a
    /// miss. A hit refreshes the entry's LRU position.
    pub fn get(&mut self, fingerprint: &str) -> Option<serde_json::Value> {
        let expired = match self.entries.get(fingerprint) {
            Some(entry) => entry.stored_at.elapsed() >= entry.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(fingerprint);
            return None;
        }
        self.clock += 1;
        let entry = self.entries.get_mut(fingerprint)?;
        entry.touched = self.clock;
        Some(entry.payload.clone())
    }

    /// Insert or replace an entry, evicting the least recently used entry
    /// if the tier is full.
    pub fn put(&mut self, fingerprint: String, payload: serde_json::Value, ttl: Duration) {
        self.clock += 1;
        if self.max_entries > 0
            && !self.entries.contains_key(&fingerprint)
            && self.entries.len() >= self.max_entries
        {
            self.evict_lru();
        }
        self.entries.insert(
            fingerprint,
            Entry {
                payload,
                stored_at: Instant::now(),
                ttl,
                touched: self.clock,
            },
        );
    }

    /// Insert only if absent, preserving the fresher entry already present.
    /// Used by preload so live traffic wins over startup warming.
    pub fn put_if_absent(&mut self, fingerprint: String, payload: serde_json::Value, ttl: Duration) {
        if !self.entries.contains_key(&fingerprint) {
            self.put(fingerprint, payload, ttl);
        }
    }

    /// Drop an entry. Returns whether one was present.
    pub fn remove(&mut self, fingerprint: &str) -> bool {
        self.entries.remove(fingerprint).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_lru(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.touched)
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}
