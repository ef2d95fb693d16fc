//! In-memory translation stores.
//!
//! [`TranslationIndex`] is the primary store from pre-NAT origin endpoint to
//! reply-tuple translation. [`ShortLivedBuffer`] retains translations for
//! flows destroyed very recently, so a consumer that observes a socket
//! closing after the kernel has already fired the destroy event can still
//! resolve it. Both are owned by the tracker engine and accessed under its
//! lock.

use crate::generation::{current_generation, nth_generation, EXPIRY_GENERATIONS};
use conntrack_types::{ConnKey, Translation};
use std::collections::{HashMap, VecDeque};

/// A translation plus the generation at which it becomes eligible for
/// eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub translation: Translation,
    pub exp_generation: u8,
}

/// Primary associative store with a hard capacity.
///
/// Overflow is rejected at the registration boundary, never evicted: a full
/// index stays full until compaction or destroy events make room.
#[derive(Debug)]
pub struct TranslationIndex {
    entries: HashMap<ConnKey, IndexEntry>,
    max_size: usize,
}

impl TranslationIndex {
    pub fn new(max_size: usize) -> Self {
        TranslationIndex {
            entries: HashMap::new(),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Store or overwrite the entry for `key`.
    ///
    /// Returns false without storing when the index is at capacity and the
    /// key is not already present. Overwrites of resident keys always
    /// succeed, so a full index keeps refreshing the flows it already
    /// tracks.
    pub fn insert(&mut self, key: ConnKey, entry: IndexEntry) -> bool {
        if self.entries.len() >= self.max_size && !self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, entry);
        true
    }

    /// Remove and return the entry for `key`.
    pub fn remove(&mut self, key: &ConnKey) -> Option<IndexEntry> {
        self.entries.remove(key)
    }

    /// Look up the translation for `key`, pushing the entry's expiry
    /// `EXPIRY_GENERATIONS` into the future so actively queried flows are
    /// not dropped by compaction.
    pub fn lookup(&mut self, key: &ConnKey, now_nanos: u64) -> Option<Translation> {
        let entry = self.entries.get_mut(key)?;
        entry.exp_generation = nth_generation(now_nanos, EXPIRY_GENERATIONS);
        Some(entry.translation)
    }

    /// Drop every entry whose expiry generation has come due. Returns the
    /// number of entries dropped.
    ///
    /// A pure in-memory pass: the caller holds the engine lock for the
    /// duration, which is bounded by the index capacity.
    pub fn compact(&mut self, now_nanos: u64) -> u64 {
        let gen = current_generation(now_nanos);
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.exp_generation != gen);
        (before - self.entries.len()) as u64
    }

    #[cfg(test)]
    pub fn contains(&self, key: &ConnKey) -> bool {
        self.entries.contains_key(key)
    }
}

/// Fixed-capacity secondary store for translations of recently destroyed
/// flows. Displacement is FIFO: once full, admitting a newly destroyed
/// flow drops the oldest retained translation.
#[derive(Debug)]
pub struct ShortLivedBuffer {
    entries: HashMap<ConnKey, Translation>,
    order: VecDeque<ConnKey>,
    capacity: usize,
}

impl ShortLivedBuffer {
    pub fn new(capacity: usize) -> Self {
        ShortLivedBuffer {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retain a translation for a just-destroyed flow. Returns true when an
    /// older translation was displaced to make room.
    pub fn insert(&mut self, key: ConnKey, translation: Translation) -> bool {
        let mut evicted = false;
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.capacity {
                // The order queue may hold keys already removed out of
                // band; keep popping until a resident one goes.
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                if self.entries.remove(&oldest).is_some() {
                    evicted = true;
                }
            }
            self.order.push_back(key);
        }
        self.entries.insert(key, translation);
        evicted
    }

    pub fn lookup(&self, key: &ConnKey) -> Option<Translation> {
        self.entries.get(key).copied()
    }

    /// Forget a key, typically because the flow came back to life and was
    /// re-registered in the primary index.
    pub fn remove(&mut self, key: &ConnKey) -> Option<Translation> {
        self.entries.remove(key)
    }

    /// Empty the buffer. Called by the consumer at the end of each of its
    /// sampling windows once pending socket closures have been resolved.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
