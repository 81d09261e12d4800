//! Small id-keyed cache with oldest-first eviction

use std::collections::BTreeMap;

/// Holds at most `capacity` entries keyed by frame id.
/// The id passed as `pinned` to [`IdCache::insert`] is never evicted.
#[derive(Debug)]
pub(crate) struct IdCache<T> {
    entries: BTreeMap<u64, T>,
    capacity: usize,
}

impl<T> IdCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            // room for the pinned entry plus the newest one
            capacity: capacity.max(2),
        }
    }

    /// Returns how many entries were pushed out to make room
    pub fn insert(&mut self, id: u64, value: T, pinned: Option<u64>) -> usize {
        self.entries.insert(id, value);
        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            let victim = self.entries.keys().copied().find(|&k| Some(k) != pinned);
            match victim {
                Some(k) => {
                    self.entries.remove(&k);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    pub fn get(&self, id: u64) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Drop everything older than `id`; returns how many entries went
    pub fn remove_below(&mut self, id: u64) -> usize {
        let keep = self.entries.split_off(&id);
        let removed = self.entries.len();
        self.entries = keep;
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
