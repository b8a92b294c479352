//! Candle cache keyed by opening timestamp

use std::collections::{HashMap, HashSet, VecDeque};

use super::{normalize_max_size, HasTimestamp};

/// Rolling cache of OHLCV-style bars
///
/// A bar whose timestamp is already cached is merged into the stored entry
/// instead of being appended again, so an in-progress candle is updated tick
/// by tick in its original position.
#[derive(Debug, Clone)]
pub struct ArrayCacheByTimestamp<T> {
    items: VecDeque<T>,
    max_size: Option<usize>,
    /// timestamp -> absolute sequence number of the stored bar
    hashmap: HashMap<i64, u64>,
    /// sequence number of `items[0]`
    head: u64,
    /// distinct timestamps touched since the last clear
    size_tracker: HashSet<i64>,
    new_updates: usize,
    clear_updates: bool,
}

impl<T: HasTimestamp> ArrayCacheByTimestamp<T> {
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            max_size: normalize_max_size(max_size),
            hashmap: HashMap::new(),
            head: 0,
            size_tracker: HashSet::new(),
            new_updates: 0,
            clear_updates: false,
        }
    }

    pub fn append(&mut self, item: T) {
        let timestamp = item.timestamp();
        match self.hashmap.get(&timestamp) {
            Some(&seq) => {
                let position = (seq - self.head) as usize;
                if let Some(existing) = self.items.get_mut(position) {
                    existing.merge(item);
                }
            }
            None => {
                if self.max_size.is_some_and(|max| self.items.len() >= max) {
                    if let Some(evicted) = self.items.pop_front() {
                        self.hashmap.remove(&evicted.timestamp());
                    }
                    self.head += 1;
                }
                self.hashmap
                    .insert(timestamp, self.head + self.items.len() as u64);
                self.items.push_back(item);
            }
        }

        if self.clear_updates {
            self.clear_updates = false;
            self.size_tracker.clear();
        }
        self.size_tracker.insert(timestamp);
        self.new_updates = self.size_tracker.len();
    }

    /// Number of distinct bars touched since the last read, capped by `limit`
    pub fn get_limit(&mut self, _symbol: Option<&str>, limit: Option<usize>) -> Option<usize> {
        self.clear_updates = true;
        Some(limit.map_or(self.new_updates, |limit| limit.min(self.new_updates)))
    }

    pub fn get_by_timestamp(&self, timestamp: i64) -> Option<&T> {
        let seq = *self.hashmap.get(&timestamp)?;
        self.items.get((seq - self.head) as usize)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.hashmap.clear();
        self.head = 0;
        self.size_tracker.clear();
        self.new_updates = 0;
        self.clear_updates = false;
    }
}

impl<T> ArrayCacheByTimestamp<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }
}

impl<T: Clone> ArrayCacheByTimestamp<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}
