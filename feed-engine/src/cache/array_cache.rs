//! Append-only cache for trade-like items

use std::collections::VecDeque;

use super::tracker::UpdateTracker;
use super::{normalize_max_size, CacheItem};

#[derive(Debug, Clone)]
pub struct ArrayCache<T> {
    items: VecDeque<T>,
    max_size: Option<usize>,
    updates: UpdateTracker,
}

impl<T: CacheItem> ArrayCache<T> {
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            max_size: normalize_max_size(max_size),
            updates: UpdateTracker::default(),
        }
    }

    /// Push an item, evicting the oldest one when full
    pub fn append(&mut self, item: T) {
        if self.max_size.is_some_and(|max| self.items.len() >= max) {
            self.items.pop_front();
        }
        self.updates.record(item.symbol(), None);
        self.items.push_back(item);
    }

    /// Number of items to hand to a reader of `symbol` (or of every symbol)
    ///
    /// Falls back to `limit` when the partition has never been written.
    pub fn get_limit(&mut self, symbol: Option<&str>, limit: Option<usize>) -> Option<usize> {
        self.updates.get_limit(symbol, limit)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.updates.clear();
    }
}

impl<T> ArrayCache<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    /// Oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }
}

impl<T: Clone> ArrayCache<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    /// The newest `n` items, oldest first
    pub fn tail(&self, n: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }
}
