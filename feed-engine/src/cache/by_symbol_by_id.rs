//! Open-orders cache keyed by `(symbol, id)`

use std::collections::{HashMap, HashSet, VecDeque};

use super::tracker::UpdateTracker;
use super::{normalize_max_size, CacheItem, HasId, Merge};

/// Cache where each `(symbol, key)` pair is stored once and the most recently
/// touched entry sits at the end
#[derive(Debug, Clone)]
pub(crate) struct SymbolKeyedCache<T> {
    items: VecDeque<T>,
    max_size: Option<usize>,
    /// symbol -> keys present in `items`
    hashmap: HashMap<String, HashSet<String>>,
    updates: UpdateTracker,
    key: fn(&T) -> &str,
}

fn symbol_of<T: CacheItem>(item: &T) -> &str {
    item.symbol().unwrap_or_default()
}

impl<T: CacheItem + Merge> SymbolKeyedCache<T> {
    pub(crate) fn new(max_size: Option<usize>, key: fn(&T) -> &str) -> Self {
        Self {
            items: VecDeque::new(),
            max_size: normalize_max_size(max_size),
            hashmap: HashMap::new(),
            updates: UpdateTracker::default(),
            key,
        }
    }

    pub(crate) fn append(&mut self, item: T) {
        let key_of = self.key;
        let symbol = symbol_of(&item).to_string();
        let key = key_of(&item).to_string();

        let known = self
            .hashmap
            .get(&symbol)
            .is_some_and(|keys| keys.contains(&key));
        let existing = if known {
            self.items
                .iter()
                .position(|x| symbol_of(x) == symbol && key_of(x) == key)
                .and_then(|position| self.items.remove(position))
        } else {
            None
        };

        let item = match existing {
            Some(mut stored) => {
                stored.merge(item);
                stored
            }
            None => {
                self.hashmap
                    .entry(symbol.clone())
                    .or_default()
                    .insert(key.clone());
                item
            }
        };

        if self.max_size.is_some_and(|max| self.items.len() >= max) {
            if let Some(evicted) = self.items.pop_front() {
                if let Some(keys) = self.hashmap.get_mut(symbol_of(&evicted)) {
                    keys.remove(key_of(&evicted));
                }
            }
        }
        self.items.push_back(item);
        self.updates.record(Some(&symbol), Some(&key));
    }

    pub(crate) fn get_limit(&mut self, symbol: Option<&str>, limit: Option<usize>) -> Option<usize> {
        self.updates.get_limit(symbol, limit)
    }

    pub(crate) fn get(&self, symbol: &str, key: &str) -> Option<&T> {
        let key_of = self.key;
        self.items
            .iter()
            .find(|x| symbol_of(*x) == symbol && key_of(*x) == key)
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
        self.hashmap.clear();
        self.updates.clear();
    }

    pub(crate) fn items(&self) -> &VecDeque<T> {
        &self.items
    }

    pub(crate) fn max_size(&self) -> Option<usize> {
        self.max_size
    }
}

/// Orders (or any id-keyed item) ordered by most recent activity
#[derive(Debug, Clone)]
pub struct ArrayCacheBySymbolById<T> {
    inner: SymbolKeyedCache<T>,
}

impl<T: HasId> ArrayCacheBySymbolById<T> {
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            inner: SymbolKeyedCache::new(max_size, T::id),
        }
    }

    /// Insert a new item, or merge into the stored one and move it to the end
    pub fn append(&mut self, item: T) {
        self.inner.append(item);
    }

    /// Distinct ids touched since the last read of `symbol`
    pub fn get_limit(&mut self, symbol: Option<&str>, limit: Option<usize>) -> Option<usize> {
        self.inner.get_limit(symbol, limit)
    }

    pub fn get(&self, symbol: &str, id: &str) -> Option<&T> {
        self.inner.get(symbol, id)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items().is_empty()
    }

    pub fn max_size(&self) -> Option<usize> {
        self.inner.max_size()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.inner.items().iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.inner.items().back()
    }
}

impl<T: HasId + Clone> ArrayCacheBySymbolById<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.inner.items().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Order;

    fn order(id: &str, status: Option<&str>) -> Order {
        Order {
            id: id.to_string(),
            symbol: "X".to_string(),
            status: status.map(str::to_string),
            ..Default::default()
        }
    }

    fn ids(cache: &ArrayCacheBySymbolById<Order>) -> Vec<String> {
        cache.iter().map(|o| o.id.clone()).collect()
    }

    #[test]
    fn test_update_moves_to_end_and_evicts_oldest() {
        let mut cache = ArrayCacheBySymbolById::new(Some(2));
        cache.append(order("1", Some("open")));
        cache.append(order("2", Some("open")));
        cache.append(order("1", Some("filled")));
        assert_eq!(ids(&cache), vec!["2", "1"]);
        assert_eq!(cache.last().and_then(|o| o.status.as_deref()), Some("filled"));

        cache.append(order("3", Some("open")));
        assert_eq!(ids(&cache), vec!["1", "3"]);
        assert!(cache.get("X", "2").is_none());
        assert_eq!(cache.get("X", "1").and_then(|o| o.status.as_deref()), Some("filled"));
    }

    #[test]
    fn test_merge_keeps_fields_missing_from_update() {
        let mut cache = ArrayCacheBySymbolById::new(None);
        cache.append(order("1", Some("open")));
        cache.append(order("1", None));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("X", "1").and_then(|o| o.status.as_deref()), Some("open"));
    }

    #[test]
    fn test_same_id_on_other_symbol_is_distinct() {
        let mut cache = ArrayCacheBySymbolById::new(None);
        cache.append(order("1", None));
        cache.append(Order {
            symbol: "Y".to_string(),
            ..order("1", None)
        });
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_counts_distinct_ids_per_symbol() {
        let mut cache = ArrayCacheBySymbolById::new(None);
        cache.append(order("1", None));
        cache.append(order("1", Some("open")));
        cache.append(order("2", None));
        assert_eq!(cache.get_limit(Some("X"), None), Some(2));
        assert_eq!(cache.get_limit(None, None), Some(2));
        cache.append(order("2", Some("closed")));
        assert_eq!(cache.get_limit(Some("X"), None), Some(1));
    }

    #[test]
    fn test_evicted_id_can_return() {
        let mut cache = ArrayCacheBySymbolById::new(Some(1));
        cache.append(order("1", None));
        cache.append(order("2", None));
        cache.append(order("1", Some("open")));
        assert_eq!(ids(&cache), vec!["1"]);
        assert_eq!(cache.len(), 1);
    }
}
