//! Positions cache keyed by `(symbol, side)`

use super::by_symbol_by_id::SymbolKeyedCache;
use super::HasSide;

/// One entry per symbol and position side (long/short, or "both" for
/// one-way mode), most recently updated last
#[derive(Debug, Clone)]
pub struct ArrayCacheBySymbolBySide<T> {
    inner: SymbolKeyedCache<T>,
}

impl<T: HasSide> ArrayCacheBySymbolBySide<T> {
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            inner: SymbolKeyedCache::new(max_size, T::side),
        }
    }

    pub fn append(&mut self, item: T) {
        self.inner.append(item);
    }

    pub fn get_limit(&mut self, symbol: Option<&str>, limit: Option<usize>) -> Option<usize> {
        self.inner.get_limit(symbol, limit)
    }

    pub fn get(&self, symbol: &str, side: &str) -> Option<&T> {
        self.inner.get(symbol, side)
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

impl<T: HasSide + Clone> ArrayCacheBySymbolBySide<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.inner.items().iter().cloned().collect()
    }
}
