//! Bounded rolling caches for streamed items
//!
//! Each cache holds at most `max_size` items, evicting the oldest first, and
//! tracks how many items arrived per symbol since a consumer last asked via
//! `get_limit`. A read only marks the counter; it is reset on the next
//! append, so several readers can poll before new data lands without losing
//! counts.

mod array_cache;
mod by_symbol_by_id;
mod by_symbol_by_side;
mod by_timestamp;
mod tracker;

pub use array_cache::ArrayCache;
pub use by_symbol_by_id::ArrayCacheBySymbolById;
pub use by_symbol_by_side::ArrayCacheBySymbolBySide;
pub use by_timestamp::ArrayCacheByTimestamp;

/// An item that can be partitioned by market symbol
pub trait CacheItem {
    fn symbol(&self) -> Option<&str> {
        None
    }
}

/// Update an existing entry in place with a newer version of the same item
pub trait Merge {
    fn merge(&mut self, update: Self)
    where
        Self: Sized;
}

/// Items keyed by exchange id within a symbol (orders, trades)
pub trait HasId: CacheItem + Merge {
    fn id(&self) -> &str;
}

/// Items keyed by position side within a symbol
pub trait HasSide: CacheItem + Merge {
    fn side(&self) -> &str;
}

/// Items keyed by their opening timestamp (candles)
pub trait HasTimestamp: Merge {
    fn timestamp(&self) -> i64;
}

/// `0` and `None` both mean unbounded
pub(crate) fn normalize_max_size(max_size: Option<usize>) -> Option<usize> {
    max_size.filter(|&max| max > 0)
}
