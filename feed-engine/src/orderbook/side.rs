//! One side of an order book
//!
//! Levels live in a `Vec` kept sorted best-first. New prices are placed with a
//! binary search and an in-place shift, so a delta never triggers a resort.
//! Indexed kinds additionally keep an id -> sort key map to find an order's
//! entry among levels sharing a price.

use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::trace;

use super::{BookKind, PriceLevel, Side};

/// Depth used when the caller does not bound the side
const UNBOUNDED: usize = usize::MAX;

#[derive(Debug, Clone)]
pub struct OrderBookSide {
    side: Side,
    kind: BookKind,
    depth: usize,
    levels: Vec<PriceLevel>,
    /// Order id -> sort key of the entry carrying it (indexed kinds only)
    index: HashMap<String, Decimal>,
}

impl OrderBookSide {
    /// Create an empty side
    pub fn new(side: Side, kind: BookKind, depth: Option<usize>) -> Self {
        Self {
            side,
            kind,
            depth: depth.unwrap_or(UNBOUNDED),
            levels: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Create a side from snapshot levels, applied as deltas in order
    pub fn from_levels(side: Side, kind: BookKind, levels: &[PriceLevel], depth: Option<usize>) -> Self {
        let mut book_side = Self::new(side, kind, depth);
        book_side.update(levels);
        book_side
    }

    /// Apply a batch of deltas in wire order
    pub fn update(&mut self, deltas: &[PriceLevel]) {
        for delta in deltas {
            self.store_array(delta.clone());
        }
    }

    /// Apply a single delta according to the side's discipline
    pub fn store_array(&mut self, delta: PriceLevel) {
        match self.kind {
            BookKind::Plain => {
                let keep = delta.size > Decimal::ZERO;
                self.store_absolute(delta, keep);
            }
            BookKind::Counted => {
                let keep = delta.size > Decimal::ZERO && delta.count.unwrap_or(0) > 0;
                self.store_absolute(delta, keep);
            }
            BookKind::Incremental => self.store_incremental(delta),
            BookKind::Indexed => self.store_indexed(delta, false),
            BookKind::IncrementalIndexed => self.store_indexed(delta, true),
        }
    }

    /// Shortcut for `[price, size]` deltas
    pub fn store(&mut self, price: Decimal, size: Decimal) {
        self.store_array(PriceLevel::new(price, size));
    }

    /// Drop levels beyond `min(n, depth)` from the worst end
    pub fn limit(&mut self, n: Option<usize>) {
        let cap = n.map_or(self.depth, |n| n.min(self.depth));
        if self.levels.len() <= cap {
            return;
        }
        for dropped in self.levels.drain(cap..) {
            if let Some(id) = dropped.id {
                self.index.remove(&id);
            }
        }
    }

    fn position(&self, price: Decimal) -> Result<usize, usize> {
        let side = self.side;
        let key = side.sort_key(price);
        self.levels
            .binary_search_by(|level| side.sort_key(level.price).cmp(&key))
    }

    fn store_absolute(&mut self, delta: PriceLevel, keep: bool) {
        match (self.position(delta.price), keep) {
            // already positioned, overwrite in place
            (Ok(i), true) => self.levels[i] = delta,
            (Err(i), true) => self.levels.insert(i, delta),
            (Ok(i), false) => {
                self.levels.remove(i);
            }
            (Err(_), false) => {}
        }
    }

    fn store_incremental(&mut self, delta: PriceLevel) {
        let position = self.position(delta.price);
        let existing = position.ok().map_or(Decimal::ZERO, |i| self.levels[i].size);
        let size = existing + delta.size;
        match position {
            Ok(i) if size > Decimal::ZERO => self.levels[i].size = size,
            Ok(i) => {
                self.levels.remove(i);
            }
            Err(i) if size > Decimal::ZERO => self.levels.insert(i, PriceLevel { size, ..delta }),
            Err(_) => {}
        }
    }

    /// Position of order `id` among entries whose sort key equals `key`
    fn locate(&self, key: Decimal, id: &str) -> Option<usize> {
        let side = self.side;
        let start = self
            .levels
            .partition_point(|level| side.sort_key(level.price) < key);
        self.levels[start..]
            .iter()
            .take_while(|level| side.sort_key(level.price) == key)
            .position(|level| level.id.as_deref() == Some(id))
            .map(|offset| start + offset)
    }

    /// Insert after every entry at the same price, preserving arrival order
    fn insert_indexed(&mut self, level: PriceLevel) {
        let side = self.side;
        let key = side.sort_key(level.price);
        let at = self
            .levels
            .partition_point(|existing| side.sort_key(existing.price) <= key);
        if let Some(id) = level.id.clone() {
            self.index.insert(id, key);
        }
        self.levels.insert(at, level);
    }

    fn store_indexed(&mut self, delta: PriceLevel, incremental: bool) {
        let Some(id) = delta.id.clone() else {
            trace!(side = ?self.side, price = %delta.price, "Dropping indexed delta without an id");
            return;
        };

        let existing = self
            .index
            .get(&id)
            .copied()
            .and_then(|key| self.locate(key, &id));

        let Some(i) = existing else {
            self.index.remove(&id);
            // a new order needs both a price and a positive size
            if delta.size > Decimal::ZERO && !delta.price.is_zero() {
                self.insert_indexed(delta);
            }
            return;
        };

        let current = &self.levels[i];
        let price = if delta.price.is_zero() { current.price } else { delta.price };
        // a zero delta deletes the order for both indexed kinds
        let size = if incremental && !delta.size.is_zero() {
            current.size + delta.size
        } else {
            delta.size
        };

        if size <= Decimal::ZERO {
            // a non-positive result removes the order
            self.levels.remove(i);
            self.index.remove(&id);
            return;
        }

        let count = delta.count.or(current.count);
        if price == current.price {
            let level = &mut self.levels[i];
            level.size = size;
            level.count = count;
        } else {
            self.levels.remove(i);
            self.insert_indexed(PriceLevel {
                price,
                size,
                count,
                id: Some(id),
            });
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn kind(&self) -> BookKind {
        self.kind
    }

    pub fn depth(&self) -> Option<usize> {
        (self.depth != UNBOUNDED).then_some(self.depth)
    }

    /// Levels best-first
    pub fn levels(&self) -> &[PriceLevel] {
        &self.levels
    }

    pub fn iter(&self) -> impl Iterator<Item = &PriceLevel> {
        self.levels.iter()
    }

    pub fn best(&self) -> Option<&PriceLevel> {
        self.levels.first()
    }

    /// First entry at `price`
    pub fn get(&self, price: Decimal) -> Option<&PriceLevel> {
        let side = self.side;
        let key = side.sort_key(price);
        let at = self
            .levels
            .partition_point(|level| side.sort_key(level.price) < key);
        self.levels.get(at).filter(|level| level.price == price)
    }

    /// Entry carrying order `id` (indexed kinds only)
    pub fn get_by_id(&self, id: &str) -> Option<&PriceLevel> {
        let key = *self.index.get(id)?;
        self.locate(key, id).map(|i| &self.levels[i])
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn clear(&mut self) {
        self.levels.clear();
        self.index.clear();
    }
}

impl<'a> IntoIterator for &'a OrderBookSide {
    type Item = &'a PriceLevel;
    type IntoIter = std::slice::Iter<'a, PriceLevel>;

    fn into_iter(self) -> Self::IntoIter {
        self.levels.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pairs(side: &OrderBookSide) -> Vec<(Decimal, Decimal)> {
        side.iter().map(|l| (l.price, l.size)).collect()
    }

    fn assert_sorted(side: &OrderBookSide) {
        for pair in side.levels().windows(2) {
            match side.side() {
                Side::Ask => assert!(pair[0].price < pair[1].price),
                Side::Bid => assert!(pair[0].price > pair[1].price),
            }
        }
    }

    #[test]
    fn test_asks_insert_then_remove() {
        let mut asks = OrderBookSide::new(Side::Ask, BookKind::Plain, None);
        asks.store(dec!(100), dec!(5));
        asks.store(dec!(98), dec!(3));
        asks.store(dec!(100), dec!(0));
        assert_eq!(pairs(&asks), vec![(dec!(98), dec!(3))]);
    }

    #[test]
    fn test_bids_descending() {
        let mut bids = OrderBookSide::new(Side::Bid, BookKind::Plain, None);
        bids.store(dec!(50), dec!(1));
        bids.store(dec!(51), dec!(2));
        assert_eq!(pairs(&bids), vec![(dec!(51), dec!(2)), (dec!(50), dec!(1))]);
    }

    #[test]
    fn test_overwrite_is_absolute() {
        let mut bids = OrderBookSide::new(Side::Bid, BookKind::Plain, None);
        bids.store(dec!(50), dec!(1));
        bids.store(dec!(50), dec!(4));
        assert_eq!(pairs(&bids), vec![(dec!(50), dec!(4))]);
    }

    #[test]
    fn test_removing_absent_price_is_noop() {
        let mut asks = OrderBookSide::new(Side::Ask, BookKind::Plain, None);
        asks.store(dec!(10), dec!(1));
        asks.store(dec!(11), dec!(0));
        assert_eq!(pairs(&asks), vec![(dec!(10), dec!(1))]);
    }

    #[test]
    fn test_sort_invariant_under_mixed_deltas() {
        let mut asks = OrderBookSide::new(Side::Ask, BookKind::Plain, None);
        let mut bids = OrderBookSide::new(Side::Bid, BookKind::Plain, None);
        let prices = [7, 3, 9, 1, 3, 8, 2, 9, 5, 4, 6, 1];
        for (step, p) in prices.iter().enumerate() {
            let size = if step % 4 == 3 { dec!(0) } else { Decimal::from(step + 1) };
            asks.store(Decimal::from(*p), size);
            bids.store(Decimal::from(*p), size);
            assert_sorted(&asks);
            assert_sorted(&bids);
        }
    }

    #[test]
    fn test_limit_keeps_best_levels() {
        let mut asks = OrderBookSide::new(Side::Ask, BookKind::Plain, Some(3));
        for p in [5, 1, 4, 2, 3] {
            asks.store(Decimal::from(p), dec!(1));
        }
        asks.limit(None);
        assert_eq!(asks.len(), 3);
        assert_eq!(asks.best().map(|l| l.price), Some(dec!(1)));
        assert_eq!(asks.levels().last().map(|l| l.price), Some(dec!(3)));

        asks.limit(Some(2));
        assert_eq!(asks.len(), 2);
        // a larger request never exceeds the configured depth
        asks.store(dec!(9), dec!(1));
        asks.store(dec!(8), dec!(1));
        asks.limit(Some(10));
        assert_eq!(asks.len(), 3);
    }

    #[test]
    fn test_counted_removes_on_zero_count() {
        let mut bids = OrderBookSide::new(Side::Bid, BookKind::Counted, None);
        bids.store_array(PriceLevel::counted(dec!(10), dec!(2), 3));
        bids.store_array(PriceLevel::counted(dec!(11), dec!(1), 1));
        bids.store_array(PriceLevel::counted(dec!(10), dec!(2), 0));
        assert_eq!(pairs(&bids), vec![(dec!(11), dec!(1))]);
        assert_eq!(bids.best().and_then(|l| l.count), Some(1));
    }

    #[test]
    fn test_incremental_accumulates_and_nets_to_zero() {
        let mut asks = OrderBookSide::new(Side::Ask, BookKind::Incremental, None);
        asks.store(dec!(10), dec!(5));
        asks.store(dec!(10), dec!(-3));
        assert_eq!(pairs(&asks), vec![(dec!(10), dec!(2))]);
        asks.store(dec!(10), dec!(-2));
        assert!(asks.is_empty());

        asks.store(dec!(0.3), dec!(0.1));
        asks.store(dec!(0.3), dec!(-0.1));
        assert!(asks.get(dec!(0.3)).is_none());
    }

    #[test]
    fn test_incremental_negative_on_empty_level_is_ignored() {
        let mut bids = OrderBookSide::new(Side::Bid, BookKind::Incremental, None);
        bids.store(dec!(10), dec!(-1));
        assert!(bids.is_empty());
    }

    #[test]
    fn test_indexed_moves_price_for_same_id() {
        let mut asks = OrderBookSide::new(Side::Ask, BookKind::Indexed, None);
        asks.store_array(PriceLevel::with_id(dec!(10), dec!(5), "A"));
        asks.store_array(PriceLevel::with_id(dec!(11), dec!(5), "A"));
        assert_eq!(asks.len(), 1);
        assert_eq!(asks.levels()[0], PriceLevel::with_id(dec!(11), dec!(5), "A"));
    }

    #[test]
    fn test_indexed_same_delta_twice_is_idempotent() {
        let mut bids = OrderBookSide::new(Side::Bid, BookKind::Indexed, None);
        let delta = PriceLevel::with_id(dec!(10), dec!(5), "A");
        bids.store_array(delta.clone());
        let once = bids.levels().to_vec();
        bids.store_array(delta);
        assert_eq!(bids.levels(), once.as_slice());
    }

    #[test]
    fn test_indexed_size_only_update_keeps_price() {
        let mut bids = OrderBookSide::new(Side::Bid, BookKind::Indexed, None);
        bids.store_array(PriceLevel::with_id(dec!(10), dec!(5), "A"));
        bids.store_array(PriceLevel::with_id(dec!(0), dec!(7), "A"));
        assert_eq!(bids.get_by_id("A").map(|l| (l.price, l.size)), Some((dec!(10), dec!(7))));
    }

    #[test]
    fn test_indexed_orders_share_price_in_arrival_order() {
        let mut asks = OrderBookSide::new(Side::Ask, BookKind::Indexed, None);
        asks.store_array(PriceLevel::with_id(dec!(10), dec!(1), "A"));
        asks.store_array(PriceLevel::with_id(dec!(10), dec!(2), "B"));
        asks.store_array(PriceLevel::with_id(dec!(9), dec!(3), "C"));
        let ids: Vec<_> = asks.iter().filter_map(|l| l.id.as_deref()).collect();
        assert_eq!(ids, vec!["C", "A", "B"]);

        asks.store_array(PriceLevel::with_id(dec!(10), dec!(0), "A"));
        let ids: Vec<_> = asks.iter().filter_map(|l| l.id.as_deref()).collect();
        assert_eq!(ids, vec!["C", "B"]);
        assert!(asks.get_by_id("A").is_none());
    }

    #[test]
    fn test_indexed_limit_forgets_dropped_ids() {
        let mut bids = OrderBookSide::new(Side::Bid, BookKind::Indexed, Some(1));
        bids.store_array(PriceLevel::with_id(dec!(10), dec!(1), "A"));
        bids.store_array(PriceLevel::with_id(dec!(9), dec!(1), "B"));
        bids.limit(None);
        assert!(bids.get_by_id("B").is_none());
        // a size-only update for a forgotten id has no price to land on
        bids.store_array(PriceLevel::with_id(dec!(0), dec!(4), "B"));
        assert_eq!(bids.len(), 1);
    }

    #[test]
    fn test_incremental_indexed_adjusts_by_id() {
        let mut asks = OrderBookSide::new(Side::Ask, BookKind::IncrementalIndexed, None);
        asks.store_array(PriceLevel::with_id(dec!(10), dec!(5), "A"));
        asks.store_array(PriceLevel::with_id(dec!(10), dec!(-2), "A"));
        assert_eq!(asks.get_by_id("A").map(|l| l.size), Some(dec!(3)));
        asks.store_array(PriceLevel::with_id(dec!(12), dec!(1), "A"));
        assert_eq!(asks.get_by_id("A").map(|l| (l.price, l.size)), Some((dec!(12), dec!(4))));
        asks.store_array(PriceLevel::with_id(dec!(12), dec!(-4), "A"));
        assert!(asks.is_empty());
    }

    #[test]
    fn test_incremental_indexed_zero_size_deletes() {
        let mut asks = OrderBookSide::new(Side::Ask, BookKind::IncrementalIndexed, None);
        asks.store_array(PriceLevel::with_id(dec!(10), dec!(5), "A"));
        asks.store_array(PriceLevel::with_id(dec!(11), dec!(1), "B"));
        asks.store_array(PriceLevel::with_id(dec!(10), dec!(0), "A"));
        assert!(asks.get_by_id("A").is_none());
        assert_eq!(asks.len(), 1);
        assert_eq!(asks.best().map(|l| l.price), Some(dec!(11)));
    }

    // overshoot removes the entry rather than starting a fresh one, so every
    // stored size stays positive
    #[test]
    fn test_incremental_indexed_overshoot_discards_entry() {
        let mut bids = OrderBookSide::new(Side::Bid, BookKind::IncrementalIndexed, None);
        bids.store_array(PriceLevel::with_id(dec!(10), dec!(2), "A"));
        bids.store_array(PriceLevel::with_id(dec!(10), dec!(-5), "A"));
        assert!(bids.get_by_id("A").is_none());
        assert!(bids.is_empty());

        // the id can start over afterwards
        bids.store_array(PriceLevel::with_id(dec!(10), dec!(1), "A"));
        assert_eq!(bids.get_by_id("A").map(|l| l.size), Some(dec!(1)));
    }
}
