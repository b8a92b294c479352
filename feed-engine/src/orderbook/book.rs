//! Core order book implementation
//!
//! Pairs two [`OrderBookSide`]s with nonce sequencing. Deltas that arrive
//! before a snapshot are buffered and replayed by [`OrderBook::resync`].

use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::{iso8601, BookDelta, BookKind, OrderBookSide, OrderBookSnapshot, PriceLevel, Side};

/// Order book for a single symbol
#[derive(Debug, Clone)]
pub struct OrderBook {
    symbol: Option<String>,
    kind: BookKind,
    depth: Option<usize>,
    /// Bids sorted by price descending (highest first)
    bids: OrderBookSide,
    /// Asks sorted by price ascending (lowest first)
    asks: OrderBookSide,
    nonce: Option<u64>,
    timestamp: Option<i64>,
    datetime: Option<String>,
    /// Deltas received while waiting for a snapshot
    cache: Vec<BookDelta>,
    /// Whether the book reflects a snapshot
    synced: bool,
}

impl OrderBook {
    /// Create a plain book from a snapshot
    pub fn new(snapshot: impl Into<OrderBookSnapshot>, depth: Option<usize>) -> Self {
        Self::with_kind(snapshot, depth, BookKind::Plain)
    }

    /// Create a book whose deltas carry an order count
    pub fn counted(snapshot: impl Into<OrderBookSnapshot>, depth: Option<usize>) -> Self {
        Self::with_kind(snapshot, depth, BookKind::Counted)
    }

    /// Create a book keyed by order id
    pub fn indexed(snapshot: impl Into<OrderBookSnapshot>, depth: Option<usize>) -> Self {
        Self::with_kind(snapshot, depth, BookKind::Indexed)
    }

    pub fn with_kind(
        snapshot: impl Into<OrderBookSnapshot>,
        depth: Option<usize>,
        kind: BookKind,
    ) -> Self {
        let snapshot = snapshot.into();
        let mut book = Self::pending(snapshot.symbol.clone(), depth, kind);
        book.reset(snapshot);
        book
    }

    /// Create an empty book that buffers deltas until [`OrderBook::resync`]
    pub fn pending(symbol: Option<String>, depth: Option<usize>, kind: BookKind) -> Self {
        Self {
            symbol,
            kind,
            depth,
            bids: OrderBookSide::new(Side::Bid, kind, depth),
            asks: OrderBookSide::new(Side::Ask, kind, depth),
            nonce: None,
            timestamp: None,
            datetime: None,
            cache: Vec::new(),
            synced: false,
        }
    }

    /// Replace both sides and the sequencing state with a snapshot
    pub fn reset(&mut self, snapshot: OrderBookSnapshot) {
        self.bids = OrderBookSide::from_levels(Side::Bid, self.kind, &snapshot.bids, self.depth);
        self.asks = OrderBookSide::from_levels(Side::Ask, self.kind, &snapshot.asks, self.depth);
        self.bids.limit(None);
        self.asks.limit(None);
        if snapshot.symbol.is_some() {
            self.symbol = snapshot.symbol;
        }
        self.nonce = snapshot.nonce;
        self.set_timestamp(snapshot.timestamp);
        self.synced = true;
    }

    /// Apply one batch of deltas
    ///
    /// A batch whose nonce is not newer than the current nonce is dropped
    /// without touching the book.
    pub fn update(
        &mut self,
        nonce: Option<u64>,
        timestamp: Option<i64>,
        asks: &[PriceLevel],
        bids: &[PriceLevel],
    ) -> &mut Self {
        if self.is_stale(nonce) {
            debug!(
                symbol = ?self.symbol,
                nonce = ?nonce,
                current = ?self.nonce,
                "Dropping stale order book update"
            );
            return self;
        }

        self.asks.update(asks);
        self.bids.update(bids);
        self.asks.limit(None);
        self.bids.limit(None);

        if nonce.is_some() {
            self.nonce = nonce;
        }
        if timestamp.is_some() {
            self.set_timestamp(timestamp);
        }
        self
    }

    /// Route a wire batch: buffer it before the first snapshot, apply it after.
    ///
    /// Returns true if the batch changed the book.
    pub fn apply(&mut self, delta: BookDelta) -> bool {
        if !self.synced {
            self.cache_delta(delta);
            return false;
        }
        if self.is_stale(delta.nonce) {
            debug!(symbol = ?self.symbol, nonce = ?delta.nonce, "Dropping stale order book update");
            return false;
        }
        self.update(delta.nonce, delta.timestamp, &delta.asks, &delta.bids);
        true
    }

    /// Whether a batch carrying `nonce` would be ignored
    pub fn is_stale(&self, nonce: Option<u64>) -> bool {
        matches!((nonce, self.nonce), (Some(n), Some(current)) if n <= current)
    }

    /// Nonce the stream should continue from, if a batch starting at
    /// `first_nonce` would skip updates
    pub fn gap(&self, first_nonce: Option<u64>) -> Option<u64> {
        let expected = self.nonce?.saturating_add(1);
        first_nonce.filter(|first| *first > expected).map(|_| expected)
    }

    /// Truncate both sides to `min(n, depth)` levels
    pub fn limit(&mut self, n: Option<usize>) -> &mut Self {
        self.bids.limit(n);
        self.asks.limit(n);
        self
    }

    /// Buffer a batch for replay after the next snapshot
    pub fn cache_delta(&mut self, delta: BookDelta) {
        self.cache.push(delta);
    }

    /// Index of the first buffered batch that continues a snapshot taken at
    /// `snapshot_nonce`
    ///
    /// `Some(len)` means every buffered batch is already covered by the
    /// snapshot; `None` means the buffer starts after the snapshot and there
    /// is a gap.
    pub fn cache_index(&self, snapshot_nonce: u64) -> Option<usize> {
        let Some(index) = self
            .cache
            .iter()
            .position(|delta| delta.nonce.map_or(true, |n| n > snapshot_nonce))
        else {
            return Some(self.cache.len());
        };

        match self.cache[index].first_nonce {
            Some(first) if first > snapshot_nonce.saturating_add(1) => None,
            _ => Some(index),
        }
    }

    /// Rebuild from a snapshot and replay the buffered batches that follow it
    ///
    /// Leaves the book untouched and returns false when the snapshot is older
    /// than the buffered stream.
    pub fn resync(&mut self, snapshot: OrderBookSnapshot) -> bool {
        let index = match snapshot.nonce {
            Some(nonce) => self.cache_index(nonce),
            None => Some(0),
        };
        let Some(index) = index else {
            warn!(
                symbol = ?self.symbol,
                snapshot_nonce = ?snapshot.nonce,
                buffered = self.cache.len(),
                "Snapshot is behind the buffered deltas"
            );
            return false;
        };

        let buffered = std::mem::take(&mut self.cache);
        self.reset(snapshot);
        for delta in buffered.into_iter().skip(index) {
            self.update(delta.nonce, delta.timestamp, &delta.asks, &delta.bids);
        }
        debug!(symbol = ?self.symbol, nonce = ?self.nonce, "Order book resynced");
        true
    }

    /// Drop all state and go back to buffering
    pub fn invalidate(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.cache.clear();
        self.nonce = None;
        self.set_timestamp(None);
        self.synced = false;
    }

    fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.timestamp = timestamp;
        self.datetime = timestamp.and_then(iso8601);
    }

    pub fn bids(&self) -> &OrderBookSide {
        &self.bids
    }

    pub fn asks(&self) -> &OrderBookSide {
        &self.asks
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.best().map(|level| level.price)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.best().map(|level| level.price)
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()? - self.best_bid()?)
    }

    pub fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }

    pub fn kind(&self) -> BookKind {
        self.kind
    }

    pub fn nonce(&self) -> Option<u64> {
        self.nonce
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn datetime(&self) -> Option<&str> {
        self.datetime.as_deref()
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn buffered(&self) -> usize {
        self.cache.len()
    }

    /// Plain copy of the current contents
    pub fn snapshot(&self) -> OrderBookSnapshot {
        OrderBookSnapshot::from(self)
    }
}

impl From<&OrderBook> for OrderBookSnapshot {
    fn from(book: &OrderBook) -> Self {
        Self {
            symbol: book.symbol.clone(),
            nonce: book.nonce,
            timestamp: book.timestamp,
            datetime: book.datetime.clone(),
            bids: book.bids.levels().to_vec(),
            asks: book.asks.levels().to_vec(),
        }
    }
}

impl From<OrderBook> for OrderBookSnapshot {
    fn from(book: OrderBook) -> Self {
        Self::from(&book)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn create_test_book() -> OrderBook {
        let snapshot = OrderBookSnapshot {
            symbol: Some("BTC/USDT".to_string()),
            nonce: Some(100),
            timestamp: Some(1_672_531_200_000),
            bids: vec![
                PriceLevel::new(dec!(49999), dec!(2.0)),
                PriceLevel::new(dec!(50000), dec!(1.0)),
            ],
            asks: vec![
                PriceLevel::new(dec!(50002), dec!(2.5)),
                PriceLevel::new(dec!(50001), dec!(1.5)),
            ],
            ..Default::default()
        };
        OrderBook::new(snapshot, Some(10))
    }

    fn delta(first: u64, last: u64, bids: Vec<PriceLevel>) -> BookDelta {
        BookDelta {
            first_nonce: Some(first),
            nonce: Some(last),
            timestamp: Some(1_672_531_201_000),
            bids,
            asks: vec![],
        }
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let book = create_test_book();
        assert_eq!(book.best_bid(), Some(dec!(50000)));
        assert_eq!(book.best_ask(), Some(dec!(50001)));
        assert_eq!(book.spread(), Some(dec!(1)));
        assert_eq!(book.datetime(), Some("2023-01-01T00:00:00.000Z"));
        assert!(book.is_synced());
    }

    #[test]
    fn test_stale_update_is_noop() {
        let mut book = create_test_book();
        let before = book.snapshot();
        book.update(Some(99), Some(1), &[PriceLevel::new(dec!(50001), dec!(0))], &[]);
        book.update(Some(100), Some(1), &[], &[PriceLevel::new(dec!(1), dec!(1))]);
        assert_eq!(book.snapshot(), before);
    }

    #[test]
    fn test_newer_update_applies() {
        let mut book = create_test_book();
        book.update(
            Some(101),
            Some(1_672_531_201_000),
            &[PriceLevel::new(dec!(50001), dec!(0))],
            &[PriceLevel::new(dec!(50000), dec!(3))],
        );
        assert_eq!(book.nonce(), Some(101));
        assert_eq!(book.best_ask(), Some(dec!(50002)));
        assert_eq!(book.bids().best().map(|l| l.size), Some(dec!(3)));
        assert_eq!(book.datetime(), Some("2023-01-01T00:00:01.000Z"));
    }

    #[test]
    fn test_update_without_nonce_keeps_nonce() {
        let mut book = create_test_book();
        book.update(None, None, &[], &[PriceLevel::new(dec!(49998), dec!(1))]);
        assert_eq!(book.nonce(), Some(100));
        assert_eq!(book.bids().len(), 3);
    }

    #[test]
    fn test_update_enforces_depth() {
        let mut book = OrderBook::new(OrderBookSnapshot::default(), Some(2));
        let asks: Vec<_> = (1..=5).map(|p| PriceLevel::new(Decimal::from(p), dec!(1))).collect();
        book.update(Some(1), None, &asks, &[]);
        assert_eq!(book.asks().len(), 2);
        assert_eq!(book.best_ask(), Some(dec!(1)));
        book.limit(Some(1));
        assert_eq!(book.asks().len(), 1);
    }

    #[test]
    fn test_construction_from_book_does_not_double_wrap() {
        let book = create_test_book();
        let copy = OrderBook::new(&book, Some(10));
        assert_eq!(copy.snapshot(), book.snapshot());
        let counted = OrderBook::counted(OrderBookSnapshot::default(), None);
        assert_eq!(counted.bids().kind(), BookKind::Counted);
        let indexed = OrderBook::indexed(OrderBookSnapshot::default(), None);
        assert_eq!(indexed.asks().kind(), BookKind::Indexed);
    }

    #[test]
    fn test_pending_book_buffers_until_resync() {
        let mut book = OrderBook::pending(Some("BTC/USDT".into()), None, BookKind::Plain);
        assert!(!book.apply(delta(95, 99, vec![PriceLevel::new(dec!(1), dec!(1))])));
        assert!(!book.apply(delta(100, 102, vec![PriceLevel::new(dec!(2), dec!(1))])));
        assert!(!book.apply(delta(103, 104, vec![PriceLevel::new(dec!(3), dec!(1))])));
        assert_eq!(book.buffered(), 3);

        let snapshot = OrderBookSnapshot {
            nonce: Some(101),
            ..Default::default()
        };
        assert_eq!(book.cache_index(101), Some(1));
        assert!(book.resync(snapshot));
        assert_eq!(book.buffered(), 0);
        assert_eq!(book.nonce(), Some(104));
        let prices: Vec<_> = book.bids().iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![dec!(3), dec!(2)]);

        assert!(book.apply(delta(105, 105, vec![PriceLevel::new(dec!(4), dec!(1))])));
        assert!(!book.apply(delta(105, 105, vec![PriceLevel::new(dec!(5), dec!(1))])));
        assert_eq!(book.best_bid(), Some(dec!(4)));
    }

    #[test]
    fn test_resync_rejects_old_snapshot() {
        let mut book = OrderBook::pending(None, None, BookKind::Plain);
        book.cache_delta(delta(200, 205, vec![]));
        assert_eq!(book.cache_index(150), None);
        let snapshot = OrderBookSnapshot {
            nonce: Some(150),
            ..Default::default()
        };
        assert!(!book.resync(snapshot));
        assert!(!book.is_synced());
        assert_eq!(book.buffered(), 1);
    }

    #[test]
    fn test_cache_index_when_snapshot_covers_everything() {
        let mut book = OrderBook::pending(None, None, BookKind::Plain);
        book.cache_delta(delta(1, 5, vec![]));
        assert_eq!(book.cache_index(10), Some(1));
    }

    #[test]
    fn test_cache_index_at_max_nonce() {
        let mut book = OrderBook::pending(None, None, BookKind::Plain);
        book.cache_delta(BookDelta {
            first_nonce: Some(u64::MAX),
            ..Default::default()
        });
        assert_eq!(book.cache_index(u64::MAX), Some(0));
    }

    #[test]
    fn test_gap_detects_skipped_updates() {
        let book = create_test_book();
        assert_eq!(book.gap(Some(101)), None);
        // overlapping batches continue the stream
        assert_eq!(book.gap(Some(90)), None);
        assert_eq!(book.gap(None), None);
        assert_eq!(book.gap(Some(150)), Some(101));

        let pending = OrderBook::pending(None, None, BookKind::Plain);
        assert_eq!(pending.gap(Some(150)), None);
    }

    #[test]
    fn test_invalidate_returns_to_buffering() {
        let mut book = create_test_book();
        book.invalidate();
        assert!(!book.is_synced());
        assert!(book.bids().is_empty());
        assert_eq!(book.nonce(), None);
    }
}
