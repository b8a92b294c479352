//! Items held by the rolling caches

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheItem, HasId, HasSide, HasTimestamp, Merge};

/// A public trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Option<String>,
    pub symbol: String,
    pub timestamp: i64,
    pub price: Decimal,
    pub amount: Decimal,
    /// "buy" or "sell" from the taker's point of view
    pub side: Option<String>,
}

impl CacheItem for Trade {
    fn symbol(&self) -> Option<&str> {
        Some(&self.symbol)
    }
}

/// An OHLCV bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Merge for Ohlcv {
    fn merge(&mut self, update: Self) {
        *self = update;
    }
}

impl HasTimestamp for Ohlcv {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// An order as reported by a private stream
///
/// Venues often send partial updates; `None` fields keep their stored value
/// when merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub status: Option<String>,
    pub side: Option<String>,
    pub price: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub filled: Option<Decimal>,
    pub timestamp: Option<i64>,
}

impl CacheItem for Order {
    fn symbol(&self) -> Option<&str> {
        Some(&self.symbol)
    }
}

impl Merge for Order {
    fn merge(&mut self, update: Self) {
        self.status = update.status.or(self.status.take());
        self.side = update.side.or(self.side.take());
        self.price = update.price.or(self.price);
        self.amount = update.amount.or(self.amount);
        self.filled = update.filled.or(self.filled);
        self.timestamp = update.timestamp.or(self.timestamp);
    }
}

impl HasId for Order {
    fn id(&self) -> &str {
        &self.id
    }
}

/// A derivatives position
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// "long", "short", or "both" for one-way mode
    pub side: String,
    pub contracts: Decimal,
    pub entry_price: Option<Decimal>,
    pub timestamp: Option<i64>,
}

impl CacheItem for Position {
    fn symbol(&self) -> Option<&str> {
        Some(&self.symbol)
    }
}

impl Merge for Position {
    fn merge(&mut self, update: Self) {
        self.contracts = update.contracts;
        self.entry_price = update.entry_price.or(self.entry_price);
        self.timestamp = update.timestamp.or(self.timestamp);
    }
}

impl HasSide for Position {
    fn side(&self) -> &str {
        &self.side
    }
}
