//! Order book module
//!
//! Maintains depth-bounded, price-sorted books from snapshot and delta
//! updates. One [`OrderBookSide`] per side, composed by [`OrderBook`].

mod book;
mod side;

pub use book::OrderBook;
pub use side::OrderBookSide;

use chrono::{SecondsFormat, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    /// Key under which levels are kept in ascending order: best level first.
    #[inline]
    pub fn sort_key(self, price: Decimal) -> Decimal {
        match self {
            Side::Bid => -price,
            Side::Ask => price,
        }
    }
}

/// Update discipline applied by a side to each incoming delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BookKind {
    /// `[price, size]`: size overwrites the level, zero removes it
    #[default]
    Plain,
    /// `[price, size, count]`: zero size or zero count removes the level
    Counted,
    /// `[price, size, id]`: one entry per order id
    Indexed,
    /// `[price, size]`: size is added to the level
    Incremental,
    /// `[price, size, id]`: size is added to the order's entry
    IncrementalIndexed,
}

impl BookKind {
    pub fn is_indexed(self) -> bool {
        matches!(self, BookKind::Indexed | BookKind::IncrementalIndexed)
    }
}

/// A single level (or a single order, for indexed books)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self {
            price,
            size,
            count: None,
            id: None,
        }
    }

    pub fn counted(price: Decimal, size: Decimal, count: u64) -> Self {
        Self {
            count: Some(count),
            ..Self::new(price, size)
        }
    }

    pub fn with_id(price: Decimal, size: Decimal, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(price, size)
        }
    }
}

/// Plain book contents, as delivered by a REST or WebSocket snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: Option<String>,
    pub nonce: Option<u64>,
    pub timestamp: Option<i64>,
    pub datetime: Option<String>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// One batch of deltas as received from the wire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookDelta {
    /// First sequence number covered by the batch, when the venue sends one
    pub first_nonce: Option<u64>,
    /// Last sequence number covered by the batch
    pub nonce: Option<u64>,
    pub timestamp: Option<i64>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// ISO-8601 rendering of a millisecond timestamp
pub fn iso8601(timestamp_ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}
