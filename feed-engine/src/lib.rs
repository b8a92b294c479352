//! Feed Engine - exchange market data consistency library
//!
//! This crate keeps locally mirrored exchange state consistent with a live
//! WebSocket feed: sorted order book sides driven by snapshots and deltas,
//! bounded caches for trades, candles, orders and positions, and a client
//! state machine that turns a socket into message-hash keyed futures.

pub mod binance;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orderbook;
pub mod parser;
pub mod stream;
pub mod types;
pub mod websocket;

pub use binance::{BinanceFeed, BinanceRest, Update};
pub use cache::{ArrayCache, ArrayCacheBySymbolById, ArrayCacheBySymbolBySide, ArrayCacheByTimestamp};
pub use config::Config;
pub use error::{Result, StreamError};
pub use metrics::FeedMetrics;
pub use orderbook::{BookDelta, BookKind, OrderBook, OrderBookSide, OrderBookSnapshot, PriceLevel, Side};
pub use stream::{load_order_book, ApplyOutcome, OrderBookRegistry, SnapshotSource, Stream};
pub use types::{Ohlcv, Order, Position, Trade};
pub use websocket::{Client, ClientConfig, ConnectionState, Handlers, MessageFuture};
