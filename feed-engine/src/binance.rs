//! Binance spot adapter
//!
//! Wires the public depth, trade and kline streams into the engine. Depth
//! deltas feed an [`OrderBookRegistry`] and are buffered until a REST
//! snapshot lines them up; trades and candles land in bounded caches. Each
//! `watch_*` call awaits the next update for its symbol.

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::cache::{ArrayCache, ArrayCacheByTimestamp};
use crate::config::Config;
use crate::error::{Result, StreamError};
use crate::metrics::FeedMetrics;
use crate::orderbook::{BookKind, OrderBookSnapshot};
use crate::parser::{DepthSnapshot, DepthUpdate, KlineEvent, ParsedMessage, TradeEvent};
use crate::stream::{load_order_book, ApplyOutcome, OrderBookRegistry, SnapshotSource, Stream};
use crate::types::{Ohlcv, Trade};
use crate::websocket::Client;

/// Deltas buffered before the snapshot is requested, so the snapshot is
/// likely to overlap the buffer
pub const SNAPSHOT_DELAY: usize = 5;

/// Upper bound on a single snapshot request; deltas keep buffering meanwhile
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// What a `watch_*` future resolves with
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Book(OrderBookSnapshot),
    /// New trades are in the cache for this symbol
    Trades(String),
    /// New bars are in the cache for this symbol and interval
    Ohlcv(String),
}

impl From<OrderBookSnapshot> for Update {
    fn from(snapshot: OrderBookSnapshot) -> Self {
        Update::Book(snapshot)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn orderbook_hash(symbol: &str) -> String {
    format!("orderbook:{symbol}")
}

fn trades_hash(symbol: &str) -> String {
    format!("trades:{symbol}")
}

fn ohlcv_key(symbol: &str, interval: &str) -> String {
    format!("{symbol}:{interval}")
}

fn ohlcv_hash(symbol: &str, interval: &str) -> String {
    format!("ohlcv:{}", ohlcv_key(symbol, interval))
}

/// REST snapshot source for `GET /api/v3/depth`
pub struct BinanceRest {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl BinanceRest {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_timeout(endpoint, SNAPSHOT_TIMEOUT)
    }

    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

impl SnapshotSource for BinanceRest {
    fn fetch_order_book(
        &self,
        symbol: &str,
        limit: Option<usize>,
    ) -> BoxFuture<'static, Result<OrderBookSnapshot>> {
        let http = self.http.clone();
        let timeout = self.timeout;
        let symbol = symbol.to_string();
        let mut url = format!("{}/depth?symbol={}", self.endpoint, symbol);
        if let Some(limit) = limit {
            url.push_str(&format!("&limit={limit}"));
        }

        Box::pin(async move {
            info!(symbol = %symbol, url = %url, "Fetching order book snapshot");
            let response = http.get(&url).timeout(timeout).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(StreamError::RestApiError(format!("{url} returned {status}")));
            }
            let snapshot: DepthSnapshot = response.json().await?;
            Ok(snapshot.into_snapshot(&symbol))
        })
    }
}

/// State touched by the message handler
struct Shared {
    books: Mutex<OrderBookRegistry>,
    trades: Mutex<HashMap<String, ArrayCache<Trade>>>,
    candles: Mutex<HashMap<String, ArrayCacheByTimestamp<Ohlcv>>>,
    source: Arc<dyn SnapshotSource>,
    metrics: FeedMetrics,
    depth_levels: usize,
    cache_limit: usize,
    snapshot_max_retries: u32,
}

impl Shared {
    fn handle(self: &Arc<Self>, client: &Client<Update>, message: Value) {
        match ParsedMessage::parse_value(message) {
            Ok(ParsedMessage::DepthUpdate(update)) => {
                self.count("depth");
                self.on_depth(client, update);
            }
            Ok(ParsedMessage::Trade(event)) => {
                self.count("trade");
                self.on_trade(client, event);
            }
            Ok(ParsedMessage::Kline(event)) => {
                self.count("kline");
                self.on_kline(client, event);
            }
            Ok(ParsedMessage::Reply(reply)) => {
                self.count("reply");
                debug!(id = reply.id, result = %reply.result, "Command acknowledged");
            }
            Ok(ParsedMessage::Unknown(message)) => {
                self.count("unknown");
                trace!(msg = %message, "Unknown message type");
            }
            Err(e) => {
                self.count("malformed");
                self.metrics.malformed_messages.inc();
                warn!(url = %client.url(), error = %e, "Dropping malformed message");
            }
        }
    }

    fn count(&self, kind: &str) {
        self.metrics.messages_received.with_label_values(&[kind]).inc();
    }

    fn on_depth(self: &Arc<Self>, client: &Client<Update>, update: DepthUpdate) {
        let symbol = update.symbol.clone();
        let (outcome, state) = {
            let mut books = lock(&self.books);
            let outcome = books.apply(&symbol, update.into_delta());
            let state = match outcome {
                ApplyOutcome::Applied => books.get_state(&symbol, None),
                _ => None,
            };
            (outcome, state)
        };

        match outcome {
            ApplyOutcome::Applied => {
                if let Some(state) = state {
                    client.resolve(Update::Book(state), &orderbook_hash(&symbol));
                }
            }
            ApplyOutcome::Buffered(buffered) if buffered == SNAPSHOT_DELAY => {
                self.spawn_snapshot(client.clone(), symbol);
            }
            ApplyOutcome::Buffered(buffered) => {
                trace!(symbol = %symbol, buffered, "Buffering depth update");
            }
            ApplyOutcome::Stale => self.metrics.stale_updates.inc(),
            ApplyOutcome::Gap { expected, first } => {
                self.metrics.sequence_gaps.inc();
                let error = StreamError::SequenceGap {
                    symbol: symbol.clone(),
                    expected,
                    first,
                };
                client.reject(error, Some(&orderbook_hash(&symbol)));
            }
            ApplyOutcome::UnknownSymbol => {
                trace!(symbol = %symbol, "Depth update for an unwatched symbol");
            }
        }
    }

    fn spawn_snapshot(self: &Arc<Self>, client: Client<Update>, symbol: String) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let result = load_order_book(
                shared.source.as_ref(),
                &shared.books,
                &client,
                &orderbook_hash(&symbol),
                &symbol,
                Some(shared.depth_levels),
                shared.snapshot_max_retries,
            )
            .await;
            match result {
                Ok(_) => shared.metrics.resyncs.inc(),
                Err(e) => {
                    shared.metrics.resync_failures.inc();
                    warn!(symbol = %symbol, error = %e, "Order book resync failed");
                }
            }
        });
    }

    fn on_trade(&self, client: &Client<Update>, event: TradeEvent) {
        let trade = Trade::from(event);
        let symbol = trade.symbol.clone();
        lock(&self.trades)
            .entry(symbol.clone())
            .or_insert_with(|| ArrayCache::new(Some(self.cache_limit)))
            .append(trade);
        client.resolve(Update::Trades(symbol.clone()), &trades_hash(&symbol));
    }

    fn on_kline(&self, client: &Client<Update>, event: KlineEvent) {
        let key = ohlcv_key(&event.symbol, &event.kline.interval);
        lock(&self.candles)
            .entry(key.clone())
            .or_insert_with(|| ArrayCacheByTimestamp::new(Some(self.cache_limit)))
            .append(Ohlcv::from(&event.kline));
        client.resolve(
            Update::Ohlcv(key),
            &ohlcv_hash(&event.symbol, &event.kline.interval),
        );
    }

    fn recent_trades(&self, symbol: &str, limit: Option<usize>) -> Vec<Trade> {
        let mut trades = lock(&self.trades);
        let Some(cache) = trades.get_mut(symbol) else {
            return Vec::new();
        };
        let n = cache.get_limit(Some(symbol), limit).unwrap_or(cache.len());
        cache.tail(n)
    }

    fn recent_candles(&self, key: &str, limit: Option<usize>) -> Vec<Ohlcv> {
        let mut candles = lock(&self.candles);
        let Some(cache) = candles.get_mut(key) else {
            return Vec::new();
        };
        let n = cache.get_limit(None, limit).unwrap_or(cache.len());
        cache.iter().skip(cache.len().saturating_sub(n)).copied().collect()
    }
}

/// Public market data from one Binance WebSocket endpoint
pub struct BinanceFeed {
    url: String,
    stream: Stream<Update>,
    shared: Arc<Shared>,
    request_id: AtomicU64,
}

impl BinanceFeed {
    pub fn new(config: &Config, source: Arc<dyn SnapshotSource>, metrics: FeedMetrics) -> Self {
        let shared = Arc::new(Shared {
            books: Mutex::new(OrderBookRegistry::new(Some(config.depth_levels), BookKind::Plain)),
            trades: Mutex::new(HashMap::new()),
            candles: Mutex::new(HashMap::new()),
            source,
            metrics,
            depth_levels: config.depth_levels,
            cache_limit: config.trades_limit,
            snapshot_max_retries: config.snapshot_max_retries,
        });

        let handler = Arc::clone(&shared);
        let stream: Stream<Update> = Stream::new(config.client_config(), move |client, message| {
            handler.handle(client, message)
        });

        Self {
            url: format!("{}/ws", config.ws_endpoint.trim_end_matches('/')),
            stream,
            shared,
            request_id: AtomicU64::new(1),
        }
    }

    /// Feed backed by the REST endpoint from `config`
    pub fn from_config(config: &Config, metrics: FeedMetrics) -> Self {
        let source = Arc::new(BinanceRest::new(config.rest_endpoint.clone()));
        Self::new(config, source, metrics)
    }

    fn subscribe_message(&self, stream_name: &str) -> Value {
        json!({
            "method": "SUBSCRIBE",
            "params": [stream_name],
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Next state of the order book for `symbol`
    ///
    /// The first call subscribes to the depth stream and resolves once the
    /// buffered deltas have been lined up with a snapshot.
    pub async fn watch_order_book(
        &self,
        symbol: &str,
        limit: Option<usize>,
    ) -> Result<OrderBookSnapshot> {
        let symbol = symbol.to_uppercase();
        let stream_name = format!("{}@depth@100ms", symbol.to_lowercase());

        let client = self.stream.client(&self.url);
        if !client.is_subscribed(&stream_name) {
            lock(&self.shared.books).init_book(&symbol);
        }

        let future = self.stream.watch(
            &self.url,
            &orderbook_hash(&symbol),
            Some(self.subscribe_message(&stream_name)),
            Some(&stream_name),
        );
        match future.await? {
            Update::Book(mut snapshot) => {
                if let Some(limit) = limit {
                    snapshot.bids.truncate(limit);
                    snapshot.asks.truncate(limit);
                }
                Ok(snapshot)
            }
            other => Err(StreamError::OrderBookError(format!(
                "Unexpected update for {symbol}: {other:?}"
            ))),
        }
    }

    /// Trades received since the previous call for `symbol`
    pub async fn watch_trades(&self, symbol: &str, limit: Option<usize>) -> Result<Vec<Trade>> {
        let symbol = symbol.to_uppercase();
        let stream_name = format!("{}@trade", symbol.to_lowercase());
        self.stream
            .watch(
                &self.url,
                &trades_hash(&symbol),
                Some(self.subscribe_message(&stream_name)),
                Some(&stream_name),
            )
            .await?;
        Ok(self.shared.recent_trades(&symbol, limit))
    }

    /// Bars touched since the previous call for `symbol` and `interval`
    pub async fn watch_ohlcv(
        &self,
        symbol: &str,
        interval: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Ohlcv>> {
        let symbol = symbol.to_uppercase();
        let stream_name = format!("{}@kline_{}", symbol.to_lowercase(), interval);
        self.stream
            .watch(
                &self.url,
                &ohlcv_hash(&symbol, interval),
                Some(self.subscribe_message(&stream_name)),
                Some(&stream_name),
            )
            .await?;
        Ok(self.shared.recent_candles(&ohlcv_key(&symbol, interval), limit))
    }

    /// Snapshots of every synced book
    pub fn order_books(&self) -> Vec<OrderBookSnapshot> {
        lock(&self.shared.books).get_all_states()
    }

    pub fn is_synced(&self, symbol: &str) -> bool {
        lock(&self.shared.books).is_synced(&symbol.to_uppercase())
    }

    pub fn metrics(&self) -> &FeedMetrics {
        &self.shared.metrics
    }

    /// Close every connection; pending watches are rejected
    pub async fn close(&self) {
        self.stream.close_all().await;
    }
}
