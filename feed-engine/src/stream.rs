//! Watch orchestration
//!
//! [`Stream`] keeps one [`Client`] per URL and implements the
//! subscribe-once/await-many pattern used by every `watch_*` call.
//! [`OrderBookRegistry`] holds the per-symbol books fed by the message
//! handler, and [`load_order_book`] resynchronises one of them from a REST
//! snapshot.

use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};
use crate::orderbook::{BookDelta, BookKind, OrderBook, OrderBookSnapshot};
use crate::websocket::{Client, ClientConfig, Handlers, MessageFuture, MessageHandler, PingHandler};

type ClientMap<T> = Mutex<HashMap<String, Client<T>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of connections sharing one message handler
pub struct Stream<T> {
    config: ClientConfig,
    on_message: MessageHandler<T>,
    ping: Option<PingHandler<T>>,
    clients: Arc<ClientMap<T>>,
}

impl<T: Clone + Send + Sync + 'static> Stream<T> {
    pub fn new(
        config: ClientConfig,
        on_message: impl Fn(&Client<T>, Value) + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            on_message: Arc::new(on_message),
            ping: None,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Application-level ping used by every client of this stream
    pub fn with_ping(
        mut self,
        ping: impl Fn(&Client<T>) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.ping = Some(Arc::new(ping));
        self
    }

    /// The client for `url`, created on first use
    ///
    /// A client is dropped from the registry when it errors or is closed by
    /// the server, so the next call starts from a fresh connection.
    pub fn client(&self, url: &str) -> Client<T> {
        let mut clients = lock(&self.clients);
        if let Some(client) = clients.get(url) {
            return client.clone();
        }

        let on_error = Arc::downgrade(&self.clients);
        let on_close = Weak::clone(&on_error);
        let mut handlers = Handlers::from_shared(Arc::clone(&self.on_message))
            .on_error(move |client, error| {
                debug!(url = %client.url(), error = %error, "Dropping errored client");
                forget(&on_error, client);
            })
            .on_close(move |client, error| {
                debug!(url = %client.url(), error = %error, "Dropping closed client");
                forget(&on_close, client);
            });
        if let Some(ping) = &self.ping {
            handlers = handlers.ping(Arc::clone(ping));
        }

        let client = Client::new(url, self.config, handlers);
        clients.insert(url.to_string(), client.clone());
        client
    }

    /// Future for the next message routed to `message_hash` on `url`
    ///
    /// Connects if needed. Once connected, `message` is sent unless
    /// `subscribe_hash` is already recorded as a subscription on the
    /// client. Without a subscribe hash an already pending future for
    /// `message_hash` is returned as is.
    pub fn watch(
        &self,
        url: &str,
        message_hash: &str,
        message: Option<Value>,
        subscribe_hash: Option<&str>,
    ) -> MessageFuture<T> {
        let client = self.client(url);
        if subscribe_hash.is_none() {
            if let Some(pending) = client.pending(message_hash) {
                return pending;
            }
        }
        let future = client.future(message_hash);
        self.subscribe(client, message, subscribe_hash.map(str::to_string), future.clone());
        future
    }

    /// Like [`Stream::watch`] for a request answered under any of several
    /// hashes
    pub fn watch_multiple(
        &self,
        url: &str,
        message_hashes: &[&str],
        message: Option<Value>,
        subscribe_hash: Option<&str>,
    ) -> MessageFuture<T> {
        let client = self.client(url);
        let future = client.future_any(message_hashes);
        self.subscribe(client, message, subscribe_hash.map(str::to_string), future.clone());
        future
    }

    fn subscribe(
        &self,
        client: Client<T>,
        message: Option<Value>,
        subscribe_hash: Option<String>,
        future: MessageFuture<T>,
    ) {
        let connected = client.connect(Duration::ZERO);
        tokio::spawn(async move {
            // a failed connection has already rejected `future`
            if connected.await.is_err() {
                return;
            }
            if let Some(hash) = &subscribe_hash {
                if !client.subscribe(hash, Value::Bool(true)) {
                    return;
                }
            }
            let Some(message) = message else {
                return;
            };
            if let Err(e) = client.send(&message) {
                warn!(url = %client.url(), error = %e, "Failed to send subscription");
                if let Some(hash) = &subscribe_hash {
                    client.unsubscribe(hash);
                }
                future.reject(e);
            }
        });
    }

    pub fn len(&self) -> usize {
        lock(&self.clients).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.clients).is_empty()
    }

    /// Close and forget every client
    pub async fn close_all(&self) {
        let clients: Vec<Client<T>> = lock(&self.clients).drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close().await;
        }
    }
}

fn forget<T: Clone + Send + Sync + 'static>(registry: &Weak<ClientMap<T>>, client: &Client<T>) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let mut clients = lock(&registry);
    if clients.get(client.url()).is_some_and(|known| known.same(client)) {
        clients.remove(client.url());
    }
}

/// What happened to a delta routed through [`OrderBookRegistry::apply`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Held until a snapshot arrives; carries the buffer length
    Buffered(usize),
    Stale,
    /// The batch skipped updates; the book was dropped and buffers again
    Gap { expected: u64, first: u64 },
    UnknownSymbol,
}

/// Order books for multiple symbols
#[derive(Debug)]
pub struct OrderBookRegistry {
    books: HashMap<String, OrderBook>,
    depth: Option<usize>,
    kind: BookKind,
}

impl OrderBookRegistry {
    pub fn new(depth: Option<usize>, kind: BookKind) -> Self {
        Self {
            books: HashMap::new(),
            depth,
            kind,
        }
    }

    /// Start a symbol over: an empty book that buffers deltas
    pub fn init_book(&mut self, symbol: &str) -> &mut OrderBook {
        let book = OrderBook::pending(Some(symbol.to_string()), self.depth, self.kind);
        match self.books.entry(symbol.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.insert(book);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(book),
        }
    }

    /// Route a delta to its book
    pub fn apply(&mut self, symbol: &str, delta: BookDelta) -> ApplyOutcome {
        let Some(book) = self.books.get_mut(symbol) else {
            return ApplyOutcome::UnknownSymbol;
        };
        if !book.is_synced() {
            book.cache_delta(delta);
            return ApplyOutcome::Buffered(book.buffered());
        }
        if let (Some(expected), Some(first)) = (book.gap(delta.first_nonce), delta.first_nonce) {
            warn!(symbol = %symbol, expected, first, "Order book update skipped nonces, dropping book");
            book.invalidate();
            return ApplyOutcome::Gap { expected, first };
        }
        if book.apply(delta) {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Stale
        }
    }

    /// Resync a symbol from a snapshot; `None` if the symbol is unknown
    pub fn resync(&mut self, symbol: &str, snapshot: OrderBookSnapshot) -> Option<bool> {
        self.books.get_mut(symbol).map(|book| book.resync(snapshot))
    }

    /// Drop a symbol's state and go back to buffering
    pub fn invalidate(&mut self, symbol: &str) {
        if let Some(book) = self.books.get_mut(symbol) {
            book.invalidate();
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&OrderBook> {
        self.books.get(symbol)
    }

    /// Snapshot of a synced book, truncated to `limit` levels per side
    pub fn get_state(&self, symbol: &str, limit: Option<usize>) -> Option<OrderBookSnapshot> {
        let book = self.books.get(symbol).filter(|book| book.is_synced())?;
        let mut snapshot = book.snapshot();
        if let Some(limit) = limit {
            snapshot.bids.truncate(limit);
            snapshot.asks.truncate(limit);
        }
        Some(snapshot)
    }

    /// Snapshots of every synced book
    pub fn get_all_states(&self) -> Vec<OrderBookSnapshot> {
        self.books
            .values()
            .filter(|book| book.is_synced())
            .map(OrderBook::snapshot)
            .collect()
    }

    pub fn is_synced(&self, symbol: &str) -> bool {
        self.books.get(symbol).is_some_and(OrderBook::is_synced)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.books.keys().cloned().collect()
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.books.contains_key(symbol)
    }
}

/// Where order book snapshots come from (normally a REST endpoint)
#[cfg_attr(test, mockall::automock)]
pub trait SnapshotSource: Send + Sync {
    fn fetch_order_book(
        &self,
        symbol: &str,
        limit: Option<usize>,
    ) -> BoxFuture<'static, Result<OrderBookSnapshot>>;
}

/// Fetch snapshots until one lines up with the buffered deltas of `symbol`
///
/// On success the book is resynced and the future under `message_hash` is
/// resolved with its contents. After `max_retries` attempts the future is
/// rejected, the book is invalidated so buffering starts over, and the last
/// error is returned ([`StreamError::NonceBehind`] when every snapshot was
/// too old).
pub async fn load_order_book<S, T>(
    source: &S,
    books: &Mutex<OrderBookRegistry>,
    client: &Client<T>,
    message_hash: &str,
    symbol: &str,
    limit: Option<usize>,
    max_retries: u32,
) -> Result<OrderBookSnapshot>
where
    S: SnapshotSource + ?Sized,
    T: From<OrderBookSnapshot> + Clone + Send + Sync + 'static,
{
    let tries = max_retries.max(1);
    let mut last_error = StreamError::NonceBehind {
        symbol: symbol.to_string(),
        tries,
    };

    for attempt in 1..=tries {
        let snapshot = match source.fetch_order_book(symbol, limit).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(symbol = %symbol, attempt, error = %e, "Order book snapshot request failed");
                last_error = e;
                continue;
            }
        };
        let snapshot_nonce = snapshot.nonce;

        let resynced = {
            let mut books = lock(books);
            match books.resync(symbol, snapshot) {
                Some(true) => books.get_state(symbol, None),
                Some(false) => None,
                None => {
                    return Err(StreamError::OrderBookError(format!(
                        "No order book initialised for {symbol}"
                    )))
                }
            }
        };

        if let Some(state) = resynced {
            info!(symbol = %symbol, nonce = ?state.nonce, attempt, "Order book synchronised");
            client.resolve(T::from(state.clone()), message_hash);
            return Ok(state);
        }

        warn!(
            symbol = %symbol,
            attempt,
            snapshot_nonce = ?snapshot_nonce,
            "Snapshot is behind the buffered deltas, retrying"
        );
        last_error = StreamError::NonceBehind {
            symbol: symbol.to_string(),
            tries: attempt,
        };
    }

    lock(books).invalidate(symbol);
    client.reject(last_error.clone(), Some(message_hash));
    Err(last_error)
}
