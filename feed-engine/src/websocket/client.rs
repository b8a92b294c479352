//! WebSocket client for exchange streams
//!
//! Owns one connection and its lifecycle: connect with an optional backoff,
//! a connection timeout, ping/pong keepalive, and message-hash keyed futures
//! that are settled by the message handler. Connection failures reject every
//! pending future and are reported once through the error/close handlers.
//! The client never reconnects on its own.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use super::MessageFuture;
use crate::error::{Result, StreamError};

/// How long `close` waits for the close frame to be flushed
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle settings for a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Time allowed between `connect` (after backoff) and the socket opening
    pub connection_timeout: Duration,
    /// Ping interval; zero disables keepalive
    pub keep_alive: Duration,
    /// Pings that may go unanswered before the connection is declared dead
    pub max_ping_pong_misses: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
            max_ping_pong_misses: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Open,
    Closed,
    /// Absorbing until the next `connect`
    Errored,
}

pub type MessageHandler<T> = Arc<dyn Fn(&Client<T>, Value) + Send + Sync>;
pub type ErrorHandler<T> = Arc<dyn Fn(&Client<T>, &StreamError) + Send + Sync>;
pub type ConnectedHandler<T> = Arc<dyn Fn(&Client<T>) + Send + Sync>;
/// Builds an application-level ping; `None` falls back to a protocol ping
pub type PingHandler<T> = Arc<dyn Fn(&Client<T>) -> Option<Value> + Send + Sync>;

/// Callbacks supplied by the exchange adapter
pub struct Handlers<T> {
    pub on_message: MessageHandler<T>,
    pub on_error: Option<ErrorHandler<T>>,
    pub on_close: Option<ErrorHandler<T>>,
    pub on_connected: Option<ConnectedHandler<T>>,
    pub ping: Option<PingHandler<T>>,
}

impl<T> Clone for Handlers<T> {
    fn clone(&self) -> Self {
        Self {
            on_message: Arc::clone(&self.on_message),
            on_error: self.on_error.clone(),
            on_close: self.on_close.clone(),
            on_connected: self.on_connected.clone(),
            ping: self.ping.clone(),
        }
    }
}

impl<T> Handlers<T> {
    pub fn new(on_message: impl Fn(&Client<T>, Value) + Send + Sync + 'static) -> Self {
        Self::from_shared(Arc::new(on_message))
    }

    pub fn from_shared(on_message: MessageHandler<T>) -> Self {
        Self {
            on_message,
            on_error: None,
            on_close: None,
            on_connected: None,
            ping: None,
        }
    }

    pub fn on_error(mut self, f: impl Fn(&Client<T>, &StreamError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn(&Client<T>, &StreamError) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_connected(mut self, f: impl Fn(&Client<T>) + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(f));
        self
    }

    pub fn ping(mut self, f: PingHandler<T>) -> Self {
        self.ping = Some(f);
        self
    }
}

struct State<T> {
    status: ConnectionState,
    futures: HashMap<String, MessageFuture<T>>,
    subscriptions: HashMap<String, Value>,
    connected: Option<MessageFuture<String>>,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    connection_started: Option<i64>,
    connection_established: Option<i64>,
    last_pong: Option<Instant>,
    close_code: Option<u16>,
    error: Option<StreamError>,
    connect_timer: Option<JoinHandle<()>>,
    keepalive_timer: Option<JoinHandle<()>>,
    io_task: Option<JoinHandle<()>>,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            status: ConnectionState::Unconnected,
            futures: HashMap::new(),
            subscriptions: HashMap::new(),
            connected: None,
            outgoing: None,
            connection_started: None,
            connection_established: None,
            last_pong: None,
            close_code: None,
            error: None,
            connect_timer: None,
            keepalive_timer: None,
            io_task: None,
        }
    }
}

/// Everything `reset` tears down, collected under the lock and released
/// outside it
struct Teardown<T> {
    tasks: Vec<JoinHandle<()>>,
    connected: Option<MessageFuture<String>>,
    futures: Vec<MessageFuture<T>>,
}

struct Inner<T> {
    url: String,
    config: ClientConfig,
    handlers: Handlers<T>,
    state: Mutex<State<T>>,
}

/// Cheaply cloneable handle to one WebSocket connection
pub struct Client<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl<T: Clone + Send + Sync + 'static> Client<T> {
    pub fn new(url: impl Into<String>, config: ClientConfig, handlers: Handlers<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                config,
                handlers,
                state: Mutex::new(State::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Futures keyed by message hash
    // ------------------------------------------------------------------

    /// Pending future for `hash`, created if absent
    pub fn future(&self, hash: &str) -> MessageFuture<T> {
        self.state()
            .futures
            .entry(hash.to_string())
            .or_default()
            .clone()
    }

    /// One future registered under every hash in `hashes`
    ///
    /// If one of the hashes already has a pending future it is reused, so
    /// the reply to any of them settles the same handle.
    pub fn future_any<I, S>(&self, hashes: I) -> MessageFuture<T>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hashes: Vec<String> = hashes.into_iter().map(|h| h.as_ref().to_string()).collect();
        let mut state = self.state();
        let future = hashes
            .iter()
            .find_map(|hash| state.futures.get(hash).cloned())
            .unwrap_or_default();
        for hash in hashes {
            state.futures.insert(hash, future.clone());
        }
        future
    }

    /// Pending future for `hash`, if any
    pub fn pending(&self, hash: &str) -> Option<MessageFuture<T>> {
        self.state().futures.get(hash).cloned()
    }

    /// Settle the future registered under `hash` (and every alias of it)
    ///
    /// Returns false if nothing was waiting on `hash`.
    pub fn resolve(&self, result: T, hash: &str) -> bool {
        match self.take_future(hash) {
            Some(future) => future.resolve(result),
            None => false,
        }
    }

    /// Reject the future under `hash`, or every pending future when `hash`
    /// is `None`
    pub fn reject(&self, error: StreamError, hash: Option<&str>) {
        let futures: Vec<MessageFuture<T>> = match hash {
            Some(hash) => self.take_future(hash).into_iter().collect(),
            None => self.state().futures.drain().map(|(_, f)| f).collect(),
        };
        for future in futures {
            future.reject(error.clone());
        }
    }

    fn take_future(&self, hash: &str) -> Option<MessageFuture<T>> {
        let mut state = self.state();
        let future = state.futures.remove(hash)?;
        state.futures.retain(|_, other| !other.same(&future));
        Some(future)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Record a subscription; returns false if it was already present
    pub fn subscribe(&self, hash: &str, subscription: Value) -> bool {
        let mut state = self.state();
        if state.subscriptions.contains_key(hash) {
            return false;
        }
        state.subscriptions.insert(hash.to_string(), subscription);
        true
    }

    pub fn unsubscribe(&self, hash: &str) -> Option<Value> {
        self.state().subscriptions.remove(hash)
    }

    pub fn is_subscribed(&self, hash: &str) -> bool {
        self.state().subscriptions.contains_key(hash)
    }

    pub fn subscription(&self, hash: &str) -> Option<Value> {
        self.state().subscriptions.get(hash).cloned()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open the connection after `backoff`
    ///
    /// Returns the connection future, resolved with the URL once the socket
    /// is open. While a connection is open or being opened, the existing
    /// future is returned and nothing else happens. Must be called inside a
    /// tokio runtime.
    pub fn connect(&self, backoff: Duration) -> MessageFuture<String> {
        let mut state = self.state();
        if matches!(state.status, ConnectionState::Connecting | ConnectionState::Open) {
            if let Some(connected) = &state.connected {
                return connected.clone();
            }
        }

        let connected = MessageFuture::new();
        state.connected = Some(connected.clone());
        state.status = ConnectionState::Connecting;
        state.error = None;
        state.close_code = None;
        state.connection_started = Some(now_ms());
        state.connection_established = None;

        info!(
            url = %self.inner.url,
            backoff_ms = backoff.as_millis() as u64,
            "Connecting to WebSocket"
        );

        let client = self.clone();
        let deadline = backoff + self.inner.config.connection_timeout;
        state.connect_timer = Some(tokio::spawn(async move {
            sleep(deadline).await;
            client.on_connection_timeout();
        }));

        let client = self.clone();
        state.io_task = Some(tokio::spawn(async move {
            client.run(backoff).await;
        }));

        connected
    }

    async fn run(self, backoff: Duration) {
        if !backoff.is_zero() {
            sleep(backoff).await;
        }

        let stream = match connect_async(self.inner.url.as_str()).await {
            Ok((stream, response)) => {
                debug!(url = %self.inner.url, status = ?response.status(), "WebSocket handshake complete");
                stream
            }
            Err(e) => {
                self.on_error(StreamError::WebSocketConnection(format!(
                    "Failed to connect to {}: {}",
                    self.inner.url, e
                )));
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        if !self.on_open(tx) {
            return;
        }

        let (mut sink, mut source) = stream.split();
        loop {
            tokio::select! {
                outgoing = rx.recv() => match outgoing {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            self.on_error(StreamError::WebSocketMessage(e.to_string()));
                            return;
                        }
                    }
                    None => {
                        // sender dropped by close/reset
                        let _ = sink.close().await;
                        return;
                    }
                },
                incoming = source.next() => match incoming {
                    Some(Ok(message)) => self.on_frame(message),
                    Some(Err(e)) => {
                        self.on_error(StreamError::WebSocketMessage(e.to_string()));
                        return;
                    }
                    None => {
                        self.on_close();
                        return;
                    }
                },
            }
        }
    }

    /// Transition to open; false if the attempt was abandoned meanwhile
    fn on_open(&self, outgoing: mpsc::UnboundedSender<Message>) -> bool {
        let (connected, keepalive) = {
            let mut state = self.state();
            if state.status != ConnectionState::Connecting {
                return false;
            }
            state.status = ConnectionState::Open;
            state.outgoing = Some(outgoing);
            state.connection_established = Some(now_ms());
            state.last_pong = Some(Instant::now());
            if let Some(timer) = state.connect_timer.take() {
                timer.abort();
            }
            (state.connected.clone(), self.keepalive_enabled())
        };

        if keepalive {
            let timer = self.spawn_keepalive();
            self.state().keepalive_timer = Some(timer);
        }

        info!(url = %self.inner.url, "WebSocket connected");
        if let Some(connected) = connected {
            connected.resolve(self.inner.url.clone());
        }
        if let Some(on_connected) = &self.inner.handlers.on_connected {
            on_connected(self);
        }
        true
    }

    fn keepalive_enabled(&self) -> bool {
        !self.inner.config.keep_alive.is_zero()
    }

    fn spawn_keepalive(&self) -> JoinHandle<()> {
        let client = self.clone();
        let period = self.inner.config.keep_alive;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !client.keepalive_tick() {
                    break;
                }
            }
        })
    }

    /// One keepalive round; false stops the timer
    fn keepalive_tick(&self) -> bool {
        let last_pong = {
            let state = self.state();
            if state.status != ConnectionState::Open {
                return false;
            }
            state.last_pong
        };

        let config = &self.inner.config;
        let allowed = config.keep_alive * config.max_ping_pong_misses;
        let elapsed = last_pong.map_or(Duration::ZERO, |t| t.elapsed());
        if elapsed > allowed {
            self.on_error(StreamError::KeepaliveTimeout {
                url: self.inner.url.clone(),
                elapsed_ms: elapsed.as_millis() as u64,
            });
            return false;
        }

        let ping = match &self.inner.handlers.ping {
            Some(ping) => ping(self).map(|message| Message::Text(message.to_string())),
            None => Some(Message::Ping(Vec::new())),
        };
        if let Some(ping) = ping {
            if let Err(e) = self.send_frame(ping) {
                warn!(url = %self.inner.url, error = %e, "Failed to send keepalive ping");
            }
        }
        true
    }

    fn on_connection_timeout(&self) {
        if self.status() != ConnectionState::Connecting {
            return;
        }
        self.on_error(StreamError::ConnectionTimeout {
            url: self.inner.url.clone(),
            timeout_ms: self.inner.config.connection_timeout.as_millis() as u64,
        });
    }

    fn on_frame(&self, message: Message) {
        match message {
            Message::Text(text) => self.on_text(&text),
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => self.on_text(&text),
                Err(_) => warn!(url = %self.inner.url, "Dropping non-UTF-8 binary message"),
            },
            Message::Ping(data) => {
                debug!("Received ping, sending pong");
                self.touch_pong();
                if let Err(e) = self.send_frame(Message::Pong(data)) {
                    warn!(url = %self.inner.url, error = %e, "Failed to answer ping");
                }
            }
            Message::Pong(_) => {
                debug!("Received pong");
                self.touch_pong();
            }
            Message::Close(frame) => {
                warn!(frame = ?frame, "Received close frame");
                self.state().close_code = frame.map(|f| u16::from(f.code));
            }
            Message::Frame(_) => {}
        }
    }

    fn on_text(&self, text: &str) {
        let trimmed = text.trim_start();
        let message = if trimmed.starts_with('{') || trimmed.starts_with('[') {
            match serde_json::from_str::<Value>(text) {
                Ok(value) => value,
                Err(e) => {
                    warn!(url = %self.inner.url, error = %e, len = text.len(), "Dropping malformed message");
                    return;
                }
            }
        } else {
            // plain-text heartbeats such as "pong"
            Value::String(text.to_string())
        };
        (self.inner.handlers.on_message)(self, message);
    }

    /// Record liveness; adapters call this when an application-level pong
    /// arrives
    pub fn touch_pong(&self) {
        self.state().last_pong = Some(Instant::now());
    }

    /// Transport failure: enter the error state, tear down, notify once
    pub fn on_error(&self, error: StreamError) {
        {
            let mut state = self.state();
            if matches!(state.status, ConnectionState::Errored | ConnectionState::Closed) {
                debug!(url = %self.inner.url, error = %error, "Ignoring error on a finished connection");
                return;
            }
            state.status = ConnectionState::Errored;
            state.error = Some(error.clone());
        }
        error!(url = %self.inner.url, error = %error, "WebSocket error");
        self.reset(error.clone());
        if let Some(on_error) = &self.inner.handlers.on_error {
            on_error(self, &error);
        }
    }

    /// Stream ended
    fn on_close(&self) {
        let (error, locally_closed) = {
            let mut state = self.state();
            let locally_closed = state.status == ConnectionState::Closed;
            if state.status == ConnectionState::Errored {
                return;
            }
            state.status = ConnectionState::Closed;
            let error = StreamError::RemoteClose {
                url: self.inner.url.clone(),
                code: state.close_code.unwrap_or(1006),
            };
            (error, locally_closed)
        };
        if locally_closed {
            return;
        }
        warn!(url = %self.inner.url, error = %error, "WebSocket closed by remote");
        self.reset(error.clone());
        if let Some(on_close) = &self.inner.handlers.on_close {
            on_close(self, &error);
        }
    }

    /// Disarm every timer, stop the connection task, reject the connection
    /// future and every pending future with `error`, and forget
    /// subscriptions. Safe to call repeatedly.
    pub fn reset(&self, error: StreamError) {
        let teardown = {
            let mut state = self.state();
            state.outgoing = None;
            state.subscriptions.clear();
            Teardown {
                tasks: [
                    state.connect_timer.take(),
                    state.keepalive_timer.take(),
                    state.io_task.take(),
                ]
                .into_iter()
                .flatten()
                .collect(),
                connected: state.connected.take(),
                futures: state.futures.drain().map(|(_, f)| f).collect(),
            }
        };

        for task in teardown.tasks {
            task.abort();
        }
        if let Some(connected) = teardown.connected {
            connected.reject(error.clone());
        }
        for future in teardown.futures {
            future.reject(error.clone());
        }
    }

    /// Close the connection from our side
    pub async fn close(&self) {
        let (outgoing, io_task) = {
            let mut state = self.state();
            if matches!(state.status, ConnectionState::Open | ConnectionState::Connecting) {
                state.status = ConnectionState::Closed;
            }
            (state.outgoing.take(), state.io_task.take())
        };

        if let Some(outgoing) = outgoing {
            let _ = outgoing.send(Message::Close(None));
        }
        if let Some(io_task) = io_task {
            let abort = io_task.abort_handle();
            if timeout(CLOSE_GRACE, io_task).await.is_err() {
                abort.abort();
            }
        }

        info!(url = %self.inner.url, "WebSocket closed");
        self.reset(StreamError::ConnectionClosed(format!(
            "{} closed by the client",
            self.inner.url
        )));
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send a JSON message
    pub fn send(&self, message: &Value) -> Result<()> {
        debug!(url = %self.inner.url, message = %message, "Sending message");
        self.send_frame(Message::Text(message.to_string()))
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send_frame(Message::Text(text.into()))
    }

    fn send_frame(&self, message: Message) -> Result<()> {
        let outgoing = self
            .state()
            .outgoing
            .clone()
            .ok_or_else(|| StreamError::NotConnected(self.inner.url.clone()))?;
        outgoing
            .send(message)
            .map_err(|_| StreamError::NotConnected(self.inner.url.clone()))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ConnectionState {
        self.state().status
    }

    pub fn is_open(&self) -> bool {
        self.status() == ConnectionState::Open
    }

    pub fn error(&self) -> Option<StreamError> {
        self.state().error.clone()
    }

    pub fn connection_started(&self) -> Option<i64> {
        self.state().connection_started
    }

    pub fn connection_established(&self) -> Option<i64> {
        self.state().connection_established
    }

    pub fn last_pong(&self) -> Option<Instant> {
        self.state().last_pong
    }

    /// Whether both handles refer to the same connection
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
