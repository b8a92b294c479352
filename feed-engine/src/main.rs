//! Feed Engine - Binance demo feed
//!
//! Streams order books and trades for the configured symbols, logs top of
//! book, and serves `/health` and `/metrics`. Reconnection with exponential
//! backoff lives here; the library never retries on its own.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use feed_engine::{BinanceFeed, Config, FeedMetrics};

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF_MS: u64 = 60_000;
/// How often each symbol logs its top of book
const STATUS_INTERVAL: Duration = Duration::from_secs(30);
/// Levels per side returned to the book watchers
const WATCH_DEPTH: usize = 5;

/// Application state shared with the health server
struct AppState {
    feed: Arc<BinanceFeed>,
    config: Arc<Config>,
    started: Instant,
}

/// Exponential backoff between failed watches
struct Backoff {
    base_delay_ms: u64,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    fn new(config: &Config) -> Self {
        Self {
            base_delay_ms: config.reconnect_delay_ms,
            max_attempts: config.max_reconnect_attempts,
            attempts: 0,
        }
    }

    fn success(&mut self) {
        if self.attempts > 0 {
            info!(previous_attempts = self.attempts, "Feed recovered, resetting reconnect counter");
            self.attempts = 0;
        }
    }

    /// Delay before the next attempt; `None` once the attempts are used up
    /// (a limit of 0 retries forever)
    fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.max_attempts > 0 && self.attempts > self.max_attempts {
            return None;
        }
        let base_delay = self.base_delay_ms * 2u64.pow(self.attempts.min(6));
        Some(Duration::from_millis(base_delay.min(MAX_BACKOFF_MS)))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Feed Engine");

    // Load configuration
    let config = Arc::new(Config::load()?);
    info!(symbols = ?config.symbols, endpoint = %config.ws_endpoint, "Configuration loaded");

    let metrics = FeedMetrics::new()?;
    let feed = Arc::new(BinanceFeed::from_config(&config, metrics));

    let state = Arc::new(AppState {
        feed: Arc::clone(&feed),
        config: Arc::clone(&config),
        started: Instant::now(),
    });

    // Start health check server
    let health_state = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state).await {
            warn!(error = %e, "Health server error");
        }
    });

    let mut watchers = JoinSet::new();
    for symbol in &config.symbols {
        watchers.spawn(run_order_book(Arc::clone(&feed), Arc::clone(&config), symbol.clone()));
        watchers.spawn(run_trades(Arc::clone(&feed), Arc::clone(&config), symbol.clone()));
    }

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            Ok(())
        }
        Some(joined) = watchers.join_next() => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(e.into()),
        },
    };

    watchers.abort_all();
    feed.close().await;
    if let Err(e) = &outcome {
        error!(error = %e, "Feed stopped");
    }
    outcome
}

async fn run_order_book(feed: Arc<BinanceFeed>, config: Arc<Config>, symbol: String) -> anyhow::Result<()> {
    let mut backoff = Backoff::new(&config);
    let mut last_status: Option<Instant> = None;

    loop {
        match feed.watch_order_book(&symbol, Some(WATCH_DEPTH)).await {
            Ok(book) => {
                backoff.success();
                if last_status.map_or(true, |at| at.elapsed() >= STATUS_INTERVAL) {
                    last_status = Some(Instant::now());
                    info!(
                        symbol = %symbol,
                        best_bid = ?book.bids.first().map(|l| l.price),
                        best_ask = ?book.asks.first().map(|l| l.price),
                        nonce = ?book.nonce,
                        datetime = ?book.datetime,
                        "Order book status"
                    );
                }
            }
            Err(e) => {
                let Some(delay) = backoff.next_delay() else {
                    anyhow::bail!("order book watch for {symbol} failed too many times: {e}");
                };
                warn!(
                    symbol = %symbol,
                    error = %e,
                    attempt = backoff.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Order book watch failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

async fn run_trades(feed: Arc<BinanceFeed>, config: Arc<Config>, symbol: String) -> anyhow::Result<()> {
    let mut backoff = Backoff::new(&config);

    loop {
        match feed.watch_trades(&symbol, None).await {
            Ok(trades) => {
                backoff.success();
                for trade in &trades {
                    tracing::debug!(
                        symbol = %trade.symbol,
                        price = %trade.price,
                        amount = %trade.amount,
                        side = ?trade.side,
                        "Trade received"
                    );
                }
            }
            Err(e) => {
                let Some(delay) = backoff.next_delay() else {
                    anyhow::bail!("trade watch for {symbol} failed too many times: {e}");
                };
                warn!(symbol = %symbol, error = %e, delay_ms = delay.as_millis() as u64, "Trade watch failed, retrying");
                sleep(delay).await;
            }
        }
    }
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.health_port));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let synced: Vec<&String> = state
        .config
        .symbols
        .iter()
        .filter(|symbol| state.feed.is_synced(symbol))
        .collect();
    let status = if synced.len() == state.config.symbols.len() {
        "healthy"
    } else {
        "degraded"
    };

    Json(serde_json::json!({
        "status": status,
        "component": "feed-engine",
        "synced": synced,
        "uptime_secs": state.started.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<String, (StatusCode, String)> {
    state
        .feed
        .metrics()
        .render()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
