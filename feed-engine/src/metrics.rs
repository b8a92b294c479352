//! Prometheus counters for the feed

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Counters exposed on `/metrics`
#[derive(Clone)]
pub struct FeedMetrics {
    registry: Registry,
    /// Messages handed to the adapter, by stream kind
    pub messages_received: IntCounterVec,
    /// Messages that failed to decode
    pub malformed_messages: IntCounter,
    /// Book deltas dropped for carrying an old nonce
    pub stale_updates: IntCounter,
    /// Synced books dropped because a batch skipped nonces
    pub sequence_gaps: IntCounter,
    /// Successful snapshot resyncs
    pub resyncs: IntCounter,
    /// Snapshot resyncs abandoned after the retry limit
    pub resync_failures: IntCounter,
}

impl FeedMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("feed_engine".to_string()), None)?;

        let messages_received = IntCounterVec::new(
            Opts::new("messages_received_total", "WebSocket messages received"),
            &["kind"],
        )?;
        let malformed_messages =
            IntCounter::new("malformed_messages_total", "Messages dropped as malformed")?;
        let stale_updates =
            IntCounter::new("stale_updates_total", "Order book deltas dropped as stale")?;
        let sequence_gaps = IntCounter::new(
            "sequence_gaps_total",
            "Order books dropped after a delta skipped nonces",
        )?;
        let resyncs = IntCounter::new("resyncs_total", "Order books resynced from a snapshot")?;
        let resync_failures = IntCounter::new(
            "resync_failures_total",
            "Order book resyncs abandoned after the retry limit",
        )?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(malformed_messages.clone()))?;
        registry.register(Box::new(stale_updates.clone()))?;
        registry.register(Box::new(sequence_gaps.clone()))?;
        registry.register(Box::new(resyncs.clone()))?;
        registry.register(Box::new(resync_failures.clone()))?;

        Ok(Self {
            registry,
            messages_received,
            malformed_messages,
            stale_updates,
            sequence_gaps,
            resyncs,
            resync_failures,
        })
    }

    /// Text exposition format
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
