//! Parser module for Binance WebSocket and REST messages
//!
//! Handles deserialization of depth updates, trades, klines and depth
//! snapshots, and converts them into the engine's generic deltas and items.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::str::FromStr;

use crate::orderbook::{BookDelta, OrderBookSnapshot, PriceLevel};
use crate::types::{Ohlcv, Trade};

/// Binance depth update message
#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdate {
    /// Event type
    #[serde(rename = "e")]
    pub event_type: String,

    /// Event time (milliseconds)
    #[serde(rename = "E")]
    pub event_time: i64,

    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// First update ID in event
    #[serde(rename = "U")]
    pub first_update_id: u64,

    /// Final update ID in event
    #[serde(rename = "u")]
    pub final_update_id: u64,

    /// Bids to update
    #[serde(rename = "b", deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    /// Asks to update
    #[serde(rename = "a", deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

impl DepthUpdate {
    pub fn into_delta(self) -> BookDelta {
        BookDelta {
            first_nonce: Some(self.first_update_id),
            nonce: Some(self.final_update_id),
            timestamp: Some(self.event_time),
            bids: self.bids,
            asks: self.asks,
        }
    }
}

/// Binance trade message
#[derive(Debug, Clone, Deserialize)]
pub struct TradeEvent {
    #[serde(rename = "e")]
    pub event_type: String,

    #[serde(rename = "E")]
    pub event_time: i64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "t")]
    pub trade_id: u64,

    #[serde(rename = "p", deserialize_with = "deserialize_decimal")]
    pub price: Decimal,

    #[serde(rename = "q", deserialize_with = "deserialize_decimal")]
    pub quantity: Decimal,

    /// Trade time
    #[serde(rename = "T")]
    pub trade_time: i64,

    /// Is buyer maker
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

impl From<TradeEvent> for Trade {
    fn from(event: TradeEvent) -> Self {
        // a buyer-maker trade was initiated by the seller
        let side = if event.is_buyer_maker { "sell" } else { "buy" };
        Trade {
            id: Some(event.trade_id.to_string()),
            symbol: event.symbol,
            timestamp: event.trade_time,
            price: event.price,
            amount: event.quantity,
            side: Some(side.to_string()),
        }
    }
}

/// Binance kline message
#[derive(Debug, Clone, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "e")]
    pub event_type: String,

    #[serde(rename = "E")]
    pub event_time: i64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "k")]
    pub kline: Kline,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Kline {
    /// Open time
    #[serde(rename = "t")]
    pub start_time: i64,

    #[serde(rename = "i")]
    pub interval: String,

    #[serde(rename = "o", deserialize_with = "deserialize_decimal")]
    pub open: Decimal,

    #[serde(rename = "h", deserialize_with = "deserialize_decimal")]
    pub high: Decimal,

    #[serde(rename = "l", deserialize_with = "deserialize_decimal")]
    pub low: Decimal,

    #[serde(rename = "c", deserialize_with = "deserialize_decimal")]
    pub close: Decimal,

    #[serde(rename = "v", deserialize_with = "deserialize_decimal")]
    pub volume: Decimal,

    /// Whether the bar is final
    #[serde(rename = "x")]
    pub closed: bool,
}

impl From<&Kline> for Ohlcv {
    fn from(kline: &Kline) -> Self {
        Ohlcv {
            timestamp: kline.start_time,
            open: kline.open,
            high: kline.high,
            low: kline.low,
            close: kline.close,
            volume: kline.volume,
        }
    }
}

/// Order book snapshot from REST API
#[derive(Debug, Clone, Deserialize)]
pub struct DepthSnapshot {
    /// Last update ID
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    #[serde(deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    #[serde(deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

impl DepthSnapshot {
    /// Binance snapshots carry no timestamp
    pub fn into_snapshot(self, symbol: &str) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: Some(symbol.to_string()),
            nonce: Some(self.last_update_id),
            timestamp: None,
            datetime: None,
            bids: self.bids,
            asks: self.asks,
        }
    }
}

/// Combined stream message wrapper
#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    /// Stream name
    pub stream: String,

    /// Data payload
    pub data: Value,
}

/// Reply to a SUBSCRIBE/UNSUBSCRIBE request
#[derive(Debug, Clone, Deserialize)]
pub struct CommandReply {
    pub result: Value,
    pub id: u64,
}

/// Parsed WebSocket message
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    DepthUpdate(DepthUpdate),
    Trade(TradeEvent),
    Kline(KlineEvent),
    Reply(CommandReply),
    Unknown(Value),
}

impl ParsedMessage {
    /// Parse a raw WebSocket message
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        Self::parse_value(serde_json::from_str(raw)?)
    }

    /// Classify an already decoded message
    ///
    /// Combined-stream envelopes are unwrapped first. A payload whose event
    /// type is known but whose fields do not match is an error.
    pub fn parse_value(value: Value) -> Result<Self, serde_json::Error> {
        if value.get("stream").is_some() && value.get("data").is_some() {
            let envelope: StreamMessage = serde_json::from_value(value)?;
            return Self::parse_value(envelope.data);
        }

        match value.get("e").and_then(Value::as_str) {
            Some("depthUpdate") => Ok(ParsedMessage::DepthUpdate(serde_json::from_value(value)?)),
            Some("trade") => Ok(ParsedMessage::Trade(serde_json::from_value(value)?)),
            Some("kline") => Ok(ParsedMessage::Kline(serde_json::from_value(value)?)),
            Some(_) => Ok(ParsedMessage::Unknown(value)),
            None if value.get("id").is_some() && value.get("result").is_some() => {
                Ok(ParsedMessage::Reply(serde_json::from_value(value)?))
            }
            None => Ok(ParsedMessage::Unknown(value)),
        }
    }
}

/// Custom deserializer for Decimal from string
fn deserialize_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Decimal::from_str(&s).map_err(serde::de::Error::custom)
}

/// Custom deserializer for price levels from array of string pairs
fn deserialize_price_levels<'de, D>(deserializer: D) -> Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("Invalid price level format"));
            }
            Ok(PriceLevel::new(
                Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?,
                Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_depth_update() {
        let raw = r#"{
            "e": "depthUpdate",
            "E": 1672531200000,
            "s": "BTCUSDT",
            "U": 100,
            "u": 105,
            "b": [["50000.00", "1.5"], ["49999.00", "2.0"]],
            "a": [["50001.00", "1.0"], ["50002.00", "0.5"]]
        }"#;

        let msg = ParsedMessage::parse(raw).unwrap();
        if let ParsedMessage::DepthUpdate(depth) = msg {
            assert_eq!(depth.symbol, "BTCUSDT");
            let delta = depth.into_delta();
            assert_eq!(delta.first_nonce, Some(100));
            assert_eq!(delta.nonce, Some(105));
            assert_eq!(delta.timestamp, Some(1672531200000));
            assert_eq!(delta.bids.len(), 2);
            assert_eq!(delta.asks[0], PriceLevel::new(dec!(50001.00), dec!(1.0)));
        } else {
            panic!("Expected DepthUpdate");
        }
    }

    #[test]
    fn test_parse_combined_trade() {
        let raw = r#"{
            "stream": "btcusdt@trade",
            "data": {
                "e": "trade",
                "E": 1672531200000,
                "s": "BTCUSDT",
                "t": 12345,
                "p": "50000.50",
                "q": "0.5",
                "b": 111,
                "a": 222,
                "T": 1672531200001,
                "m": true
            }
        }"#;

        let msg = ParsedMessage::parse(raw).unwrap();
        if let ParsedMessage::Trade(event) = msg {
            let trade = Trade::from(event);
            assert_eq!(trade.symbol, "BTCUSDT");
            assert_eq!(trade.id.as_deref(), Some("12345"));
            assert_eq!(trade.price, dec!(50000.50));
            assert_eq!(trade.timestamp, 1672531200001);
            assert_eq!(trade.side.as_deref(), Some("sell"));
        } else {
            panic!("Expected Trade");
        }
    }

    #[test]
    fn test_parse_kline() {
        let raw = r#"{
            "e": "kline", "E": 1672531260000, "s": "ETHUSDT",
            "k": {"t": 1672531200000, "T": 1672531259999, "s": "ETHUSDT", "i": "1m",
                  "o": "1200.0", "c": "1201.5", "h": "1202.0", "l": "1199.0",
                  "v": "35.2", "x": false}
        }"#;

        let msg = ParsedMessage::parse(raw).unwrap();
        if let ParsedMessage::Kline(event) = msg {
            let bar = Ohlcv::from(&event.kline);
            assert_eq!(event.kline.interval, "1m");
            assert_eq!(bar.timestamp, 1672531200000);
            assert_eq!(bar.close, dec!(1201.5));
        } else {
            panic!("Expected Kline");
        }
    }

    #[test]
    fn test_parse_reply_and_unknown() {
        assert!(matches!(
            ParsedMessage::parse(r#"{"result": null, "id": 7}"#),
            Ok(ParsedMessage::Reply(CommandReply { id: 7, .. }))
        ));
        assert!(matches!(
            ParsedMessage::parse(r#"{"e": "24hrTicker", "s": "BTCUSDT"}"#),
            Ok(ParsedMessage::Unknown(_))
        ));
    }

    #[test]
    fn test_known_event_with_bad_fields_is_an_error() {
        assert!(ParsedMessage::parse(r#"{"e": "depthUpdate", "s": "BTCUSDT"}"#).is_err());
    }

    #[test]
    fn test_parse_snapshot() {
        let raw = r#"{"lastUpdateId": 1027024, "bids": [["4.00000000", "431.00000000"]], "asks": [["4.00000200", "12.00000000"]]}"#;
        let snapshot: DepthSnapshot = serde_json::from_str(raw).unwrap();
        let snapshot = snapshot.into_snapshot("BNBBTC");
        assert_eq!(snapshot.nonce, Some(1027024));
        assert_eq!(snapshot.symbol.as_deref(), Some("BNBBTC"));
        assert_eq!(snapshot.bids[0].size, dec!(431));
    }
}
