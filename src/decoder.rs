//! Event decoder for Binance market data payloads
//!
//! Turns raw depth and trade payloads into normalized events. The decoder holds
//! no state beyond its timestamp unit flag, so the same input always yields the
//! same output.

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

/// Price level (price, quantity pair)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
}

impl PriceLevel {
    pub fn new(price: f64, quantity: f64) -> Self {
        Self { price, quantity }
    }
}

/// Incremental depth update covering book versions `first_update_id..=last_update_id`
#[derive(Debug, Clone, PartialEq)]
pub struct DepthDiff {
    /// Venue event time (microseconds)
    pub event_time_us: u64,
    /// Local receive time (microseconds)
    pub recv_time_us: u64,
    pub symbol: String,
    /// First update ID in event (`U`)
    pub first_update_id: u64,
    /// Final update ID in event (`u`)
    pub last_update_id: u64,
    /// Final update ID of the previous event (`pu`), only sent by some venues
    pub prev_final_update_id: Option<u64>,
    /// Absolute level replacements; zero quantity removes the level
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl DepthDiff {
    /// Receive time minus venue event time. Zero when the venue omitted the
    /// event time and the receive time was substituted.
    pub fn latency_us(&self) -> i64 {
        self.recv_time_us as i64 - self.event_time_us as i64
    }
}

/// Aggressor side of a public trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TakerSide {
    /// Aggressor lifted the ask
    Buy,
    /// Aggressor hit the bid
    Sell,
}

/// Public trade print
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub event_time_us: u64,
    pub recv_time_us: u64,
    pub symbol: String,
    pub trade_id: u64,
    pub price: f64,
    pub quantity: f64,
    pub taker_side: TakerSide,
}

/// Normalized market event
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Depth(DepthDiff),
    Trade(Trade),
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Depth(diff) => &diff.symbol,
            MarketEvent::Trade(trade) => &trade.symbol,
        }
    }
}

/// Binance `depthUpdate` payload
#[derive(Debug, Deserialize)]
struct RawDepthUpdate {
    /// Event time, kept raw so a bad value falls back to the receive time
    #[serde(rename = "E", default)]
    event_time: Option<Value>,

    #[serde(rename = "s", default)]
    symbol: Option<String>,

    #[serde(rename = "U")]
    first_update_id: u64,

    #[serde(rename = "u")]
    final_update_id: u64,

    #[serde(rename = "pu", default)]
    prev_final_update_id: Option<u64>,

    #[serde(rename = "b", default, deserialize_with = "deserialize_levels")]
    bids: Vec<PriceLevel>,

    #[serde(rename = "a", default, deserialize_with = "deserialize_levels")]
    asks: Vec<PriceLevel>,
}

/// Binance `trade` payload
#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "E", default)]
    event_time: Option<Value>,

    #[serde(rename = "s", default)]
    symbol: Option<String>,

    #[serde(rename = "t")]
    trade_id: u64,

    #[serde(rename = "p", deserialize_with = "deserialize_price")]
    price: f64,

    #[serde(rename = "q", deserialize_with = "deserialize_quantity")]
    quantity: f64,

    /// Buyer was the maker, so the seller was the aggressor
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

/// Stateless decoder from Binance payloads to [`MarketEvent`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct EventDecoder {
    /// Event times are already in microseconds (`timeUnit=MICROSECOND` streams)
    timestamps_in_micros: bool,
}

impl EventDecoder {
    pub fn new(timestamps_in_micros: bool) -> Self {
        Self {
            timestamps_in_micros,
        }
    }

    /// Decode a raw text frame, wrapped (combined stream) or not.
    pub fn decode_text(&self, raw: &str, recv_us: u64) -> Result<Option<MarketEvent>, DecodeError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        if value.get("stream").is_some() {
            self.decode_combined(&value, recv_us)
        } else {
            self.decode_raw(&value, recv_us)
        }
    }

    /// Decode a combined stream message: `{"stream": "<name>", "data": {...}}`
    pub fn decode_combined(
        &self,
        msg: &Value,
        recv_us: u64,
    ) -> Result<Option<MarketEvent>, DecodeError> {
        let Some(msg) = msg.as_object() else {
            return Ok(None);
        };
        let stream = msg.get("stream").and_then(Value::as_str).unwrap_or("");
        match msg.get("data") {
            Some(data) if data.is_object() => self.decode_stream(stream, data, recv_us),
            _ => Ok(None),
        }
    }

    /// Decode an unwrapped payload, classified by its `e` event type.
    pub fn decode_raw(
        &self,
        payload: &Value,
        recv_us: u64,
    ) -> Result<Option<MarketEvent>, DecodeError> {
        if !payload.is_object() {
            return Ok(None);
        }
        match payload.get("e").and_then(Value::as_str) {
            Some("depthUpdate") => self.depth(payload, recv_us).map(Some),
            Some("trade") => self.trade(payload, recv_us).map(Some),
            _ => Ok(None),
        }
    }

    /// Decode a payload classified by stream name suffix.
    pub fn decode_stream(
        &self,
        stream: &str,
        data: &Value,
        recv_us: u64,
    ) -> Result<Option<MarketEvent>, DecodeError> {
        if is_depth_stream(stream) {
            self.depth(data, recv_us).map(Some)
        } else if stream.ends_with("@trade") {
            self.trade(data, recv_us).map(Some)
        } else {
            Ok(None)
        }
    }

    fn depth(&self, payload: &Value, recv_us: u64) -> Result<MarketEvent, DecodeError> {
        let raw = RawDepthUpdate::deserialize(payload).map_err(|e| DecodeError::InvalidPayload {
            kind: "depthUpdate",
            reason: e.to_string(),
        })?;

        Ok(MarketEvent::Depth(DepthDiff {
            event_time_us: self.event_time_us(raw.event_time.as_ref(), recv_us),
            recv_time_us: recv_us,
            symbol: raw.symbol.unwrap_or_else(unknown_symbol),
            first_update_id: raw.first_update_id,
            last_update_id: raw.final_update_id,
            prev_final_update_id: raw.prev_final_update_id,
            bids: raw.bids,
            asks: raw.asks,
        }))
    }

    fn trade(&self, payload: &Value, recv_us: u64) -> Result<MarketEvent, DecodeError> {
        let raw = RawTrade::deserialize(payload).map_err(|e| DecodeError::InvalidPayload {
            kind: "trade",
            reason: e.to_string(),
        })?;

        Ok(MarketEvent::Trade(Trade {
            event_time_us: self.event_time_us(raw.event_time.as_ref(), recv_us),
            recv_time_us: recv_us,
            symbol: raw.symbol.unwrap_or_else(unknown_symbol),
            trade_id: raw.trade_id,
            price: raw.price,
            quantity: raw.quantity,
            taker_side: if raw.is_buyer_maker {
                TakerSide::Sell
            } else {
                TakerSide::Buy
            },
        }))
    }

    /// Venue event time in microseconds, falling back to the receive time when
    /// the field is absent or unusable.
    fn event_time_us(&self, raw: Option<&Value>, fallback_us: u64) -> u64 {
        let parsed = match raw {
            Some(Value::Number(n)) => n.as_u64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f as u64)
            }),
            Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
            _ => None,
        };

        match parsed {
            Some(t) if self.timestamps_in_micros => t,
            Some(t) => t.checked_mul(1_000).unwrap_or(fallback_us),
            None => fallback_us,
        }
    }
}

/// `<symbol>@depth` or `<symbol>@depth@<n>ms`
fn is_depth_stream(stream: &str) -> bool {
    let Some(idx) = stream.rfind("@depth") else {
        return false;
    };
    let rest = &stream[idx + "@depth".len()..];
    if rest.is_empty() {
        return true;
    }
    rest.strip_prefix('@')
        .and_then(|r| r.strip_suffix("ms"))
        .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

fn unknown_symbol() -> String {
    "UNKNOWN".to_string()
}

/// Price or quantity given as a JSON string or number. Must be finite and
/// non-negative.
pub(crate) fn parse_number(field: &'static str, v: &Value) -> Result<f64, DecodeError> {
    let parsed = match v {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    match parsed {
        Some(x) if x.is_finite() && x >= 0.0 => Ok(x),
        _ => Err(DecodeError::InvalidNumber {
            field,
            value: v.to_string(),
        }),
    }
}

/// Price levels given as `[price, qty]` pairs of strings or numbers
pub(crate) fn deserialize_levels<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<(Value, Value)> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(price, quantity)| {
            Ok(PriceLevel {
                price: parse_number("price", &price).map_err(de::Error::custom)?,
                quantity: parse_number("quantity", &quantity).map_err(de::Error::custom)?,
            })
        })
        .collect()
}

fn deserialize_price<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    parse_number("price", &raw).map_err(de::Error::custom)
}

fn deserialize_quantity<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    parse_number("quantity", &raw).map_err(de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RECV_US: u64 = 1_672_531_200_500_000;

    fn depth_payload() -> Value {
        json!({
            "e": "depthUpdate",
            "E": 1672531200000u64,
            "s": "BTCUSDT",
            "U": 100,
            "u": 105,
            "b": [["50000.00", "1.5"], ["49999.00", "0"]],
            "a": [["50001.00", "1.0"]]
        })
    }

    fn trade_payload(buyer_is_maker: bool) -> Value {
        json!({
            "e": "trade",
            "E": 1672531200000u64,
            "s": "BTCUSDT",
            "t": 12345,
            "p": "50000.50",
            "q": "0.5",
            "T": 1672531200000u64,
            "m": buyer_is_maker
        })
    }

    fn expect_depth(event: Option<MarketEvent>) -> DepthDiff {
        match event {
            Some(MarketEvent::Depth(diff)) => diff,
            other => panic!("Expected depth diff, got {:?}", other),
        }
    }

    fn expect_trade(event: Option<MarketEvent>) -> Trade {
        match event {
            Some(MarketEvent::Trade(trade)) => trade,
            other => panic!("Expected trade, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_combined_depth() {
        let decoder = EventDecoder::new(false);
        let msg = json!({ "stream": "btcusdt@depth@100ms", "data": depth_payload() });

        let diff = expect_depth(decoder.decode_combined(&msg, RECV_US).unwrap());
        assert_eq!(diff.symbol, "BTCUSDT");
        assert_eq!(diff.first_update_id, 100);
        assert_eq!(diff.last_update_id, 105);
        assert_eq!(diff.prev_final_update_id, None);
        assert_eq!(diff.event_time_us, 1_672_531_200_000_000);
        assert_eq!(diff.recv_time_us, RECV_US);
        assert_eq!(
            diff.bids,
            vec![PriceLevel::new(50000.0, 1.5), PriceLevel::new(49999.0, 0.0)]
        );
        assert_eq!(diff.asks, vec![PriceLevel::new(50001.0, 1.0)]);
    }

    #[test]
    fn test_decode_plain_depth_stream_suffix() {
        let decoder = EventDecoder::new(false);
        let event = decoder
            .decode_stream("btcusdt@depth", &depth_payload(), RECV_US)
            .unwrap();
        assert!(matches!(event, Some(MarketEvent::Depth(_))));
    }

    #[test]
    fn test_partial_depth_stream_is_ignored() {
        let decoder = EventDecoder::new(false);
        let event = decoder
            .decode_stream("btcusdt@depth20@100ms", &depth_payload(), RECV_US)
            .unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn test_decode_raw_depth_by_event_type() {
        let decoder = EventDecoder::new(false);
        let diff = expect_depth(decoder.decode_raw(&depth_payload(), RECV_US).unwrap());
        assert_eq!(diff.last_update_id, 105);
    }

    #[test]
    fn test_decode_text_routes_wrapped_and_raw() {
        let decoder = EventDecoder::new(false);
        let wrapped =
            json!({ "stream": "btcusdt@trade", "data": trade_payload(false) }).to_string();
        let raw = trade_payload(false).to_string();

        assert_eq!(
            decoder.decode_text(&wrapped, RECV_US).unwrap(),
            decoder.decode_text(&raw, RECV_US).unwrap()
        );
    }

    #[test]
    fn test_decode_trade_taker_side() {
        let decoder = EventDecoder::new(false);

        let buy = expect_trade(decoder.decode_raw(&trade_payload(false), RECV_US).unwrap());
        assert_eq!(buy.taker_side, TakerSide::Buy);
        assert_eq!(buy.trade_id, 12345);
        assert_eq!(buy.price, 50000.5);
        assert_eq!(buy.quantity, 0.5);

        let sell = expect_trade(decoder.decode_raw(&trade_payload(true), RECV_US).unwrap());
        assert_eq!(sell.taker_side, TakerSide::Sell);
    }

    #[test]
    fn test_unknown_messages_are_dropped() {
        let decoder = EventDecoder::new(false);

        let kline = json!({ "stream": "btcusdt@kline_1m", "data": { "e": "kline" } });
        assert!(decoder.decode_combined(&kline, RECV_US).unwrap().is_none());

        let ack = json!({ "result": null, "id": 1 });
        assert!(decoder.decode_raw(&ack, RECV_US).unwrap().is_none());

        assert!(decoder.decode_raw(&json!([1, 2, 3]), RECV_US).unwrap().is_none());
        assert!(decoder
            .decode_combined(&json!({ "stream": "btcusdt@trade", "data": "x" }), RECV_US)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_malformed_price_is_an_error() {
        let decoder = EventDecoder::new(false);
        let mut payload = depth_payload();
        payload["b"] = json!([["not-a-price", "1.0"]]);

        let err = decoder.decode_raw(&payload, RECV_US).unwrap_err();
        match err {
            DecodeError::InvalidPayload { kind, reason } => {
                assert_eq!(kind, "depthUpdate");
                assert!(reason.contains("not-a-price"), "{}", reason);
            }
            other => panic!("Expected invalid payload, got {:?}", other),
        }
    }

    #[test]
    fn test_non_finite_and_negative_numbers_rejected() {
        let decoder = EventDecoder::new(false);

        let mut payload = trade_payload(false);
        payload["p"] = json!("NaN");
        assert!(decoder.decode_raw(&payload, RECV_US).is_err());

        let mut payload = depth_payload();
        payload["a"] = json!([["50001.00", "-1"]]);
        assert!(decoder.decode_raw(&payload, RECV_US).is_err());
    }

    #[test]
    fn test_level_must_be_a_pair() {
        let decoder = EventDecoder::new(false);
        let mut payload = depth_payload();
        payload["a"] = json!([["50001.00"]]);

        let err = decoder.decode_raw(&payload, RECV_US).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::InvalidPayload {
                kind: "depthUpdate",
                ..
            }
        ));
    }

    #[test]
    fn test_missing_update_id_is_an_error() {
        let decoder = EventDecoder::new(false);
        let mut payload = depth_payload();
        payload.as_object_mut().unwrap().remove("U");

        match decoder.decode_raw(&payload, RECV_US).unwrap_err() {
            DecodeError::InvalidPayload { reason, .. } => {
                assert!(reason.contains("missing field `U`"), "{}", reason);
            }
            other => panic!("Expected invalid payload, got {:?}", other),
        }
    }

    #[test]
    fn test_numeric_levels_accepted() {
        let decoder = EventDecoder::new(false);
        let mut payload = depth_payload();
        payload["b"] = json!([[100.5, 2]]);

        let diff = expect_depth(decoder.decode_raw(&payload, RECV_US).unwrap());
        assert_eq!(diff.bids, vec![PriceLevel::new(100.5, 2.0)]);
    }

    #[test]
    fn test_event_time_fallback() {
        let decoder = EventDecoder::new(false);

        let mut payload = depth_payload();
        payload.as_object_mut().unwrap().remove("E");
        let diff = expect_depth(decoder.decode_raw(&payload, RECV_US).unwrap());
        assert_eq!(diff.event_time_us, RECV_US);

        payload["E"] = json!("yesterday");
        let diff = expect_depth(decoder.decode_raw(&payload, RECV_US).unwrap());
        assert_eq!(diff.event_time_us, RECV_US);
    }

    #[test]
    fn test_event_time_in_micros() {
        let decoder = EventDecoder::new(true);
        let mut payload = depth_payload();
        payload["E"] = json!(1672531200000123u64);

        let diff = expect_depth(decoder.decode_raw(&payload, RECV_US).unwrap());
        assert_eq!(diff.event_time_us, 1_672_531_200_000_123);
    }

    #[test]
    fn test_prev_final_update_id() {
        let decoder = EventDecoder::new(false);
        let mut payload = depth_payload();
        payload["pu"] = json!(99);

        let diff = expect_depth(decoder.decode_raw(&payload, RECV_US).unwrap());
        assert_eq!(diff.prev_final_update_id, Some(99));
    }

    #[test]
    fn test_missing_symbol_defaults() {
        let decoder = EventDecoder::new(false);
        let mut payload = trade_payload(true);
        payload.as_object_mut().unwrap().remove("s");

        let trade = expect_trade(decoder.decode_raw(&payload, RECV_US).unwrap());
        assert_eq!(trade.symbol, "UNKNOWN");
    }

    #[test]
    fn test_decoding_is_deterministic() {
        let decoder = EventDecoder::new(false);
        let payload = depth_payload();
        assert_eq!(
            decoder.decode_raw(&payload, RECV_US).unwrap(),
            decoder.decode_raw(&payload, RECV_US).unwrap()
        );
    }

    #[test]
    fn test_latency() {
        let decoder = EventDecoder::new(false);
        let diff = expect_depth(decoder.decode_raw(&depth_payload(), RECV_US).unwrap());
        assert_eq!(diff.latency_us(), 500_000);
    }
}
