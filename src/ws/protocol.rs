//! Polymarket CLOB market-channel wire format.
//!
//! Inbound frames are a JSON object or an array of objects keyed by
//! `event_type`. Outbound control frames subscribe or unsubscribe asset ids
//! on the open socket.

use crate::orderbook::{BookSnapshot, PriceLevel, PriceSnapshot, Side, TradeEvent};
use crate::ws::connection::ConnectionState;
use crate::ws::WsError;
use rust_decimal::Decimal;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use tracing::{debug, warn};

/// Application-level keepalive sent by the client.
pub const PING_FRAME: &str = "PING";
/// Server answer to [`PING_FRAME`].
pub const PONG_FRAME: &str = "PONG";

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    PriceChange(PriceSnapshot),
    BookChange(BookSnapshot),
    LastTrade(TradeEvent),
    Error {
        asset_id: Option<String>,
        message: String,
    },
    ConnectionStateChange(ConnectionState),
}

/// Outbound control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

impl ControlMessage {
    pub fn asset_ids(&self) -> &[String] {
        match self {
            ControlMessage::Subscribe(ids) | ControlMessage::Unsubscribe(ids) => ids,
        }
    }

    /// Encode for the wire. The first subscribe on a fresh socket uses the
    /// channel handshake form; everything after it uses `operation`.
    pub fn to_frame(&self, first_on_socket: bool) -> String {
        match self {
            ControlMessage::Subscribe(ids) if first_on_socket => serde_json::json!({
                "type": "market",
                "assets_ids": ids,
            })
            .to_string(),
            ControlMessage::Subscribe(ids) => serde_json::json!({
                "operation": "subscribe",
                "assets_ids": ids,
            })
            .to_string(),
            ControlMessage::Unsubscribe(ids) => serde_json::json!({
                "operation": "unsubscribe",
                "assets_ids": ids,
            })
            .to_string(),
        }
    }
}

// --- Wire types ---

#[derive(Deserialize)]
#[serde(untagged)]
enum StrOrNum {
    Str(String),
    Num(serde_json::Number),
}

fn de_opt_decimal<'de, D>(d: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<StrOrNum>::deserialize(d)? {
        None => Ok(None),
        Some(StrOrNum::Str(s)) if s.trim().is_empty() => Ok(None),
        Some(StrOrNum::Str(s)) => Decimal::from_str(s.trim()).map(Some).map_err(de::Error::custom),
        Some(StrOrNum::Num(n)) => Decimal::from_str(&n.to_string())
            .map(Some)
            .map_err(de::Error::custom),
    }
}

fn de_decimal<'de, D>(d: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    de_opt_decimal(d)?.ok_or_else(|| de::Error::custom("missing decimal"))
}

fn de_opt_u64<'de, D>(d: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<StrOrNum>::deserialize(d)? {
        None => Ok(None),
        Some(StrOrNum::Str(s)) if s.trim().is_empty() => Ok(None),
        Some(StrOrNum::Str(s)) => s.trim().parse().map(Some).map_err(de::Error::custom),
        Some(StrOrNum::Num(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| de::Error::custom("timestamp is not an unsigned integer")),
    }
}

#[derive(Debug, Deserialize)]
struct WireLevel {
    #[serde(deserialize_with = "de_decimal")]
    price: Decimal,
    #[serde(deserialize_with = "de_decimal")]
    size: Decimal,
}

impl From<&WireLevel> for PriceLevel {
    fn from(w: &WireLevel) -> Self {
        PriceLevel::new(w.price, w.size)
    }
}

#[derive(Debug, Deserialize)]
struct WireBook {
    asset_id: String,
    #[serde(default, alias = "buys")]
    bids: Vec<WireLevel>,
    #[serde(default, alias = "sells")]
    asks: Vec<WireLevel>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    timestamp: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WirePriceChange {
    asset_id: String,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    price: Option<Decimal>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    best_bid: Option<Decimal>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    best_ask: Option<Decimal>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    timestamp: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireLegacyChange {
    #[serde(default, deserialize_with = "de_opt_decimal")]
    price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct WirePriceChangeBatch {
    #[serde(default)]
    asset_id: Option<String>,
    #[serde(default)]
    price_changes: Vec<WirePriceChange>,
    /// Older single-asset form: level changes without best quotes.
    #[serde(default)]
    changes: Vec<WireLegacyChange>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    best_bid: Option<Decimal>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    best_ask: Option<Decimal>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    timestamp: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireBestBidAsk {
    asset_id: String,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    best_bid: Option<Decimal>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    best_ask: Option<Decimal>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    timestamp: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireLastTrade {
    asset_id: String,
    #[serde(deserialize_with = "de_decimal")]
    price: Decimal,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    size: Option<Decimal>,
    side: String,
    #[serde(default, deserialize_with = "de_opt_u64")]
    timestamp: Option<u64>,
}

// --- Decoding ---

/// Decode one text frame into zero or more messages.
///
/// Fails only when the frame is not JSON, or when every event in it is
/// malformed. Individual bad events in an otherwise good batch are logged
/// and skipped.
pub fn decode_frame(text: &str, received_at: u64) -> Result<Vec<FeedMessage>, WsError> {
    let val: Value = serde_json::from_str(text)?;
    let events = match val {
        Value::Array(items) => items,
        other => vec![other],
    };
    if events.is_empty() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    let mut first_err = None;
    let mut failed = 0usize;
    let total = events.len();
    for event in &events {
        match decode_event(event, received_at) {
            Ok(mut msgs) => out.append(&mut msgs),
            Err(e) => {
                failed += 1;
                debug!(error = %e, "skipping malformed event");
                first_err.get_or_insert(e);
            }
        }
    }

    match first_err {
        Some(e) if failed == total => Err(e),
        Some(_) => {
            warn!(failed, total, "dropped malformed events from batch");
            Ok(out)
        }
        None => Ok(out),
    }
}

/// Decode a single event object.
pub fn decode_event(event: &Value, received_at: u64) -> Result<Vec<FeedMessage>, WsError> {
    let event_type = event
        .get("event_type")
        .or_else(|| event.get("type"))
        .and_then(|v| v.as_str())
        .unwrap_or("");

    match event_type {
        "book" => {
            let book: WireBook = serde_json::from_value(event.clone())?;
            let bids: Vec<PriceLevel> = book.bids.iter().map(PriceLevel::from).collect();
            let asks: Vec<PriceLevel> = book.asks.iter().map(PriceLevel::from).collect();
            if bids.iter().chain(asks.iter()).any(|l| !in_unit_range(l.price)) {
                return Err(WsError::Decode(format!(
                    "book level price out of range for {}",
                    book.asset_id
                )));
            }
            Ok(vec![FeedMessage::BookChange(BookSnapshot::from_levels(
                book.asset_id,
                &bids,
                &asks,
                book.timestamp.unwrap_or(received_at),
            ))])
        }
        "price_change" => {
            let batch: WirePriceChangeBatch = serde_json::from_value(event.clone())?;
            let batch_ts = batch.timestamp.unwrap_or(received_at);
            let mut out = Vec::with_capacity(batch.price_changes.len().max(1));
            for change in &batch.price_changes {
                match PriceSnapshot::from_quotes(
                    change.asset_id.clone(),
                    change.price,
                    change.best_bid,
                    change.best_ask,
                    change.timestamp.unwrap_or(batch_ts),
                ) {
                    Some(snap) => out.push(FeedMessage::PriceChange(snap)),
                    None => debug!(asset_id = %change.asset_id, "skipping price change without a valid price"),
                }
            }
            if out.is_empty() {
                if let Some(first) = batch.price_changes.first() {
                    return Err(out_of_range(&first.asset_id));
                }
            }
            if let Some(asset_id) = batch.asset_id.as_deref() {
                if batch.price_changes.is_empty() {
                    let last_price = batch.changes.iter().rev().find_map(|c| c.price);
                    let snap = PriceSnapshot::from_quotes(
                        asset_id,
                        last_price,
                        batch.best_bid,
                        batch.best_ask,
                        batch_ts,
                    )
                    .ok_or_else(|| out_of_range(asset_id))?;
                    out.push(FeedMessage::PriceChange(snap));
                }
            }
            Ok(out)
        }
        "best_bid_ask" => {
            let bba: WireBestBidAsk = serde_json::from_value(event.clone())?;
            let snap = PriceSnapshot::from_quotes(
                bba.asset_id.clone(),
                None,
                bba.best_bid,
                bba.best_ask,
                bba.timestamp.unwrap_or(received_at),
            )
            .ok_or_else(|| out_of_range(&bba.asset_id))?;
            Ok(vec![FeedMessage::PriceChange(snap)])
        }
        "last_trade_price" => {
            let trade: WireLastTrade = serde_json::from_value(event.clone())?;
            let side = Side::from_str(&trade.side).map_err(WsError::Decode)?;
            if !in_unit_range(trade.price) {
                return Err(out_of_range(&trade.asset_id));
            }
            Ok(vec![FeedMessage::LastTrade(TradeEvent {
                asset_id: trade.asset_id,
                side,
                size: trade.size.unwrap_or(Decimal::ZERO),
                price: trade.price,
                timestamp: trade.timestamp.unwrap_or(received_at),
            })])
        }
        "" => {
            let message = event
                .get("error")
                .or_else(|| event.get("message"))
                .and_then(|v| v.as_str());
            match message {
                Some(message) => Ok(vec![FeedMessage::Error {
                    asset_id: event
                        .get("asset_id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    message: message.to_string(),
                }]),
                None => Err(WsError::Decode("event without event_type".to_string())),
            }
        }
        other => {
            debug!(event_type = other, "unhandled market event");
            Ok(Vec::new())
        }
    }
}

fn in_unit_range(p: Decimal) -> bool {
    p >= Decimal::ZERO && p <= Decimal::ONE
}

fn out_of_range(asset_id: &str) -> WsError {
    WsError::Decode(format!("no valid price for {asset_id}"))
}

/// Shorten a frame for log output.
pub fn preview(text: &str) -> String {
    text.chars().take(240).collect::<String>().replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_decode_book_snapshot() {
        let text = r#"{"event_type":"book","asset_id":"Y1","market":"0xabc",
            "bids":[{"price":"0.48","size":"30"},{"price":"0.50","size":"10"}],
            "asks":[{"price":"0.53","size":"5"},{"price":"0.52","size":"25"}],
            "timestamp":"1700000000123","hash":"h"}"#;
        let msgs = decode_frame(text, 1).unwrap();
        assert_eq!(msgs.len(), 1);
        let FeedMessage::BookChange(book) = &msgs[0] else {
            panic!("expected book, got {:?}", msgs[0]);
        };
        assert_eq!(book.asset_id, "Y1");
        assert_eq!(book.timestamp, 1_700_000_000_123);
        assert_eq!(book.bids[0].price, d("0.50"));
        assert_eq!(book.asks[0].price, d("0.52"));
    }

    #[test]
    fn test_decode_price_change_batch() {
        let text = r#"{"event_type":"price_change","market":"0xabc","timestamp":"1000",
            "price_changes":[
              {"asset_id":"Y1","price":"0.5","size":"10","side":"BUY","best_bid":"0.54","best_ask":"0.56"},
              {"asset_id":"N1","price":"0.44","size":"10","side":"SELL","best_bid":"","best_ask":""}
            ]}"#;
        let msgs = decode_frame(text, 1).unwrap();
        assert_eq!(msgs.len(), 2);
        let FeedMessage::PriceChange(yes) = &msgs[0] else { panic!() };
        assert_eq!(yes.price, d("0.55"));
        assert_eq!(yes.spread, d("0.02"));
        assert_eq!(yes.timestamp, 1000);
        let FeedMessage::PriceChange(no) = &msgs[1] else { panic!() };
        assert_eq!(no.price, d("0.44"));
        assert_eq!(no.spread, Decimal::ZERO);
    }

    #[test]
    fn test_decode_legacy_price_change() {
        let text = r#"{"event_type":"price_change","asset_id":"Y1","timestamp":5,
            "changes":[{"price":"0.40","side":"BUY","size":"1"},{"price":"0.41","side":"BUY","size":"2"}]}"#;
        let msgs = decode_frame(text, 1).unwrap();
        assert_eq!(msgs.len(), 1);
        let FeedMessage::PriceChange(p) = &msgs[0] else { panic!() };
        assert_eq!(p.price, d("0.41"));
        assert_eq!(p.timestamp, 5);
    }

    #[test]
    fn test_decode_last_trade_and_array_envelope() {
        let text = r#"[{"event_type":"last_trade_price","asset_id":"Y1","price":"0.57","size":"12.5","side":"BUY"},
                      {"event_type":"tick_size_change","asset_id":"Y1"}]"#;
        let msgs = decode_frame(text, 77).unwrap();
        assert_eq!(
            msgs,
            vec![FeedMessage::LastTrade(TradeEvent {
                asset_id: "Y1".to_string(),
                side: Side::Buy,
                size: d("12.5"),
                price: d("0.57"),
                timestamp: 77,
            })]
        );
    }

    #[test]
    fn test_decode_best_bid_ask_numeric_fields() {
        let text = r#"{"event_type":"best_bid_ask","asset_id":"N1","best_bid":0.30,"best_ask":0.34,"timestamp":9}"#;
        let msgs = decode_frame(text, 1).unwrap();
        let FeedMessage::PriceChange(p) = &msgs[0] else { panic!() };
        assert_eq!(p.price, d("0.32"));
    }

    #[test]
    fn test_decode_error_frame() {
        let msgs = decode_frame(r#"{"error":"invalid asset","asset_id":"X"}"#, 1).unwrap();
        assert_eq!(
            msgs,
            vec![FeedMessage::Error {
                asset_id: Some("X".to_string()),
                message: "invalid asset".to_string()
            }]
        );
    }

    #[test]
    fn test_malformed_frames_are_decode_errors() {
        assert!(matches!(decode_frame("not json", 1), Err(WsError::Decode(_))));
        assert!(matches!(
            decode_frame(r#"{"event_type":"book","bids":[]}"#, 1),
            Err(WsError::Decode(_))
        ));
        assert!(matches!(
            decode_frame(r#"{"event_type":"best_bid_ask","asset_id":"A","best_bid":"1.2","best_ask":"1.4"}"#, 1),
            Err(WsError::Decode(_))
        ));
        assert!(decode_frame("[]", 1).unwrap().is_empty());
    }

    #[test]
    fn test_bad_event_in_batch_is_skipped() {
        let text = r#"[{"event_type":"last_trade_price","asset_id":"Y1","price":"0.5","side":"HOLD"},
                      {"event_type":"last_trade_price","asset_id":"Y1","price":"0.5","side":"SELL","timestamp":"3"}]"#;
        let msgs = decode_frame(text, 1).unwrap();
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn test_bad_entry_in_price_changes_keeps_the_rest() {
        let text = r#"{"event_type":"price_change","timestamp":"7","price_changes":[
              {"asset_id":"Y1","price":"1.7","side":"BUY"},
              {"asset_id":"N1","price":"0.41","side":"SELL"}
            ]}"#;
        let msgs = decode_frame(text, 1).unwrap();
        assert_eq!(msgs.len(), 1);
        let FeedMessage::PriceChange(snap) = &msgs[0] else {
            panic!("expected price change, got {:?}", msgs[0]);
        };
        assert_eq!(snap.asset_id, "N1");
        assert_eq!(snap.price, d("0.41"));

        let all_bad = r#"{"event_type":"price_change","timestamp":"7","price_changes":[
              {"asset_id":"Y1","price":"1.7","side":"BUY"}]}"#;
        assert!(matches!(decode_frame(all_bad, 1), Err(WsError::Decode(_))));
    }

    #[test]
    fn test_control_frames() {
        let ids = vec!["Y1".to_string(), "N1".to_string()];
        let first: Value = serde_json::from_str(&ControlMessage::Subscribe(ids.clone()).to_frame(true)).unwrap();
        assert_eq!(first["type"], "market");
        assert_eq!(first["assets_ids"][1], "N1");

        let later: Value = serde_json::from_str(&ControlMessage::Subscribe(ids.clone()).to_frame(false)).unwrap();
        assert_eq!(later["operation"], "subscribe");

        let unsub: Value = serde_json::from_str(&ControlMessage::Unsubscribe(ids).to_frame(true)).unwrap();
        assert_eq!(unsub["operation"], "unsubscribe");
        assert!(unsub.get("type").is_none());
    }
}
