// =============================================================================
// Stream payload decoding — public market streams and the private account
// stream
// =============================================================================
//
// Decoding is isolated per payload (and per item inside a batch): a bad
// payload yields an `Err` the caller logs and drops, and a bad item inside a
// mark-price batch is counted and skipped while the rest are kept.
// =============================================================================

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{de_str_f64, MarkPriceUpdate, Ticker};

/// Stream name for the all-market mark-price feed (1s cadence).
pub const ALL_MARK_PRICE_STREAM: &str = "!markPrice@arr@1s";

pub fn book_ticker_stream(symbol: &str) -> String {
    format!("{}@bookTicker", symbol.to_lowercase())
}

// =============================================================================
// Public market payloads
// =============================================================================

#[derive(Debug, Clone)]
pub enum MarketPayload {
    MarkPrices {
        updates: Vec<MarkPriceUpdate>,
        rejected: usize,
    },
    BookTicker(Ticker),
    /// Reply to a SUBSCRIBE / UNSUBSCRIBE request.
    Ack { id: Option<u64> },
    ProtocolError(String),
    /// Recognised envelope with an event kind this service does not consume.
    Ignored(String),
}

pub fn decode_market(text: &str) -> Result<MarketPayload> {
    let root: Value = serde_json::from_str(text).context("payload is not valid JSON")?;

    // Combined-stream envelope: {"stream": "...", "data": {...}}
    let root = match root {
        Value::Object(mut obj) if obj.contains_key("stream") => {
            obj.remove("data").context("combined stream payload without data")?
        }
        other => other,
    };

    match root {
        Value::Array(items) => Ok(decode_mark_batch(items)),
        Value::Object(obj) => {
            if obj.contains_key("result") {
                return Ok(MarketPayload::Ack {
                    id: obj.get("id").and_then(Value::as_u64),
                });
            }
            if let Some(err) = obj.get("error") {
                return Ok(MarketPayload::ProtocolError(err.to_string()));
            }
            let kind = obj
                .get("e")
                .and_then(Value::as_str)
                .context("payload has no event type")?
                .to_string();
            match kind.as_str() {
                "markPriceUpdate" => {
                    let update: MarkPriceUpdate = serde_json::from_value(Value::Object(obj))
                        .context("malformed markPriceUpdate")?;
                    Ok(MarketPayload::MarkPrices {
                        updates: vec![update],
                        rejected: 0,
                    })
                }
                "bookTicker" => {
                    let ticker: Ticker = serde_json::from_value(Value::Object(obj))
                        .context("malformed bookTicker")?;
                    Ok(MarketPayload::BookTicker(ticker))
                }
                _ => Ok(MarketPayload::Ignored(kind)),
            }
        }
        other => bail!("unexpected payload shape: {}", short(&other.to_string())),
    }
}

fn decode_mark_batch(items: Vec<Value>) -> MarketPayload {
    let total = items.len();
    let updates: Vec<MarkPriceUpdate> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect();
    let rejected = total - updates.len();
    MarketPayload::MarkPrices { updates, rejected }
}

fn short(s: &str) -> String {
    s.chars().take(120).collect()
}

// =============================================================================
// Private account stream
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceUpdate {
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "wb", deserialize_with = "de_str_f64")]
    pub wallet_balance: f64,
    #[serde(rename = "cw", default, deserialize_with = "de_str_f64")]
    pub cross_wallet_balance: f64,
    #[serde(rename = "bc", default, deserialize_with = "de_str_f64")]
    pub balance_change: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "pa", deserialize_with = "de_str_f64")]
    pub position_amount: f64,
    #[serde(rename = "ep", default, deserialize_with = "de_str_f64")]
    pub entry_price: f64,
    #[serde(rename = "cr", default, deserialize_with = "de_str_f64")]
    pub accumulated_realized: f64,
    #[serde(rename = "up", default, deserialize_with = "de_str_f64")]
    pub unrealized_pnl: f64,
    #[serde(rename = "mt", default)]
    pub margin_type: String,
    #[serde(rename = "iw", default, deserialize_with = "de_str_f64")]
    pub isolated_wallet: f64,
    #[serde(rename = "ps", default)]
    pub position_side: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountData {
    #[serde(rename = "m", default)]
    pub reason: String,
    #[serde(rename = "B", default)]
    pub balances: Vec<BalanceUpdate>,
    #[serde(rename = "P", default)]
    pub positions: Vec<PositionUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountUpdate {
    #[serde(rename = "E", default)]
    pub event_time: i64,
    #[serde(rename = "T", default)]
    pub transaction_time: i64,
    #[serde(rename = "a")]
    pub data: AccountData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderData {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c", default)]
    pub client_order_id: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "o")]
    pub order_type: String,
    #[serde(rename = "q", deserialize_with = "de_str_f64")]
    pub orig_qty: f64,
    #[serde(rename = "p", default, deserialize_with = "de_str_f64")]
    pub price: f64,
    #[serde(rename = "ap", default, deserialize_with = "de_str_f64")]
    pub average_price: f64,
    #[serde(rename = "x")]
    pub execution_type: String,
    #[serde(rename = "X")]
    pub order_status: String,
    #[serde(rename = "i")]
    pub order_id: i64,
    #[serde(rename = "l", default, deserialize_with = "de_str_f64")]
    pub last_filled_qty: f64,
    #[serde(rename = "z", default, deserialize_with = "de_str_f64")]
    pub cumulative_filled_qty: f64,
    #[serde(rename = "L", default, deserialize_with = "de_str_f64")]
    pub last_filled_price: f64,
    #[serde(rename = "T", default)]
    pub trade_time: i64,
    #[serde(rename = "rp", default, deserialize_with = "de_str_f64")]
    pub realized_profit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    #[serde(rename = "E", default)]
    pub event_time: i64,
    #[serde(rename = "T", default)]
    pub transaction_time: i64,
    #[serde(rename = "o")]
    pub order: OrderData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginCallPosition {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "ps", default)]
    pub position_side: String,
    #[serde(rename = "pa", deserialize_with = "de_str_f64")]
    pub position_amount: f64,
    #[serde(rename = "mt", default)]
    pub margin_type: String,
    #[serde(rename = "iw", default, deserialize_with = "de_str_f64")]
    pub isolated_wallet: f64,
    #[serde(rename = "mp", default, deserialize_with = "de_str_f64")]
    pub mark_price: f64,
    #[serde(rename = "up", default, deserialize_with = "de_str_f64")]
    pub unrealized_pnl: f64,
    #[serde(rename = "mm", default, deserialize_with = "de_str_f64")]
    pub maintenance_margin: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginCall {
    #[serde(rename = "E", default)]
    pub event_time: i64,
    #[serde(rename = "cw", default, deserialize_with = "de_str_f64")]
    pub cross_wallet_balance: f64,
    #[serde(rename = "p", default)]
    pub positions: Vec<MarginCallPosition>,
}

/// Typed events delivered to the private-stream handler.
#[derive(Debug, Clone)]
pub enum UserDataEvent {
    Account(AccountUpdate),
    Order(OrderUpdate),
    MarginCall(MarginCall),
    ListenKeyExpired { event_time: i64 },
}

/// Decode one private-stream payload. Unknown event kinds yield `Ok(None)`.
pub fn decode_user_data(text: &str) -> Result<Option<UserDataEvent>> {
    let root: Value = serde_json::from_str(text).context("payload is not valid JSON")?;
    let kind = root
        .get("e")
        .and_then(Value::as_str)
        .context("user data payload has no event type")?
        .to_string();

    let event = match kind.as_str() {
        "ACCOUNT_UPDATE" => UserDataEvent::Account(
            serde_json::from_value(root).context("malformed ACCOUNT_UPDATE")?,
        ),
        "ORDER_TRADE_UPDATE" => UserDataEvent::Order(
            serde_json::from_value(root).context("malformed ORDER_TRADE_UPDATE")?,
        ),
        "MARGIN_CALL" => UserDataEvent::MarginCall(
            serde_json::from_value(root).context("malformed MARGIN_CALL")?,
        ),
        "listenKeyExpired" => UserDataEvent::ListenKeyExpired {
            event_time: root.get("E").and_then(crate::types::value_f64).unwrap_or(0.0) as i64,
        },
        _ => return Ok(None),
    };
    Ok(Some(event))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_price_array_keeps_valid_items() {
        let raw = r#"[
            {"e":"markPriceUpdate","E":1,"s":"BTCUSDT","p":"100.5","i":"100.4","r":"0.0001","T":2},
            {"e":"markPriceUpdate","E":1,"s":"ETHUSDT"},
            {"e":"markPriceUpdate","E":1,"s":"SOLUSDT","p":"20.1","i":"20.0","r":"-0.003","T":2}
        ]"#;
        match decode_market(raw).unwrap() {
            MarketPayload::MarkPrices { updates, rejected } => {
                assert_eq!(updates.len(), 2);
                assert_eq!(rejected, 1);
                assert_eq!(updates[1].symbol, "SOLUSDT");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ack_and_error_replies() {
        assert!(matches!(
            decode_market(r#"{"result":null,"id":42}"#).unwrap(),
            MarketPayload::Ack { id: Some(42) }
        ));
        assert!(matches!(
            decode_market(r#"{"error":{"code":2,"msg":"Invalid request"},"id":1}"#).unwrap(),
            MarketPayload::ProtocolError(_)
        ));
    }

    #[test]
    fn combined_stream_envelope_is_unwrapped() {
        let raw = r#"{"stream":"btcusdt@bookTicker","data":{"e":"bookTicker","u":1,"s":"BTCUSDT","b":"99.9","B":"1","a":"100.1","A":"2","T":5,"E":6}}"#;
        match decode_market(raw).unwrap() {
            MarketPayload::BookTicker(t) => {
                assert_eq!(t.symbol, "BTCUSDT");
                assert!((t.bid_price - 99.9).abs() < 1e-9);
                assert!((t.ask_price - 100.1).abs() < 1e-9);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_kinds_are_ignored_and_garbage_is_an_error() {
        assert!(matches!(
            decode_market(r#"{"e":"depthUpdate","s":"BTCUSDT"}"#).unwrap(),
            MarketPayload::Ignored(k) if k == "depthUpdate"
        ));
        assert!(decode_market("not json").is_err());
        assert!(decode_market(r#"{"foo":1}"#).is_err());
        assert!(decode_market("17").is_err());
    }

    #[test]
    fn account_update_decodes() {
        let raw = r#"{"e":"ACCOUNT_UPDATE","E":1564745798939,"T":1564745798938,
            "a":{"m":"ORDER",
                 "B":[{"a":"USDT","wb":"122624.12345678","cw":"100.12345678","bc":"50.12345678"}],
                 "P":[{"s":"BTCUSDT","pa":"0","ep":"0.00000","cr":"200","up":"0","mt":"isolated","iw":"0.00000000","ps":"BOTH"}]}}"#;
        match decode_user_data(raw).unwrap() {
            Some(UserDataEvent::Account(update)) => {
                assert_eq!(update.data.reason, "ORDER");
                assert_eq!(update.data.balances[0].asset, "USDT");
                assert!((update.data.balances[0].wallet_balance - 122624.12345678).abs() < 1e-6);
                assert_eq!(update.data.positions[0].position_side, "BOTH");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn order_update_decodes() {
        let raw = r#"{"e":"ORDER_TRADE_UPDATE","E":1568879465651,"T":1568879465650,
            "o":{"s":"BTCUSDT","c":"TEST","S":"SELL","o":"TRAILING_STOP_MARKET","f":"GTC",
                 "q":"0.001","p":"0","ap":"0","sp":"7103.04","x":"NEW","X":"NEW","i":8886774,
                 "l":"0","z":"0","L":"0","T":1568879465651,"rp":"0"}}"#;
        match decode_user_data(raw).unwrap() {
            Some(UserDataEvent::Order(update)) => {
                assert_eq!(update.order.order_id, 8886774);
                assert_eq!(update.order.side, "SELL");
                assert_eq!(update.order.order_status, "NEW");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn margin_call_and_expiry_decode() {
        let raw = r#"{"e":"MARGIN_CALL","E":1587727187525,"cw":"3.16812045",
            "p":[{"s":"ETHUSDT","ps":"LONG","pa":"1.327","mt":"CROSSED","iw":"0","mp":"187.17127","up":"-1.166074","mm":"1.614445"}]}"#;
        assert!(matches!(
            decode_user_data(raw).unwrap(),
            Some(UserDataEvent::MarginCall(m)) if m.positions.len() == 1
        ));

        let expired = r#"{"e":"listenKeyExpired","E":"1736996475556","listenKey":"abc"}"#;
        assert!(matches!(
            decode_user_data(expired).unwrap(),
            Some(UserDataEvent::ListenKeyExpired { event_time: 1736996475556 })
        ));
    }

    #[test]
    fn unknown_user_events_are_not_errors() {
        assert!(decode_user_data(r#"{"e":"TRADE_LITE","E":1}"#).unwrap().is_none());
        assert!(decode_user_data(r#"{"E":1}"#).is_err());
    }

    #[test]
    fn book_ticker_stream_name_is_lowercase() {
        assert_eq!(book_ticker_stream("BTCUSDT"), "btcusdt@bookTicker");
    }
}
