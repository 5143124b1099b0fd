//! Exchange protocol adapters.
//!
//! One module per venue, each normalizing that venue's signed REST
//! protocol, payload shapes and error semantics into the
//! `ExchangeClient` contract. Shared here: defensive JSON field
//! extraction (vendor payloads drift) and id/timestamp helpers.

pub mod binance;
pub mod kraken;
pub mod kucoin;
pub mod mexc;

pub use binance::BinanceClient;
pub use kraken::KrakenClient;
pub use kucoin::KucoinClient;
pub use mexc::MexcClient;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

pub(crate) fn pick<'a>(root: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| root.get(*key))
}

pub(crate) fn pick_str<'a>(root: &'a Value, keys: &[&str]) -> Option<&'a str> {
    pick(root, keys).and_then(|v| v.as_str())
}

pub(crate) fn parse_decimalish(value: &Value) -> Option<Decimal> {
    match value {
        Value::Null => None,
        Value::String(s) => Decimal::from_str_exact(s.trim()).ok(),
        Value::Number(n) => Decimal::from_str_exact(&n.to_string()).ok(),
        _ => None,
    }
}

pub(crate) fn pick_decimal(root: &Value, keys: &[&str]) -> Option<Decimal> {
    pick(root, keys).and_then(parse_decimalish)
}

/// Render a decimal for a REST body: fixed-point, trailing zeros
/// trimmed, never scientific notation.
pub(crate) fn format_decimal(value: Decimal) -> String {
    value.normalize().to_string()
}

pub(crate) fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Millisecond epoch timestamps (vendor JSON carries them as numbers
/// or strings); zero and negative values mean "absent".
pub(crate) fn parse_millis(value: &Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    if millis <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(millis).single()
}

/// Unix epoch seconds, possibly fractional (Kraken's `opentm`/`closetm`).
pub(crate) fn parse_epoch_seconds(value: &Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    if secs <= 0.0 {
        return None;
    }
    Utc.timestamp_millis_opt((secs * 1000.0) as i64).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn pick_decimal_reads_strings_and_numbers() {
        let v = json!({"a": "1.5", "b": 2.25, "c": null});
        assert_eq!(pick_decimal(&v, &["a"]), Some(dec!(1.5)));
        assert_eq!(pick_decimal(&v, &["b"]), Some(dec!(2.25)));
        assert_eq!(pick_decimal(&v, &["c", "b"]), Some(dec!(2.25)));
        assert_eq!(pick_decimal(&v, &["missing"]), None);
    }

    #[test]
    fn format_decimal_avoids_scientific_notation() {
        assert_eq!(format_decimal(dec!(0.00001000)), "0.00001");
        assert_eq!(format_decimal(dec!(60000)), "60000");
    }

    #[test]
    fn digits_only_strips_everything_else() {
        assert_eq!(digits_only("C02__12345"), "0212345");
        assert_eq!(digits_only("987654"), "987654");
        assert_eq!(digits_only("abc"), "");
    }

    #[test]
    fn parse_millis_rejects_zero() {
        assert_eq!(parse_millis(&json!(0)), None);
        assert!(parse_millis(&json!(1710000000000i64)).is_some());
        assert!(parse_millis(&json!("1710000000000")).is_some());
    }

    #[test]
    fn parse_epoch_seconds_handles_fractional() {
        let ts = parse_epoch_seconds(&json!(1710000000.5)).unwrap();
        assert_eq!(ts.timestamp_millis(), 1710000000500);
        assert_eq!(parse_epoch_seconds(&json!(0)), None);
    }
}
