use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::warn;

use crate::error::{CyclerError, Result};

use super::rules::SymbolRules;

pub const BTC: &str = "BTC";
pub const USDC: &str = "USDC";

/// Relative price adjustment applied by maker orders (~0.2% away from
/// market) to bias toward maker-fee execution.
pub const MAKER_PRICE_OFFSET: Decimal = dec!(0.002);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Mexc,
    Kucoin,
    Kraken,
}

impl Exchange {
    pub const ALL: [Exchange; 4] = [
        Exchange::Binance,
        Exchange::Mexc,
        Exchange::Kucoin,
        Exchange::Kraken,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Mexc => "mexc",
            Exchange::Kucoin => "kucoin",
            Exchange::Kraken => "kraken",
        }
    }

    /// Executed-vs-ordered tolerance used by fill detection. Venue
    /// status fields can lag or mislead, so a fill is accepted when
    /// the executed quantity is within this fraction of the order.
    pub fn fill_tolerance(&self) -> Decimal {
        match self {
            Exchange::Binance => dec!(0.01),
            Exchange::Mexc => dec!(0.02),
            Exchange::Kucoin => dec!(0.015),
            Exchange::Kraken => dec!(0.02),
        }
    }

    /// Fraction of the expected quantity that must show up in the free
    /// BTC balance before a reported buy fill is believed.
    pub fn fill_balance_factor(&self) -> Decimal {
        match self {
            Exchange::Binance => dec!(0.99),
            Exchange::Mexc => dec!(0.95),
            Exchange::Kucoin => dec!(0.98),
            Exchange::Kraken => dec!(0.97),
        }
    }

    /// Safety margin applied on top of estimated fees when computing
    /// the minimum profitable sell price; higher on higher-fee venues.
    pub fn fee_safety_margin(&self) -> Decimal {
        match self {
            Exchange::Binance => dec!(0.05),
            Exchange::Mexc => dec!(0.05),
            Exchange::Kucoin => dec!(0.08),
            Exchange::Kraken => dec!(0.10),
        }
    }

    /// Static fee-rate estimate used when real fees cannot be read
    /// from trade history.
    pub fn default_fee_rate(&self) -> Decimal {
        match self {
            Exchange::Binance => dec!(0.001),
            Exchange::Mexc => dec!(0.0005),
            Exchange::Kucoin => dec!(0.001),
            Exchange::Kraken => dec!(0.0025),
        }
    }

    /// Fixed offset added to `created_at` when the venue reports no
    /// parseable completion timestamp.
    pub fn estimated_completion_offset(&self) -> Duration {
        match self {
            Exchange::Binance => Duration::hours(2),
            Exchange::Mexc => Duration::hours(4),
            Exchange::Kucoin => Duration::hours(3),
            Exchange::Kraken => Duration::hours(6),
        }
    }

    /// Venues that report FILLED before balances propagate need one
    /// bounded wait-and-recheck during fill validation.
    pub fn balance_settle_wait(&self) -> Option<std::time::Duration> {
        match self {
            Exchange::Mexc => Some(std::time::Duration::from_secs(5)),
            _ => None,
        }
    }

    /// Per-call HTTP timeout for this venue's REST API.
    pub fn http_timeout(&self) -> std::time::Duration {
        match self {
            Exchange::Binance => std::time::Duration::from_secs(10),
            Exchange::Mexc => std::time::Duration::from_secs(15),
            Exchange::Kucoin => std::time::Duration::from_secs(15),
            Exchange::Kraken => std::time::Duration::from_secs(30),
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "mexc" => Ok(Exchange::Mexc),
            "kucoin" => Ok(Exchange::Kucoin),
            "kraken" => Ok(Exchange::Kraken),
            _ => Err("invalid exchange; expected binance|mexc|kucoin|kraken"),
        }
    }
}

pub fn parse_exchange(raw: &str) -> Result<Exchange> {
    Exchange::from_str(raw).map_err(|e| CyclerError::Validation(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// One asset's balance split
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub locked: Decimal,
    pub total: Decimal,
}

impl AssetBalance {
    pub fn new(free: Decimal, locked: Decimal) -> Self {
        Self {
            free,
            locked,
            total: free + locked,
        }
    }
}

/// Balances keyed by asset. `detailed_balances` guarantees BTC and
/// USDC keys exist (zero-filled) even for empty accounts.
pub type BalanceMap = HashMap<String, AssetBalance>;

/// Zero-fill the pair's assets so callers never hit a missing key.
pub fn ensure_core_assets(balances: &mut BalanceMap) {
    balances.entry(BTC.to_string()).or_default();
    balances.entry(USDC.to_string()).or_default();
}

/// Normalized view of a venue order. `raw` keeps the vendor payload
/// for diagnostics; all other fields are best-effort extractions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub orig_quantity: Decimal,
    pub executed_quantity: Decimal,
    /// Cumulative USDC value filled, when the venue reports it
    #[serde(default)]
    pub cumulative_quote: Decimal,
    /// Raw vendor status text; never trusted on its own
    pub status: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Vendor-reported completion evidence, when parseable
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub raw: Value,
}

impl OrderSnapshot {
    /// Filled USDC value; falls back to executed x price when the
    /// venue does not report a cumulative quote figure.
    pub fn filled_quote_value(&self) -> Decimal {
        if self.cumulative_quote > Decimal::ZERO {
            self.cumulative_quote
        } else {
            self.executed_quantity * self.price
        }
    }
}

/// Executed-vs-ordered check: `executed >= ordered * (1 - tolerance)`.
pub fn fill_within_tolerance(executed: Decimal, ordered: Decimal, tolerance: Decimal) -> bool {
    if ordered <= Decimal::ZERO {
        return false;
    }
    executed >= ordered * (Decimal::ONE - tolerance)
}

/// Minimum sell price that still nets out non-negative after the buy
/// fee plus an estimated sell fee, with `margin` (a fraction) applied
/// on top of both fee legs. Never returns less than `buy_price`.
pub fn min_profitable_sell_price(
    buy_price: Decimal,
    quantity: Decimal,
    buy_fee_usdc: Decimal,
    sell_fee_rate: Decimal,
    margin: Decimal,
) -> Decimal {
    if quantity <= Decimal::ZERO {
        return buy_price;
    }
    let padded_sell_rate = sell_fee_rate * (Decimal::ONE + margin);
    let denominator = quantity * (Decimal::ONE - padded_sell_rate);
    if denominator <= Decimal::ZERO {
        // fee rate >= 100% after padding; nothing sensible to compute
        return buy_price;
    }
    let cost = buy_price * quantity + buy_fee_usdc * (Decimal::ONE + margin);
    let price = cost / denominator;
    price.max(buy_price)
}

/// Maker price adjustment: ~0.2% away from the given price, biased so
/// the order rests on the book instead of crossing.
pub fn maker_adjusted_price(side: OrderSide, price: Decimal) -> Decimal {
    match side {
        OrderSide::Buy => price * (Decimal::ONE - MAKER_PRICE_OFFSET),
        OrderSide::Sell => price * (Decimal::ONE + MAKER_PRICE_OFFSET),
    }
}

/// Capability contract every exchange implementation satisfies.
///
/// Implementations wrap one venue's signed REST protocol and normalize
/// its response shapes and error semantics. All prices are USDC per
/// BTC; all quantities are BTC.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn exchange(&self) -> Exchange;

    fn is_dry_run(&self) -> bool;

    /// Lightweight liveness + credential probe.
    async fn check_connection(&self) -> Result<()>;

    /// Latest BTC/USDC trade or quote price.
    async fn last_price(&self) -> Result<Decimal>;

    /// Free/locked/total per asset. Implementations must derive
    /// `locked` from open-order state when the venue's balance call
    /// does not separate free from locked, and must always include
    /// zero-filled BTC and USDC entries.
    async fn detailed_balances(&self) -> Result<BalanceMap>;

    /// Venue trading rules for the pair (cached after first fetch).
    async fn symbol_rules(&self) -> Result<SymbolRules>;

    /// Place a limit order. Implementations re-check available balance
    /// and clamp the requested quantity to <= available x 0.99 so
    /// float drift cannot trigger a venue-side rejection.
    async fn create_order(
        &self,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderSnapshot>;

    /// Place a limit order at a maker-adjusted price.
    async fn create_maker_order(
        &self,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderSnapshot> {
        let rules = self.symbol_rules().await?;
        let adjusted = rules.round_price(maker_adjusted_price(side, price));
        self.create_order(side, adjusted, quantity).await
    }

    /// Fetch an order, falling back to historical/closed-order queries
    /// when the active-order endpoint reports not-found (some venues
    /// evict filled orders from the open set immediately).
    async fn order_by_id(&self, order_id: &str) -> Result<OrderSnapshot>;

    /// Venue-specific fill detection; cross-checks executed quantity
    /// against the ordered quantity rather than trusting status text.
    async fn is_filled(&self, order: &OrderSnapshot) -> Result<bool>;

    /// Cancel an order. Callers wanting idempotency go through
    /// `engine::cancel::safe_cancel`.
    async fn cancel_order(&self, order_id: &str) -> Result<Value>;

    /// Real fee paid on an order, from trade history, when obtainable.
    async fn order_fees(&self, order_id: &str) -> Result<Option<Decimal>>;

    /// Fee-rate estimate used when `order_fees` yields nothing.
    fn fallback_fee_rate(&self) -> Decimal;

    /// Sell price guaranteeing non-negative net profit after real or
    /// estimated buy+sell fees plus the venue's safety margin.
    async fn adjust_sell_price_for_fees(
        &self,
        buy_price: Decimal,
        quantity: Decimal,
        buy_order_id: &str,
    ) -> Result<Decimal> {
        let rate = self.fallback_fee_rate();
        let buy_fee = match self.order_fees(buy_order_id).await {
            Ok(Some(fee)) => fee,
            Ok(None) => buy_price * quantity * rate,
            Err(e) => {
                warn!(
                    exchange = %self.exchange(),
                    order_id = buy_order_id,
                    error = %e,
                    "fee lookup failed, falling back to estimate"
                );
                buy_price * quantity * rate
            }
        };
        Ok(min_profitable_sell_price(
            buy_price,
            quantity,
            buy_fee,
            rate,
            self.exchange().fee_safety_margin(),
        ))
    }

    /// Venue-specific, idempotent order-id normalization:
    /// `normalize(normalize(x)) == normalize(x)`.
    fn normalize_order_id(&self, raw: &str) -> String;

    /// Id variants to attempt during cancellation, most likely first.
    /// Venues with unambiguous formats return a single entry.
    fn cancel_id_variants(&self, order_id: &str) -> Vec<String> {
        let normalized = self.normalize_order_id(order_id);
        let mut variants = vec![order_id.to_string()];
        if normalized != order_id {
            variants.push(normalized);
        }
        variants
    }

    /// Best-evidence completion timestamp for a filled order; `None`
    /// means the caller must fall back to the venue's fixed offset
    /// estimate.
    fn completion_time(&self, order: &OrderSnapshot) -> Option<DateTime<Utc>> {
        order.completed_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_exchange_accepts_all_names() {
        for exchange in Exchange::ALL {
            assert_eq!(parse_exchange(exchange.as_str()).unwrap(), exchange);
        }
        assert!(parse_exchange("coinbase").is_err());
    }

    #[test]
    fn ensure_core_assets_zero_fills_empty_account() {
        let mut balances = BalanceMap::new();
        ensure_core_assets(&mut balances);
        let btc = balances.get(BTC).expect("BTC key must exist");
        let usdc = balances.get(USDC).expect("USDC key must exist");
        assert_eq!(btc.free, Decimal::ZERO);
        assert_eq!(btc.locked, Decimal::ZERO);
        assert_eq!(btc.total, Decimal::ZERO);
        assert_eq!(usdc.total, Decimal::ZERO);
    }

    #[test]
    fn ensure_core_assets_keeps_existing_entries() {
        let mut balances = BalanceMap::new();
        balances.insert(USDC.to_string(), AssetBalance::new(dec!(100), dec!(50)));
        ensure_core_assets(&mut balances);
        assert_eq!(balances.get(USDC).unwrap().total, dec!(150));
        assert_eq!(balances.get(BTC).unwrap().total, Decimal::ZERO);
    }

    #[test]
    fn fill_tolerance_accepts_998_of_1000() {
        // executed 0.00998 vs ordered 0.01 is 99.8% -- inside a 2% band
        assert!(fill_within_tolerance(
            dec!(0.00998),
            dec!(0.01),
            dec!(0.02)
        ));
        // and inside a 1% band too
        assert!(fill_within_tolerance(
            dec!(0.00998),
            dec!(0.01),
            dec!(0.01)
        ));
        // but 95% is outside both
        assert!(!fill_within_tolerance(
            dec!(0.0095),
            dec!(0.01),
            dec!(0.02)
        ));
    }

    #[test]
    fn fill_tolerance_rejects_zero_ordered() {
        assert!(!fill_within_tolerance(dec!(1), Decimal::ZERO, dec!(0.02)));
    }

    #[test]
    fn min_profitable_price_never_below_buy_price() {
        let cases = [
            (dec!(60000), dec!(0.01), dec!(0.6), dec!(0.001), dec!(0.05)),
            (dec!(60000), dec!(0.01), Decimal::ZERO, Decimal::ZERO, Decimal::ZERO),
            (dec!(100), dec!(5), dec!(10), dec!(0.0025), dec!(0.10)),
            (dec!(60000), Decimal::ZERO, dec!(1), dec!(0.001), dec!(0.05)),
        ];
        for (buy, qty, fee, rate, margin) in cases {
            let price = min_profitable_sell_price(buy, qty, fee, rate, margin);
            assert!(
                price >= buy,
                "price {price} fell below buy price {buy} for qty {qty}"
            );
        }
    }

    #[test]
    fn min_profitable_price_covers_fees() {
        let buy = dec!(60000);
        let qty = dec!(0.01);
        let buy_fee = dec!(0.6);
        let rate = dec!(0.001);
        let price = min_profitable_sell_price(buy, qty, buy_fee, rate, dec!(0.05));
        // proceeds net of the (unpadded) sell fee must cover cost + buy fee
        let proceeds = price * qty * (Decimal::ONE - rate);
        assert!(proceeds >= buy * qty + buy_fee);
    }

    #[test]
    fn maker_price_moves_away_from_market() {
        let price = dec!(60000);
        assert_eq!(maker_adjusted_price(OrderSide::Buy, price), dec!(59880));
        assert_eq!(maker_adjusted_price(OrderSide::Sell, price), dec!(60120));
    }

    #[test]
    fn filled_quote_value_prefers_vendor_figure() {
        let mut order = OrderSnapshot {
            id: "1".into(),
            side: OrderSide::Buy,
            price: dec!(60000),
            orig_quantity: dec!(0.01),
            executed_quantity: dec!(0.01),
            cumulative_quote: dec!(599.5),
            status: "FILLED".into(),
            created_at: None,
            completed_at: None,
            raw: Value::Null,
        };
        assert_eq!(order.filled_quote_value(), dec!(599.5));
        order.cumulative_quote = Decimal::ZERO;
        assert_eq!(order.filled_quote_value(), dec!(600));
    }
}
