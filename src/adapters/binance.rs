//! Binance spot adapter (signed REST v3).
//!
//! Auth: HMAC-SHA256 hex signature over the query string, key in the
//! `X-MBX-APIKEY` header. Order ids are numeric. Balances natively
//! split free/locked. Real fees come from `myTrades` commissions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{digits_only, format_decimal, parse_millis, pick, pick_decimal, pick_str};
use crate::config::ExchangeSettings;
use crate::error::{CyclerError, Result};
use crate::exchange::{
    ensure_core_assets, fill_within_tolerance, AssetBalance, BalanceMap, Exchange, ExchangeClient,
    OrderSide, OrderSnapshot, SymbolRules, BTC, USDC,
};

const DEFAULT_BASE: &str = "https://api.binance.com";
const SYMBOL: &str = "BTCUSDC";
const RECV_WINDOW: &str = "5000";

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    fee_rate: Decimal,
    dry_run: bool,
    rules: OnceCell<SymbolRules>,
}

impl BinanceClient {
    pub fn new(settings: &ExchangeSettings, dry_run: bool) -> Result<Self> {
        let base_url = settings
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE)
            .trim_end_matches('/')
            .to_string();

        let http = Client::builder()
            .user_agent("cycler-binance/0.1")
            .timeout(Exchange::Binance.http_timeout())
            .build()
            .map_err(|e| CyclerError::Internal(format!("failed to build Binance HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            fee_rate: settings
                .fee_rate
                .unwrap_or_else(|| Exchange::Binance.default_fee_rate()),
            dry_run,
            rules: OnceCell::new(),
        })
    }

    fn credentials(&self) -> Result<(&str, &str)> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| CyclerError::Auth("Binance api_key is required".to_string()))?;
        let secret = self
            .api_secret
            .as_deref()
            .ok_or_else(|| CyclerError::Auth("Binance api_secret is required".to_string()))?;
        Ok((key, secret))
    }

    fn sign(&self, query: &str) -> Result<String> {
        let (_, secret) = self.credentials()?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| CyclerError::Auth(format!("invalid Binance secret: {e}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn public_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.get(&url).query(query).send().await?;
        Self::decode(resp, path).await
    }

    async fn signed_json(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Value> {
        let (key, _) = self.credentials()?;
        let timestamp = Utc::now().timestamp_millis().to_string();

        let mut query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect();
        query.push(format!("recvWindow={RECV_WINDOW}"));
        query.push(format!("timestamp={timestamp}"));
        let query = query.join("&");
        let signature = self.sign(&query)?;

        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query, signature
        );
        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", key)
            .send()
            .await?;
        Self::decode(resp, path).await
    }

    async fn decode(resp: reqwest::Response, path: &str) -> Result<Value> {
        let status = resp.status();
        let text = resp.text().await?;

        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(CyclerError::RateLimited(format!(
                "Binance rate limited on {path}"
            )));
        }

        let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if !status.is_success() {
            let message = pick_str(&value, &["msg"])
                .map(ToString::to_string)
                .unwrap_or(text);
            return Err(CyclerError::ExchangeApi {
                exchange: "binance".to_string(),
                message: format!("{path}: {message}"),
            });
        }
        Ok(value)
    }

    fn map_order(&self, order: &Value) -> OrderSnapshot {
        let id = pick(order, &["orderId"])
            .map(|v| match v {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => String::new(),
            })
            .unwrap_or_default();

        let side = match pick_str(order, &["side"]) {
            Some("SELL") => OrderSide::Sell,
            _ => OrderSide::Buy,
        };

        let status = pick_str(order, &["status"]).unwrap_or("UNKNOWN").to_string();
        let executed = pick_decimal(order, &["executedQty"]).unwrap_or(Decimal::ZERO);
        let completed_at = if status == "FILLED" {
            pick(order, &["updateTime"]).and_then(parse_millis)
        } else {
            None
        };

        OrderSnapshot {
            id,
            side,
            price: pick_decimal(order, &["price"]).unwrap_or(Decimal::ZERO),
            orig_quantity: pick_decimal(order, &["origQty"]).unwrap_or(Decimal::ZERO),
            executed_quantity: executed,
            cumulative_quote: pick_decimal(order, &["cummulativeQuoteQty"])
                .unwrap_or(Decimal::ZERO),
            status,
            created_at: pick(order, &["time", "transactTime"]).and_then(parse_millis),
            completed_at,
            raw: order.clone(),
        }
    }

    fn dry_run_order(side: OrderSide, price: Decimal, quantity: Decimal) -> OrderSnapshot {
        OrderSnapshot {
            id: (Uuid::new_v4().as_u128() % 10_000_000_000).to_string(),
            side,
            price,
            orig_quantity: quantity,
            executed_quantity: Decimal::ZERO,
            cumulative_quote: Decimal::ZERO,
            status: "NEW".to_string(),
            created_at: Some(Utc::now()),
            completed_at: None,
            raw: json!({"dryRun": true}),
        }
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    async fn check_connection(&self) -> Result<()> {
        self.public_json("/api/v3/ping", &[]).await?;
        if !self.dry_run {
            self.signed_json(Method::GET, "/api/v3/account", &[]).await?;
        }
        Ok(())
    }

    async fn last_price(&self) -> Result<Decimal> {
        let value = self
            .public_json("/api/v3/ticker/price", &[("symbol", SYMBOL)])
            .await?;
        pick_decimal(&value, &["price"]).ok_or_else(|| {
            CyclerError::MarketDataUnavailable("Binance ticker returned no price".to_string())
        })
    }

    async fn detailed_balances(&self) -> Result<BalanceMap> {
        let mut balances = BalanceMap::new();

        if self.dry_run {
            // Synthetic funding so dry-run cycle creation has a budget
            balances.insert(USDC.to_string(), AssetBalance::new(dec!(10000), Decimal::ZERO));
            ensure_core_assets(&mut balances);
            return Ok(balances);
        }

        let value = self.signed_json(Method::GET, "/api/v3/account", &[]).await?;
        if let Some(entries) = value.get("balances").and_then(|v| v.as_array()) {
            for entry in entries {
                let Some(asset) = pick_str(entry, &["asset"]) else {
                    continue;
                };
                let free = pick_decimal(entry, &["free"]).unwrap_or(Decimal::ZERO);
                let locked = pick_decimal(entry, &["locked"]).unwrap_or(Decimal::ZERO);
                if free > Decimal::ZERO || locked > Decimal::ZERO || asset == BTC || asset == USDC {
                    balances.insert(asset.to_string(), AssetBalance::new(free, locked));
                }
            }
        }
        ensure_core_assets(&mut balances);
        Ok(balances)
    }

    async fn symbol_rules(&self) -> Result<SymbolRules> {
        self.rules
            .get_or_try_init(|| async {
                let value = self
                    .public_json("/api/v3/exchangeInfo", &[("symbol", SYMBOL)])
                    .await?;
                let symbol = value
                    .get("symbols")
                    .and_then(|v| v.as_array())
                    .and_then(|a| a.first())
                    .ok_or_else(|| {
                        CyclerError::MarketDataUnavailable(
                            "Binance exchangeInfo missing symbol".to_string(),
                        )
                    })?;

                let mut rules = SymbolRules {
                    quantity_step: dec!(0.00001),
                    price_step: dec!(0.01),
                    min_quantity: dec!(0.00001),
                    max_quantity: Decimal::ZERO,
                    min_notional: dec!(5),
                };
                if let Some(filters) = symbol.get("filters").and_then(|v| v.as_array()) {
                    for filter in filters {
                        match pick_str(filter, &["filterType"]) {
                            Some("LOT_SIZE") => {
                                if let Some(step) = pick_decimal(filter, &["stepSize"]) {
                                    rules.quantity_step = step;
                                }
                                if let Some(min) = pick_decimal(filter, &["minQty"]) {
                                    rules.min_quantity = min;
                                }
                                if let Some(max) = pick_decimal(filter, &["maxQty"]) {
                                    rules.max_quantity = max;
                                }
                            }
                            Some("PRICE_FILTER") => {
                                if let Some(tick) = pick_decimal(filter, &["tickSize"]) {
                                    rules.price_step = tick;
                                }
                            }
                            Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                                if let Some(min) = pick_decimal(filter, &["minNotional"]) {
                                    rules.min_notional = min;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Ok(rules)
            })
            .await
            .cloned()
    }

    async fn create_order(
        &self,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderSnapshot> {
        let rules = self.symbol_rules().await?;
        let price = rules.round_price(price);
        let mut quantity = rules.round_quantity(quantity);

        if self.dry_run {
            rules.validate_order(side, price, quantity)?;
            return Ok(Self::dry_run_order(side, price, quantity));
        }

        // Defensive re-check: clamp to 99% of what the account can
        // actually cover, so float drift cannot bounce the order.
        let balances = self.detailed_balances().await?;
        let cap = match side {
            OrderSide::Buy => {
                let usdc = balances.get(USDC).copied().unwrap_or_default();
                if price > Decimal::ZERO {
                    usdc.free * dec!(0.99) / price
                } else {
                    Decimal::ZERO
                }
            }
            OrderSide::Sell => balances.get(BTC).copied().unwrap_or_default().free * dec!(0.99),
        };
        let cap = rules.round_quantity(cap);
        if quantity > cap {
            debug!(%quantity, %cap, "clamping order quantity to available balance");
            quantity = cap;
        }
        rules.validate_order(side, price, quantity)?;

        let price_s = format_decimal(price);
        let qty_s = format_decimal(quantity);
        let side_s = side.to_string();
        let value = self
            .signed_json(
                Method::POST,
                "/api/v3/order",
                &[
                    ("symbol", SYMBOL),
                    ("side", side_s.as_str()),
                    ("type", "LIMIT"),
                    ("timeInForce", "GTC"),
                    ("quantity", qty_s.as_str()),
                    ("price", price_s.as_str()),
                    ("newOrderRespType", "RESULT"),
                ],
            )
            .await?;
        Ok(self.map_order(&value))
    }

    async fn order_by_id(&self, order_id: &str) -> Result<OrderSnapshot> {
        let id = self.normalize_order_id(order_id);
        let result = self
            .signed_json(
                Method::GET,
                "/api/v3/order",
                &[("symbol", SYMBOL), ("orderId", id.as_str())],
            )
            .await;

        match result {
            Ok(value) => Ok(self.map_order(&value)),
            Err(e) if order_gone(&e) => {
                // Filled orders can leave the active set; search history.
                debug!(order_id = %id, "order not in active set, checking history");
                let value = self
                    .signed_json(
                        Method::GET,
                        "/api/v3/allOrders",
                        &[("symbol", SYMBOL), ("limit", "500")],
                    )
                    .await?;
                let orders = value.as_array().cloned().unwrap_or_default();
                orders
                    .iter()
                    .find(|o| {
                        pick(o, &["orderId"])
                            .map(|v| v.to_string().trim_matches('"') == id)
                            .unwrap_or(false)
                    })
                    .map(|o| self.map_order(o))
                    .ok_or_else(|| CyclerError::OrderNotFound(id))
            }
            Err(e) => Err(e),
        }
    }

    async fn is_filled(&self, order: &OrderSnapshot) -> Result<bool> {
        if order.status == "FILLED" {
            return Ok(true);
        }
        // Status can lag: accept executed quantity inside tolerance.
        Ok(fill_within_tolerance(
            order.executed_quantity,
            order.orig_quantity,
            Exchange::Binance.fill_tolerance(),
        ))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<Value> {
        if self.dry_run {
            return Ok(json!({"status": "CANCELED", "dryRun": true}));
        }
        let id = self.normalize_order_id(order_id);
        self.signed_json(
            Method::DELETE,
            "/api/v3/order",
            &[("symbol", SYMBOL), ("orderId", id.as_str())],
        )
        .await
    }

    async fn order_fees(&self, order_id: &str) -> Result<Option<Decimal>> {
        if self.dry_run {
            return Ok(None);
        }
        let id = self.normalize_order_id(order_id);
        let value = self
            .signed_json(
                Method::GET,
                "/api/v3/myTrades",
                &[("symbol", SYMBOL), ("orderId", id.as_str())],
            )
            .await?;

        let Some(trades) = value.as_array() else {
            return Ok(None);
        };
        if trades.is_empty() {
            return Ok(None);
        }

        let mut total = Decimal::ZERO;
        for trade in trades {
            let commission = pick_decimal(trade, &["commission"]).unwrap_or(Decimal::ZERO);
            if commission <= Decimal::ZERO {
                continue;
            }
            match pick_str(trade, &["commissionAsset"]) {
                Some(USDC) => total += commission,
                Some(BTC) => {
                    // BTC-denominated commission on buys: convert at
                    // the trade price.
                    let price = pick_decimal(trade, &["price"]).unwrap_or(Decimal::ZERO);
                    total += commission * price;
                }
                Some(other) => {
                    warn!(asset = other, "unconvertible commission asset, skipping");
                }
                None => {}
            }
        }
        Ok(Some(total))
    }

    fn fallback_fee_rate(&self) -> Decimal {
        self.fee_rate
    }

    /// Binance order ids are numeric; anything else is decoration.
    fn normalize_order_id(&self, raw: &str) -> String {
        digits_only(raw)
    }

    fn completion_time(&self, order: &OrderSnapshot) -> Option<DateTime<Utc>> {
        order.completed_at
    }
}

fn order_gone(err: &CyclerError) -> bool {
    match err {
        CyclerError::ExchangeApi { message, .. } => {
            let lower = message.to_lowercase();
            lower.contains("does not exist") || lower.contains("not found")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> BinanceClient {
        BinanceClient::new(&ExchangeSettings::default(), true).unwrap()
    }

    #[test]
    fn normalize_is_digits_only_and_idempotent() {
        let c = client();
        assert_eq!(c.normalize_order_id("123456"), "123456");
        assert_eq!(c.normalize_order_id(" 123456 "), "123456");
        let once = c.normalize_order_id("id-123456");
        assert_eq!(c.normalize_order_id(&once), once);
    }

    #[test]
    fn map_order_extracts_fields() {
        let c = client();
        let order = c.map_order(&json!({
            "orderId": 123456789,
            "side": "BUY",
            "status": "FILLED",
            "price": "60000.00",
            "origQty": "0.01000000",
            "executedQty": "0.00998000",
            "cummulativeQuoteQty": "598.80",
            "time": 1710000000000i64,
            "updateTime": 1710003600000i64
        }));
        assert_eq!(order.id, "123456789");
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(order.status, "FILLED");
        assert_eq!(order.executed_quantity, dec!(0.00998));
        assert_eq!(order.cumulative_quote, dec!(598.80));
        assert!(order.completed_at.is_some());
        assert!(order.created_at.unwrap() < order.completed_at.unwrap());
    }

    #[test]
    fn map_order_without_fill_has_no_completion_time() {
        let c = client();
        let order = c.map_order(&json!({
            "orderId": 1,
            "side": "SELL",
            "status": "NEW",
            "price": "61000",
            "origQty": "0.01",
            "executedQty": "0",
            "updateTime": 1710003600000i64
        }));
        assert!(order.completed_at.is_none());
    }

    #[tokio::test]
    async fn is_filled_accepts_tolerance_fill() {
        let c = client();
        let mut order = c.map_order(&json!({
            "orderId": 1,
            "side": "BUY",
            "status": "PARTIALLY_FILLED",
            "price": "60000",
            "origQty": "0.01",
            "executedQty": "0.00998"
        }));
        assert!(c.is_filled(&order).await.unwrap());

        order.executed_quantity = dec!(0.005);
        assert!(!c.is_filled(&order).await.unwrap());
    }

    #[tokio::test]
    async fn dry_run_balances_are_zero_filled_and_funded() {
        let c = client();
        let balances = c.detailed_balances().await.unwrap();
        assert!(balances.contains_key(BTC));
        assert!(balances.get(USDC).unwrap().free > Decimal::ZERO);
    }
}
