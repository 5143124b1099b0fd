//! MEXC spot adapter (signed REST v3, Binance-shaped).
//!
//! Auth: HMAC-SHA256 hex signature over the query string, key in the
//! `X-MEXC-APIKEY` header. Order ids carry a fixed `C02__` prefix that
//! some endpoints return stripped, so normalization re-attaches it and
//! cancellation walks id variants. Status fields lag fills; balance
//! propagation after a fill lags too (the engine does one bounded
//! wait-and-recheck for this venue). No reliable per-order fee
//! endpoint: fees are always estimated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::OnceCell;
use tracing::debug;
use uuid::Uuid;

use super::{digits_only, format_decimal, parse_millis, pick, pick_decimal, pick_str};
use crate::config::ExchangeSettings;
use crate::error::{CyclerError, Result};
use crate::exchange::{
    ensure_core_assets, fill_within_tolerance, AssetBalance, BalanceMap, Exchange, ExchangeClient,
    OrderSide, OrderSnapshot, SymbolRules, BTC, USDC,
};

const DEFAULT_BASE: &str = "https://api.mexc.com";
const SYMBOL: &str = "BTCUSDC";

/// Fixed textual prefix MEXC attaches to spot order ids.
pub const ORDER_ID_PREFIX: &str = "C02__";

/// Age past which a misleading vendor status is second-guessed using
/// price evidence.
const STALE_STATUS_AGE_MINUTES: i64 = 10;

type HmacSha256 = Hmac<Sha256>;

pub struct MexcClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    fee_rate: Decimal,
    dry_run: bool,
    rules: OnceCell<SymbolRules>,
}

impl MexcClient {
    pub fn new(settings: &ExchangeSettings, dry_run: bool) -> Result<Self> {
        let base_url = settings
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE)
            .trim_end_matches('/')
            .to_string();

        let http = Client::builder()
            .user_agent("cycler-mexc/0.1")
            .timeout(Exchange::Mexc.http_timeout())
            .build()
            .map_err(|e| CyclerError::Internal(format!("failed to build MEXC HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            fee_rate: settings
                .fee_rate
                .unwrap_or_else(|| Exchange::Mexc.default_fee_rate()),
            dry_run,
            rules: OnceCell::new(),
        })
    }

    fn credentials(&self) -> Result<(&str, &str)> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| CyclerError::Auth("MEXC api_key is required".to_string()))?;
        let secret = self
            .api_secret
            .as_deref()
            .ok_or_else(|| CyclerError::Auth("MEXC api_secret is required".to_string()))?;
        Ok((key, secret))
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
        let (key, secret) = self.credentials()?;
        let timestamp = Utc::now().timestamp_millis().to_string();

        let mut query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect();
        query.push("recvWindow=5000".to_string());
        query.push(format!("timestamp={timestamp}"));
        let query = query.join("&");

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| CyclerError::Auth(format!("invalid MEXC secret: {e}")))?;
        mac.update(query.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query, signature
        );
        let resp = self
            .http
            .request(method, &url)
            .header("X-MEXC-APIKEY", key)
            .send()
            .await?;
        Self::decode(resp, path).await
    }

    async fn decode(resp: reqwest::Response, path: &str) -> Result<Value> {
        let status = resp.status();
        let text = resp.text().await?;

        if status.as_u16() == 429 {
            return Err(CyclerError::RateLimited(format!(
                "MEXC rate limited on {path}"
            )));
        }

        let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if !status.is_success() {
            let message = pick_str(&value, &["msg"])
                .map(ToString::to_string)
                .unwrap_or(text);
            return Err(CyclerError::ExchangeApi {
                exchange: "mexc".to_string(),
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
            .map(|raw| self.normalize_order_id(&raw))
            .unwrap_or_default();

        let side = match pick_str(order, &["side"]) {
            Some("SELL") => OrderSide::Sell,
            _ => OrderSide::Buy,
        };

        let status = pick_str(order, &["status"]).unwrap_or("UNKNOWN").to_string();
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
            executed_quantity: pick_decimal(order, &["executedQty"]).unwrap_or(Decimal::ZERO),
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
            id: format!(
                "{}{}",
                ORDER_ID_PREFIX,
                Uuid::new_v4().as_u128() % 1_000_000_000_000
            ),
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

    fn strip_prefix(raw: &str) -> &str {
        raw.strip_prefix(ORDER_ID_PREFIX).unwrap_or(raw)
    }
}

#[async_trait]
impl ExchangeClient for MexcClient {
    fn exchange(&self) -> Exchange {
        Exchange::Mexc
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
            CyclerError::MarketDataUnavailable("MEXC ticker returned no price".to_string())
        })
    }

    async fn detailed_balances(&self) -> Result<BalanceMap> {
        let mut balances = BalanceMap::new();

        if self.dry_run {
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
                let free = pick_decimal(entry, &["free", "available"]).unwrap_or(Decimal::ZERO);
                let locked = pick_decimal(entry, &["locked", "frozen"]).unwrap_or(Decimal::ZERO);
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
                            "MEXC exchangeInfo missing symbol".to_string(),
                        )
                    })?;

                // MEXC exposes precisions instead of Binance-style
                // filters; baseSizePrecision is already a step size.
                let quantity_step = pick_decimal(symbol, &["baseSizePrecision"])
                    .filter(|d| *d > Decimal::ZERO)
                    .or_else(|| {
                        symbol
                            .get("baseAssetPrecision")
                            .and_then(|v| v.as_u64())
                            .map(|p| Decimal::new(1, p as u32))
                    })
                    .unwrap_or(dec!(0.000001));
                let price_step = symbol
                    .get("quotePrecision")
                    .or_else(|| symbol.get("quoteAssetPrecision"))
                    .and_then(|v| v.as_u64())
                    .map(|p| Decimal::new(1, p as u32))
                    .unwrap_or(dec!(0.01));
                let min_notional = pick_decimal(symbol, &["quoteAmountPrecision"])
                    .unwrap_or(dec!(1));
                let max_quantity =
                    pick_decimal(symbol, &["maxQuoteAmount"]).unwrap_or(Decimal::ZERO);

                Ok(SymbolRules {
                    quantity_step,
                    price_step,
                    min_quantity: quantity_step,
                    max_quantity,
                    min_notional,
                })
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
                    ("quantity", qty_s.as_str()),
                    ("price", price_s.as_str()),
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
                // Some lookups only accept the bare id.
                let stripped = Self::strip_prefix(&id).to_string();
                if stripped != id {
                    debug!(order_id = %id, "retrying lookup with stripped id");
                    let value = self
                        .signed_json(
                            Method::GET,
                            "/api/v3/order",
                            &[("symbol", SYMBOL), ("orderId", stripped.as_str())],
                        )
                        .await?;
                    return Ok(self.map_order(&value));
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// MEXC status fields go stale: orders report NEW long after the
    /// level traded through, and occasionally FILLED with a zero
    /// executed quantity. Cross-check quantity first, then fall back
    /// to age plus price-proximity evidence.
    async fn is_filled(&self, order: &OrderSnapshot) -> Result<bool> {
        let tolerance = Exchange::Mexc.fill_tolerance();
        if fill_within_tolerance(order.executed_quantity, order.orig_quantity, tolerance) {
            return Ok(true);
        }
        if order.status != "FILLED" {
            return Ok(false);
        }

        // FILLED with no executed quantity reported: believe it only
        // when the order has aged and the market confirms the level
        // was crossed.
        let age_ok = order
            .created_at
            .map(|t| (Utc::now() - t).num_minutes() >= STALE_STATUS_AGE_MINUTES)
            .unwrap_or(false);
        if !age_ok {
            return Ok(false);
        }
        let current = self.last_price().await?;
        let crossed = match order.side {
            OrderSide::Buy => current <= order.price * dec!(1.001),
            OrderSide::Sell => current >= order.price * dec!(0.999),
        };
        Ok(crossed)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<Value> {
        if self.dry_run {
            return Ok(json!({"status": "CANCELED", "dryRun": true}));
        }
        self.signed_json(
            Method::DELETE,
            "/api/v3/order",
            &[("symbol", SYMBOL), ("orderId", order_id)],
        )
        .await
    }

    /// MEXC's trade-fee reporting is unreliable; the caller falls back
    /// to the static estimate.
    async fn order_fees(&self, _order_id: &str) -> Result<Option<Decimal>> {
        Ok(None)
    }

    fn fallback_fee_rate(&self) -> Decimal {
        self.fee_rate
    }

    /// Re-attach the fixed `C02__` prefix to bare numeric ids; leave
    /// prefixed or otherwise-shaped ids untouched.
    fn normalize_order_id(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        if trimmed.starts_with(ORDER_ID_PREFIX) {
            return trimmed.to_string();
        }
        let digits = digits_only(trimmed);
        if !digits.is_empty() && digits == trimmed {
            return format!("{ORDER_ID_PREFIX}{trimmed}");
        }
        trimmed.to_string()
    }

    /// Ambiguous id format: try as-given, prefix-stripped,
    /// prefix-attached, then digits only.
    fn cancel_id_variants(&self, order_id: &str) -> Vec<String> {
        let raw = order_id.trim().to_string();
        let stripped = Self::strip_prefix(&raw).to_string();
        let prefixed = format!("{ORDER_ID_PREFIX}{stripped}");
        let digits = digits_only(&stripped);

        let mut variants = Vec::new();
        for candidate in [raw, stripped, prefixed, digits] {
            if !candidate.is_empty() && !variants.contains(&candidate) {
                variants.push(candidate);
            }
        }
        variants
    }

    fn completion_time(&self, order: &OrderSnapshot) -> Option<DateTime<Utc>> {
        order.completed_at
    }
}

fn order_gone(err: &CyclerError) -> bool {
    match err {
        CyclerError::ExchangeApi { message, .. } => {
            let lower = message.to_lowercase();
            lower.contains("does not exist")
                || lower.contains("not found")
                || lower.contains("unknown order")
        }
        _ => false,
    }
}
