//! KuCoin spot adapter (signed REST, KC-API v2 key scheme).
//!
//! Auth: `KC-API-SIGN` is base64(HMAC-SHA256(secret, timestamp +
//! METHOD + endpoint + body)); the passphrase is itself HMAC-signed.
//! Responses are wrapped in `{"code":"200000","data":...}`. Order ids
//! are 24-char lowercase hex tokens; normalization extracts the token
//! from whatever wrapper the caller hands in.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
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

use super::{format_decimal, parse_millis, pick, pick_decimal, pick_str};
use crate::config::ExchangeSettings;
use crate::error::{CyclerError, Result};
use crate::exchange::{
    ensure_core_assets, fill_within_tolerance, AssetBalance, BalanceMap, Exchange, ExchangeClient,
    OrderSide, OrderSnapshot, SymbolRules, BTC, USDC,
};

const DEFAULT_BASE: &str = "https://api.kucoin.com";
const SYMBOL: &str = "BTC-USDC";

/// KuCoin order ids are 24 lowercase hex characters.
const ORDER_ID_LEN: usize = 24;

type HmacSha256 = Hmac<Sha256>;

pub struct KucoinClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    api_passphrase: Option<String>,
    fee_rate: Decimal,
    dry_run: bool,
    rules: OnceCell<SymbolRules>,
}

impl KucoinClient {
    pub fn new(settings: &ExchangeSettings, dry_run: bool) -> Result<Self> {
        let base_url = settings
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE)
            .trim_end_matches('/')
            .to_string();

        let http = Client::builder()
            .user_agent("cycler-kucoin/0.1")
            .timeout(Exchange::Kucoin.http_timeout())
            .build()
            .map_err(|e| {
                CyclerError::Internal(format!("failed to build KuCoin HTTP client: {e}"))
            })?;

        Ok(Self {
            http,
            base_url,
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            api_passphrase: settings.api_passphrase.clone(),
            fee_rate: settings
                .fee_rate
                .unwrap_or_else(|| Exchange::Kucoin.default_fee_rate()),
            dry_run,
            rules: OnceCell::new(),
        })
    }

    fn credentials(&self) -> Result<(&str, &str, &str)> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| CyclerError::Auth("KuCoin api_key is required".to_string()))?;
        let secret = self
            .api_secret
            .as_deref()
            .ok_or_else(|| CyclerError::Auth("KuCoin api_secret is required".to_string()))?;
        let passphrase = self
            .api_passphrase
            .as_deref()
            .ok_or_else(|| CyclerError::Auth("KuCoin api_passphrase is required".to_string()))?;
        Ok((key, secret, passphrase))
    }

    fn hmac_b64(secret: &str, payload: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| CyclerError::Auth(format!("invalid KuCoin secret: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// `endpoint` must include the query string; it is part of the
    /// signed payload.
    async fn request_json(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
        auth: bool,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, endpoint);
        let body_text = body.as_ref().map(|b| b.to_string()).unwrap_or_default();

        let mut req = self.http.request(method.clone(), &url);

        if auth {
            let (key, secret, passphrase) = self.credentials()?;
            let timestamp = Utc::now().timestamp_millis().to_string();
            let payload = format!("{timestamp}{}{endpoint}{body_text}", method.as_str());
            let signature = Self::hmac_b64(secret, &payload)?;
            let signed_passphrase = Self::hmac_b64(secret, passphrase)?;
            req = req
                .header("KC-API-KEY", key)
                .header("KC-API-SIGN", signature)
                .header("KC-API-TIMESTAMP", timestamp)
                .header("KC-API-PASSPHRASE", signed_passphrase)
                .header("KC-API-KEY-VERSION", "2");
        }

        if let Some(body) = body {
            req = req
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .json(&body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if status.as_u16() == 429 {
            return Err(CyclerError::RateLimited(format!(
                "KuCoin rate limited on {endpoint}"
            )));
        }

        let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let code = pick_str(&value, &["code"]).unwrap_or_default();

        if !status.is_success() || (!code.is_empty() && code != "200000") {
            let message = pick_str(&value, &["msg"])
                .map(ToString::to_string)
                .unwrap_or(text);
            return Err(CyclerError::ExchangeApi {
                exchange: "kucoin".to_string(),
                message: format!("{endpoint}: [{code}] {message}"),
            });
        }

        Ok(value.get("data").cloned().unwrap_or(Value::Null))
    }

    fn map_order(&self, order: &Value) -> OrderSnapshot {
        let id = pick_str(order, &["id", "orderId"])
            .map(|raw| self.normalize_order_id(raw))
            .unwrap_or_default();

        let side = match pick_str(order, &["side"]) {
            Some("sell") | Some("SELL") => OrderSide::Sell,
            _ => OrderSide::Buy,
        };

        let is_active = order
            .get("isActive")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let status = if is_active { "open" } else { "done" }.to_string();

        OrderSnapshot {
            id,
            side,
            price: pick_decimal(order, &["price"]).unwrap_or(Decimal::ZERO),
            orig_quantity: pick_decimal(order, &["size"]).unwrap_or(Decimal::ZERO),
            executed_quantity: pick_decimal(order, &["dealSize"]).unwrap_or(Decimal::ZERO),
            cumulative_quote: pick_decimal(order, &["dealFunds"]).unwrap_or(Decimal::ZERO),
            status,
            created_at: pick(order, &["createdAt"]).and_then(parse_millis),
            completed_at: pick(order, &["doneAt", "updatedAt"]).and_then(parse_millis),
            raw: order.clone(),
        }
    }

    fn dry_run_order(side: OrderSide, price: Decimal, quantity: Decimal) -> OrderSnapshot {
        let hex = format!("{:032x}", Uuid::new_v4().as_u128());
        OrderSnapshot {
            id: hex[..ORDER_ID_LEN].to_string(),
            side,
            price,
            orig_quantity: quantity,
            executed_quantity: Decimal::ZERO,
            cumulative_quote: Decimal::ZERO,
            status: "open".to_string(),
            created_at: Some(Utc::now()),
            completed_at: None,
            raw: json!({"dryRun": true}),
        }
    }
}

#[async_trait]
impl ExchangeClient for KucoinClient {
    fn exchange(&self) -> Exchange {
        Exchange::Kucoin
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    async fn check_connection(&self) -> Result<()> {
        self.request_json(Method::GET, "/api/v1/timestamp", None, false)
            .await?;
        if !self.dry_run {
            self.request_json(Method::GET, "/api/v1/accounts?type=trade", None, true)
                .await?;
        }
        Ok(())
    }

    async fn last_price(&self) -> Result<Decimal> {
        let data = self
            .request_json(
                Method::GET,
                &format!("/api/v1/market/orderbook/level1?symbol={SYMBOL}"),
                None,
                false,
            )
            .await?;
        pick_decimal(&data, &["price"]).ok_or_else(|| {
            CyclerError::MarketDataUnavailable("KuCoin level1 returned no price".to_string())
        })
    }

    async fn detailed_balances(&self) -> Result<BalanceMap> {
        let mut balances = BalanceMap::new();

        if self.dry_run {
            balances.insert(USDC.to_string(), AssetBalance::new(dec!(10000), Decimal::ZERO));
            ensure_core_assets(&mut balances);
            return Ok(balances);
        }

        let data = self
            .request_json(Method::GET, "/api/v1/accounts?type=trade", None, true)
            .await?;
        if let Some(entries) = data.as_array() {
            for entry in entries {
                let Some(currency) = pick_str(entry, &["currency"]) else {
                    continue;
                };
                let free = pick_decimal(entry, &["available"]).unwrap_or(Decimal::ZERO);
                let locked = pick_decimal(entry, &["holds"]).unwrap_or(Decimal::ZERO);
                if free > Decimal::ZERO
                    || locked > Decimal::ZERO
                    || currency == BTC
                    || currency == USDC
                {
                    balances.insert(currency.to_string(), AssetBalance::new(free, locked));
                }
            }
        }
        ensure_core_assets(&mut balances);
        Ok(balances)
    }

    async fn symbol_rules(&self) -> Result<SymbolRules> {
        self.rules
            .get_or_try_init(|| async {
                let data = self
                    .request_json(
                        Method::GET,
                        &format!("/api/v2/symbols/{SYMBOL}"),
                        None,
                        false,
                    )
                    .await?;
                if data.is_null() {
                    return Err(CyclerError::MarketDataUnavailable(
                        "KuCoin symbol metadata missing".to_string(),
                    ));
                }
                Ok(SymbolRules {
                    quantity_step: pick_decimal(&data, &["baseIncrement"]).unwrap_or(dec!(0.00000001)),
                    price_step: pick_decimal(&data, &["priceIncrement"]).unwrap_or(dec!(0.1)),
                    min_quantity: pick_decimal(&data, &["baseMinSize"]).unwrap_or(dec!(0.00001)),
                    max_quantity: pick_decimal(&data, &["baseMaxSize"]).unwrap_or(Decimal::ZERO),
                    min_notional: pick_decimal(&data, &["minFunds"]).unwrap_or(dec!(0.1)),
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

        let body = json!({
            "clientOid": Uuid::new_v4().to_string(),
            "side": match side { OrderSide::Buy => "buy", OrderSide::Sell => "sell" },
            "symbol": SYMBOL,
            "type": "limit",
            "price": format_decimal(price),
            "size": format_decimal(quantity),
        });
        let data = self
            .request_json(Method::POST, "/api/v1/orders", Some(body), true)
            .await?;
        let order_id = pick_str(&data, &["orderId"])
            .map(ToString::to_string)
            .ok_or_else(|| {
                CyclerError::OrderSubmission("KuCoin order response missing orderId".to_string())
            })?;

        // Placement returns only the id; echo the request as snapshot.
        Ok(OrderSnapshot {
            id: order_id,
            side,
            price,
            orig_quantity: quantity,
            executed_quantity: Decimal::ZERO,
            cumulative_quote: Decimal::ZERO,
            status: "open".to_string(),
            created_at: Some(Utc::now()),
            completed_at: None,
            raw: data,
        })
    }

    async fn order_by_id(&self, order_id: &str) -> Result<OrderSnapshot> {
        let id = self.normalize_order_id(order_id);
        let result = self
            .request_json(Method::GET, &format!("/api/v1/orders/{id}"), None, true)
            .await;

        match result {
            Ok(data) if !data.is_null() => Ok(self.map_order(&data)),
            other => {
                match other {
                    Err(e) if !order_gone(&e) => return Err(e),
                    _ => {}
                }
                // Done orders can drop off the direct lookup; scan the
                // recent done list.
                debug!(order_id = %id, "order lookup failed, scanning done orders");
                let data = self
                    .request_json(
                        Method::GET,
                        &format!("/api/v1/orders?status=done&symbol={SYMBOL}"),
                        None,
                        true,
                    )
                    .await?;
                let items = data
                    .get("items")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                items
                    .iter()
                    .find(|o| pick_str(o, &["id"]) == Some(id.as_str()))
                    .map(|o| self.map_order(o))
                    .ok_or_else(|| CyclerError::OrderNotFound(id))
            }
        }
    }

    async fn is_filled(&self, order: &OrderSnapshot) -> Result<bool> {
        // "done" covers both filled and cancelled orders, so the
        // status string alone proves nothing; only the deal size does.
        Ok(fill_within_tolerance(
            order.executed_quantity,
            order.orig_quantity,
            Exchange::Kucoin.fill_tolerance(),
        ))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<Value> {
        if self.dry_run {
            return Ok(json!({"cancelledOrderIds": [order_id], "dryRun": true}));
        }
        let id = self.normalize_order_id(order_id);
        self.request_json(Method::DELETE, &format!("/api/v1/orders/{id}"), None, true)
            .await
    }

    async fn order_fees(&self, order_id: &str) -> Result<Option<Decimal>> {
        if self.dry_run {
            return Ok(None);
        }
        let id = self.normalize_order_id(order_id);
        let data = self
            .request_json(
                Method::GET,
                &format!("/api/v1/fills?orderId={id}"),
                None,
                true,
            )
            .await?;
        let items = data
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        if items.is_empty() {
            return Ok(None);
        }

        let mut total = Decimal::ZERO;
        for fill in &items {
            let fee = pick_decimal(fill, &["fee"]).unwrap_or(Decimal::ZERO);
            if fee <= Decimal::ZERO {
                continue;
            }
            match pick_str(fill, &["feeCurrency"]) {
                Some(BTC) => {
                    let price = pick_decimal(fill, &["price"]).unwrap_or(Decimal::ZERO);
                    total += fee * price;
                }
                _ => total += fee,
            }
        }
        Ok(Some(total))
    }

    fn fallback_fee_rate(&self) -> Decimal {
        self.fee_rate
    }

    /// Extract the 24-char lowercase hex token from whatever wrapper
    /// the id arrived in.
    fn normalize_order_id(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        extract_hex_token(trimmed).unwrap_or_else(|| trimmed.to_string())
    }

    fn completion_time(&self, order: &OrderSnapshot) -> Option<DateTime<Utc>> {
        order.completed_at
    }
}

fn extract_hex_token(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    if bytes.len() < ORDER_ID_LEN {
        return None;
    }
    let is_hex = |b: u8| b.is_ascii_digit() || (b'a'..=b'f').contains(&b);
    for start in 0..=bytes.len() - ORDER_ID_LEN {
        let window = &bytes[start..start + ORDER_ID_LEN];
        if window.iter().all(|b| is_hex(*b)) {
            // Require a boundary so a longer hex run is not split
            let before_ok = start == 0 || !is_hex(bytes[start - 1]);
            let after_ok =
                start + ORDER_ID_LEN == bytes.len() || !is_hex(bytes[start + ORDER_ID_LEN]);
            if before_ok && after_ok {
                return Some(String::from_utf8_lossy(window).to_string());
            }
        }
    }
    None
}

fn order_gone(err: &CyclerError) -> bool {
    match err {
        CyclerError::ExchangeApi { message, .. } => {
            let lower = message.to_lowercase();
            lower.contains("not exist") || lower.contains("not found") || lower.contains("400100")
        }
        _ => false,
    }
}
