//! Kraken spot adapter (signed REST v0).
//!
//! Private calls are form-encoded POSTs; `API-Sign` is
//! base64(HMAC-SHA512(base64-decoded secret, path + SHA256(nonce +
//! postdata))). The `Balance` endpoint reports totals only, so locked
//! amounts are derived by summing remaining volume x price across open
//! orders on the pair. Filled orders leave the open set immediately;
//! lookups fall back to `ClosedOrders`. Fees are real
//! (`QueryOrders.fee`, quote currency).

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256, Sha512};
use tokio::sync::OnceCell;
use tracing::debug;
use uuid::Uuid;

use super::{format_decimal, parse_epoch_seconds, pick, pick_decimal, pick_str};
use crate::config::ExchangeSettings;
use crate::error::{CyclerError, Result};
use crate::exchange::{
    ensure_core_assets, fill_within_tolerance, AssetBalance, BalanceMap, Exchange, ExchangeClient,
    OrderSide, OrderSnapshot, SymbolRules, BTC, USDC,
};

const DEFAULT_BASE: &str = "https://api.kraken.com";
const PAIR: &str = "XBTUSDC";

type HmacSha512 = Hmac<Sha512>;

pub struct KrakenClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    fee_rate: Decimal,
    dry_run: bool,
    rules: OnceCell<SymbolRules>,
}

impl KrakenClient {
    pub fn new(settings: &ExchangeSettings, dry_run: bool) -> Result<Self> {
        let base_url = settings
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE)
            .trim_end_matches('/')
            .to_string();

        let http = Client::builder()
            .user_agent("cycler-kraken/0.1")
            .timeout(Exchange::Kraken.http_timeout())
            .build()
            .map_err(|e| {
                CyclerError::Internal(format!("failed to build Kraken HTTP client: {e}"))
            })?;

        Ok(Self {
            http,
            base_url,
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            fee_rate: settings
                .fee_rate
                .unwrap_or_else(|| Exchange::Kraken.default_fee_rate()),
            dry_run,
            rules: OnceCell::new(),
        })
    }

    fn credentials(&self) -> Result<(&str, &str)> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| CyclerError::Auth("Kraken api_key is required".to_string()))?;
        let secret = self
            .api_secret
            .as_deref()
            .ok_or_else(|| CyclerError::Auth("Kraken api_secret is required".to_string()))?;
        Ok((key, secret))
    }

    fn sign(&self, path: &str, nonce: &str, postdata: &str) -> Result<String> {
        let (_, secret) = self.credentials()?;
        let secret = BASE64_STANDARD
            .decode(secret)
            .map_err(|e| CyclerError::Auth(format!("Kraken secret is not base64: {e}")))?;

        let mut sha = Sha256::new();
        sha.update(nonce.as_bytes());
        sha.update(postdata.as_bytes());
        let digest = sha.finalize();

        let mut mac = HmacSha512::new_from_slice(&secret)
            .map_err(|e| CyclerError::Auth(format!("invalid Kraken secret: {e}")))?;
        mac.update(path.as_bytes());
        mac.update(&digest);
        Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
    }

    async fn public_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.get(&url).query(query).send().await?;
        Self::decode(resp, path).await
    }

    async fn private_json(&self, path: &str, params: &[(&str, &str)]) -> Result<Value> {
        let (key, _) = self.credentials()?;
        let nonce = Utc::now().timestamp_millis().to_string();

        let mut postdata = format!("nonce={nonce}");
        for (k, v) in params {
            postdata.push('&');
            postdata.push_str(k);
            postdata.push('=');
            postdata.push_str(&urlencoding::encode(v));
        }
        let signature = self.sign(path, &nonce, &postdata)?;

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .header("API-Key", key)
            .header("API-Sign", signature)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(postdata)
            .send()
            .await?;
        Self::decode(resp, path).await
    }

    async fn decode(resp: reqwest::Response, path: &str) -> Result<Value> {
        let status = resp.status();
        let text = resp.text().await?;
        let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        let errors: Vec<String> = value
            .get("error")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|e| e.as_str())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if errors.iter().any(|e| e.contains("EAPI:Rate limit")) {
            return Err(CyclerError::RateLimited(format!(
                "Kraken rate limited on {path}"
            )));
        }
        if !errors.is_empty() {
            return Err(CyclerError::ExchangeApi {
                exchange: "kraken".to_string(),
                message: format!("{path}: {}", errors.join("; ")),
            });
        }
        if !status.is_success() {
            return Err(CyclerError::ExchangeApi {
                exchange: "kraken".to_string(),
                message: format!("{path}: status={status} body={text}"),
            });
        }

        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Kraken keys results by its own pair spelling; take the first
    /// entry rather than guessing the key.
    fn first_entry(result: &Value) -> Option<(&String, &Value)> {
        result.as_object().and_then(|m| m.iter().next())
    }

    fn map_order(&self, id: &str, order: &Value) -> OrderSnapshot {
        let descr = order.get("descr").cloned().unwrap_or(Value::Null);

        let side = match pick_str(&descr, &["type"]).or_else(|| pick_str(order, &["type"])) {
            Some("sell") => OrderSide::Sell,
            _ => OrderSide::Buy,
        };

        let status = pick_str(order, &["status"]).unwrap_or("unknown").to_string();
        // Limit price lives in descr; top-level price is the average
        // execution price (zero until something fills).
        let limit_price = pick_decimal(&descr, &["price"])
            .filter(|p| *p > Decimal::ZERO)
            .or_else(|| pick_decimal(order, &["price"]))
            .unwrap_or(Decimal::ZERO);

        let completed_at = if status == "closed" {
            pick(order, &["closetm"]).and_then(parse_epoch_seconds)
        } else {
            None
        };

        OrderSnapshot {
            id: self.normalize_order_id(id),
            side,
            price: limit_price,
            orig_quantity: pick_decimal(order, &["vol"]).unwrap_or(Decimal::ZERO),
            executed_quantity: pick_decimal(order, &["vol_exec"]).unwrap_or(Decimal::ZERO),
            cumulative_quote: pick_decimal(order, &["cost"]).unwrap_or(Decimal::ZERO),
            status,
            created_at: pick(order, &["opentm"]).and_then(parse_epoch_seconds),
            completed_at,
            raw: order.clone(),
        }
    }

    fn dry_run_order(side: OrderSide, price: Decimal, quantity: Decimal) -> OrderSnapshot {
        let token = Uuid::new_v4().simple().to_string().to_uppercase();
        OrderSnapshot {
            id: format!("O{}-{}-{}", &token[..5], &token[5..10], &token[10..16]),
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

    /// Open orders on the pair, as (side, remaining volume, limit price).
    async fn open_pair_orders(&self) -> Result<Vec<(OrderSide, Decimal, Decimal)>> {
        let result = self.private_json("/0/private/OpenOrders", &[]).await?;
        let open = result
            .get("open")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_else(Map::new);

        let mut orders = Vec::new();
        for (_, order) in open.iter() {
            let descr = order.get("descr").cloned().unwrap_or(Value::Null);
            let pair = pick_str(&descr, &["pair"]).unwrap_or_default();
            if !pair.contains("XBT") || !pair.contains("USDC") {
                continue;
            }
            let side = match pick_str(&descr, &["type"]) {
                Some("sell") => OrderSide::Sell,
                _ => OrderSide::Buy,
            };
            let vol = pick_decimal(order, &["vol"]).unwrap_or(Decimal::ZERO);
            let vol_exec = pick_decimal(order, &["vol_exec"]).unwrap_or(Decimal::ZERO);
            let price = pick_decimal(&descr, &["price"]).unwrap_or(Decimal::ZERO);
            let remaining = (vol - vol_exec).max(Decimal::ZERO);
            if remaining > Decimal::ZERO {
                orders.push((side, remaining, price));
            }
        }
        Ok(orders)
    }
}

/// Kraken's asset codes to ours.
fn map_asset(code: &str) -> &str {
    match code {
        "XXBT" | "XBT" => BTC,
        "ZUSD" => "USD",
        other => other,
    }
}

#[async_trait]
impl ExchangeClient for KrakenClient {
    fn exchange(&self) -> Exchange {
        Exchange::Kraken
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    async fn check_connection(&self) -> Result<()> {
        self.public_json("/0/public/Time", &[]).await?;
        if !self.dry_run {
            self.private_json("/0/private/Balance", &[]).await?;
        }
        Ok(())
    }

    async fn last_price(&self) -> Result<Decimal> {
        let result = self
            .public_json("/0/public/Ticker", &[("pair", PAIR)])
            .await?;
        let (_, ticker) = Self::first_entry(&result).ok_or_else(|| {
            CyclerError::MarketDataUnavailable("Kraken ticker returned no pair".to_string())
        })?;
        // c = [last trade price, lot volume]
        ticker
            .get("c")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(super::parse_decimalish)
            .ok_or_else(|| {
                CyclerError::MarketDataUnavailable("Kraken ticker returned no price".to_string())
            })
    }

    /// `Balance` reports totals only; locked is derived from open
    /// orders (remaining volume for sells, remaining volume x price
    /// for buys) and free is total minus locked.
    async fn detailed_balances(&self) -> Result<BalanceMap> {
        let mut balances = BalanceMap::new();

        if self.dry_run {
            balances.insert(USDC.to_string(), AssetBalance::new(dec!(10000), Decimal::ZERO));
            ensure_core_assets(&mut balances);
            return Ok(balances);
        }

        let result = self.private_json("/0/private/Balance", &[]).await?;
        let totals = result.as_object().cloned().unwrap_or_else(Map::new);

        let mut locked_btc = Decimal::ZERO;
        let mut locked_usdc = Decimal::ZERO;
        for (side, remaining, price) in self.open_pair_orders().await? {
            match side {
                OrderSide::Buy => locked_usdc += remaining * price,
                OrderSide::Sell => locked_btc += remaining,
            }
        }

        for (code, amount) in totals.iter() {
            let asset = map_asset(code);
            let total = super::parse_decimalish(amount).unwrap_or(Decimal::ZERO);
            let locked = match asset {
                BTC => locked_btc.min(total),
                USDC => locked_usdc.min(total),
                _ => Decimal::ZERO,
            };
            balances.insert(asset.to_string(), AssetBalance::new(total - locked, locked));
        }
        ensure_core_assets(&mut balances);
        Ok(balances)
    }

    async fn symbol_rules(&self) -> Result<SymbolRules> {
        self.rules
            .get_or_try_init(|| async {
                let result = self
                    .public_json("/0/public/AssetPairs", &[("pair", PAIR)])
                    .await?;
                let (_, pair) = Self::first_entry(&result).ok_or_else(|| {
                    CyclerError::MarketDataUnavailable(
                        "Kraken AssetPairs returned no pair".to_string(),
                    )
                })?;

                let lot_decimals = pair.get("lot_decimals").and_then(|v| v.as_u64()).unwrap_or(8);
                let pair_decimals = pair.get("pair_decimals").and_then(|v| v.as_u64()).unwrap_or(1);
                Ok(SymbolRules {
                    quantity_step: Decimal::new(1, lot_decimals as u32),
                    price_step: Decimal::new(1, pair_decimals as u32),
                    min_quantity: pick_decimal(pair, &["ordermin"]).unwrap_or(dec!(0.0001)),
                    max_quantity: Decimal::ZERO,
                    min_notional: pick_decimal(pair, &["costmin"]).unwrap_or(dec!(0.5)),
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
        let volume_s = format_decimal(quantity);
        let type_s = match side {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        };
        let result = self
            .private_json(
                "/0/private/AddOrder",
                &[
                    ("pair", PAIR),
                    ("type", type_s),
                    ("ordertype", "limit"),
                    ("price", price_s.as_str()),
                    ("volume", volume_s.as_str()),
                ],
            )
            .await?;

        let txid = result
            .get("txid")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| {
                CyclerError::OrderSubmission("Kraken AddOrder returned no txid".to_string())
            })?;

        Ok(OrderSnapshot {
            id: self.normalize_order_id(&txid),
            side,
            price,
            orig_quantity: quantity,
            executed_quantity: Decimal::ZERO,
            cumulative_quote: Decimal::ZERO,
            status: "open".to_string(),
            created_at: Some(Utc::now()),
            completed_at: None,
            raw: result,
        })
    }

    async fn order_by_id(&self, order_id: &str) -> Result<OrderSnapshot> {
        let id = self.normalize_order_id(order_id);
        let result = self
            .private_json("/0/private/QueryOrders", &[("txid", id.as_str())])
            .await;

        match result {
            Ok(value) => {
                if let Some(order) = value.get(&id) {
                    return Ok(self.map_order(&id, order));
                }
                // QueryOrders succeeded but did not echo the id.
                Err(CyclerError::OrderNotFound(id))
            }
            Err(e) if order_gone(&e) => {
                debug!(order_id = %id, "order unknown to QueryOrders, scanning closed orders");
                let value = self.private_json("/0/private/ClosedOrders", &[]).await?;
                let closed = value
                    .get("closed")
                    .and_then(|v| v.as_object())
                    .cloned()
                    .unwrap_or_else(Map::new);
                closed
                    .get(&id)
                    .map(|o| self.map_order(&id, o))
                    .ok_or(CyclerError::OrderNotFound(id))
            }
            Err(e) => Err(e),
        }
    }

    async fn is_filled(&self, order: &OrderSnapshot) -> Result<bool> {
        if order.status == "closed" {
            return Ok(true);
        }
        Ok(fill_within_tolerance(
            order.executed_quantity,
            order.orig_quantity,
            Exchange::Kraken.fill_tolerance(),
        ))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<Value> {
        if self.dry_run {
            return Ok(json!({"count": 1, "dryRun": true}));
        }
        let id = self.normalize_order_id(order_id);
        self.private_json("/0/private/CancelOrder", &[("txid", id.as_str())])
            .await
    }

    /// Kraken reports the real fee (quote currency) on the order itself.
    async fn order_fees(&self, order_id: &str) -> Result<Option<Decimal>> {
        if self.dry_run {
            return Ok(None);
        }
        let order = self.order_by_id(order_id).await?;
        let fee = pick_decimal(&order.raw, &["fee"]).unwrap_or(Decimal::ZERO);
        if fee > Decimal::ZERO {
            Ok(Some(fee))
        } else {
            Ok(None)
        }
    }

    fn fallback_fee_rate(&self) -> Decimal {
        self.fee_rate
    }

    /// Strip to Kraken's safe character set (uppercase alphanumerics
    /// and dashes, e.g. `OABCDE-12345-FGHIJK`).
    fn normalize_order_id(&self, raw: &str) -> String {
        raw.trim()
            .to_ascii_uppercase()
            .chars()
            .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '-')
            .collect()
    }

    fn completion_time(&self, order: &OrderSnapshot) -> Option<DateTime<Utc>> {
        order.completed_at
    }
}

fn order_gone(err: &CyclerError) -> bool {
    match err {
        CyclerError::ExchangeApi { message, .. } => {
            message.contains("EOrder:Unknown order") || message.contains("EOrder:Invalid order")
        }
        _ => false,
    }
}
