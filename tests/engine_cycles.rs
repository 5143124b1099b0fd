//! End-to-end engine tests over an in-memory mock exchange.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use cycler::config::{
    AppConfig, DryRunConfig, ExchangesConfig, LoggingConfig, SchedulerConfig, StorageConfig,
};
use cycler::domain::{Cycle, CycleStatus};
use cycler::engine::{accumulate, safe_cancel, AccumulationOutcome, StrategyOverrides, UpdateEngine};
use cycler::error::{CyclerError, Result};
use cycler::exchange::{
    AssetBalance, BalanceMap, ClientTable, Exchange, ExchangeClient, OrderSide, OrderSnapshot,
    SymbolRules, BTC, USDC,
};
use cycler::repository::{AccumulationRepository, CycleRepository};

/// Scripted exchange double: orders fill when told to, cancels can be
/// made to fail with an arbitrary message, balances are set directly.
struct MockExchange {
    exchange: Exchange,
    price: Mutex<Decimal>,
    orders: Mutex<HashMap<String, OrderSnapshot>>,
    balances: Mutex<BalanceMap>,
    cancel_error: Mutex<Option<String>>,
    fail_sell_orders: Mutex<bool>,
    next_id: AtomicU64,
    fees: Mutex<Option<Decimal>>,
}

impl MockExchange {
    fn new(exchange: Exchange, price: Decimal) -> Arc<Self> {
        let mut balances = BalanceMap::new();
        balances.insert(USDC.to_string(), AssetBalance::new(dec!(10000), Decimal::ZERO));
        balances.insert(BTC.to_string(), AssetBalance::new(Decimal::ZERO, Decimal::ZERO));
        Arc::new(Self {
            exchange,
            price: Mutex::new(price),
            orders: Mutex::new(HashMap::new()),
            balances: Mutex::new(balances),
            cancel_error: Mutex::new(None),
            fail_sell_orders: Mutex::new(false),
            next_id: AtomicU64::new(1),
            fees: Mutex::new(None),
        })
    }

    fn set_free_btc(&self, amount: Decimal) {
        self.balances
            .lock()
            .unwrap()
            .insert(BTC.to_string(), AssetBalance::new(amount, Decimal::ZERO));
    }

    fn set_cancel_error(&self, message: &str) {
        *self.cancel_error.lock().unwrap() = Some(message.to_string());
    }

    fn set_fail_sell_orders(&self, fail: bool) {
        *self.fail_sell_orders.lock().unwrap() = fail;
    }

    fn set_fees(&self, fee: Decimal) {
        *self.fees.lock().unwrap() = Some(fee);
    }

    /// Register an order as resting on the book.
    fn seed_order(&self, id: &str, side: OrderSide, price: Decimal, quantity: Decimal) {
        self.orders.lock().unwrap().insert(
            id.to_string(),
            OrderSnapshot {
                id: id.to_string(),
                side,
                price,
                orig_quantity: quantity,
                executed_quantity: Decimal::ZERO,
                cumulative_quote: Decimal::ZERO,
                status: "NEW".to_string(),
                created_at: Some(Utc::now()),
                completed_at: None,
                raw: Value::Null,
            },
        );
    }

    /// Mark an order fully (or partially) executed.
    fn fill_order(&self, id: &str, executed: Decimal) {
        let mut orders = self.orders.lock().unwrap();
        if let Some(order) = orders.get_mut(id) {
            order.executed_quantity = executed;
            order.cumulative_quote = executed * order.price;
            order.status = "FILLED".to_string();
            order.completed_at = Some(Utc::now());
        }
    }

    fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    fn is_dry_run(&self) -> bool {
        false
    }

    async fn check_connection(&self) -> Result<()> {
        Ok(())
    }

    async fn last_price(&self) -> Result<Decimal> {
        Ok(*self.price.lock().unwrap())
    }

    async fn detailed_balances(&self) -> Result<BalanceMap> {
        Ok(self.balances.lock().unwrap().clone())
    }

    async fn symbol_rules(&self) -> Result<SymbolRules> {
        Ok(SymbolRules {
            quantity_step: dec!(0.00001),
            price_step: dec!(0.01),
            min_quantity: dec!(0.0001),
            max_quantity: Decimal::ZERO,
            min_notional: dec!(5),
        })
    }

    async fn create_order(
        &self,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderSnapshot> {
        if side == OrderSide::Sell && *self.fail_sell_orders.lock().unwrap() {
            return Err(CyclerError::OrderSubmission(
                "venue rejected the order".to_string(),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let order = OrderSnapshot {
            id: id.clone(),
            side,
            price,
            orig_quantity: quantity,
            executed_quantity: Decimal::ZERO,
            cumulative_quote: Decimal::ZERO,
            status: "NEW".to_string(),
            created_at: Some(Utc::now()),
            completed_at: None,
            raw: Value::Null,
        };
        self.orders.lock().unwrap().insert(id, order.clone());
        Ok(order)
    }

    async fn order_by_id(&self, order_id: &str) -> Result<OrderSnapshot> {
        self.orders
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .ok_or_else(|| CyclerError::OrderNotFound(order_id.to_string()))
    }

    async fn is_filled(&self, order: &OrderSnapshot) -> Result<bool> {
        Ok(order.status == "FILLED")
    }

    async fn cancel_order(&self, order_id: &str) -> Result<Value> {
        if let Some(message) = self.cancel_error.lock().unwrap().clone() {
            return Err(CyclerError::ExchangeApi {
                exchange: self.exchange.to_string(),
                message,
            });
        }
        self.orders.lock().unwrap().remove(order_id);
        Ok(json!({"cancelled": order_id}))
    }

    async fn order_fees(&self, _order_id: &str) -> Result<Option<Decimal>> {
        Ok(*self.fees.lock().unwrap())
    }

    fn fallback_fee_rate(&self) -> Decimal {
        dec!(0.001)
    }

    fn normalize_order_id(&self, raw: &str) -> String {
        raw.trim().to_string()
    }
}

fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("cycler-engine-{}", Uuid::new_v4()))
}

fn test_config(accumulation: bool) -> AppConfig {
    let mut exchanges = ExchangesConfig::default();
    exchanges.binance.enabled = true;
    exchanges.binance.sell_offset = dec!(500);
    exchanges.binance.buy_max_days = 2;
    exchanges.binance.accumulation = accumulation;
    exchanges.binance.sell_accu_price_deviation = dec!(3);
    AppConfig {
        exchanges,
        scheduler: SchedulerConfig::default(),
        storage: StorageConfig::default(),
        logging: LoggingConfig::default(),
        dry_run: DryRunConfig { enabled: false },
    }
}

struct Harness {
    mock: Arc<MockExchange>,
    engine: Arc<UpdateEngine>,
    cycles: Arc<CycleRepository>,
    accumulations: Arc<AccumulationRepository>,
}

async fn harness(price: Decimal, accumulation: bool) -> Harness {
    let dir = temp_dir();
    let mock = MockExchange::new(Exchange::Binance, price);
    let mut clients = ClientTable::new();
    clients.insert(Exchange::Binance, mock.clone() as Arc<dyn ExchangeClient>);

    let cycles = Arc::new(CycleRepository::open(&dir).await.unwrap());
    let accumulations = Arc::new(AccumulationRepository::open(&dir).await.unwrap());
    let engine = Arc::new(UpdateEngine::new(
        clients,
        test_config(accumulation),
        cycles.clone(),
        accumulations.clone(),
    ));
    Harness {
        mock,
        engine,
        cycles,
        accumulations,
    }
}

async fn seed_buy_cycle(h: &Harness, quantity: Decimal, buy_price: Decimal) -> u64 {
    h.mock.seed_order("buy-1", OrderSide::Buy, buy_price, quantity);
    let cycle = Cycle::new(
        Exchange::Binance,
        quantity,
        buy_price,
        "buy-1".to_string(),
        Utc::now(),
    );
    h.cycles.save(cycle).await.unwrap()
}

#[tokio::test]
async fn buy_fill_opens_sell_side_with_standard_offset() {
    let h = harness(dec!(60100), false).await;
    let id = seed_buy_cycle(&h, dec!(0.01), dec!(60000)).await;

    h.mock.fill_order("buy-1", dec!(0.00998));
    h.mock.set_free_btc(dec!(0.00998));

    let summary = h.engine.clone().run_pass(None, StrategyOverrides::default()).await;
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.advanced, 1);

    let cycle = h.cycles.find_by_id_int(id).await.unwrap();
    assert_eq!(cycle.status, CycleStatus::Sell);
    // executed quantity reconciled down to what the venue reported
    assert_eq!(cycle.quantity, dec!(0.00998));
    // standard offset (60000 + 500) beats the maker floor
    // (60100 x 1.001 = 60160.1) and the fee floor
    assert_eq!(cycle.sell_price, dec!(60500));
    assert!(!cycle.sell_id.is_empty());
    assert!(cycle.total_fees > Decimal::ZERO);
    assert!(cycle.purchase_amount_usdc > Decimal::ZERO);
}

#[tokio::test]
async fn maker_floor_wins_when_market_above_offset_target() {
    let h = harness(dec!(61000), false).await;
    let id = seed_buy_cycle(&h, dec!(0.01), dec!(60000)).await;

    h.mock.fill_order("buy-1", dec!(0.01));
    h.mock.set_free_btc(dec!(0.01));

    h.engine.clone().run_pass(None, StrategyOverrides::default()).await;

    let cycle = h.cycles.find_by_id_int(id).await.unwrap();
    // 61000 x 1.001 = 61061 > 60500
    assert_eq!(cycle.sell_price, dec!(61061));
}

#[tokio::test]
async fn reported_fill_without_balance_defers() {
    let h = harness(dec!(60100), false).await;
    let id = seed_buy_cycle(&h, dec!(0.01), dec!(60000)).await;

    h.mock.fill_order("buy-1", dec!(0.01));
    // Balance never arrives: the fill must not be believed.

    let summary = h.engine.clone().run_pass(None, StrategyOverrides::default()).await;
    assert_eq!(summary.advanced, 0);

    let cycle = h.cycles.find_by_id_int(id).await.unwrap();
    assert_eq!(cycle.status, CycleStatus::Buy);
}

#[tokio::test]
async fn aged_unfilled_buy_is_cancelled_and_deleted() {
    let h = harness(dec!(60100), false).await;
    // buy_max_days = 2; age the cycle 3 days
    h.mock.seed_order("buy-1", OrderSide::Buy, dec!(60000), dec!(0.01));
    let mut cycle = Cycle::new(
        Exchange::Binance,
        dec!(0.01),
        dec!(60000),
        "buy-1".to_string(),
        Utc::now() - Duration::days(3),
    );
    cycle.id_int = 0;
    let id = h.cycles.save(cycle).await.unwrap();

    // Exchange-side cancel fails outright; the row must go anyway.
    h.mock.set_cancel_error("internal server error");

    let summary = h.engine.clone().run_pass(None, StrategyOverrides::default()).await;
    assert_eq!(summary.advanced, 1);
    assert!(h.cycles.find_by_id_int(id).await.is_none());
}

#[tokio::test]
async fn runaway_price_cancels_the_buy() {
    let h = harness(dec!(66100), false).await;
    let mut config = test_config(false);
    config.exchanges.binance.buy_max_price_deviation = dec!(10);
    // Rebuild the engine with the deviation cap set
    let mut clients = ClientTable::new();
    clients.insert(Exchange::Binance, h.mock.clone() as Arc<dyn ExchangeClient>);
    let engine = Arc::new(UpdateEngine::new(
        clients,
        config,
        h.cycles.clone(),
        h.accumulations.clone(),
    ));

    let id = seed_buy_cycle(&h, dec!(0.01), dec!(60000)).await;
    // 66100 > 60000 x 1.10 = 66000
    engine.clone().run_pass(None, StrategyOverrides::default()).await;
    assert!(h.cycles.find_by_id_int(id).await.is_none());
}

#[tokio::test]
async fn sell_placement_failure_keeps_cycle_with_empty_sell_id() {
    let h = harness(dec!(60100), false).await;
    let id = seed_buy_cycle(&h, dec!(0.01), dec!(60000)).await;

    h.mock.fill_order("buy-1", dec!(0.01));
    h.mock.set_free_btc(dec!(0.01));
    h.mock.set_fail_sell_orders(true);

    h.engine.clone().run_pass(None, StrategyOverrides::default()).await;

    let cycle = h.cycles.find_by_id_int(id).await.unwrap();
    assert_eq!(cycle.status, CycleStatus::Sell);
    assert!(cycle.sell_id.is_empty());

    // Next pass re-places the sell once the venue accepts again.
    h.mock.set_fail_sell_orders(false);
    h.engine.clone().run_pass(None, StrategyOverrides::default()).await;
    let cycle = h.cycles.find_by_id_int(id).await.unwrap();
    assert!(!cycle.sell_id.is_empty());
}

#[tokio::test]
async fn sell_fill_completes_the_cycle() {
    let h = harness(dec!(60100), false).await;
    let id = seed_buy_cycle(&h, dec!(0.01), dec!(60000)).await;

    h.mock.fill_order("buy-1", dec!(0.01));
    h.mock.set_free_btc(dec!(0.01));
    h.engine.clone().run_pass(None, StrategyOverrides::default()).await;

    let cycle = h.cycles.find_by_id_int(id).await.unwrap();
    let sell_id = cycle.sell_id.clone();
    h.mock.fill_order(&sell_id, dec!(0.01));

    let summary = h.engine.clone().run_pass(None, StrategyOverrides::default()).await;
    assert_eq!(summary.advanced, 1);

    let cycle = h.cycles.find_by_id_int(id).await.unwrap();
    assert_eq!(cycle.status, CycleStatus::Completed);
    assert!(cycle.completed_at.is_some());
    assert!(cycle.completed_at.unwrap() >= cycle.created_at);
    assert!(cycle.sale_amount_usdc > Decimal::ZERO);
    assert_eq!(
        cycle.exact_exchange_gain,
        cycle.sale_amount_usdc - cycle.purchase_amount_usdc
    );
    // buy estimate + sell estimate both land in total_fees
    assert!(cycle.total_fees > Decimal::ZERO);
}

#[tokio::test]
async fn real_fees_are_preferred_over_estimates() {
    let h = harness(dec!(60100), false).await;
    let id = seed_buy_cycle(&h, dec!(0.01), dec!(60000)).await;

    h.mock.set_fees(dec!(0.42));
    h.mock.fill_order("buy-1", dec!(0.01));
    h.mock.set_free_btc(dec!(0.01));
    h.engine.clone().run_pass(None, StrategyOverrides::default()).await;

    let cycle = h.cycles.find_by_id_int(id).await.unwrap();
    assert_eq!(cycle.total_fees, dec!(0.42));
}

// ---------------------------------------------------------------------------
// Accumulation
// ---------------------------------------------------------------------------

async fn seed_sell_cycle(h: &Harness, sell_price: Decimal) -> Cycle {
    let mut cycle = Cycle::new(
        Exchange::Binance,
        dec!(0.01),
        dec!(59000),
        "buy-0".to_string(),
        Utc::now(),
    );
    cycle.status = CycleStatus::Sell;
    cycle.sell_price = sell_price;
    cycle.sell_id = "sell-0".to_string();
    h.mock
        .seed_order("sell-0", OrderSide::Sell, sell_price, dec!(0.01));
    let id = h.cycles.save(cycle).await.unwrap();
    h.cycles.find_by_id_int(id).await.unwrap()
}

async fn seed_completed_profit(h: &Harness, net_gain: Decimal) {
    let mut cycle = Cycle::new(
        Exchange::Binance,
        dec!(0.01),
        dec!(50000),
        "done".to_string(),
        Utc::now(),
    );
    cycle.status = CycleStatus::Completed;
    cycle.exact_exchange_gain = net_gain;
    cycle.total_fees = Decimal::ZERO;
    h.cycles.save(cycle).await.unwrap();
}

#[tokio::test]
async fn accumulation_approval_flips_exactly_at_the_funding_boundary() {
    // holdings value = 0.01 x 60000 = 600
    for (profit, expect_approved) in [
        (dec!(599.99), false),
        (dec!(600), true),
        (dec!(600.01), true),
    ] {
        let h = harness(dec!(57000), true).await;
        seed_completed_profit(&h, profit).await;
        let cycle = seed_sell_cycle(&h, dec!(60000)).await;

        let settings = test_config(true).exchanges.binance.clone();
        let outcome = accumulate::consider(
            h.mock.as_ref() as &dyn ExchangeClient,
            &settings,
            &h.cycles,
            &h.accumulations,
            &cycle,
            dec!(57000),
        )
        .await
        .unwrap();

        if expect_approved {
            assert!(
                matches!(outcome, AccumulationOutcome::Accumulated { .. }),
                "profit {profit} should fund the accumulation"
            );
            assert!(h.cycles.find_by_id_int(cycle.id_int).await.is_none());
            let records = h.accumulations.find_all().await;
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].cycle_id_int, cycle.id_int);
            assert_eq!(records[0].deviation, dec!(5));
        } else {
            assert_eq!(outcome, AccumulationOutcome::InsufficientProfit);
            assert!(h.cycles.find_by_id_int(cycle.id_int).await.is_some());
            assert!(h.accumulations.find_all().await.is_empty());
        }
    }
}

#[tokio::test]
async fn accumulation_requires_enough_deviation() {
    let h = harness(dec!(58500), true).await;
    seed_completed_profit(&h, dec!(10000)).await;
    let cycle = seed_sell_cycle(&h, dec!(60000)).await;

    // (60000 - 58500) / 60000 = 2.5% < 3% threshold
    let settings = test_config(true).exchanges.binance.clone();
    let outcome = accumulate::consider(
        h.mock.as_ref() as &dyn ExchangeClient,
        &settings,
        &h.cycles,
        &h.accumulations,
        &cycle,
        dec!(58500),
    )
    .await
    .unwrap();
    assert_eq!(outcome, AccumulationOutcome::BelowDeviation);
}

#[tokio::test]
async fn accumulation_disabled_is_a_no_op() {
    let h = harness(dec!(50000), false).await;
    seed_completed_profit(&h, dec!(10000)).await;
    let cycle = seed_sell_cycle(&h, dec!(60000)).await;

    let settings = test_config(false).exchanges.binance.clone();
    let outcome = accumulate::consider(
        h.mock.as_ref() as &dyn ExchangeClient,
        &settings,
        &h.cycles,
        &h.accumulations,
        &cycle,
        dec!(50000),
    )
    .await
    .unwrap();
    assert_eq!(outcome, AccumulationOutcome::Disabled);
}

#[tokio::test]
async fn accumulation_recreates_missing_sell_order_before_cancelling() {
    let h = harness(dec!(57000), true).await;
    seed_completed_profit(&h, dec!(10000)).await;

    let mut cycle = seed_sell_cycle(&h, dec!(60000)).await;
    cycle.sell_id = String::new();
    h.cycles.save(cycle.clone()).await.unwrap();
    let before = h.mock.order_count();

    let settings = test_config(true).exchanges.binance.clone();
    let outcome = accumulate::consider(
        h.mock.as_ref() as &dyn ExchangeClient,
        &settings,
        &h.cycles,
        &h.accumulations,
        &cycle,
        dec!(57000),
    )
    .await
    .unwrap();
    assert!(matches!(outcome, AccumulationOutcome::Accumulated { .. }));
    // a sell was created (then cancelled/removed); the book did not grow
    assert!(h.mock.order_count() <= before);
    assert!(h.cycles.find_by_id_int(cycle.id_int).await.is_none());
}

// ---------------------------------------------------------------------------
// Safe cancel against the mock
// ---------------------------------------------------------------------------

#[tokio::test]
async fn safe_cancel_reports_disguised_success() {
    let h = harness(dec!(60000), false).await;
    h.mock.seed_order("gone", OrderSide::Buy, dec!(60000), dec!(0.01));
    h.mock.set_cancel_error("Order does not exist (code -2013)");

    let outcome = safe_cancel(h.mock.as_ref() as &dyn ExchangeClient, "gone")
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        cycler::engine::CancelOutcome::AlreadyGone { .. }
    ));
}

#[tokio::test]
async fn safe_cancel_surfaces_real_failures() {
    let h = harness(dec!(60000), false).await;
    h.mock.seed_order("stuck", OrderSide::Buy, dec!(60000), dec!(0.01));
    h.mock.set_cancel_error("internal server error");

    let err = safe_cancel(h.mock.as_ref() as &dyn ExchangeClient, "stuck")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("internal server error"));
}
