//! Reconciliation engine ("update" pass).
//!
//! One pass iterates every active cycle, advances its state against
//! the owning exchange, and writes the result back. Cycles are
//! processed sequentially, but each one runs on its own task so an
//! unexpected failure (panic included) is contained to that cycle and
//! the pass continues.

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::domain::{Cycle, CycleStatus};
use crate::error::Result;
use crate::exchange::{ClientTable, Exchange, ExchangeClient, OrderSide, BTC, USDC};
use crate::repository::{AccumulationRepository, CycleRepository};

use super::accumulate::{self, AccumulationOutcome};
use super::cancel::safe_cancel;
use super::pricing::{
    buy_deviation_exceeded, completion_timestamp, reconcile_executed_quantity, target_sell_price,
};
use super::StrategyOverrides;

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Cycles examined
    pub processed: usize,
    /// Cycles whose state advanced (filled, cancelled, accumulated)
    pub advanced: usize,
    /// Cycles skipped on error this pass (retried next tick)
    pub failed: usize,
    /// Cycles whose processing panicked
    pub panicked: usize,
}

pub struct UpdateEngine {
    clients: ClientTable,
    config: AppConfig,
    cycles: Arc<CycleRepository>,
    accumulations: Arc<AccumulationRepository>,
}

impl UpdateEngine {
    pub fn new(
        clients: ClientTable,
        config: AppConfig,
        cycles: Arc<CycleRepository>,
        accumulations: Arc<AccumulationRepository>,
    ) -> Self {
        Self {
            clients,
            config,
            cycles,
            accumulations,
        }
    }

    pub fn cycles(&self) -> &Arc<CycleRepository> {
        &self.cycles
    }

    pub fn accumulations(&self) -> &Arc<AccumulationRepository> {
        &self.accumulations
    }

    pub fn client(&self, exchange: Exchange) -> Option<Arc<dyn ExchangeClient>> {
        self.clients.get(&exchange).cloned()
    }

    /// Run one reconciliation pass over all active cycles, optionally
    /// scoped to one exchange.
    pub async fn run_pass(
        self: Arc<Self>,
        filter: Option<Exchange>,
        overrides: StrategyOverrides,
    ) -> PassSummary {
        let active: Vec<Cycle> = self
            .cycles
            .active()
            .await
            .into_iter()
            .filter(|c| filter.map(|f| c.exchange == f).unwrap_or(true))
            .filter(|c| self.clients.contains_key(&c.exchange))
            .collect();

        let mut summary = PassSummary::default();
        if active.is_empty() {
            debug!("no active cycles to reconcile");
            return summary;
        }

        self.verify_locked_balances(&active).await;

        info!(cycles = active.len(), "reconciliation pass starting");
        for cycle in active {
            summary.processed += 1;
            let id = cycle.id_int;
            let engine = Arc::clone(&self);

            // One task per cycle: a panic in one must not abort the rest.
            let handle =
                tokio::spawn(async move { engine.process_cycle(cycle, overrides).await });
            match handle.await {
                Ok(Ok(advanced)) => {
                    if advanced {
                        summary.advanced += 1;
                    }
                }
                Ok(Err(e)) => {
                    summary.failed += 1;
                    warn!(cycle = id, error = %e, "cycle skipped this pass");
                }
                Err(join_err) => {
                    summary.panicked += 1;
                    error!(cycle = id, error = %join_err, "cycle processing panicked");
                }
            }
        }

        info!(
            processed = summary.processed,
            advanced = summary.advanced,
            failed = summary.failed,
            panicked = summary.panicked,
            "reconciliation pass finished"
        );
        summary
    }

    /// Aggregate sanity check: with buy orders resting, the exchange
    /// should report at least `min_locked_ratio` of their value as
    /// locked USDC. A shortfall usually means an order quietly died.
    async fn verify_locked_balances(&self, active: &[Cycle]) {
        for exchange in Exchange::ALL {
            let Some(client) = self.clients.get(&exchange) else {
                continue;
            };
            if client.is_dry_run() {
                continue;
            }
            let expected: Decimal = active
                .iter()
                .filter(|c| c.exchange == exchange && c.status == CycleStatus::Buy)
                .map(|c| c.buy_price * c.quantity)
                .sum();
            if expected <= Decimal::ZERO {
                continue;
            }
            let settings = self.config.exchanges.get(exchange);
            match client.detailed_balances().await {
                Ok(balances) => {
                    let locked = balances.get(USDC).copied().unwrap_or_default().locked;
                    let floor = expected * settings.min_locked_ratio;
                    if locked < floor {
                        warn!(
                            %exchange,
                            %locked,
                            expected = %expected,
                            "locked USDC below open buy-order value, an order may be gone"
                        );
                    }
                }
                Err(e) => debug!(%exchange, error = %e, "locked-balance check skipped"),
            }
        }
    }

    async fn process_cycle(&self, cycle: Cycle, overrides: StrategyOverrides) -> Result<bool> {
        let Some(client) = self.clients.get(&cycle.exchange) else {
            return Ok(false);
        };
        match cycle.status {
            CycleStatus::Buy => self.process_buy_side(client.as_ref(), &cycle, overrides).await,
            CycleStatus::Sell => self.process_sell_side(client.as_ref(), &cycle, overrides).await,
            _ => Ok(false),
        }
    }

    /// Buy-state cycle: enforce the cancellation triggers, then look
    /// for a fill and move to the sell side.
    async fn process_buy_side(
        &self,
        client: &dyn ExchangeClient,
        cycle: &Cycle,
        overrides: StrategyOverrides,
    ) -> Result<bool> {
        let settings = self.config.exchanges.get(cycle.exchange);
        let now = Utc::now();

        if settings.buy_max_days > 0 && cycle.age_days(now) >= settings.buy_max_days as i64 {
            info!(
                cycle = cycle.id_int,
                age_days = cycle.age_days(now),
                "buy order too old, cancelling cycle"
            );
            self.cancel_buy_and_delete(client, cycle).await?;
            return Ok(true);
        }

        let current = client.last_price().await?;
        if buy_deviation_exceeded(cycle.buy_price, current, settings.buy_max_price_deviation) {
            info!(
                cycle = cycle.id_int,
                buy_price = %cycle.buy_price,
                %current,
                "price ran past the deviation cap, cancelling cycle"
            );
            self.cancel_buy_and_delete(client, cycle).await?;
            return Ok(true);
        }

        let order = client.order_by_id(&cycle.buy_id).await?;
        if !client.is_filled(&order).await? {
            return Ok(false);
        }

        let executed = reconcile_executed_quantity(&order, cycle.quantity);

        // A reported fill without the BTC on the account is treated as
        // not-filled-yet; one bounded wait-and-recheck for venues whose
        // balances lag their status.
        if !client.is_dry_run() && !self.free_btc_covers(client, executed).await? {
            if let Some(wait) = cycle.exchange.balance_settle_wait() {
                debug!(
                    cycle = cycle.id_int,
                    "fill reported but balance missing, waiting for settlement"
                );
                tokio::time::sleep(wait).await;
                if !self.free_btc_covers(client, executed).await? {
                    warn!(
                        cycle = cycle.id_int,
                        "balance still short after settle wait, deferring fill"
                    );
                    return Ok(false);
                }
            } else {
                warn!(
                    cycle = cycle.id_int,
                    "fill reported but free BTC does not cover it, deferring"
                );
                return Ok(false);
            }
        }

        let buy_fees = match client.order_fees(&cycle.buy_id).await {
            Ok(Some(fee)) => fee,
            Ok(None) => cycle.buy_price * executed * client.fallback_fee_rate(),
            Err(e) => {
                warn!(cycle = cycle.id_int, error = %e, "buy fee lookup failed, estimating");
                cycle.buy_price * executed * client.fallback_fee_rate()
            }
        };

        let purchase_amount = {
            let reported = order.filled_quote_value();
            if reported > Decimal::ZERO {
                reported
            } else {
                executed * cycle.buy_price
            }
        };

        let fee_floor = client
            .adjust_sell_price_for_fees(cycle.buy_price, executed, &cycle.buy_id)
            .await?;
        let sell_offset = overrides.sell_offset.unwrap_or(settings.sell_offset);
        let rules = client.symbol_rules().await?;
        let sell_price = target_sell_price(cycle.buy_price, sell_offset, current, fee_floor, &rules);

        // The cycle must not be lost when sell placement fails; an
        // empty sell_id marks it for re-placement on a later pass.
        let sell_id = match self
            .place_sell(client, settings.adaptive_order, sell_price, executed)
            .await
        {
            Ok(order) => order.id,
            Err(e) => {
                warn!(
                    cycle = cycle.id_int,
                    error = %e,
                    "sell placement failed, recording cycle without sell order"
                );
                String::new()
            }
        };

        self.cycles
            .update_by_id_int(
                cycle.id_int,
                json!({
                    "status": CycleStatus::Sell,
                    "quantity": executed,
                    "sell_price": sell_price,
                    "sell_id": sell_id,
                    "purchase_amount_usdc": purchase_amount,
                    "total_fees": buy_fees,
                }),
            )
            .await?;

        info!(
            cycle = cycle.id_int,
            exchange = %cycle.exchange,
            %executed,
            %sell_price,
            "buy filled, sell side opened"
        );
        Ok(true)
    }

    /// Sell-state cycle: consider accumulation, re-place a lost sell
    /// order, or complete the round-trip on fill.
    async fn process_sell_side(
        &self,
        client: &dyn ExchangeClient,
        cycle: &Cycle,
        _overrides: StrategyOverrides,
    ) -> Result<bool> {
        let settings = self.config.exchanges.get(cycle.exchange);
        let current = client.last_price().await?;

        match accumulate::consider(
            client,
            settings,
            &self.cycles,
            &self.accumulations,
            cycle,
            current,
        )
        .await?
        {
            AccumulationOutcome::Accumulated { .. } => return Ok(true),
            AccumulationOutcome::Disabled
            | AccumulationOutcome::BelowDeviation
            | AccumulationOutcome::InsufficientProfit => {}
        }

        if cycle.sell_id.is_empty() {
            let order = self
                .place_sell(client, settings.adaptive_order, cycle.sell_price, cycle.quantity)
                .await?;
            self.cycles
                .update_by_id_int(cycle.id_int, json!({"sell_id": order.id}))
                .await?;
            info!(cycle = cycle.id_int, sell_id = %order.id, "missing sell order re-placed");
            return Ok(true);
        }

        let order = client.order_by_id(&cycle.sell_id).await?;
        if !client.is_filled(&order).await? {
            return Ok(false);
        }

        let sell_fees = match client.order_fees(&cycle.sell_id).await {
            Ok(Some(fee)) => fee,
            Ok(None) => cycle.sell_price * cycle.quantity * client.fallback_fee_rate(),
            Err(e) => {
                warn!(cycle = cycle.id_int, error = %e, "sell fee lookup failed, estimating");
                cycle.sell_price * cycle.quantity * client.fallback_fee_rate()
            }
        };

        let sale_amount = {
            let reported = order.filled_quote_value();
            if reported > Decimal::ZERO {
                reported
            } else {
                cycle.quantity * cycle.sell_price
            }
        };

        let evidence = client.completion_time(&order);
        let (completed_at, estimated) =
            completion_timestamp(cycle.exchange, cycle.created_at, evidence);
        if estimated {
            info!(
                cycle = cycle.id_int,
                exchange = %cycle.exchange,
                %completed_at,
                "completion time is a fixed-offset estimate"
            );
        }

        let total_fees = cycle.total_fees + sell_fees;
        let exact_gain = sale_amount - cycle.purchase_amount_usdc;

        self.cycles
            .update_by_id_int(
                cycle.id_int,
                json!({
                    "status": CycleStatus::Completed,
                    "completed_at": completed_at,
                    "sale_amount_usdc": sale_amount,
                    "total_fees": total_fees,
                    "exact_exchange_gain": exact_gain,
                }),
            )
            .await?;

        info!(
            cycle = cycle.id_int,
            exchange = %cycle.exchange,
            gain = %exact_gain,
            fees = %total_fees,
            "cycle completed"
        );
        Ok(true)
    }

    /// Exchange-side cancel is best-effort: a stuck record is worse
    /// than a possibly-duplicated manual cleanup, so the row goes away
    /// regardless of the cancel outcome.
    async fn cancel_buy_and_delete(
        &self,
        client: &dyn ExchangeClient,
        cycle: &Cycle,
    ) -> Result<()> {
        if let Err(e) = safe_cancel(client, &cycle.buy_id).await {
            warn!(
                cycle = cycle.id_int,
                error = %e,
                "exchange-side cancel failed, deleting cycle anyway"
            );
        }
        self.cycles.delete_by_id_int(cycle.id_int).await?;
        Ok(())
    }

    async fn place_sell(
        &self,
        client: &dyn ExchangeClient,
        adaptive: bool,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<crate::exchange::OrderSnapshot> {
        if adaptive {
            client.create_maker_order(OrderSide::Sell, price, quantity).await
        } else {
            client.create_order(OrderSide::Sell, price, quantity).await
        }
    }

    async fn free_btc_covers(&self, client: &dyn ExchangeClient, expected: Decimal) -> Result<bool> {
        let balances = client.detailed_balances().await?;
        let free = balances.get(BTC).copied().unwrap_or_default().free;
        let factor = client.exchange().fill_balance_factor();
        Ok(free >= expected * factor)
    }
}
