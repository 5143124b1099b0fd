//! Accumulation decision engine.
//!
//! A pending sell whose market has fallen far enough below target can
//! be abandoned: the sell order is cancelled, the BTC retained, and an
//! immutable audit record written. Accumulation is strictly
//! self-funding: it is approved only when the exchange's realized
//! profit, minus what earlier accumulations already committed, covers
//! the USDC value of the holdings being retained. Principal is never
//! spent.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::config::ExchangeSettings;
use crate::domain::{Accumulation, Cycle};
use crate::error::Result;
use crate::exchange::{ExchangeClient, OrderSide};
use crate::repository::{AccumulationRepository, CycleRepository};

use super::cancel::safe_cancel;
use super::pricing::deviation_below_percent;

/// Why (or that) a sell-state cycle was or was not accumulated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccumulationOutcome {
    /// Feature disabled for this exchange
    Disabled,
    /// Market has not fallen far enough below the target sell
    BelowDeviation,
    /// Realized profit cannot fund the holdings; principal stays safe
    InsufficientProfit,
    /// Sell cancelled, accumulation recorded, cycle row removed
    Accumulated { accumulation_id: u64 },
}

/// Realized net profit on `exchange` still available for funding:
/// completed cycles' net gains minus the value committed by earlier
/// accumulations.
pub async fn available_profit(
    cycles: &CycleRepository,
    accumulations: &AccumulationRepository,
    exchange: crate::exchange::Exchange,
) -> Decimal {
    let realized: Decimal = cycles
        .completed_for(exchange)
        .await
        .iter()
        .map(Cycle::net_gain)
        .sum();
    let committed: Decimal = accumulations
        .for_exchange(exchange)
        .await
        .iter()
        .map(Accumulation::committed_value)
        .sum();
    realized - committed
}

/// Decide whether to accumulate `cycle` and, when approved, execute
/// the cancel + record + delete sequence.
pub async fn consider(
    client: &dyn ExchangeClient,
    settings: &ExchangeSettings,
    cycles: &CycleRepository,
    accumulations: &AccumulationRepository,
    cycle: &Cycle,
    current_price: Decimal,
) -> Result<AccumulationOutcome> {
    if !settings.accumulation {
        return Ok(AccumulationOutcome::Disabled);
    }
    if cycle.sell_price <= Decimal::ZERO {
        return Ok(AccumulationOutcome::BelowDeviation);
    }

    let deviation = deviation_below_percent(cycle.sell_price, current_price);
    if deviation < settings.sell_accu_price_deviation {
        return Ok(AccumulationOutcome::BelowDeviation);
    }

    let holdings_value = cycle.quantity * cycle.sell_price;
    let available = available_profit(cycles, accumulations, cycle.exchange).await;
    if available < holdings_value {
        info!(
            cycle = cycle.id_int,
            exchange = %cycle.exchange,
            %available,
            required = %holdings_value,
            "accumulation declined, not self-funding"
        );
        return Ok(AccumulationOutcome::InsufficientProfit);
    }

    // A sell placement may have failed earlier, leaving no order to
    // cancel; put one on the book first so the cancel path is uniform.
    let sell_id = if cycle.sell_id.is_empty() {
        warn!(
            cycle = cycle.id_int,
            "sell order missing before accumulation, creating one to cancel"
        );
        let order = client
            .create_order(OrderSide::Sell, cycle.sell_price, cycle.quantity)
            .await?;
        order.id
    } else {
        cycle.sell_id.clone()
    };

    safe_cancel(client, &sell_id).await?;

    let record = Accumulation {
        id_int: 0,
        exchange: cycle.exchange,
        cycle_id_int: cycle.id_int,
        quantity: cycle.quantity,
        original_buy_price: cycle.buy_price,
        target_sell_price: cycle.sell_price,
        cancel_price: current_price,
        deviation,
        created_at: Utc::now(),
    };

    // Exchange state of record wins: the sell is already cancelled, so
    // the cycle row goes away even if the audit insert fails. The gap
    // is logged, not repaired.
    let accumulation_id = match accumulations.save(record).await {
        Ok(id) => id,
        Err(e) => {
            error!(
                cycle = cycle.id_int,
                exchange = %cycle.exchange,
                error = %e,
                "accumulation record write failed after exchange cancel; audit trail has a gap"
            );
            0
        }
    };

    cycles.delete_by_id_int(cycle.id_int).await?;
    info!(
        cycle = cycle.id_int,
        accumulation = accumulation_id,
        %deviation,
        "cycle accumulated, BTC retained"
    );

    Ok(AccumulationOutcome::Accumulated { accumulation_id })
}
