//! New-cycle creation: place a buy order below market and record the
//! round-trip with `status = buy`.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::info;

use crate::config::ExchangeSettings;
use crate::domain::Cycle;
use crate::error::{CyclerError, Result};
use crate::exchange::{ExchangeClient, OrderSide, USDC};
use crate::repository::CycleRepository;

use super::StrategyOverrides;

/// Create one cycle on the client's exchange. Returns the saved
/// cycle's id.
pub async fn create_cycle(
    client: &dyn ExchangeClient,
    settings: &ExchangeSettings,
    overrides: &StrategyOverrides,
    cycles: &CycleRepository,
) -> Result<u64> {
    let buy_offset = overrides.buy_offset.unwrap_or(settings.buy_offset);
    let percent = overrides.percent.unwrap_or(settings.percent);

    let current = client.last_price().await?;
    let rules = client.symbol_rules().await?;
    let buy_price = rules.round_price(current - buy_offset);
    if buy_price <= Decimal::ZERO {
        return Err(CyclerError::Validation(format!(
            "buy offset {buy_offset} leaves a non-positive price at market {current}"
        )));
    }

    let balances = client.detailed_balances().await?;
    let free_usdc = balances.get(USDC).copied().unwrap_or_default().free;
    let budget = free_usdc * percent / dec!(100);
    let quantity = rules.round_quantity(budget / buy_price);

    // Preflight so an undersized budget fails with a clear error
    // instead of a venue rejection.
    rules.validate_order(OrderSide::Buy, buy_price, quantity)?;

    let order = if settings.adaptive_order {
        client
            .create_maker_order(OrderSide::Buy, buy_price, quantity)
            .await?
    } else {
        client.create_order(OrderSide::Buy, buy_price, quantity).await?
    };

    // Record what was actually placed (the maker path adjusts price,
    // the clamp path may trim quantity).
    let cycle = Cycle::new(
        client.exchange(),
        order.orig_quantity,
        order.price,
        order.id.clone(),
        order.created_at.unwrap_or_else(Utc::now),
    );
    let id = cycles.save(cycle).await?;

    info!(
        exchange = %client.exchange(),
        cycle = id,
        buy_id = %order.id,
        price = %order.price,
        quantity = %order.orig_quantity,
        "cycle created"
    );
    Ok(id)
}
