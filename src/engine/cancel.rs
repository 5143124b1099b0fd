//! Idempotent order cancellation.
//!
//! Two layers of tolerance around `ExchangeClient::cancel_order`:
//!
//! 1. Success disguised as error: venues routinely answer a cancel for
//!    an already-filled or already-cancelled order with "not found" /
//!    "unknown order" style failures. The phrase table below maps
//!    those onto success.
//! 2. Id-variant retry: venues with ambiguous id formats get each
//!    variant from `cancel_id_variants` in turn, stopping at the first
//!    success; only when every variant fails is the failure reported.

use tracing::{debug, info, warn};

use crate::domain::{Cycle, CycleStatus};
use crate::error::{CyclerError, Result};
use crate::exchange::ExchangeClient;
use crate::repository::CycleRepository;

/// Phrases meaning "the order is already gone" across all four
/// venues' cancel/query error texts. Matched case-insensitively.
const DISGUISED_SUCCESS_PHRASES: &[&str] = &[
    "cancelled",
    "canceled",
    "already closed",
    "does not exist",
    "not exist",
    "not found",
    "unknown order",
    "order completed",
    "already filled",
];

/// Whether a cancel error actually means the order is already gone.
pub fn is_disguised_success(message: &str) -> bool {
    let lower = message.to_lowercase();
    DISGUISED_SUCCESS_PHRASES
        .iter()
        .any(|phrase| lower.contains(phrase))
}

/// How a safe cancel concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The venue acknowledged the cancel
    Cancelled { variant: String },
    /// The venue reported the order already gone (filled or cancelled)
    AlreadyGone { variant: String },
}

impl CancelOutcome {
    pub fn variant(&self) -> &str {
        match self {
            CancelOutcome::Cancelled { variant } | CancelOutcome::AlreadyGone { variant } => {
                variant
            }
        }
    }
}

/// Cancel `order_id`, treating already-gone answers as success and
/// walking the venue's id variants before giving up.
pub async fn safe_cancel(client: &dyn ExchangeClient, order_id: &str) -> Result<CancelOutcome> {
    if order_id.trim().is_empty() {
        return Err(CyclerError::OrderCancel(
            "refusing to cancel an empty order id".to_string(),
        ));
    }

    let variants = client.cancel_id_variants(order_id);
    let mut last_error: Option<CyclerError> = None;

    for variant in &variants {
        match client.cancel_order(variant).await {
            Ok(_) => {
                debug!(exchange = %client.exchange(), order_id = %variant, "order cancelled");
                return Ok(CancelOutcome::Cancelled {
                    variant: variant.clone(),
                });
            }
            Err(e) => {
                let message = e.to_string();
                if is_disguised_success(&message) {
                    debug!(
                        exchange = %client.exchange(),
                        order_id = %variant,
                        "cancel reported order already gone, treating as success"
                    );
                    return Ok(CancelOutcome::AlreadyGone {
                        variant: variant.clone(),
                    });
                }
                debug!(
                    exchange = %client.exchange(),
                    order_id = %variant,
                    error = %message,
                    "cancel attempt failed, trying next id variant"
                );
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        CyclerError::OrderCancel(format!("no cancellable id variants for '{order_id}'"))
    }))
}

/// Manual cancellation of a cycle: best-effort exchange-side cancel,
/// then remove the local row. With `force`, the row is removed even
/// when the exchange-side cancel failed outright (a dangling local
/// record with a live exchange order is worse than a flagged mismatch
/// needing manual venue-side cleanup).
pub async fn cancel_cycle(
    client: &dyn ExchangeClient,
    cycles: &CycleRepository,
    cycle: &Cycle,
    force: bool,
) -> Result<()> {
    let order_id = match cycle.status {
        CycleStatus::Buy => cycle.buy_id.as_str(),
        CycleStatus::Sell => cycle.sell_id.as_str(),
        _ => {
            return Err(CyclerError::Validation(format!(
                "cycle {} is already {}",
                cycle.id_int, cycle.status
            )))
        }
    };

    if order_id.is_empty() {
        info!(cycle = cycle.id_int, "no open order on cycle, deleting row");
    } else {
        match safe_cancel(client, order_id).await {
            Ok(outcome) => {
                info!(
                    cycle = cycle.id_int,
                    order_id = outcome.variant(),
                    "exchange order cancelled"
                );
            }
            Err(e) if force => {
                warn!(
                    cycle = cycle.id_int,
                    error = %e,
                    "exchange cancel failed; forcing local delete, venue-side order may linger"
                );
            }
            Err(e) => return Err(e),
        }
    }

    cycles.delete_by_id_int(cycle.id_int).await?;
    Ok(())
}
