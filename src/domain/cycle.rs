use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{CyclerError, Result};
use crate::exchange::Exchange;

/// Cycle status
///
/// Transitions only move forward: buy -> sell -> completed, or
/// {buy, sell} -> cancelled. Completed and cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    /// Buy order placed, waiting for fill
    Buy,
    /// Buy filled, sell order placed (or pending re-placement)
    Sell,
    /// Sell filled, round-trip finished
    Completed,
    /// Ended without completing the round-trip
    Cancelled,
}

impl CycleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleStatus::Completed | CycleStatus::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, CycleStatus::Buy | CycleStatus::Sell)
    }

    /// Forward-only transition check.
    pub fn can_transition_to(&self, next: CycleStatus) -> bool {
        matches!(
            (self, next),
            (CycleStatus::Buy, CycleStatus::Sell)
                | (CycleStatus::Buy, CycleStatus::Cancelled)
                | (CycleStatus::Sell, CycleStatus::Completed)
                | (CycleStatus::Sell, CycleStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleStatus::Buy => write!(f, "buy"),
            CycleStatus::Sell => write!(f, "sell"),
            CycleStatus::Completed => write!(f, "completed"),
            CycleStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One buy-then-sell trading round-trip.
///
/// Created by the new-cycle flow with `status = buy`; mutated only by
/// the reconciliation engine and the manual cancel flow. Order ids are
/// opaque exchange-specific strings and must never be assumed to share
/// a format across exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cycle {
    /// Monotonic integer id, assigned by the repository on first save
    #[serde(default)]
    pub id_int: u64,
    pub exchange: Exchange,
    pub status: CycleStatus,
    /// BTC quantity; reconciled to the executed quantity once the buy
    /// fills
    pub quantity: Decimal,
    /// USDC per BTC
    pub buy_price: Decimal,
    /// USDC per BTC; zero until the buy fills
    #[serde(default)]
    pub sell_price: Decimal,
    pub buy_id: String,
    /// Empty while `status == buy`, and also when sell placement
    /// failed and is pending re-creation
    #[serde(default)]
    pub sell_id: String,
    /// Time of buy-order placement
    pub created_at: DateTime<Utc>,
    /// Time the sell was observed filled; never before `created_at`
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub purchase_amount_usdc: Decimal,
    #[serde(default)]
    pub sale_amount_usdc: Decimal,
    #[serde(default)]
    pub total_fees: Decimal,
    /// sale_amount_usdc - purchase_amount_usdc
    #[serde(default)]
    pub exact_exchange_gain: Decimal,
}

impl Cycle {
    pub fn new(
        exchange: Exchange,
        quantity: Decimal,
        buy_price: Decimal,
        buy_id: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id_int: 0,
            exchange,
            status: CycleStatus::Buy,
            quantity,
            buy_price,
            sell_price: Decimal::ZERO,
            buy_id,
            sell_id: String::new(),
            created_at,
            completed_at: None,
            purchase_amount_usdc: Decimal::ZERO,
            sale_amount_usdc: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            exact_exchange_gain: Decimal::ZERO,
        }
    }

    /// Whole days since the buy order was placed.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }

    /// Realized gain net of all fees; meaningful for completed cycles.
    pub fn net_gain(&self) -> Decimal {
        self.exact_exchange_gain - self.total_fees
    }

    /// Move to `next`, enforcing the forward-only machine.
    pub fn transition(&mut self, next: CycleStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CyclerError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cycle() -> Cycle {
        Cycle::new(
            Exchange::Binance,
            dec!(0.01),
            dec!(60000),
            "12345".to_string(),
            Utc::now(),
        )
    }

    #[test]
    fn status_only_moves_forward() {
        let forward = [
            (CycleStatus::Buy, CycleStatus::Sell),
            (CycleStatus::Buy, CycleStatus::Cancelled),
            (CycleStatus::Sell, CycleStatus::Completed),
            (CycleStatus::Sell, CycleStatus::Cancelled),
        ];
        for (from, to) in forward {
            assert!(from.can_transition_to(to), "{from} -> {to} must be legal");
        }

        let backward = [
            (CycleStatus::Sell, CycleStatus::Buy),
            (CycleStatus::Completed, CycleStatus::Sell),
            (CycleStatus::Completed, CycleStatus::Buy),
            (CycleStatus::Cancelled, CycleStatus::Buy),
            (CycleStatus::Cancelled, CycleStatus::Sell),
            (CycleStatus::Completed, CycleStatus::Cancelled),
            (CycleStatus::Cancelled, CycleStatus::Completed),
            (CycleStatus::Buy, CycleStatus::Completed),
        ];
        for (from, to) in backward {
            assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
        }
    }

    #[test]
    fn transition_rejects_backward_move() {
        let mut c = cycle();
        c.transition(CycleStatus::Sell).unwrap();
        let err = c.transition(CycleStatus::Buy).unwrap_err();
        assert!(matches!(
            err,
            CyclerError::InvalidStateTransition { .. }
        ));
        assert_eq!(c.status, CycleStatus::Sell);
    }

    #[test]
    fn terminal_states() {
        assert!(CycleStatus::Completed.is_terminal());
        assert!(CycleStatus::Cancelled.is_terminal());
        assert!(CycleStatus::Buy.is_active());
        assert!(CycleStatus::Sell.is_active());
    }

    #[test]
    fn net_gain_subtracts_fees() {
        let mut c = cycle();
        c.exact_exchange_gain = dec!(50);
        c.total_fees = dec!(1.2);
        assert_eq!(c.net_gain(), dec!(48.8));
    }

    #[test]
    fn serde_round_trip_uses_lowercase_status() {
        let c = cycle();
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"status\":\"buy\""));
        let back: Cycle = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, CycleStatus::Buy);
        assert_eq!(back.quantity, c.quantity);
    }
}
