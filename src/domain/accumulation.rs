use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::Exchange;

/// Audit record of a forgone sell: the pending sell order was
/// cancelled and the BTC retained. Written exactly once when the
/// accumulation decision approves; never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Accumulation {
    /// Monotonic integer id, assigned by the repository on first save
    #[serde(default)]
    pub id_int: u64,
    pub exchange: Exchange,
    /// Origin cycle, deleted at accumulation time
    pub cycle_id_int: u64,
    /// BTC retained
    pub quantity: Decimal,
    pub original_buy_price: Decimal,
    /// The cancelled sell price
    pub target_sell_price: Decimal,
    /// Market price at cancellation
    pub cancel_price: Decimal,
    /// Percent below the target sell price at cancellation
    pub deviation: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Accumulation {
    /// USDC value this accumulation committed, counted against the
    /// exchange's realized profit when funding later accumulations.
    pub fn committed_value(&self) -> Decimal {
        self.quantity * self.target_sell_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn committed_value_is_quantity_times_target() {
        let a = Accumulation {
            id_int: 1,
            exchange: Exchange::Kraken,
            cycle_id_int: 7,
            quantity: dec!(0.02),
            original_buy_price: dec!(58000),
            target_sell_price: dec!(60000),
            cancel_price: dec!(57000),
            deviation: dec!(5),
            created_at: Utc::now(),
        };
        assert_eq!(a.committed_value(), dec!(1200));
    }
}
