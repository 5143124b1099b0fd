use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{CyclerError, Result};

use super::OrderSide;

/// Per-venue trading rules for the BTC/USDC pair: quantity and price
/// increments plus order-size bounds. Discovered once per client from
/// the venue's symbol/pair metadata endpoint and cached; never assumed
/// uniform across exchanges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRules {
    /// Lot size step (BTC)
    pub quantity_step: Decimal,
    /// Price increment (USDC)
    pub price_step: Decimal,
    pub min_quantity: Decimal,
    pub max_quantity: Decimal,
    /// Minimum order value (price x quantity, USDC)
    pub min_notional: Decimal,
}

impl SymbolRules {
    /// Round a quantity down to the venue's lot step. Rounding down
    /// keeps the order within available balance.
    pub fn round_quantity(&self, quantity: Decimal) -> Decimal {
        round_down_to_step(quantity, self.quantity_step)
    }

    /// Round a price down to the venue's price increment.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        round_down_to_step(price, self.price_step)
    }

    /// Reject an order that the venue would refuse, before sending it.
    pub fn validate_order(&self, side: OrderSide, price: Decimal, quantity: Decimal) -> Result<()> {
        if quantity < self.min_quantity {
            return Err(CyclerError::SymbolRules(format!(
                "{side} quantity {quantity} below minimum {}",
                self.min_quantity
            )));
        }
        if self.max_quantity > Decimal::ZERO && quantity > self.max_quantity {
            return Err(CyclerError::SymbolRules(format!(
                "{side} quantity {quantity} above maximum {}",
                self.max_quantity
            )));
        }
        let notional = price * quantity;
        if notional < self.min_notional {
            return Err(CyclerError::SymbolRules(format!(
                "{side} notional {notional} below minimum {}",
                self.min_notional
            )));
        }
        Ok(())
    }
}

fn round_down_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rules() -> SymbolRules {
        SymbolRules {
            quantity_step: dec!(0.00001),
            price_step: dec!(0.01),
            min_quantity: dec!(0.0001),
            max_quantity: dec!(100),
            min_notional: dec!(10),
        }
    }

    #[test]
    fn quantity_rounds_down_to_lot_step() {
        let r = rules();
        assert_eq!(r.round_quantity(dec!(0.0123456)), dec!(0.01234));
        assert_eq!(r.round_quantity(dec!(0.01)), dec!(0.01));
    }

    #[test]
    fn price_rounds_down_to_increment() {
        let r = rules();
        assert_eq!(r.round_price(dec!(60123.456)), dec!(60123.45));
    }

    #[test]
    fn validate_rejects_below_min_quantity() {
        let err = rules()
            .validate_order(OrderSide::Buy, dec!(60000), dec!(0.00005))
            .unwrap_err();
        assert!(err.to_string().contains("below minimum"));
    }

    #[test]
    fn validate_rejects_below_min_notional() {
        let err = rules()
            .validate_order(OrderSide::Sell, dec!(50), dec!(0.001))
            .unwrap_err();
        assert!(err.to_string().contains("notional"));
    }

    #[test]
    fn validate_rejects_above_max_quantity() {
        let err = rules()
            .validate_order(OrderSide::Buy, dec!(60000), dec!(150))
            .unwrap_err();
        assert!(err.to_string().contains("above maximum"));
    }

    #[test]
    fn validate_accepts_legal_order() {
        assert!(rules()
            .validate_order(OrderSide::Buy, dec!(60000), dec!(0.001))
            .is_ok());
    }

    #[test]
    fn zero_step_leaves_value_unchanged() {
        let mut r = rules();
        r.quantity_step = Decimal::ZERO;
        assert_eq!(r.round_quantity(dec!(0.0123456789)), dec!(0.0123456789));
    }
}
