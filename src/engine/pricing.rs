//! Pricing and reconciliation arithmetic used by the update engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::exchange::{Exchange, OrderSnapshot, SymbolRules};

/// Multiplier over the current price below which a sell would risk
/// executing as a taker; the sell price never goes under this floor.
pub const MAKER_SAFETY_FLOOR: Decimal = dec!(1.001);

/// Target sell price for a freshly filled buy: the greatest of the
/// configured offset over the buy price, the maker-safety floor over
/// the current market, and the fee-covering minimum.
pub fn target_sell_price(
    buy_price: Decimal,
    sell_offset: Decimal,
    current_price: Decimal,
    fee_floor: Decimal,
    rules: &SymbolRules,
) -> Decimal {
    let standard = buy_price + sell_offset;
    let maker_floor = current_price * MAKER_SAFETY_FLOOR;
    let target = standard.max(maker_floor).max(fee_floor);
    rules.round_price(target)
}

/// Reconcile the quantity a cycle actually holds after its buy filled.
/// The venue-reported executed quantity wins when present (rounding
/// drift means it rarely equals the request exactly); a venue that
/// reports nothing leaves the requested quantity in place.
pub fn reconcile_executed_quantity(order: &OrderSnapshot, requested: Decimal) -> Decimal {
    if order.executed_quantity > Decimal::ZERO {
        order.executed_quantity
    } else {
        requested
    }
}

/// Completion timestamp from the best available evidence. The vendor
/// timestamp is used when parseable and not before `created_at`;
/// otherwise the venue's fixed offset estimate applies. The flag
/// reports whether the result is an estimate.
pub fn completion_timestamp(
    exchange: Exchange,
    created_at: DateTime<Utc>,
    evidence: Option<DateTime<Utc>>,
) -> (DateTime<Utc>, bool) {
    match evidence {
        Some(ts) if ts >= created_at => (ts, false),
        _ => (created_at + exchange.estimated_completion_offset(), true),
    }
}

/// Percent the market has fallen below a target sell price.
pub fn deviation_below_percent(target: Decimal, current: Decimal) -> Decimal {
    if target <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (target - current) / target * dec!(100)
}

/// Whether an unfilled buy has overrun its allowed price deviation:
/// current price above `buy_price x (1 + deviation/100)`. A zero
/// configured deviation disables the check.
pub fn buy_deviation_exceeded(
    buy_price: Decimal,
    current_price: Decimal,
    max_deviation_percent: Decimal,
) -> bool {
    if max_deviation_percent <= Decimal::ZERO {
        return false;
    }
    current_price > buy_price * (Decimal::ONE + max_deviation_percent / dec!(100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::Value;

    use crate::exchange::OrderSide;

    fn rules() -> SymbolRules {
        SymbolRules {
            quantity_step: dec!(0.00001),
            price_step: dec!(0.01),
            min_quantity: dec!(0.0001),
            max_quantity: Decimal::ZERO,
            min_notional: dec!(5),
        }
    }

    #[test]
    fn standard_offset_wins_when_highest() {
        // buy 60000, offset 500, market 60100: maker floor is
        // 60100 x 1.001 = 60160.1, standard 60500 wins
        let price = target_sell_price(dec!(60000), dec!(500), dec!(60100), Decimal::ZERO, &rules());
        assert_eq!(price, dec!(60500));
    }

    #[test]
    fn maker_floor_wins_when_market_ran_away() {
        let price = target_sell_price(dec!(60000), dec!(100), dec!(61000), Decimal::ZERO, &rules());
        assert_eq!(price, dec!(61061));
    }

    #[test]
    fn fee_floor_wins_when_fees_dominate() {
        let price = target_sell_price(dec!(60000), dec!(10), dec!(60000), dec!(60900), &rules());
        assert_eq!(price, dec!(60900));
    }

    #[test]
    fn reconcile_prefers_reported_quantity() {
        let order = OrderSnapshot {
            id: "1".into(),
            side: OrderSide::Buy,
            price: dec!(60000),
            orig_quantity: dec!(0.01),
            executed_quantity: dec!(0.00998),
            cumulative_quote: Decimal::ZERO,
            status: "FILLED".into(),
            created_at: None,
            completed_at: None,
            raw: Value::Null,
        };
        assert_eq!(reconcile_executed_quantity(&order, dec!(0.01)), dec!(0.00998));
    }

    #[test]
    fn reconcile_keeps_requested_when_venue_silent() {
        let order = OrderSnapshot {
            id: "1".into(),
            side: OrderSide::Buy,
            price: dec!(60000),
            orig_quantity: dec!(0.01),
            executed_quantity: Decimal::ZERO,
            cumulative_quote: Decimal::ZERO,
            status: "FILLED".into(),
            created_at: None,
            completed_at: None,
            raw: Value::Null,
        };
        assert_eq!(reconcile_executed_quantity(&order, dec!(0.01)), dec!(0.01));
    }

    #[test]
    fn completion_uses_vendor_evidence_when_sane() {
        let created = Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap();
        let reported = created + Duration::hours(1);
        let (ts, estimated) = completion_timestamp(Exchange::Binance, created, Some(reported));
        assert_eq!(ts, reported);
        assert!(!estimated);
    }

    #[test]
    fn completion_never_precedes_creation() {
        let created = Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap();
        let bogus = created - Duration::hours(3);
        let (ts, estimated) = completion_timestamp(Exchange::Kraken, created, Some(bogus));
        assert_eq!(ts, created + Duration::hours(6));
        assert!(estimated);
    }

    #[test]
    fn completion_falls_back_to_venue_offset() {
        let created = Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap();
        let (ts, estimated) = completion_timestamp(Exchange::Mexc, created, None);
        assert_eq!(ts, created + Duration::hours(4));
        assert!(estimated);
    }

    #[test]
    fn deviation_below_is_percent_of_target() {
        assert_eq!(deviation_below_percent(dec!(60000), dec!(57000)), dec!(5));
        assert_eq!(deviation_below_percent(Decimal::ZERO, dec!(57000)), Decimal::ZERO);
    }

    #[test]
    fn buy_deviation_check_disabled_at_zero() {
        assert!(!buy_deviation_exceeded(dec!(60000), dec!(90000), Decimal::ZERO));
        assert!(buy_deviation_exceeded(dec!(60000), dec!(63001), dec!(5)));
        assert!(!buy_deviation_exceeded(dec!(60000), dec!(63000), dec!(5)));
    }
}
