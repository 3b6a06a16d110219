//! Pip arithmetic and pending-order type selection.

use rust_decimal::Decimal;

use crate::broker::{Quote, SymbolSpec};
use crate::models::OrderType;

/// One pip: ten points on 3/5-digit symbols, one point otherwise.
pub fn pip_size(spec: &SymbolSpec) -> Decimal {
    if spec.digits == 3 || spec.digits == 5 {
        spec.point * Decimal::TEN
    } else {
        spec.point
    }
}

/// Absolute distance between two prices in pips, saturating at `Decimal::MAX`.
pub fn deviation_pips(spec: &SymbolSpec, reference: Decimal, current: Decimal) -> Decimal {
    let pip = pip_size(spec);
    if pip.is_zero() {
        return Decimal::ZERO;
    }
    current
        .checked_sub(reference)
        .and_then(|diff| diff.abs().checked_div(pip))
        .map_or(Decimal::MAX, |pips| pips.round_dp(1))
}

/// Pending type that waits for the market to reach `price` in `side`'s direction.
///
/// A buy below the ask is a limit, above it a stop; sells mirror that on the
/// bid. Without a quote the order is placed as a limit.
pub fn pending_type_for(side: OrderType, price: Decimal, quote: Option<&Quote>) -> OrderType {
    let buy = side.is_buy();
    let Some(quote) = quote else {
        return if buy { OrderType::BuyLimit } else { OrderType::SellLimit };
    };

    if buy {
        if price <= quote.ask {
            OrderType::BuyLimit
        } else {
            OrderType::BuyStop
        }
    } else if price >= quote.bid {
        OrderType::SellLimit
    } else {
        OrderType::SellStop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn quote(bid: Decimal, ask: Decimal) -> Quote {
        Quote { bid, ask, time: Utc::now() }
    }

    #[test]
    fn test_pip_size_by_digits() {
        assert_eq!(pip_size(&SymbolSpec::forex("EURUSD")), dec!(0.0001));
        assert_eq!(pip_size(&SymbolSpec::forex("USDJPY")), dec!(0.01));
        let four = SymbolSpec::new("EURUSD", 4, dec!(0.01), dec!(0.01), dec!(100));
        assert_eq!(pip_size(&four), dec!(0.0001));
    }

    #[test]
    fn test_deviation_in_pips() {
        let spec = SymbolSpec::forex("EURUSD");
        assert_eq!(deviation_pips(&spec, dec!(1.10000), dec!(1.10100)), dec!(10));
        assert_eq!(deviation_pips(&spec, dec!(1.10100), dec!(1.10000)), dec!(10));
        assert_eq!(deviation_pips(&spec, dec!(1.10000), dec!(1.10025)), dec!(2.5));

        let jpy = SymbolSpec::forex("USDJPY");
        assert_eq!(deviation_pips(&jpy, dec!(150.000), dec!(150.300)), dec!(30));
    }

    #[test]
    fn test_deviation_saturates_on_absurd_prices() {
        let spec = SymbolSpec::forex("EURUSD");
        assert_eq!(deviation_pips(&spec, Decimal::ZERO, Decimal::MAX), Decimal::MAX);
        assert_eq!(deviation_pips(&spec, Decimal::MIN, Decimal::MAX), Decimal::MAX);
    }

    #[test]
    fn test_pending_type_selection() {
        let q = quote(dec!(1.1000), dec!(1.1002));
        assert_eq!(pending_type_for(OrderType::Buy, dec!(1.0990), Some(&q)), OrderType::BuyLimit);
        assert_eq!(pending_type_for(OrderType::Buy, dec!(1.1010), Some(&q)), OrderType::BuyStop);
        assert_eq!(pending_type_for(OrderType::Sell, dec!(1.1010), Some(&q)), OrderType::SellLimit);
        assert_eq!(pending_type_for(OrderType::Sell, dec!(1.0990), Some(&q)), OrderType::SellStop);
        assert_eq!(pending_type_for(OrderType::Sell, dec!(1.0990), None), OrderType::SellLimit);
    }
}
