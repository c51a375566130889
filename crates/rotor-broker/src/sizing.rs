//! Position sizing.

use rotor_core::{Price, Qty};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Whole shares affordable at `price` for the configured slice of the
/// account.
///
/// `floor(account_value * position_size_pct / price)`, floored at one
/// share whenever the allocation is positive. A non-positive price or
/// allocation sizes to zero.
pub fn shares_for(account_value: Decimal, position_size_pct: Decimal, price: Price) -> Qty {
    if !price.is_positive() {
        return Qty::ZERO;
    }
    let allocation = account_value * position_size_pct;
    if allocation <= Decimal::ZERO {
        return Qty::ZERO;
    }
    let shares = (allocation / price.inner()).floor().to_i64().unwrap_or(0);
    Qty::new(shares.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_standard_allocation() {
        // 100k at 95% into a 450 instrument buys 211 whole shares.
        let shares = shares_for(dec!(100_000), dec!(0.95), Price::new(dec!(450)));
        assert_eq!(shares, Qty::new(211));
    }

    #[test]
    fn test_floors_fractional_shares() {
        let shares = shares_for(dec!(1_000), dec!(1.0), Price::new(dec!(333)));
        assert_eq!(shares, Qty::new(3));
    }

    #[test]
    fn test_minimum_one_share_when_allocation_positive() {
        // Allocation smaller than one share still buys one.
        let shares = shares_for(dec!(100), dec!(0.95), Price::new(dec!(450)));
        assert_eq!(shares, Qty::new(1));
    }

    #[test]
    fn test_non_positive_price_sizes_zero() {
        assert_eq!(
            shares_for(dec!(100_000), dec!(0.95), Price::ZERO),
            Qty::ZERO
        );
        assert_eq!(
            shares_for(dec!(100_000), dec!(0.95), Price::new(dec!(-1))),
            Qty::ZERO
        );
    }

    #[test]
    fn test_zero_account_sizes_zero() {
        assert_eq!(
            shares_for(Decimal::ZERO, dec!(0.95), Price::new(dec!(450))),
            Qty::ZERO
        );
    }
}
