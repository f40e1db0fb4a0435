//! Decimal arithmetic utilities for quantity and notional calculations.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Round to the nearest multiple of `increment`, halves away from zero
/// (not the banker's rounding `Decimal::round` applies).
pub fn round_to_increment(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    (value / increment).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        * increment
}

/// Round down (toward zero) to a multiple of `increment`.
pub fn round_down_to_increment(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    (value / increment).trunc() * increment
}

/// Whether `value` is an exact multiple of `increment`.
pub fn is_aligned(value: Decimal, increment: Decimal) -> bool {
    if increment <= Decimal::ZERO {
        return true;
    }
    (value / increment).fract().is_zero()
}

/// Number of whole increments contained in `value` (truncated).
pub fn increments_in(value: Decimal, increment: Decimal) -> i64 {
    if increment <= Decimal::ZERO {
        return 0;
    }
    (value / increment).trunc().to_i64().unwrap_or(i64::MAX)
}

/// Calculate basis points (1 bp = 0.01%)
pub fn to_basis_points(rate: Decimal) -> Decimal {
    rate * dec!(10000)
}

/// Convert basis points to decimal rate
pub fn from_basis_points(bps: Decimal) -> Decimal {
    bps / dec!(10000)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Relative notional imbalance `|b - a| / a`, zero when `a` is zero.
pub fn notional_imbalance(notional_a: Decimal, notional_b: Decimal) -> Decimal {
    safe_div((notional_b - notional_a).abs(), notional_a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_increment_half_away_from_zero() {
        assert_eq!(round_to_increment(dec!(0.0335), dec!(0.001)), dec!(0.034));
        assert_eq!(round_to_increment(dec!(0.0345), dec!(0.001)), dec!(0.035));
        assert_eq!(round_to_increment(dec!(-0.0345), dec!(0.001)), dec!(-0.035));
        assert_eq!(round_to_increment(dec!(0.66666), dec!(0.1)), dec!(0.7));
    }

    #[test]
    fn test_round_down_to_increment() {
        assert_eq!(round_down_to_increment(dec!(1.567), dec!(0.001)), dec!(1.567));
        assert_eq!(round_down_to_increment(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(round_down_to_increment(dec!(1.567), dec!(0.1)), dec!(1.5));
    }

    #[test]
    fn test_alignment_and_counts() {
        assert!(is_aligned(dec!(0.034), dec!(0.001)));
        assert!(!is_aligned(dec!(0.0345), dec!(0.001)));
        assert_eq!(increments_in(dec!(0.7), dec!(0.1)), 7);
        assert_eq!(increments_in(dec!(0.75), dec!(0.1)), 7);
    }

    #[test]
    fn test_basis_points() {
        assert_eq!(to_basis_points(dec!(0.0001)), dec!(1)); // 0.01% = 1 bp
        assert_eq!(from_basis_points(dec!(50)), dec!(0.005)); // 50 bp = 0.5%
    }

    #[test]
    fn test_notional_imbalance() {
        assert_eq!(notional_imbalance(dec!(100), dec!(103)), dec!(0.03));
        assert_eq!(notional_imbalance(Decimal::ZERO, dec!(5)), Decimal::ZERO);
    }
}
