//! Balanced leg sizing.
//!
//! Turns a target notional into a pair of increment-aligned quantities whose
//! notionals match as closely as the two instruments' granularity allows,
//! then bounds each leg's estimated slippage. Pure and deterministic.

use crate::config::SizingConfig;
use crate::exchange::{ExchangeClient, Instrument, OrderSide, SlippageEstimate};
use crate::utils::decimal::{increments_in, notional_imbalance, round_to_increment};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Slippage re-queries after shrinking a leg before giving up.
const MAX_SHRINK_ROUNDS: usize = 4;

/// Estimated slippage as a function of order quantity.
pub trait SlippageCurve: Send + Sync {
    fn estimate(&self, quantity: Decimal) -> SlippageEstimate;
}

impl<F> SlippageCurve for F
where
    F: Fn(Decimal) -> SlippageEstimate + Send + Sync,
{
    fn estimate(&self, quantity: Decimal) -> SlippageEstimate {
        self(quantity)
    }
}

/// Slippage proportional to quantity, calibrated from a single venue estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearImpact {
    bps_per_unit: Option<Decimal>,
}

impl LinearImpact {
    pub fn new(bps_per_unit: Decimal) -> Self {
        Self {
            bps_per_unit: Some(bps_per_unit),
        }
    }

    pub fn unknown() -> Self {
        Self { bps_per_unit: None }
    }

    /// Ask the venue once for `sample_quantity` and extrapolate linearly.
    pub async fn sample(client: &dyn ExchangeClient, side: OrderSide, sample_quantity: Decimal) -> Self {
        if sample_quantity <= Decimal::ZERO {
            return Self::unknown();
        }
        match client.estimate_slippage(side, sample_quantity).await {
            SlippageEstimate::Bps(bps) => Self::new(bps / sample_quantity),
            SlippageEstimate::Unknown => Self::unknown(),
        }
    }
}

impl SlippageCurve for LinearImpact {
    fn estimate(&self, quantity: Decimal) -> SlippageEstimate {
        match self.bps_per_unit {
            Some(rate) => SlippageEstimate::Bps(rate * quantity.abs()),
            None => SlippageEstimate::Unknown,
        }
    }
}

/// Price, granularity and slippage curve for one leg.
pub struct LegQuote<'a> {
    pub instrument: &'a Instrument,
    /// Reference price (mid or touch)
    pub price: Decimal,
    pub curve: &'a dyn SlippageCurve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingConfidence {
    Full,
    /// At least one leg had no slippage data.
    Degraded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SizingResult {
    pub quantity_a: Decimal,
    pub quantity_b: Decimal,
    pub notional_a: Decimal,
    pub notional_b: Decimal,
    /// |notional_b - notional_a| / notional_a
    pub imbalance: Decimal,
    pub confidence: SizingConfidence,
}

impl SizingResult {
    fn zero() -> Self {
        Self {
            quantity_a: Decimal::ZERO,
            quantity_b: Decimal::ZERO,
            notional_a: Decimal::ZERO,
            notional_b: Decimal::ZERO,
            imbalance: Decimal::ZERO,
            confidence: SizingConfidence::Full,
        }
    }

    pub fn is_tradeable(&self) -> bool {
        self.quantity_a > Decimal::ZERO && self.quantity_b > Decimal::ZERO
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingError {
    #[error("non-positive reference price {price} for {symbol}")]
    InvalidPrice { symbol: String, price: Decimal },
}

enum SlippageCheck {
    Within,
    Unknown,
    Shrunk(Decimal),
    Impossible,
}

/// Computes balanced, slippage-bounded leg quantities.
#[derive(Debug, Clone)]
pub struct BalancedSizer {
    config: SizingConfig,
}

impl BalancedSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    pub fn max_slippage_bps(&self) -> Decimal {
        self.config.max_slippage_bps
    }

    /// Size both legs for `target_notional` (quote currency, per leg).
    pub fn size(
        &self,
        target_notional: Decimal,
        leg_a: &LegQuote<'_>,
        leg_b: &LegQuote<'_>,
    ) -> Result<SizingResult, SizingError> {
        for leg in [leg_a, leg_b] {
            if leg.price <= Decimal::ZERO {
                return Err(SizingError::InvalidPrice {
                    symbol: leg.instrument.symbol.clone(),
                    price: leg.price,
                });
            }
        }

        if target_notional <= Decimal::ZERO {
            return Ok(SizingResult::zero());
        }

        let mut target = target_notional;
        let mut cap_a = None;
        let mut cap_b = None;
        let mut degraded = false;

        for round in 0..MAX_SHRINK_ROUNDS {
            let (quantity_a, quantity_b) = self.balance(target, leg_a, leg_b, cap_a, cap_b);
            if quantity_a.is_zero() || quantity_b.is_zero() {
                debug!(%target, "No tradeable quantity pair for target");
                return Ok(SizingResult::zero());
            }

            let check_a = self.check_slippage(leg_a, quantity_a);
            let check_b = self.check_slippage(leg_b, quantity_b);

            if matches!(check_a, SlippageCheck::Impossible) || matches!(check_b, SlippageCheck::Impossible) {
                warn!(
                    max_slippage_bps = %self.config.max_slippage_bps,
                    "A leg cannot meet the slippage bound at any size"
                );
                return Ok(SizingResult::zero());
            }

            degraded |= matches!(check_a, SlippageCheck::Unknown) || matches!(check_b, SlippageCheck::Unknown);

            let shrunk_a = match check_a {
                SlippageCheck::Shrunk(q) => Some(q),
                _ => None,
            };
            let shrunk_b = match check_b {
                SlippageCheck::Shrunk(q) => Some(q),
                _ => None,
            };

            if shrunk_a.is_none() && shrunk_b.is_none() {
                let result = self.result(quantity_a, quantity_b, leg_a, leg_b, degraded);
                info!(
                    %target_notional,
                    quantity_a = %result.quantity_a,
                    quantity_b = %result.quantity_b,
                    notional_a = %result.notional_a,
                    notional_b = %result.notional_b,
                    imbalance = %result.imbalance,
                    confidence = ?result.confidence,
                    shrink_rounds = round,
                    "Legs sized"
                );
                return Ok(result);
            }

            if let Some(q) = shrunk_a {
                cap_a = Some(q);
                target = target.min(q * leg_a.price);
            }
            if let Some(q) = shrunk_b {
                cap_b = Some(q);
                target = target.min(q * leg_b.price);
            }
            debug!(round, %target, ?cap_a, ?cap_b, "Slippage bound hit, re-sizing");
        }

        warn!(%target_notional, "Slippage bound not met after re-sizing");
        Ok(SizingResult::zero())
    }

    /// Naive rounding, then a bounded local search if the pair is out of tolerance.
    fn balance(
        &self,
        target: Decimal,
        leg_a: &LegQuote<'_>,
        leg_b: &LegQuote<'_>,
        cap_a: Option<Decimal>,
        cap_b: Option<Decimal>,
    ) -> (Decimal, Decimal) {
        let inc_a = leg_a.instrument.size_increment;
        let inc_b = leg_b.instrument.size_increment;
        let naive_a = capped(round_to_increment(target / leg_a.price, inc_a), cap_a);
        let naive_b = capped(round_to_increment(target / leg_b.price, inc_b), cap_b);

        if naive_a > Decimal::ZERO && naive_b > Decimal::ZERO {
            let imbalance = notional_imbalance(naive_a * leg_a.price, naive_b * leg_b.price);
            if imbalance <= self.config.imbalance_tolerance {
                return (naive_a, naive_b);
            }
        }

        let k = i64::from(self.config.search_ticks);
        let two_target = target * Decimal::TWO;
        // (imbalance, increments moved, distance from target, qa, qb)
        let mut best: Option<(Decimal, u64, Decimal, Decimal, Decimal)> = None;

        for da in -k..=k {
            let qa = naive_a + inc_a * Decimal::from(da);
            if qa <= Decimal::ZERO || cap_a.is_some_and(|cap| qa > cap) {
                continue;
            }
            for db in -k..=k {
                let qb = naive_b + inc_b * Decimal::from(db);
                if qb <= Decimal::ZERO || cap_b.is_some_and(|cap| qb > cap) {
                    continue;
                }
                let notional_a = qa * leg_a.price;
                let notional_b = qb * leg_b.price;
                let key = (
                    notional_imbalance(notional_a, notional_b),
                    da.unsigned_abs() + db.unsigned_abs(),
                    (notional_a + notional_b - two_target).abs(),
                );
                let better = match &best {
                    Some((imb, moved, dist, _, _)) => key < (*imb, *moved, *dist),
                    None => true,
                };
                if better {
                    best = Some((key.0, key.1, key.2, qa, qb));
                }
            }
        }

        best.map(|(_, _, _, qa, qb)| (qa, qb))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO))
    }

    /// Largest quantity up to `quantity` whose estimated slippage is within bound.
    fn check_slippage(&self, leg: &LegQuote<'_>, quantity: Decimal) -> SlippageCheck {
        let max_bps = self.config.max_slippage_bps;
        let within = |q: Decimal| match leg.curve.estimate(q) {
            SlippageEstimate::Bps(bps) => bps <= max_bps,
            SlippageEstimate::Unknown => true,
        };

        match leg.curve.estimate(quantity) {
            SlippageEstimate::Unknown => return SlippageCheck::Unknown,
            SlippageEstimate::Bps(bps) if bps <= max_bps => return SlippageCheck::Within,
            SlippageEstimate::Bps(_) => {}
        }

        let increment = leg.instrument.size_increment;
        if !within(increment) {
            return SlippageCheck::Impossible;
        }

        // lo always within bound, hi always above it
        let mut lo = 1i64;
        let mut hi = increments_in(quantity, increment);
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if within(increment * Decimal::from(mid)) {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        let shrunk = increment * Decimal::from(lo);
        debug!(
            symbol = %leg.instrument.symbol,
            from = %quantity,
            to = %shrunk,
            max_slippage_bps = %max_bps,
            "Leg shrunk to slippage bound"
        );
        SlippageCheck::Shrunk(shrunk)
    }

    fn result(
        &self,
        quantity_a: Decimal,
        quantity_b: Decimal,
        leg_a: &LegQuote<'_>,
        leg_b: &LegQuote<'_>,
        degraded: bool,
    ) -> SizingResult {
        let notional_a = quantity_a * leg_a.price;
        let notional_b = quantity_b * leg_b.price;
        SizingResult {
            quantity_a,
            quantity_b,
            notional_a,
            notional_b,
            imbalance: notional_imbalance(notional_a, notional_b),
            confidence: if degraded {
                SizingConfidence::Degraded
            } else {
                SizingConfidence::Full
            },
        }
    }
}

fn capped(quantity: Decimal, cap: Option<Decimal>) -> Decimal {
    match cap {
        Some(cap) => quantity.min(cap),
        None => quantity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::decimal::is_aligned;
    use rust_decimal_macros::dec;

    fn sizer() -> BalancedSizer {
        BalancedSizer::new(SizingConfig {
            imbalance_tolerance: dec!(0.01),
            max_slippage_bps: dec!(10),
            search_ticks: 1,
        })
    }

    fn no_slippage(_: Decimal) -> SlippageEstimate {
        SlippageEstimate::Bps(Decimal::ZERO)
    }

    #[test]
    fn test_local_search_improves_naive_pair() {
        let eth = Instrument::new("ETH", dec!(0.01), dec!(0.001));
        let sol = Instrument::new("SOL", dec!(0.01), dec!(0.1));
        let a = LegQuote { instrument: &eth, price: dec!(3000), curve: &no_slippage };
        let b = LegQuote { instrument: &sol, price: dec!(150), curve: &no_slippage };

        // naive 0.033 / 0.7 is 99 vs 105 (6.06%)
        let result = sizer().size(dec!(100), &a, &b).unwrap();
        assert_eq!(result.quantity_a, dec!(0.034));
        assert_eq!(result.quantity_b, dec!(0.7));
        assert_eq!(result.notional_a, dec!(102));
        assert_eq!(result.notional_b, dec!(105));
        assert!(result.imbalance > dec!(0.0294) && result.imbalance < dec!(0.0295));
        assert_eq!(result.confidence, SizingConfidence::Full);
    }

    #[test]
    fn test_within_tolerance_keeps_naive() {
        let eth = Instrument::new("ETH", dec!(0.01), dec!(0.001));
        let a = LegQuote { instrument: &eth, price: dec!(3000), curve: &no_slippage };
        let b = LegQuote { instrument: &eth, price: dec!(3001), curve: &no_slippage };

        let result = sizer().size(dec!(300), &a, &b).unwrap();
        assert_eq!(result.quantity_a, dec!(0.1));
        assert_eq!(result.quantity_b, dec!(0.1));
    }

    #[test]
    fn test_zero_notional() {
        let eth = Instrument::new("ETH", dec!(0.01), dec!(0.001));
        let a = LegQuote { instrument: &eth, price: dec!(3000), curve: &no_slippage };

        let result = sizer().size(Decimal::ZERO, &a, &a).unwrap();
        assert!(!result.is_tradeable());
        assert_eq!(result.imbalance, Decimal::ZERO);
    }

    #[test]
    fn test_invalid_price() {
        let eth = Instrument::new("ETH", dec!(0.01), dec!(0.001));
        let a = LegQuote { instrument: &eth, price: dec!(3000), curve: &no_slippage };
        let b = LegQuote { instrument: &eth, price: dec!(0), curve: &no_slippage };

        let err = sizer().size(dec!(100), &a, &b).unwrap_err();
        assert_eq!(
            err,
            SizingError::InvalidPrice {
                symbol: "ETH".into(),
                price: dec!(0)
            }
        );
    }

    #[test]
    fn test_quantities_always_aligned() {
        let btc = Instrument::new("BTC", dec!(0.1), dec!(0.0001));
        let doge = Instrument::new("DOGE", dec!(0.00001), dec!(1));
        let a = LegQuote { instrument: &btc, price: dec!(64321.7), curve: &no_slippage };
        let b = LegQuote { instrument: &doge, price: dec!(0.12345), curve: &no_slippage };

        for notional in [dec!(10), dec!(55.5), dec!(100), dec!(333.33), dec!(1000), dec!(12345.67)] {
            let result = sizer().size(notional, &a, &b).unwrap();
            assert!(is_aligned(result.quantity_a, btc.size_increment), "{notional}");
            assert!(is_aligned(result.quantity_b, doge.size_increment), "{notional}");
        }
    }

    #[test]
    fn test_deterministic() {
        let eth = Instrument::new("ETH", dec!(0.01), dec!(0.001));
        let sol = Instrument::new("SOL", dec!(0.01), dec!(0.1));
        let curve = LinearImpact::new(dec!(2));
        let a = LegQuote { instrument: &eth, price: dec!(2987.3), curve: &curve };
        let b = LegQuote { instrument: &sol, price: dec!(143.9), curve: &curve };

        let first = sizer().size(dec!(250), &a, &b).unwrap();
        for _ in 0..10 {
            assert_eq!(sizer().size(dec!(250), &a, &b).unwrap(), first);
        }
    }

    #[test]
    fn test_slippage_shrinks_both_legs() {
        let inst = Instrument::new("X", dec!(0.01), dec!(0.01));
        // 20 bps per unit: 1.0 -> 20 bps, largest within 10 bps is 0.5
        let steep = LinearImpact::new(dec!(20));
        let a = LegQuote { instrument: &inst, price: dec!(100), curve: &steep };
        let b = LegQuote { instrument: &inst, price: dec!(100), curve: &no_slippage };

        let result = sizer().size(dec!(100), &a, &b).unwrap();
        assert_eq!(result.quantity_a, dec!(0.5));
        assert_eq!(result.quantity_b, dec!(0.5));
    }

    #[test]
    fn test_unmeetable_slippage_gives_zero() {
        let inst = Instrument::new("X", dec!(0.01), dec!(0.01));
        let thin = |_: Decimal| SlippageEstimate::Bps(dec!(50));
        let a = LegQuote { instrument: &inst, price: dec!(100), curve: &thin };
        let b = LegQuote { instrument: &inst, price: dec!(100), curve: &no_slippage };

        let result = sizer().size(dec!(100), &a, &b).unwrap();
        assert_eq!(result, SizingResult::zero());
    }

    #[test]
    fn test_unknown_slippage_degrades_confidence() {
        let inst = Instrument::new("X", dec!(0.01), dec!(0.01));
        let unknown = LinearImpact::unknown();
        let a = LegQuote { instrument: &inst, price: dec!(100), curve: &unknown };
        let b = LegQuote { instrument: &inst, price: dec!(100), curve: &no_slippage };

        let result = sizer().size(dec!(100), &a, &b).unwrap();
        assert_eq!(result.quantity_a, dec!(1));
        assert_eq!(result.confidence, SizingConfidence::Degraded);
    }

    #[tokio::test]
    async fn test_linear_impact_sample() {
        use crate::exchange::PaperExchange;

        let venue = PaperExchange::new("paper", "X", dec!(99), dec!(101)).with_depth(dec!(10));
        let curve = LinearImpact::sample(&venue, OrderSide::Buy, dec!(5)).await;
        assert_eq!(curve.estimate(dec!(20)), SlippageEstimate::Bps(dec!(2)));

        let no_depth = PaperExchange::new("paper", "X", dec!(99), dec!(101));
        let curve = LinearImpact::sample(&no_depth, OrderSide::Buy, dec!(5)).await;
        assert_eq!(curve.estimate(dec!(20)), SlippageEstimate::Unknown);
    }
}
