//! Pre-trade safety gate.
//!
//! Every BUILD passes through `RiskGuard::pre_trade_check` with its sized
//! quantities before any order is placed. Checks run in a fixed order:
//! 1. Projected position per instrument
//! 2. UTC-midnight daily PnL reset
//! 3. Daily loss limit
//! 4. Pre-trade net delta
//! 5. Consecutive failed cycles

use crate::config::RiskConfig;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Static limits, loaded once from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskLimits {
    pub max_position_per_instrument: Decimal,
    /// Positive amount; trading stops once daily PnL falls below its negation.
    pub max_daily_loss: Decimal,
    pub net_delta_tolerance: Decimal,
    pub max_consecutive_failures: u32,
}

impl From<&RiskConfig> for RiskLimits {
    fn from(config: &RiskConfig) -> Self {
        Self {
            max_position_per_instrument: config.max_position_per_instrument,
            max_daily_loss: config.max_daily_loss.abs(),
            net_delta_tolerance: config.net_delta_tolerance,
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }
}

/// Mutable safety counters. Survives across cycles and, via the journal,
/// across restarts on the same UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyState {
    pub daily_pnl: Decimal,
    /// UTC date the daily accumulator belongs to
    pub reset_date: NaiveDate,
    pub consecutive_failures: u32,
    pub total_pnl: Decimal,
}

impl SafetyState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            daily_pnl: Decimal::ZERO,
            reset_date: today,
            consecutive_failures: 0,
            total_pnl: Decimal::ZERO,
        }
    }
}

/// Current and proposed exposure on one leg.
#[derive(Debug, Clone, PartialEq)]
pub struct LegExposure {
    pub symbol: String,
    /// Signed authoritative position
    pub current: Decimal,
    /// Unsigned quantity about to be traded
    pub proposed: Decimal,
}

impl LegExposure {
    pub fn projected(&self) -> Decimal {
        self.current.abs() + self.proposed.abs()
    }
}

/// A sized BUILD awaiting approval.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedTrade {
    pub leg_a: LegExposure,
    pub leg_b: LegExposure,
}

impl ProposedTrade {
    pub fn net_delta(&self) -> Decimal {
        self.leg_a.current + self.leg_b.current
    }

    /// Larger of the two proposed leg quantities.
    pub fn proposed_size(&self) -> Decimal {
        self.leg_a.proposed.abs().max(self.leg_b.proposed.abs())
    }
}

/// Reason a trade was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskRejection {
    #[error("projected position {projected} on {symbol} exceeds limit {limit}")]
    PositionLimit {
        symbol: String,
        projected: Decimal,
        limit: Decimal,
    },

    #[error("daily PnL {daily_pnl} breaches loss limit -{limit}")]
    DailyLossLimit { daily_pnl: Decimal, limit: Decimal },

    #[error("net delta {net_delta} outside tolerance {allowed}")]
    NetDeltaOutOfTolerance { net_delta: Decimal, allowed: Decimal },

    #[error("{count} consecutive failed cycles (limit {limit})")]
    ConsecutiveFailures { count: u32, limit: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Allow,
    Reject(RiskRejection),
}

impl RiskDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RiskDecision::Allow)
    }

    pub fn into_result(self) -> Result<(), RiskRejection> {
        match self {
            RiskDecision::Allow => Ok(()),
            RiskDecision::Reject(reason) => Err(reason),
        }
    }
}

/// Owns the limits and the safety counters.
pub struct RiskGuard {
    limits: RiskLimits,
    state: SafetyState,
}

impl RiskGuard {
    pub fn new(limits: RiskLimits, today: NaiveDate) -> Self {
        Self::restore(limits, SafetyState::new(today))
    }

    /// Resume from a persisted safety state.
    pub fn restore(limits: RiskLimits, state: SafetyState) -> Self {
        info!(
            max_position = %limits.max_position_per_instrument,
            max_daily_loss = %limits.max_daily_loss,
            net_delta_tolerance = %limits.net_delta_tolerance,
            max_consecutive_failures = limits.max_consecutive_failures,
            daily_pnl = %state.daily_pnl,
            reset_date = %state.reset_date,
            consecutive_failures = state.consecutive_failures,
            "RiskGuard initialized"
        );
        Self { limits, state }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn safety_state(&self) -> &SafetyState {
        &self.state
    }

    /// Evaluate a proposed BUILD. A rejection changes nothing beyond the daily reset.
    pub fn pre_trade_check(&mut self, proposal: &ProposedTrade, now: DateTime<Utc>) -> RiskDecision {
        let decision = self.evaluate(proposal, now);

        match &decision {
            RiskDecision::Allow => info!(
                projected_a = %proposal.leg_a.projected(),
                projected_b = %proposal.leg_b.projected(),
                max_position = %self.limits.max_position_per_instrument,
                daily_pnl = %self.state.daily_pnl,
                max_daily_loss = %self.limits.max_daily_loss,
                net_delta = %proposal.net_delta(),
                consecutive_failures = self.state.consecutive_failures,
                "Pre-trade check passed"
            ),
            RiskDecision::Reject(reason) => warn!(
                %reason,
                position_a = %proposal.leg_a.current,
                position_b = %proposal.leg_b.current,
                proposed_a = %proposal.leg_a.proposed,
                proposed_b = %proposal.leg_b.proposed,
                daily_pnl = %self.state.daily_pnl,
                consecutive_failures = self.state.consecutive_failures,
                "Pre-trade check rejected"
            ),
        }

        decision
    }

    fn evaluate(&mut self, proposal: &ProposedTrade, now: DateTime<Utc>) -> RiskDecision {
        for leg in [&proposal.leg_a, &proposal.leg_b] {
            let projected = leg.projected();
            if projected > self.limits.max_position_per_instrument {
                return RiskDecision::Reject(RiskRejection::PositionLimit {
                    symbol: leg.symbol.clone(),
                    projected,
                    limit: self.limits.max_position_per_instrument,
                });
            }
        }

        self.roll_day(now);

        if self.state.daily_pnl < -self.limits.max_daily_loss {
            return RiskDecision::Reject(RiskRejection::DailyLossLimit {
                daily_pnl: self.state.daily_pnl,
                limit: self.limits.max_daily_loss,
            });
        }

        let allowed = self.limits.net_delta_tolerance * proposal.proposed_size();
        let net_delta = proposal.net_delta();
        if net_delta.abs() > allowed {
            return RiskDecision::Reject(RiskRejection::NetDeltaOutOfTolerance { net_delta, allowed });
        }

        if self.state.consecutive_failures >= self.limits.max_consecutive_failures {
            return RiskDecision::Reject(RiskRejection::ConsecutiveFailures {
                count: self.state.consecutive_failures,
                limit: self.limits.max_consecutive_failures,
            });
        }

        RiskDecision::Allow
    }

    /// Zero the daily accumulator when `now` falls on a later UTC date.
    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today > self.state.reset_date {
            info!(
                previous_date = %self.state.reset_date,
                %today,
                closing_daily_pnl = %self.state.daily_pnl,
                "Daily PnL reset"
            );
            self.state.daily_pnl = Decimal::ZERO;
            self.state.reset_date = today;
        }
    }

    /// Add realized PnL from a finished cycle.
    ///
    /// The date rolls here too: PnL booked after UTC midnight counts toward
    /// the new day even if no pre-trade check has run since.
    pub fn record_pnl(&mut self, pnl: Decimal, now: DateTime<Utc>) {
        self.roll_day(now);
        self.state.daily_pnl += pnl;
        self.state.total_pnl += pnl;

        if self.state.daily_pnl < -self.limits.max_daily_loss {
            warn!(
                daily_pnl = %self.state.daily_pnl,
                limit = %self.limits.max_daily_loss,
                "Daily loss limit breached - new cycles refused until UTC midnight"
            );
        }
    }

    pub fn record_cycle_failure(&mut self) {
        self.state.consecutive_failures += 1;
        warn!(
            consecutive_failures = self.state.consecutive_failures,
            limit = self.limits.max_consecutive_failures,
            "Cycle failure recorded"
        );
    }

    pub fn record_cycle_success(&mut self) {
        self.state.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position_per_instrument: dec!(1),
            max_daily_loss: dec!(50),
            net_delta_tolerance: dec!(0.02),
            max_consecutive_failures: 3,
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
    }

    fn proposal(current_a: Decimal, current_b: Decimal, proposed: Decimal) -> ProposedTrade {
        ProposedTrade {
            leg_a: LegExposure {
                symbol: "ETH-PERP".into(),
                current: current_a,
                proposed,
            },
            leg_b: LegExposure {
                symbol: "ETH-PERP".into(),
                current: current_b,
                proposed,
            },
        }
    }

    fn guard() -> RiskGuard {
        RiskGuard::new(limits(), at(10, 0).date_naive())
    }

    #[test]
    fn test_flat_proposal_allowed() {
        let mut guard = guard();
        assert!(guard.pre_trade_check(&proposal(dec!(0), dec!(0), dec!(0.5)), at(10, 12)).is_allowed());
    }

    #[test]
    fn test_position_limit() {
        let mut guard = guard();
        let decision = guard.pre_trade_check(&proposal(dec!(0.6), dec!(-0.6), dec!(0.5)), at(10, 12));
        assert!(matches!(
            decision,
            RiskDecision::Reject(RiskRejection::PositionLimit { projected, .. }) if projected == dec!(1.1)
        ));
    }

    #[test]
    fn test_daily_loss_resets_at_utc_midnight() {
        let mut guard = guard();
        guard.record_pnl(dec!(-60), at(10, 20));

        let late = guard.pre_trade_check(&proposal(dec!(0), dec!(0), dec!(0.1)), at(10, 23));
        assert!(matches!(late, RiskDecision::Reject(RiskRejection::DailyLossLimit { .. })));

        let next_day = guard.pre_trade_check(&proposal(dec!(0), dec!(0), dec!(0.1)), at(11, 0));
        assert!(next_day.is_allowed());
        assert_eq!(guard.safety_state().daily_pnl, Decimal::ZERO);
        assert_eq!(guard.safety_state().total_pnl, dec!(-60));
        assert_eq!(guard.safety_state().reset_date, at(11, 0).date_naive());
    }

    #[test]
    fn test_daily_reset_happens_once_per_date() {
        let mut guard = guard();
        guard.record_pnl(dec!(-60), at(10, 20));

        assert!(guard.pre_trade_check(&proposal(dec!(0), dec!(0), dec!(0.1)), at(11, 0)).is_allowed());
        guard.record_pnl(dec!(-10), at(11, 1));

        let later = guard.pre_trade_check(&proposal(dec!(0), dec!(0), dec!(0.1)), at(11, 5));
        assert!(later.is_allowed());
        assert_eq!(guard.safety_state().daily_pnl, dec!(-10));
        assert_eq!(guard.safety_state().total_pnl, dec!(-70));
        assert_eq!(guard.safety_state().reset_date, at(11, 0).date_naive());
    }

    #[test]
    fn test_pnl_booked_after_midnight_rolls_the_day() {
        let mut guard = guard();
        guard.record_pnl(dec!(-45), at(10, 22));

        // Cycle finishes after midnight, before any pre-trade check on day 11
        guard.record_pnl(dec!(-20), at(11, 0));
        assert_eq!(guard.safety_state().daily_pnl, dec!(-20));
        assert_eq!(guard.safety_state().reset_date, at(11, 0).date_naive());

        let decision = guard.pre_trade_check(&proposal(dec!(0), dec!(0), dec!(0.1)), at(11, 1));
        assert!(decision.is_allowed());
        assert_eq!(guard.safety_state().daily_pnl, dec!(-20));
    }

    #[test]
    fn test_loss_exactly_at_limit_allowed() {
        let mut guard = guard();
        guard.record_pnl(dec!(-50), at(10, 1));
        assert!(guard.pre_trade_check(&proposal(dec!(0), dec!(0), dec!(0.1)), at(10, 2)).is_allowed());
    }

    #[test]
    fn test_net_delta_tolerance() {
        let mut guard = guard();
        // 0.02 * 0.5 = 0.01 allowed
        assert!(guard
            .pre_trade_check(&proposal(dec!(0.01), dec!(0), dec!(0.5)), at(10, 1))
            .is_allowed());

        let decision = guard.pre_trade_check(&proposal(dec!(0.02), dec!(0), dec!(0.5)), at(10, 1));
        assert!(matches!(
            decision,
            RiskDecision::Reject(RiskRejection::NetDeltaOutOfTolerance { .. })
        ));
    }

    #[test]
    fn test_consecutive_failures() {
        let mut guard = guard();
        for _ in 0..3 {
            guard.record_cycle_failure();
        }
        let decision = guard.pre_trade_check(&proposal(dec!(0), dec!(0), dec!(0.1)), at(10, 1));
        assert_eq!(
            decision,
            RiskDecision::Reject(RiskRejection::ConsecutiveFailures { count: 3, limit: 3 })
        );

        guard.record_cycle_success();
        assert!(guard.pre_trade_check(&proposal(dec!(0), dec!(0), dec!(0.1)), at(10, 1)).is_allowed());
    }

    #[test]
    fn test_rejection_has_no_side_effects() {
        let mut guard = guard();
        guard.record_pnl(dec!(-10), at(10, 1));
        let before = guard.safety_state().clone();

        let decision = guard.pre_trade_check(&proposal(dec!(0.9), dec!(0), dec!(0.5)), at(10, 2));
        assert!(!decision.is_allowed());
        assert_eq!(guard.safety_state(), &before);
    }

    #[test]
    fn test_restore_keeps_counters() {
        let mut state = SafetyState::new(at(10, 0).date_naive());
        state.daily_pnl = dec!(-55);
        let mut guard = RiskGuard::restore(limits(), state);

        let decision = guard.pre_trade_check(&proposal(dec!(0), dec!(0), dec!(0.1)), at(10, 9));
        assert!(decision.into_result().is_err());
    }
}
