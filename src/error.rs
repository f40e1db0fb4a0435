//! Engine-level error taxonomy.
//!
//! Leg-level `ExchangeError`s are converted into `LegOrderResult`s inside the
//! executor; what escapes to the cycle is one of these.

use crate::exchange::{ExchangeError, LegId};
use crate::risk::RiskRejection;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HedgeError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("risk limit exceeded: {0}")]
    RiskLimitExceeded(#[from] RiskRejection),

    #[error("open position on BUILD: leg A {position_a}, leg B {position_b}")]
    OpenPositionOnBuild {
        position_a: Decimal,
        position_b: Decimal,
    },

    #[error("BUILD blocked: {0}")]
    BuildBlocked(String),

    #[error("nothing to trade: {0}")]
    NothingToTrade(String),

    #[error("achieved imbalance {imbalance} above accepted {max}")]
    ImbalanceTooHigh { imbalance: Decimal, max: Decimal },

    #[error("both legs failed: A: {error_a}, B: {error_b}")]
    BothLegsFailed { error_a: String, error_b: String },

    #[error("asymmetric fill: only leg {filled_leg} filled, emergency unwind complete: {unwind_complete}")]
    AsymmetricFill {
        filled_leg: LegId,
        unwind_complete: bool,
    },

    #[error("unwind not verified flat: leg A {position_a}, leg B {position_b}")]
    UnwindNotVerified {
        position_a: Decimal,
        position_b: Decimal,
    },

    #[error("critical net delta {net_delta} above {threshold}")]
    ReconciliationDriftCritical { net_delta: Decimal, threshold: Decimal },

    #[error("cycle timed out after {0}s")]
    CycleTimeout(u64),

    #[error("cancelled by shutdown")]
    Cancelled,
}

impl HedgeError {
    /// Raised before any order was placed; no position can have changed.
    pub fn is_pre_trade(&self) -> bool {
        matches!(
            self,
            HedgeError::RiskLimitExceeded(_)
                | HedgeError::OpenPositionOnBuild { .. }
                | HedgeError::BuildBlocked(_)
                | HedgeError::NothingToTrade(_)
                | HedgeError::ImbalanceTooHigh { .. }
                | HedgeError::ReconciliationDriftCritical { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pre_trade_classification() {
        assert!(HedgeError::BuildBlocked("halted".into()).is_pre_trade());
        assert!(HedgeError::ImbalanceTooHigh {
            imbalance: dec!(0.1),
            max: dec!(0.05)
        }
        .is_pre_trade());
        assert!(!HedgeError::UnwindNotVerified {
            position_a: dec!(0),
            position_b: dec!(0.5)
        }
        .is_pre_trade());
        assert!(!HedgeError::Cancelled.is_pre_trade());
    }

    #[test]
    fn test_exchange_error_converts() {
        let err: HedgeError = ExchangeError::Timeout(10).into();
        assert!(matches!(err, HedgeError::Exchange(ExchangeError::Timeout(10))));
    }
}
