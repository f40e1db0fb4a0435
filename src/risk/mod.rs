//! Risk management for the pairs hedger.
//!
//! - Pre-trade gating (position, daily loss, net delta, failure streak)
//! - Position reconciliation between cached and authoritative sources

mod guard;
mod reconciler;

pub use guard::{
    LegExposure, ProposedTrade, RiskDecision, RiskGuard, RiskLimits, RiskRejection, SafetyState,
};
pub use reconciler::{PositionReconciler, ReconcileResult, ReconcileStatus};
