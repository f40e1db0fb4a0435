//! Hedge execution strategy.
//!
//! - Balanced sizing of the two legs
//! - Concurrent dual-leg placement with asymmetric-fill recovery
//! - BUILD/UNWIND cycle sequencing

mod cycle;
mod executor;
mod sizer;

pub use cycle::{BuildDirection, CyclePhase, CycleState, CycleStateMachine, HedgeCycle};
pub use executor::{DualLegExecutor, DualLegReport, FillOutcome, UnwindReport};
pub use sizer::{
    BalancedSizer, LegQuote, LinearImpact, SizingConfidence, SizingError, SizingResult,
    SlippageCurve,
};
