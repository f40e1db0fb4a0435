//! Exchange collaborators for the hedge engine.
//!
//! ## Interface
//! `ExchangeClient` is the only surface the engine talks to:
//! - Top of book and slippage estimates
//! - Order placement and cancellation
//! - Authoritative and cached position reads
//!
//! ## Paper venue
//! `PaperExchange` is an in-memory venue with scriptable fill behaviour,
//! used for paper trading and for exercising the failure paths.

mod error;
pub mod paper;
mod traits;
mod types;

pub use error::{ExchangeError, RejectReason};
pub use paper::{CacheMode, PaperExchange, ScriptedFill};
#[cfg(test)]
pub use traits::MockExchangeClient;
pub use traits::{ExchangeClient, LegHandle, LegId};
pub use types::*;
