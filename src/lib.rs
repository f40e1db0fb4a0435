//! # Pairs Hedger
//!
//! Delta-neutral hedge engine that opens and closes equal-notional,
//! opposite-side positions on two venues in lock step.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Venue capability trait, shared order types and a paper venue
//! - `risk`: Pre-trade risk guard and position reconciliation
//! - `strategy`: Leg sizing, dual-leg execution and the cycle state machine
//! - `persistence`: SQLite trade journal and safety-state storage
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::HedgeError;
