//! Shared utilities: decimal arithmetic and the shutdown signal.

pub mod decimal;
mod shutdown;

pub use shutdown::ShutdownSignal;
