//! Venue-agnostic capability interface for one leg of the hedge.
//!
//! The engine is written once against `ExchangeClient` and instantiated per
//! venue pair, each leg holding an `Arc<dyn ExchangeClient>`. Wire protocols,
//! signing and nonce handling live behind this trait.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::error::ExchangeError;
use super::types::{
    BestBidOffer, ExitCapacity, Instrument, LegOrderRequest, LegOrderResult, OrderSide,
    SlippageEstimate,
};

/// Which side of the pair a leg sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegId {
    A,
    B,
}

impl LegId {
    pub const BOTH: [LegId; 2] = [LegId::A, LegId::B];
}

impl fmt::Display for LegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegId::A => write!(f, "A"),
            LegId::B => write!(f, "B"),
        }
    }
}

/// Trading capabilities the hedge engine needs from a venue.
///
/// One instance serves one venue/instrument pair. Implementations must be
/// cheap to share behind an `Arc` and safe to call concurrently.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn connect(&self) -> Result<(), ExchangeError>;

    async fn disconnect(&self) -> Result<(), ExchangeError>;

    async fn fetch_best_bid_offer(&self, symbol: &str) -> Result<BestBidOffer, ExchangeError>;

    /// Submit an order and wait (bounded by the venue) for its terminal state.
    async fn place_order(&self, request: &LegOrderRequest) -> Result<LegOrderResult, ExchangeError>;

    async fn cancel_order(&self, order_id: &str) -> Result<bool, ExchangeError>;

    /// Signed position from the venue's account endpoint.
    async fn get_authoritative_position(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Signed position from the venue's push cache; `None` when no cache is held.
    async fn get_cached_position(&self, symbol: &str) -> Option<Decimal>;

    async fn estimate_slippage(&self, side: OrderSide, quantity: Decimal) -> SlippageEstimate;

    async fn check_exit_capacity(
        &self,
        quantity: Decimal,
        max_slippage_bps: Decimal,
    ) -> Result<ExitCapacity, ExchangeError>;
}

/// One configured leg: venue name, instrument and the client that trades it.
#[derive(Clone)]
pub struct LegHandle {
    pub id: LegId,
    pub venue: String,
    pub instrument: Instrument,
    pub client: Arc<dyn ExchangeClient>,
}

impl LegHandle {
    pub fn new(
        id: LegId,
        venue: impl Into<String>,
        instrument: Instrument,
        client: Arc<dyn ExchangeClient>,
    ) -> Self {
        Self {
            id,
            venue: venue.into(),
            instrument,
            client,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.instrument.symbol
    }

    pub async fn authoritative_position(&self) -> Result<Decimal, ExchangeError> {
        self.client.get_authoritative_position(&self.instrument.symbol).await
    }

    pub async fn cached_position(&self) -> Option<Decimal> {
        self.client.get_cached_position(&self.instrument.symbol).await
    }

    pub async fn best_bid_offer(&self) -> Result<BestBidOffer, ExchangeError> {
        self.client.fetch_best_bid_offer(&self.instrument.symbol).await
    }
}

impl fmt::Debug for LegHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegHandle")
            .field("id", &self.id)
            .field("venue", &self.venue)
            .field("instrument", &self.instrument)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leg_display() {
        assert_eq!(LegId::A.to_string(), "A");
        assert_eq!(LegId::BOTH, [LegId::A, LegId::B]);
    }
}
