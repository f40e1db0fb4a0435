//! Venue-neutral order, fill and position types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tradable instrument with its price and quantity granularity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    /// Minimum price increment
    pub tick_size: Decimal,
    /// Minimum quantity increment
    pub size_increment: Decimal,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, tick_size: Decimal, size_increment: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            tick_size,
            size_increment,
        }
    }
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(self) -> Decimal {
        match self {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    /// Side that closes a signed position.
    pub fn closing(position: Decimal) -> Self {
        if position > Decimal::ZERO {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Execution style of a leg order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    ImmediateOrCancel,
    Market,
    PostOnly,
}

/// One leg order attempt. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegOrderRequest {
    pub instrument: Instrument,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub kind: OrderKind,
    pub price_hint: Option<Decimal>,
    pub client_order_id: String,
}

impl LegOrderRequest {
    pub fn new(
        instrument: Instrument,
        side: OrderSide,
        quantity: Decimal,
        kind: OrderKind,
        client_order_id: impl Into<String>,
    ) -> Self {
        Self {
            instrument,
            side,
            quantity,
            kind,
            price_hint: None,
            client_order_id: client_order_id.into(),
        }
    }

    pub fn with_price_hint(mut self, price: Decimal) -> Self {
        self.price_hint = Some(price);
        self
    }

    /// Same order re-priced for a resubmission.
    pub fn repriced(&self, price: Decimal, attempt: u32) -> Self {
        let mut next = self.clone();
        next.price_hint = Some(price);
        next.client_order_id = format!("{}-r{}", self.client_order_id, attempt);
        next
    }
}

/// Terminal status of a leg order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FillStatus {
    Filled,
    PartiallyFilled,
    Expired,
    Rejected,
}

/// Outcome of one leg order. `filled_quantity` is never negative; the sign lives in `side`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegOrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub side: OrderSide,
    pub filled_quantity: Decimal,
    pub average_price: Option<Decimal>,
    pub status: FillStatus,
    pub fee: Decimal,
    pub error: Option<String>,
}

impl LegOrderResult {
    /// A fill (full or partial) reported by the venue.
    pub fn filled(
        order_id: impl Into<String>,
        side: OrderSide,
        requested: Decimal,
        filled_quantity: Decimal,
        average_price: Decimal,
        fee: Decimal,
    ) -> Self {
        let status = if filled_quantity >= requested {
            FillStatus::Filled
        } else if filled_quantity > Decimal::ZERO {
            FillStatus::PartiallyFilled
        } else {
            FillStatus::Expired
        };
        Self {
            success: filled_quantity > Decimal::ZERO,
            order_id: Some(order_id.into()),
            side,
            filled_quantity,
            average_price: (filled_quantity > Decimal::ZERO).then_some(average_price),
            status,
            fee,
            error: None,
        }
    }

    /// A failed attempt with nothing filled.
    pub fn failed(side: OrderSide, status: FillStatus, error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            side,
            filled_quantity: Decimal::ZERO,
            average_price: None,
            status,
            fee: Decimal::ZERO,
            error: Some(error.into()),
        }
    }

    pub fn has_fill(&self) -> bool {
        self.filled_quantity > Decimal::ZERO
    }

    /// Signed position change produced by this fill.
    pub fn signed_fill(&self) -> Decimal {
        self.side.sign() * self.filled_quantity
    }

    pub fn notional(&self) -> Decimal {
        self.average_price.unwrap_or(Decimal::ZERO) * self.filled_quantity
    }
}

/// Top of book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BestBidOffer {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl BestBidOffer {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// Price an aggressive order on `side` would cross at.
    pub fn touch(&self, side: OrderSide) -> Decimal {
        match side {
            OrderSide::Buy => self.ask,
            OrderSide::Sell => self.bid,
        }
    }
}

/// Expected execution slippage for a quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlippageEstimate {
    Bps(Decimal),
    /// No depth data available.
    Unknown,
}

/// Answer to "can this quantity be exited within the slippage bound".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCapacity {
    pub can_exit: bool,
    pub max_quantity: Decimal,
}

/// Origin of a position reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSource {
    /// Fast venue-side cache; advisory only.
    Cached,
    /// Polled from the venue's account endpoint; the only input to risk decisions.
    Authoritative,
}

/// Signed position in one instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub source: PositionSource,
    pub timestamp: DateTime<Utc>,
}

impl Position {
    pub fn new(symbol: impl Into<String>, quantity: Decimal, source: PositionSource) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            source,
            timestamp: Utc::now(),
        }
    }

    pub fn is_dust(&self, tolerance: Decimal) -> bool {
        self.quantity.abs() <= tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_filled_result_status() {
        let full = LegOrderResult::filled("1", OrderSide::Buy, dec!(1), dec!(1), dec!(100), dec!(0));
        assert_eq!(full.status, FillStatus::Filled);
        assert!(full.success);

        let partial =
            LegOrderResult::filled("2", OrderSide::Sell, dec!(1), dec!(0.4), dec!(100), dec!(0));
        assert_eq!(partial.status, FillStatus::PartiallyFilled);
        assert_eq!(partial.signed_fill(), dec!(-0.4));

        let none = LegOrderResult::filled("3", OrderSide::Buy, dec!(1), dec!(0), dec!(100), dec!(0));
        assert_eq!(none.status, FillStatus::Expired);
        assert!(!none.success);
        assert_eq!(none.average_price, None);
    }

    #[test]
    fn test_closing_side() {
        assert_eq!(OrderSide::closing(dec!(0.5)), OrderSide::Sell);
        assert_eq!(OrderSide::closing(dec!(-0.5)), OrderSide::Buy);
    }

    #[test]
    fn test_bbo_touch() {
        let bbo = BestBidOffer {
            bid: dec!(99),
            ask: dec!(101),
        };
        assert_eq!(bbo.mid(), dec!(100));
        assert_eq!(bbo.touch(OrderSide::Buy), dec!(101));
        assert_eq!(bbo.touch(OrderSide::Sell), dec!(99));
    }
}
