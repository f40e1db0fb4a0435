//! In-memory paper venue with scriptable fill behaviour.

use super::error::{ExchangeError, RejectReason};
use super::traits::ExchangeClient;
use super::types::*;
use crate::utils::decimal::{from_basis_points, is_aligned};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Forced outcome for the next order the venue receives.
///
/// With an empty script every order is handled by the default matching rules.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedFill {
    /// Fill the full requested quantity at the touch.
    Full,
    /// Fill this fraction (0..1) of the requested quantity.
    Partial(Decimal),
    /// Nothing filled, order expired.
    NoFill,
    /// Reject as stale-priced.
    RejectStalePrice,
    /// Fail with a transport error before reaching the matching engine.
    TransportError,
    /// Wait, then apply the default rules.
    Delay(Duration),
    /// Report a full fill without moving the position.
    PhantomFill,
    /// Apply the default rules, then hold the acknowledgement back.
    SlowAck(Duration),
}

/// How the venue's push cache tracks the real position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Cache equals the authoritative position.
    Mirror,
    /// Cache stops updating at its current value.
    Frozen,
    /// No cache is held.
    Absent,
}

/// Simulated account state for one venue.
#[derive(Debug, Clone)]
pub struct PaperVenueState {
    pub position: Decimal,
    pub cached_position: Option<Decimal>,
    pub bbo: BestBidOffer,
    pub total_fees: Decimal,
    pub order_count: u64,
    /// Every request received, including failed ones.
    pub orders: Vec<LegOrderRequest>,
    /// Order ids passed to `cancel_order`.
    pub cancels: Vec<String>,
}

/// Paper venue for one instrument.
pub struct PaperExchange {
    venue: String,
    symbol: String,
    state: Arc<RwLock<PaperVenueState>>,
    script: Mutex<VecDeque<ScriptedFill>>,
    cache_mode: Mutex<CacheMode>,
    order_id_counter: AtomicU64,
    connected: AtomicBool,
    /// Taker fee rate (0.04% default)
    fee_rate: Decimal,
    /// Quantity absorbed per basis point of slippage; `None` = no depth data.
    depth_per_bps: Option<Decimal>,
}

impl PaperExchange {
    /// Create a connected paper venue quoting `bid`/`ask` with a flat position.
    pub fn new(venue: impl Into<String>, symbol: impl Into<String>, bid: Decimal, ask: Decimal) -> Self {
        Self {
            venue: venue.into(),
            symbol: symbol.into(),
            state: Arc::new(RwLock::new(PaperVenueState {
                position: Decimal::ZERO,
                cached_position: Some(Decimal::ZERO),
                bbo: BestBidOffer { bid, ask },
                total_fees: Decimal::ZERO,
                order_count: 0,
                orders: Vec::new(),
                cancels: Vec::new(),
            })),
            script: Mutex::new(VecDeque::new()),
            cache_mode: Mutex::new(CacheMode::Mirror),
            order_id_counter: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            fee_rate: dec!(0.0004),
            depth_per_bps: None,
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub fn with_depth(mut self, depth_per_bps: Decimal) -> Self {
        self.depth_per_bps = Some(depth_per_bps);
        self
    }

    pub fn venue(&self) -> &str {
        &self.venue
    }

    /// Queue forced outcomes, consumed one per order in FIFO order.
    pub fn push_script(&self, fills: impl IntoIterator<Item = ScriptedFill>) {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        script.extend(fills);
    }

    pub fn set_cache_mode(&self, mode: CacheMode) {
        *self.cache_mode.lock().unwrap_or_else(|e| e.into_inner()) = mode;
    }

    pub async fn set_bbo(&self, bid: Decimal, ask: Decimal) {
        self.state.write().await.bbo = BestBidOffer { bid, ask };
    }

    /// Move the position outside of the order flow (manual trade, liquidation, test setup).
    pub async fn set_authoritative_position(&self, position: Decimal) {
        let mut state = self.state.write().await;
        state.position = position;
        if self.current_cache_mode() == CacheMode::Mirror {
            state.cached_position = Some(position);
        }
        info!(venue = %self.venue, symbol = %self.symbol, %position, "Paper position overridden");
    }

    pub async fn position(&self) -> Decimal {
        self.state.read().await.position
    }

    pub async fn orders(&self) -> Vec<LegOrderRequest> {
        self.state.read().await.orders.clone()
    }

    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    pub async fn snapshot(&self) -> PaperVenueState {
        self.state.read().await.clone()
    }

    fn current_cache_mode(&self) -> CacheMode {
        *self.cache_mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_script(&self) -> Option<ScriptedFill> {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    fn next_order_id(&self) -> String {
        format!("{}-{}", self.venue, self.order_id_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn slippage_bps(&self, quantity: Decimal) -> Option<Decimal> {
        self.depth_per_bps
            .filter(|depth| *depth > Decimal::ZERO)
            .map(|depth| quantity / depth)
    }

    /// Default matching rules: market crosses, IOC needs a marketable hint,
    /// post-only rejects when it would cross and otherwise fills at its hint.
    fn match_price(&self, request: &LegOrderRequest, bbo: &BestBidOffer) -> Result<Option<Decimal>, ExchangeError> {
        let touch = bbo.touch(request.side);
        match request.kind {
            OrderKind::Market => Ok(Some(touch)),
            OrderKind::ImmediateOrCancel => {
                let limit = request.price_hint.unwrap_or(touch);
                let marketable = match request.side {
                    OrderSide::Buy => limit >= bbo.ask,
                    OrderSide::Sell => limit <= bbo.bid,
                };
                Ok(marketable.then_some(touch))
            }
            OrderKind::PostOnly => {
                let limit = request.price_hint.unwrap_or_else(|| bbo.touch(request.side.opposite()));
                let crosses = match request.side {
                    OrderSide::Buy => limit >= bbo.ask,
                    OrderSide::Sell => limit <= bbo.bid,
                };
                if crosses {
                    Err(ExchangeError::Rejected {
                        reason: RejectReason::StalePrice,
                        message: format!("post-only {} at {} would cross", request.side, limit),
                    })
                } else {
                    Ok(Some(limit))
                }
            }
        }
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn connect(&self) -> Result<(), ExchangeError> {
        self.connected.store(true, Ordering::SeqCst);
        debug!(venue = %self.venue, "Paper venue connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ExchangeError> {
        self.connected.store(false, Ordering::SeqCst);
        debug!(venue = %self.venue, "Paper venue disconnected");
        Ok(())
    }

    async fn fetch_best_bid_offer(&self, symbol: &str) -> Result<BestBidOffer, ExchangeError> {
        if symbol != self.symbol {
            return Err(ExchangeError::UnknownInstrument(symbol.to_string()));
        }
        Ok(self.state.read().await.bbo)
    }

    async fn place_order(&self, request: &LegOrderRequest) -> Result<LegOrderResult, ExchangeError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ExchangeError::NotConnected);
        }
        if request.instrument.symbol != self.symbol {
            return Err(ExchangeError::UnknownInstrument(request.instrument.symbol.clone()));
        }

        self.state.write().await.orders.push(request.clone());

        let mut scripted = self.next_script();
        let mut ack_delay = None;
        match scripted {
            Some(ScriptedFill::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                scripted = None;
            }
            Some(ScriptedFill::SlowAck(delay)) => {
                ack_delay = Some(delay);
                scripted = None;
            }
            _ => {}
        }

        match scripted {
            Some(ScriptedFill::TransportError) => {
                warn!(venue = %self.venue, client_order_id = %request.client_order_id, "Paper transport failure");
                return Err(ExchangeError::Transport("connection reset by peer".to_string()));
            }
            Some(ScriptedFill::RejectStalePrice) => {
                return Err(ExchangeError::Rejected {
                    reason: RejectReason::StalePrice,
                    message: "price moved".to_string(),
                });
            }
            _ => {}
        }

        if request.quantity <= Decimal::ZERO
            || !is_aligned(request.quantity, request.instrument.size_increment)
        {
            return Err(ExchangeError::Rejected {
                reason: RejectReason::InvalidSize,
                message: format!(
                    "quantity {} not a positive multiple of {}",
                    request.quantity, request.instrument.size_increment
                ),
            });
        }

        let mut state = self.state.write().await;
        let bbo = state.bbo;
        let order_id = self.next_order_id();

        let (price, filled, moves_position) = match scripted {
            Some(ScriptedFill::NoFill) => (bbo.touch(request.side), Decimal::ZERO, true),
            Some(ScriptedFill::Partial(fraction)) => {
                let raw = request.quantity * fraction;
                let increment = request.instrument.size_increment;
                let filled = (raw / increment).trunc() * increment;
                (bbo.touch(request.side), filled, true)
            }
            Some(ScriptedFill::PhantomFill) => (bbo.touch(request.side), request.quantity, false),
            Some(ScriptedFill::Full) => (bbo.touch(request.side), request.quantity, true),
            _ => match self.match_price(request, &bbo)? {
                Some(price) => (price, request.quantity, true),
                None => (bbo.touch(request.side), Decimal::ZERO, true),
            },
        };

        let price = match self.slippage_bps(filled) {
            Some(bps) => price * (Decimal::ONE + request.side.sign() * from_basis_points(bps)),
            None => price,
        };
        let fee = filled * price * self.fee_rate;

        if moves_position {
            state.position += request.side.sign() * filled;
        }
        match self.current_cache_mode() {
            CacheMode::Mirror => state.cached_position = Some(state.position),
            CacheMode::Frozen => {}
            CacheMode::Absent => state.cached_position = None,
        }
        state.total_fees += fee;
        state.order_count += 1;

        info!(
            venue = %self.venue,
            %order_id,
            symbol = %request.instrument.symbol,
            side = %request.side,
            requested = %request.quantity,
            filled = %filled,
            price = %price,
            fee = %fee,
            position = %state.position,
            "Paper order executed"
        );
        drop(state);

        if let Some(delay) = ack_delay {
            tokio::time::sleep(delay).await;
        }

        Ok(LegOrderResult::filled(
            order_id,
            request.side,
            request.quantity,
            filled,
            price,
            fee,
        ))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool, ExchangeError> {
        // Paper orders reach a terminal state inside place_order.
        debug!(venue = %self.venue, %order_id, "Cancel on terminal paper order");
        self.state.write().await.cancels.push(order_id.to_string());
        Ok(false)
    }

    async fn get_authoritative_position(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        if symbol != self.symbol {
            return Err(ExchangeError::UnknownInstrument(symbol.to_string()));
        }
        Ok(self.state.read().await.position)
    }

    async fn get_cached_position(&self, symbol: &str) -> Option<Decimal> {
        if symbol != self.symbol || self.current_cache_mode() == CacheMode::Absent {
            return None;
        }
        self.state.read().await.cached_position
    }

    async fn estimate_slippage(&self, _side: OrderSide, quantity: Decimal) -> SlippageEstimate {
        match self.slippage_bps(quantity) {
            Some(bps) => SlippageEstimate::Bps(bps),
            None => SlippageEstimate::Unknown,
        }
    }

    async fn check_exit_capacity(
        &self,
        quantity: Decimal,
        max_slippage_bps: Decimal,
    ) -> Result<ExitCapacity, ExchangeError> {
        let max_quantity = match self.depth_per_bps {
            Some(depth) => depth * max_slippage_bps,
            None => quantity,
        };
        Ok(ExitCapacity {
            can_exit: quantity <= max_quantity,
            max_quantity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth() -> Instrument {
        Instrument::new("ETH-PERP", dec!(0.01), dec!(0.001))
    }

    fn venue() -> PaperExchange {
        PaperExchange::new("paper-a", "ETH-PERP", dec!(2999), dec!(3001))
    }

    fn market(side: OrderSide, quantity: Decimal) -> LegOrderRequest {
        LegOrderRequest::new(eth(), side, quantity, OrderKind::Market, "t-1")
    }

    #[tokio::test]
    async fn test_market_order_moves_position() {
        let client = venue();

        let result = client.place_order(&market(OrderSide::Buy, dec!(0.5))).await.unwrap();
        assert_eq!(result.status, FillStatus::Filled);
        assert_eq!(result.average_price, Some(dec!(3001)));
        assert_eq!(client.position().await, dec!(0.5));

        client.place_order(&market(OrderSide::Sell, dec!(0.5))).await.unwrap();
        assert_eq!(client.position().await, Decimal::ZERO);
        assert!(client.snapshot().await.total_fees > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_scripted_outcomes_are_consumed_in_order() {
        let client = venue();
        client.push_script([
            ScriptedFill::TransportError,
            ScriptedFill::Partial(dec!(0.5)),
            ScriptedFill::NoFill,
        ]);

        let err = client.place_order(&market(OrderSide::Buy, dec!(1))).await.unwrap_err();
        assert!(err.is_transient());

        let partial = client.place_order(&market(OrderSide::Buy, dec!(1))).await.unwrap();
        assert_eq!(partial.status, FillStatus::PartiallyFilled);
        assert_eq!(partial.filled_quantity, dec!(0.5));

        let none = client.place_order(&market(OrderSide::Buy, dec!(1))).await.unwrap();
        assert!(!none.has_fill());
        assert_eq!(client.position().await, dec!(0.5));
        assert_eq!(client.order_count().await, 3);
    }

    #[tokio::test]
    async fn test_phantom_fill_leaves_position() {
        let client = venue();
        client.set_authoritative_position(dec!(0.5)).await;
        client.push_script([ScriptedFill::PhantomFill]);

        let result = client.place_order(&market(OrderSide::Sell, dec!(0.5))).await.unwrap();
        assert_eq!(result.status, FillStatus::Filled);
        assert_eq!(client.position().await, dec!(0.5));
    }

    #[tokio::test]
    async fn test_post_only_crossing_is_stale() {
        let client = venue();
        let request = LegOrderRequest::new(eth(), OrderSide::Buy, dec!(0.1), OrderKind::PostOnly, "p-1")
            .with_price_hint(dec!(3005));

        let err = client.place_order(&request).await.unwrap_err();
        assert!(err.is_stale_price());
    }

    #[tokio::test]
    async fn test_ioc_below_ask_expires() {
        let client = venue();
        let request = LegOrderRequest::new(eth(), OrderSide::Buy, dec!(0.1), OrderKind::ImmediateOrCancel, "i-1")
            .with_price_hint(dec!(2990));

        let result = client.place_order(&request).await.unwrap();
        assert_eq!(result.status, FillStatus::Expired);
        assert_eq!(client.position().await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_misaligned_quantity_rejected() {
        let client = venue();
        let err = client
            .place_order(&market(OrderSide::Buy, dec!(0.0005)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Rejected {
                reason: RejectReason::InvalidSize,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_frozen_cache_diverges() {
        let client = venue();
        client.set_cache_mode(CacheMode::Frozen);
        client.place_order(&market(OrderSide::Buy, dec!(0.2))).await.unwrap();

        assert_eq!(client.get_cached_position("ETH-PERP").await, Some(Decimal::ZERO));
        assert_eq!(client.get_authoritative_position("ETH-PERP").await.unwrap(), dec!(0.2));

        client.set_cache_mode(CacheMode::Absent);
        assert_eq!(client.get_cached_position("ETH-PERP").await, None);
    }

    #[tokio::test]
    async fn test_slippage_model() {
        let client = venue().with_depth(dec!(10));
        assert_eq!(
            client.estimate_slippage(OrderSide::Buy, dec!(25)).await,
            SlippageEstimate::Bps(dec!(2.5))
        );
        let capacity = client.check_exit_capacity(dec!(60), dec!(5)).await.unwrap();
        assert!(!capacity.can_exit);
        assert_eq!(capacity.max_quantity, dec!(50));

        assert_eq!(
            venue().estimate_slippage(OrderSide::Sell, dec!(1)).await,
            SlippageEstimate::Unknown
        );
    }

    #[tokio::test]
    async fn test_disconnected_venue_refuses_orders() {
        let client = venue();
        client.disconnect().await.unwrap();
        let err = client.place_order(&market(OrderSide::Buy, dec!(0.1))).await.unwrap_err();
        assert_eq!(err, ExchangeError::NotConnected);
    }
}
