//! Dual-leg order execution.
//!
//! Both legs are dispatched before either is awaited and joined once both
//! reach a terminal state. Leg-level exchange errors stop here: each leg
//! always comes back as a `LegOrderResult`, and a failure on one leg never
//! aborts its sibling.

use crate::config::ExecutionConfig;
use crate::exchange::{
    BestBidOffer, ExchangeError, FillStatus, LegHandle, LegId, LegOrderRequest, LegOrderResult,
    OrderKind, OrderSide,
};
use crate::utils::decimal::round_down_to_increment;
use crate::utils::ShutdownSignal;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

/// Classification of a dual-leg placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FillOutcome {
    BothFilled,
    BothFailed,
    /// Exactly one leg has a non-zero fill.
    Asymmetric,
}

impl FillOutcome {
    /// Total over every pair of results; a partial fill counts as filled.
    pub fn classify(result_a: &LegOrderResult, result_b: &LegOrderResult) -> Self {
        match (result_a.has_fill(), result_b.has_fill()) {
            (true, true) => FillOutcome::BothFilled,
            (false, false) => FillOutcome::BothFailed,
            _ => FillOutcome::Asymmetric,
        }
    }
}

/// Outcome of closing one leg against its authoritative position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnwindReport {
    pub leg: LegId,
    /// Absolute authoritative position when the close started
    pub target_quantity: Decimal,
    pub filled_quantity: Decimal,
    /// Closing orders sent
    pub attempts: u32,
    /// Last authoritative reading (signed)
    pub residual: Decimal,
    pub complete: bool,
    pub fills: Vec<LegOrderResult>,
}

impl UnwindReport {
    fn new(leg: LegId) -> Self {
        Self {
            leg,
            target_quantity: Decimal::ZERO,
            filled_quantity: Decimal::ZERO,
            attempts: 0,
            residual: Decimal::ZERO,
            complete: false,
            fills: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DualLegReport {
    pub result_a: LegOrderResult,
    pub result_b: LegOrderResult,
    pub outcome: FillOutcome,
    /// Present when an asymmetric fill was closed out
    pub emergency_unwind: Option<UnwindReport>,
}

impl DualLegReport {
    pub fn result(&self, leg: LegId) -> &LegOrderResult {
        match leg {
            LegId::A => &self.result_a,
            LegId::B => &self.result_b,
        }
    }

    /// The only leg with a fill, when the outcome is asymmetric.
    pub fn filled_leg(&self) -> Option<LegId> {
        match (self.result_a.has_fill(), self.result_b.has_fill()) {
            (true, false) => Some(LegId::A),
            (false, true) => Some(LegId::B),
            _ => None,
        }
    }
}

/// Whether a placement gives up when shutdown is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryPolicy {
    /// Opening orders: stop retrying once shutdown is requested.
    Cancellable,
    /// Closing orders: keep going, they move the book toward flat.
    RunToCompletion,
}

/// Places the two legs of a hedge and recovers from one-sided fills.
pub struct DualLegExecutor {
    leg_a: LegHandle,
    leg_b: LegHandle,
    config: ExecutionConfig,
    dust_tolerance: Decimal,
    shutdown: ShutdownSignal,
    order_seq: AtomicU64,
}

impl DualLegExecutor {
    pub fn new(
        leg_a: LegHandle,
        leg_b: LegHandle,
        config: ExecutionConfig,
        dust_tolerance: Decimal,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            leg_a,
            leg_b,
            config,
            dust_tolerance,
            shutdown,
            order_seq: AtomicU64::new(1),
        }
    }

    pub fn leg(&self, leg: LegId) -> &LegHandle {
        match leg {
            LegId::A => &self.leg_a,
            LegId::B => &self.leg_b,
        }
    }

    /// Build a request with the configured order kind and a fresh client order id.
    pub fn request(&self, leg: LegId, side: OrderSide, quantity: Decimal, tag: &str) -> LegOrderRequest {
        LegOrderRequest::new(
            self.leg(leg).instrument.clone(),
            side,
            quantity,
            self.config.order_kind,
            self.next_client_id(tag, leg),
        )
    }

    fn next_client_id(&self, tag: &str, leg: LegId) -> String {
        format!("{}-{}-{}", tag, leg, self.order_seq.fetch_add(1, Ordering::SeqCst))
    }

    /// Place both legs concurrently and classify the result.
    pub async fn execute(&self, request_a: &LegOrderRequest, request_b: &LegOrderRequest) -> DualLegReport {
        self.execute_with_policy(request_a, request_b, RetryPolicy::Cancellable).await
    }

    /// `execute` for closing orders: retries are not cut short by shutdown.
    pub async fn execute_closing(
        &self,
        request_a: &LegOrderRequest,
        request_b: &LegOrderRequest,
    ) -> DualLegReport {
        self.execute_with_policy(request_a, request_b, RetryPolicy::RunToCompletion).await
    }

    async fn execute_with_policy(
        &self,
        request_a: &LegOrderRequest,
        request_b: &LegOrderRequest,
        policy: RetryPolicy,
    ) -> DualLegReport {
        let (result_a, result_b) = tokio::join!(
            self.place_leg(LegId::A, request_a, policy),
            self.place_leg(LegId::B, request_b, policy),
        );
        let outcome = FillOutcome::classify(&result_a, &result_b);

        info!(
            ?outcome,
            side_a = %result_a.side,
            filled_a = %result_a.filled_quantity,
            price_a = ?result_a.average_price,
            side_b = %result_b.side,
            filled_b = %result_b.filled_quantity,
            price_b = ?result_b.average_price,
            "Dual-leg placement complete"
        );

        DualLegReport {
            result_a,
            result_b,
            outcome,
            emergency_unwind: None,
        }
    }

    /// `execute`, then close the filled leg immediately if only one side filled.
    pub async fn execute_with_recovery(
        &self,
        request_a: &LegOrderRequest,
        request_b: &LegOrderRequest,
    ) -> DualLegReport {
        let mut report = self.execute(request_a, request_b).await;

        if let Some(filled_leg) = report.filled_leg() {
            error!(
                %filled_leg,
                filled = %report.result(filled_leg).filled_quantity,
                "Asymmetric fill - emergency unwind of filled leg"
            );
            let unwind = self.close_leg(filled_leg).await;
            if !unwind.complete {
                error!(
                    %filled_leg,
                    residual = %unwind.residual,
                    attempts = unwind.attempts,
                    "CRITICAL: Emergency unwind incomplete - naked exposure remains"
                );
            }
            report.emergency_unwind = Some(unwind);
        }

        report
    }

    /// Close `leg` against its authoritative position with market orders.
    ///
    /// The position is re-read before every attempt, so partial closes and
    /// fills the venue never reported are both accounted for.
    pub async fn close_leg(&self, leg: LegId) -> UnwindReport {
        let handle = self.leg(leg);
        let increment = handle.instrument.size_increment;
        let mut report = UnwindReport::new(leg);
        let mut backoff = Duration::from_millis(self.config.backoff_base_ms);
        let mut position_read = false;

        for attempt in 1..=self.config.unwind_max_attempts {
            let position = match handle.authoritative_position().await {
                Ok(position) => position,
                Err(e) => {
                    warn!(%leg, attempt, error = %e, "Authoritative read failed during close");
                    tokio::time::sleep(backoff).await;
                    backoff = self.next_backoff(backoff);
                    continue;
                }
            };
            if !position_read {
                report.target_quantity = position.abs();
                position_read = true;
            }
            report.residual = position;

            if position.abs() <= self.dust_tolerance {
                report.complete = true;
                break;
            }

            let quantity = round_down_to_increment(position.abs(), increment);
            if quantity.is_zero() {
                warn!(%leg, %position, %increment, "Residual below size increment, cannot close");
                break;
            }

            report.attempts += 1;
            let request = LegOrderRequest::new(
                handle.instrument.clone(),
                OrderSide::closing(position),
                quantity,
                OrderKind::Market,
                self.next_client_id("close", leg),
            );
            info!(
                %leg,
                venue = %handle.venue,
                %position,
                side = %request.side,
                %quantity,
                attempt,
                "Closing leg"
            );
            let result = self.place_leg(leg, &request, RetryPolicy::RunToCompletion).await;
            report.filled_quantity += result.filled_quantity;
            report.fills.push(result);

            if attempt < self.config.unwind_max_attempts {
                tokio::time::sleep(backoff).await;
                backoff = self.next_backoff(backoff);
            }
        }

        if !report.complete {
            if let Ok(position) = handle.authoritative_position().await {
                report.residual = position;
                report.complete = position.abs() <= self.dust_tolerance;
            }
        }

        if report.complete {
            info!(%leg, filled = %report.filled_quantity, attempts = report.attempts, "Leg closed");
        } else {
            error!(%leg, residual = %report.residual, attempts = report.attempts, "Leg close incomplete");
        }
        report
    }

    /// Close both legs concurrently.
    pub async fn force_close_all(&self) -> Vec<UnwindReport> {
        warn!("Force-closing all legs");
        join_all(LegId::BOTH.iter().map(|leg| self.close_leg(*leg))).await
    }

    /// Submit one leg with retries. Never returns an error.
    async fn place_leg(&self, leg: LegId, request: &LegOrderRequest, policy: RetryPolicy) -> LegOrderResult {
        let handle = self.leg(leg);
        let side = request.side;
        let fill_timeout = Duration::from_secs(self.config.fill_timeout_secs);
        let mut backoff = Duration::from_millis(self.config.backoff_base_ms);
        let mut transport_attempts = 0u32;
        let mut reprices = 0u32;

        let mut request = request.clone();
        if request.price_hint.is_none() && request.kind != OrderKind::Market {
            match handle.best_bid_offer().await {
                Ok(bbo) => request.price_hint = Some(price_hint(request.kind, side, &bbo)),
                Err(e) => warn!(%leg, error = %e, "No quote for price hint, sending without one"),
            }
        }

        loop {
            if policy == RetryPolicy::Cancellable && (transport_attempts > 0 || reprices > 0) && self.shutdown.is_triggered() {
                warn!(%leg, client_order_id = %request.client_order_id, "Retry cancelled by shutdown");
                return LegOrderResult::failed(side, FillStatus::Rejected, "cancelled by shutdown");
            }

            let placed = tokio::time::timeout(fill_timeout, handle.client.place_order(&request)).await;

            let err = match placed {
                Ok(Ok(result)) => return result,
                Ok(Err(e)) => e,
                Err(_) => {
                    error!(
                        %leg,
                        client_order_id = %request.client_order_id,
                        timeout_secs = self.config.fill_timeout_secs,
                        "Fill wait timed out, cancelling"
                    );
                    // A cancel does not undo a fill that already happened; the
                    // caller settles against the authoritative position.
                    match handle.client.cancel_order(&request.client_order_id).await {
                        Ok(cancelled) => info!(%leg, client_order_id = %request.client_order_id, cancelled, "Cancel sent for timed-out order"),
                        Err(e) => warn!(%leg, client_order_id = %request.client_order_id, error = %e, "Cancel of timed-out order failed"),
                    }
                    return LegOrderResult::failed(
                        side,
                        FillStatus::Expired,
                        ExchangeError::Timeout(self.config.fill_timeout_secs).to_string(),
                    );
                }
            };

            if err.is_transient() {
                transport_attempts += 1;
                if transport_attempts >= self.config.max_transport_attempts {
                    error!(%leg, attempts = transport_attempts, error = %err, "Transport retries exhausted");
                    return LegOrderResult::failed(side, FillStatus::Rejected, err.to_string());
                }
                warn!(
                    %leg,
                    attempt = transport_attempts,
                    max_attempts = self.config.max_transport_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Order failed, retrying"
                );
                let slept = match policy {
                    RetryPolicy::Cancellable => self.shutdown.sleep(backoff).await,
                    RetryPolicy::RunToCompletion => {
                        tokio::time::sleep(backoff).await;
                        true
                    }
                };
                if !slept {
                    return LegOrderResult::failed(side, FillStatus::Rejected, "cancelled by shutdown");
                }
                backoff = self.next_backoff(backoff);
                continue;
            }

            if err.is_stale_price() && reprices < self.config.reprice_attempts {
                reprices += 1;
                let bbo = match handle.best_bid_offer().await {
                    Ok(bbo) => bbo,
                    Err(e) => {
                        warn!(%leg, error = %e, "Re-quote failed after stale price");
                        return LegOrderResult::failed(side, FillStatus::Rejected, err.to_string());
                    }
                };
                let price = price_hint(request.kind, side, &bbo);
                info!(%leg, %price, attempt = reprices, "Stale price, re-pricing");
                request = request.repriced(price, reprices);
                continue;
            }

            let status = match err {
                ExchangeError::Timeout(_) => FillStatus::Expired,
                _ => FillStatus::Rejected,
            };
            warn!(%leg, error = %err, "Leg order failed");
            return LegOrderResult::failed(side, status, err.to_string());
        }
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(Duration::from_millis(self.config.backoff_cap_ms))
    }
}

/// Aggressive kinds price at the touch; post-only rests on its own side.
fn price_hint(kind: OrderKind, side: OrderSide, bbo: &BestBidOffer) -> Decimal {
    match kind {
        OrderKind::ImmediateOrCancel | OrderKind::Market => bbo.touch(side),
        OrderKind::PostOnly => bbo.touch(side.opposite()),
    }
}
