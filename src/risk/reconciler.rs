//! Position reconciliation between the venues' push caches and their
//! authoritative account endpoints.
//!
//! The reconciler owns the shared position book. Only authoritative readings
//! feed risk decisions; the cached view is kept for fast display and is
//! overwritten when it drifts too far. Reconciliation never places orders.

use crate::config::ReconcileConfig;
use crate::exchange::{ExchangeError, LegHandle, LegId, Position, PositionSource};
use crate::utils::ShutdownSignal;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Net-delta health after a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStatus {
    Ok,
    Warning,
    /// Trading halted until flatness is re-verified.
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileResult {
    pub authoritative_a: Decimal,
    pub authoritative_b: Decimal,
    /// `authoritative_a + authoritative_b`
    pub net_delta: Decimal,
    pub status: ReconcileStatus,
    /// |cached - authoritative| per leg, `None` when the venue holds no cache
    pub cache_drift_a: Option<Decimal>,
    pub cache_drift_b: Option<Decimal>,
    /// Both legs within dust tolerance
    pub flat: bool,
}

impl ReconcileResult {
    pub fn authoritative(&self, leg: LegId) -> Decimal {
        match leg {
            LegId::A => self.authoritative_a,
            LegId::B => self.authoritative_b,
        }
    }
}

#[derive(Debug, Default)]
struct LegBook {
    cached: Option<Position>,
    authoritative: Option<Position>,
}

#[derive(Debug)]
struct PositionBook {
    a: LegBook,
    b: LegBook,
    /// Reference size the drift and delta thresholds scale with
    order_size: Decimal,
}

impl PositionBook {
    fn leg_mut(&mut self, leg: LegId) -> &mut LegBook {
        match leg {
            LegId::A => &mut self.a,
            LegId::B => &mut self.b,
        }
    }

    fn leg(&self, leg: LegId) -> &LegBook {
        match leg {
            LegId::A => &self.a,
            LegId::B => &self.b,
        }
    }
}

/// Keeps the position book consistent with both venues.
pub struct PositionReconciler {
    leg_a: LegHandle,
    leg_b: LegHandle,
    config: ReconcileConfig,
    book: Mutex<PositionBook>,
    halted: AtomicBool,
}

impl PositionReconciler {
    pub fn new(leg_a: LegHandle, leg_b: LegHandle, config: ReconcileConfig) -> Self {
        let book = PositionBook {
            a: LegBook::default(),
            b: LegBook::default(),
            order_size: config.order_size,
        };
        Self {
            leg_a,
            leg_b,
            config,
            book: Mutex::new(book),
            halted: AtomicBool::new(false),
        }
    }

    pub fn leg(&self, leg: LegId) -> &LegHandle {
        match leg {
            LegId::A => &self.leg_a,
            LegId::B => &self.leg_b,
        }
    }

    pub fn dust_tolerance(&self) -> Decimal {
        self.config.dust_tolerance
    }

    /// Rescale thresholds to the size of the hedge actually being traded.
    pub async fn set_reference_size(&self, order_size: Decimal) {
        if order_size > Decimal::ZERO {
            self.book.lock().await.order_size = order_size;
        }
    }

    /// Net delta above which a reading is critical, at the current reference size.
    pub async fn critical_threshold(&self) -> Decimal {
        self.config.net_delta_critical_fraction * self.book.lock().await.order_size
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Lift a critical-delta halt. Callers re-verify flatness first.
    pub fn clear_halt(&self) {
        if self.halted.swap(false, Ordering::SeqCst) {
            info!("Reconciliation halt cleared");
        }
    }

    /// Fetch both authoritative positions and reconcile the book.
    ///
    /// The book lock is held across the fetch, compare and write so that a
    /// background pass and a cycle gate never interleave.
    pub async fn reconcile(&self) -> Result<ReconcileResult, ExchangeError> {
        let mut book = self.book.lock().await;

        let (auth_a, auth_b, cached_a, cached_b) = tokio::join!(
            self.leg_a.authoritative_position(),
            self.leg_b.authoritative_position(),
            self.leg_a.cached_position(),
            self.leg_b.cached_position(),
        );
        let auth_a = auth_a?;
        let auth_b = auth_b?;

        let order_size = book.order_size;
        let cache_drift_a = self.reconcile_leg(&mut book, LegId::A, auth_a, cached_a, order_size);
        let cache_drift_b = self.reconcile_leg(&mut book, LegId::B, auth_b, cached_b, order_size);

        let net_delta = auth_a + auth_b;
        let warning = self.config.net_delta_warning_fraction * order_size;
        let critical = self.config.net_delta_critical_fraction * order_size;

        let status = if net_delta.abs() > critical {
            error!(
                position_a = %auth_a,
                position_b = %auth_b,
                %net_delta,
                threshold = %critical,
                "CRITICAL: Net delta exceeds halt threshold - trading halted"
            );
            self.halted.store(true, Ordering::SeqCst);
            ReconcileStatus::Critical
        } else if net_delta.abs() > warning {
            warn!(
                position_a = %auth_a,
                position_b = %auth_b,
                %net_delta,
                threshold = %warning,
                "Net delta above warning threshold"
            );
            ReconcileStatus::Warning
        } else {
            ReconcileStatus::Ok
        };

        let dust = self.config.dust_tolerance;
        let flat = auth_a.abs() <= dust && auth_b.abs() <= dust;

        debug!(
            position_a = %auth_a,
            position_b = %auth_b,
            %net_delta,
            ?status,
            flat,
            "Reconciled"
        );

        Ok(ReconcileResult {
            authoritative_a: auth_a,
            authoritative_b: auth_b,
            net_delta,
            status,
            cache_drift_a,
            cache_drift_b,
            flat,
        })
    }

    fn reconcile_leg(
        &self,
        book: &mut PositionBook,
        leg: LegId,
        authoritative: Decimal,
        cached: Option<Decimal>,
        order_size: Decimal,
    ) -> Option<Decimal> {
        let symbol = self.leg(leg).symbol().to_string();
        let entry = book.leg_mut(leg);
        entry.authoritative = Some(Position::new(
            symbol.clone(),
            authoritative,
            PositionSource::Authoritative,
        ));

        let Some(cached) = cached else {
            entry.cached = None;
            return None;
        };

        let drift = (cached - authoritative).abs();
        let drift_threshold = self.config.drift_fraction * order_size;
        let recovery_threshold = self.config.recovery_fraction * order_size;

        if drift > recovery_threshold {
            warn!(
                %leg,
                %symbol,
                %cached,
                %authoritative,
                %drift,
                threshold = %recovery_threshold,
                "Cache drift above recovery threshold - cached view overwritten"
            );
            entry.cached = Some(Position::new(symbol, authoritative, PositionSource::Authoritative));
        } else {
            if drift > drift_threshold {
                warn!(
                    %leg,
                    %symbol,
                    %cached,
                    %authoritative,
                    %drift,
                    threshold = %drift_threshold,
                    "Cache drift detected"
                );
            }
            entry.cached = Some(Position::new(symbol, cached, PositionSource::Cached));
        }

        Some(drift)
    }

    /// Best available view of a leg: cached preferred, authoritative fallback.
    pub async fn current_view(&self, leg: LegId) -> Result<Position, ExchangeError> {
        let mut book = self.book.lock().await;
        let entry = book.leg(leg);
        if let Some(position) = entry.cached.as_ref().or(entry.authoritative.as_ref()) {
            return Ok(position.clone());
        }

        let handle = self.leg(leg);
        let quantity = handle.authoritative_position().await?;
        let position = Position::new(handle.symbol(), quantity, PositionSource::Authoritative);
        book.leg_mut(leg).authoritative = Some(position.clone());
        Ok(position)
    }

    /// Poll until both legs read flat or `attempts` passes are exhausted.
    ///
    /// Returns the last reading; transport errors count as a failed attempt
    /// and only surface if no pass succeeded.
    pub async fn verify_flat(
        &self,
        attempts: u32,
        delay: Duration,
    ) -> Result<ReconcileResult, ExchangeError> {
        let attempts = attempts.max(1);
        let mut last_result = None;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.reconcile().await {
                Ok(result) if result.flat => {
                    info!(attempt, "Flatness verified on authoritative positions");
                    return Ok(result);
                }
                Ok(result) => {
                    warn!(
                        attempt,
                        attempts,
                        position_a = %result.authoritative_a,
                        position_b = %result.authoritative_b,
                        "Positions not yet flat"
                    );
                    last_result = Some(result);
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Flatness poll failed");
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }

        match (last_result, last_error) {
            (Some(result), _) => Ok(result),
            (None, Some(e)) => Err(e),
            (None, None) => Err(ExchangeError::NotConnected),
        }
    }

    /// Run `reconcile` every `interval` until shutdown.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Background reconciliation started");
            while shutdown.sleep(interval).await {
                if let Err(e) = self.reconcile().await {
                    warn!(error = %e, "Background reconciliation failed");
                }
            }
            info!("Background reconciliation stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{CacheMode, Instrument, PaperExchange};
    use rust_decimal_macros::dec;

    fn paper(venue: &str) -> Arc<PaperExchange> {
        Arc::new(PaperExchange::new(venue, "ETH-PERP", dec!(2999), dec!(3001)))
    }

    fn setup() -> (Arc<PaperExchange>, Arc<PaperExchange>, PositionReconciler) {
        let a = paper("paper-a");
        let b = paper("paper-b");
        let instrument = Instrument::new("ETH-PERP", dec!(0.01), dec!(0.001));
        let config = ReconcileConfig {
            order_size: dec!(0.1),
            ..ReconcileConfig::default()
        };
        let reconciler = PositionReconciler::new(
            LegHandle::new(LegId::A, "paper-a", instrument.clone(), a.clone()),
            LegHandle::new(LegId::B, "paper-b", instrument, b.clone()),
            config,
        );
        (a, b, reconciler)
    }

    #[tokio::test]
    async fn test_flat_reconcile() {
        let (_a, _b, reconciler) = setup();
        let result = reconciler.reconcile().await.unwrap();
        assert!(result.flat);
        assert_eq!(result.status, ReconcileStatus::Ok);
        assert_eq!(result.cache_drift_a, Some(Decimal::ZERO));
    }

    #[tokio::test]
    async fn test_hedged_book_is_not_critical() {
        let (a, b, reconciler) = setup();
        a.set_authoritative_position(dec!(0.1)).await;
        b.set_authoritative_position(dec!(-0.1)).await;

        let result = reconciler.reconcile().await.unwrap();
        assert_eq!(result.net_delta, Decimal::ZERO);
        assert_eq!(result.status, ReconcileStatus::Ok);
        assert!(!result.flat);
    }

    #[tokio::test]
    async fn test_net_delta_thresholds() {
        let (a, b, reconciler) = setup();
        // warning at 0.001, critical at 0.002
        a.set_authoritative_position(dec!(0.1)).await;
        b.set_authoritative_position(dec!(-0.0985)).await;
        let result = reconciler.reconcile().await.unwrap();
        assert_eq!(result.status, ReconcileStatus::Warning);
        assert!(!reconciler.is_halted());

        b.set_authoritative_position(dec!(0)).await;
        let result = reconciler.reconcile().await.unwrap();
        assert_eq!(result.status, ReconcileStatus::Critical);
        assert!(reconciler.is_halted());

        // Recovery of the book does not lift the halt by itself
        a.set_authoritative_position(dec!(0)).await;
        assert!(reconciler.reconcile().await.unwrap().flat);
        assert!(reconciler.is_halted());
        reconciler.clear_halt();
        assert!(!reconciler.is_halted());
    }

    #[tokio::test]
    async fn test_cache_drift_overwrites_view() {
        let (a, _b, reconciler) = setup();
        a.set_cache_mode(CacheMode::Frozen);

        // Below recovery threshold (0.025): cached view kept
        a.set_authoritative_position(dec!(0.01)).await;
        let result = reconciler.reconcile().await.unwrap();
        assert_eq!(result.cache_drift_a, Some(dec!(0.01)));
        let view = reconciler.current_view(LegId::A).await.unwrap();
        assert_eq!(view.source, PositionSource::Cached);
        assert_eq!(view.quantity, Decimal::ZERO);

        // Above recovery threshold: cached view replaced by authoritative value
        a.set_authoritative_position(dec!(0.05)).await;
        reconciler.reconcile().await.unwrap();
        let view = reconciler.current_view(LegId::A).await.unwrap();
        assert_eq!(view.source, PositionSource::Authoritative);
        assert_eq!(view.quantity, dec!(0.05));

        // Never trades
        assert_eq!(a.order_count().await, 0);
    }

    #[tokio::test]
    async fn test_current_view_without_cache() {
        let (_a, b, reconciler) = setup();
        b.set_cache_mode(CacheMode::Absent);
        b.set_authoritative_position(dec!(-0.2)).await;

        let view = reconciler.current_view(LegId::B).await.unwrap();
        assert_eq!(view.quantity, dec!(-0.2));
        assert_eq!(view.source, PositionSource::Authoritative);

        let result = reconciler.reconcile().await.unwrap();
        assert_eq!(result.cache_drift_b, None);
    }

    #[tokio::test]
    async fn test_verify_flat_reports_residual() {
        let (_a, b, reconciler) = setup();
        b.set_authoritative_position(dec!(0.5)).await;

        let result = reconciler
            .verify_flat(3, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(!result.flat);
        assert_eq!(result.authoritative_b, dec!(0.5));
    }

    #[tokio::test]
    async fn test_periodic_task_stops_on_shutdown() {
        let (_a, _b, reconciler) = setup();
        let shutdown = ShutdownSignal::new();
        let handle = Arc::new(reconciler).spawn_periodic(Duration::from_millis(10), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
