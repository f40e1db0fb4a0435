//! Hedge cycle sequencing.
//!
//! One cycle is BUILD (open both legs), hold, then UNWIND (close both legs).
//! Phases: `idle -> building -> built -> unwinding -> flat`, with
//! `building | unwinding -> halted` on failure.
//!
//! A cycle only reaches `flat` once the authoritative positions of both
//! legs read within dust tolerance; order fill reports alone are never
//! enough. A halted unwind, or a critical net-delta reading, blocks further
//! BUILDs until `recover()` has force-closed the residual and re-verified
//! flatness.

use crate::config::CycleConfig;
use crate::error::HedgeError;
use crate::exchange::{LegId, LegOrderResult, OrderSide};
use crate::persistence::{FillRecord, FillRole, TradeLogger};
use crate::risk::{
    LegExposure, PositionReconciler, ProposedTrade, ReconcileStatus, RiskGuard,
};
use crate::strategy::executor::{DualLegExecutor, DualLegReport, FillOutcome, UnwindReport};
use crate::strategy::sizer::{BalancedSizer, LegQuote, LinearImpact, SizingResult};
use crate::utils::decimal::round_to_increment;
use crate::utils::ShutdownSignal;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Building,
    Built,
    Unwinding,
    Flat,
    Halted,
}

impl CyclePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, CyclePhase::Flat | CyclePhase::Halted)
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Building => "building",
            CyclePhase::Built => "built",
            CyclePhase::Unwinding => "unwinding",
            CyclePhase::Flat => "flat",
            CyclePhase::Halted => "halted",
        };
        write!(f, "{}", name)
    }
}

/// Which leg is bought on BUILD. Alternates with every completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildDirection {
    LongAShortB,
    ShortALongB,
}

impl BuildDirection {
    pub fn for_cycle(completed: u64) -> Self {
        if completed % 2 == 0 {
            BuildDirection::LongAShortB
        } else {
            BuildDirection::ShortALongB
        }
    }

    /// BUILD side for `leg`.
    pub fn side(self, leg: LegId) -> OrderSide {
        match (self, leg) {
            (BuildDirection::LongAShortB, LegId::A) | (BuildDirection::ShortALongB, LegId::B) => OrderSide::Buy,
            _ => OrderSide::Sell,
        }
    }
}

impl fmt::Display for BuildDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildDirection::LongAShortB => write!(f, "long_a_short_b"),
            BuildDirection::ShortALongB => write!(f, "short_a_long_b"),
        }
    }
}

/// One BUILD/UNWIND round trip.
#[derive(Debug, Clone, Serialize)]
pub struct HedgeCycle {
    pub id: u64,
    pub phase: CyclePhase,
    pub direction: BuildDirection,
    pub sized_a: Decimal,
    pub sized_b: Decimal,
    pub imbalance: Decimal,
    pub build: Option<DualLegReport>,
    pub unwind: Option<DualLegReport>,
    /// Close-outs run outside the regular UNWIND (retries, timeouts, recovery)
    pub recovery: Vec<UnwindReport>,
    pub started_at: DateTime<Utc>,
    pub built_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    pub failure: Option<String>,
}

impl HedgeCycle {
    pub fn new(id: u64, direction: BuildDirection) -> Self {
        Self {
            id,
            phase: CyclePhase::Idle,
            direction,
            sized_a: Decimal::ZERO,
            sized_b: Decimal::ZERO,
            imbalance: Decimal::ZERO,
            build: None,
            unwind: None,
            recovery: Vec::new(),
            started_at: Utc::now(),
            built_at: None,
            finished_at: None,
            realized_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            failure: None,
        }
    }

    fn transition(&mut self, phase: CyclePhase) {
        info!(cycle_id = self.id, from = %self.phase, to = %phase, "Cycle phase change");
        self.phase = phase;
    }

    /// Quantity actually opened on `leg` during BUILD.
    pub fn built_quantity(&self, leg: LegId) -> Decimal {
        self.build
            .as_ref()
            .map(|report| report.result(leg).filled_quantity)
            .unwrap_or(Decimal::ZERO)
    }
}

/// Engine state carried between cycles.
#[derive(Debug, Default)]
pub struct CycleState {
    /// Cycles that reached verified flat
    pub completed: u64,
    next_id: u64,
    /// The live (non-terminal) cycle, if any
    pub current: Option<HedgeCycle>,
    pub history: Vec<HedgeCycle>,
    /// Set when exposure may remain; only `recover()` clears it.
    pub blocked: Option<String>,
}

/// Pre-trade result: everything needed to place the BUILD.
struct BuildPlan {
    direction: BuildDirection,
    sizing: SizingResult,
}

/// Sequences cycles over one venue pair.
pub struct CycleStateMachine {
    executor: DualLegExecutor,
    reconciler: Arc<PositionReconciler>,
    sizer: BalancedSizer,
    risk: RiskGuard,
    logger: Arc<dyn TradeLogger>,
    config: CycleConfig,
    shutdown: ShutdownSignal,
    state: CycleState,
}

impl CycleStateMachine {
    pub fn new(
        executor: DualLegExecutor,
        reconciler: Arc<PositionReconciler>,
        sizer: BalancedSizer,
        risk: RiskGuard,
        logger: Arc<dyn TradeLogger>,
        config: CycleConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            executor,
            reconciler,
            sizer,
            risk,
            logger,
            config,
            shutdown,
            state: CycleState {
                next_id: 1,
                ..CycleState::default()
            },
        }
    }

    pub fn state(&self) -> &CycleState {
        &self.state
    }

    pub fn risk(&self) -> &RiskGuard {
        &self.risk
    }

    pub fn is_blocked(&self) -> bool {
        self.state.blocked.is_some()
    }

    /// Blocked, or halted on critical net delta. Either way only `recover()` re-opens BUILD.
    pub fn needs_recovery(&self) -> bool {
        self.is_blocked() || self.reconciler.is_halted()
    }

    /// BUILD, hold, UNWIND. Returns the finished (flat) cycle.
    pub async fn run_cycle(&mut self) -> Result<HedgeCycle, HedgeError> {
        self.build().await?;

        let hold = Duration::from_secs(self.config.hold_secs);
        if !self.shutdown.sleep(hold).await {
            info!("Shutdown during hold - unwinding now");
        }

        self.unwind().await
    }

    /// Run the pre-trade gate and, if it passes, open both legs.
    ///
    /// On success the cycle is left `built` in `state.current`.
    pub async fn build(&mut self) -> Result<(), HedgeError> {
        if let Some(live) = &self.state.current {
            return Err(HedgeError::BuildBlocked(format!(
                "cycle {} is still {}",
                live.id, live.phase
            )));
        }

        let plan = self.plan_build().await?;

        let mut cycle = HedgeCycle::new(self.state.next_id, plan.direction);
        self.state.next_id += 1;
        cycle.sized_a = plan.sizing.quantity_a;
        cycle.sized_b = plan.sizing.quantity_b;
        cycle.imbalance = plan.sizing.imbalance;
        cycle.transition(CyclePhase::Building);

        self.reconciler.set_reference_size(plan.sizing.quantity_a.max(plan.sizing.quantity_b)).await;

        let request_a = self.executor.request(LegId::A, plan.direction.side(LegId::A), plan.sizing.quantity_a, "build");
        let request_b = self.executor.request(LegId::B, plan.direction.side(LegId::B), plan.sizing.quantity_b, "build");

        let timeout_secs = self.config.cycle_timeout_secs;
        let placed = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.executor.execute_with_recovery(&request_a, &request_b),
        )
        .await;
        let Ok(report) = placed else {
            return Err(self.abort(cycle, HedgeError::CycleTimeout(timeout_secs)).await);
        };

        for leg in LegId::BOTH {
            self.record_fill(&mut cycle, leg, report.result(leg), FillRole::Entry, None);
        }
        if let (Some(unwind), Some(leg)) = (&report.emergency_unwind, report.filled_leg()) {
            let entry = report.result(leg).clone();
            for fill in &unwind.fills {
                self.record_fill(&mut cycle, leg, fill, FillRole::Exit, Some(&entry));
            }
        }

        match report.outcome {
            FillOutcome::BothFilled => {
                info!(
                    cycle_id = cycle.id,
                    direction = %cycle.direction,
                    filled_a = %report.result_a.filled_quantity,
                    filled_b = %report.result_b.filled_quantity,
                    "Hedge built"
                );
                cycle.build = Some(report);
                cycle.built_at = Some(Utc::now());
                cycle.transition(CyclePhase::Built);
                self.state.current = Some(cycle);
                Ok(())
            }
            FillOutcome::BothFailed => {
                let err = HedgeError::BothLegsFailed {
                    error_a: report.result_a.error.clone().unwrap_or_else(|| "no fill".to_string()),
                    error_b: report.result_b.error.clone().unwrap_or_else(|| "no fill".to_string()),
                };
                cycle.build = Some(report);
                self.settle_failed_build(&mut cycle).await;
                self.halt(cycle, &err);
                Err(err)
            }
            FillOutcome::Asymmetric => {
                let filled_leg = report.filled_leg().unwrap_or(LegId::A);
                let unwind_complete = report.emergency_unwind.as_ref().is_some_and(|u| u.complete);
                if !unwind_complete {
                    let residual = report.emergency_unwind.as_ref().map(|u| u.residual).unwrap_or_default();
                    self.block(format!(
                        "emergency unwind of leg {} incomplete, residual {}",
                        filled_leg, residual
                    ));
                }
                let err = HedgeError::AsymmetricFill {
                    filled_leg,
                    unwind_complete,
                };
                cycle.build = Some(report);
                if unwind_complete {
                    self.settle_failed_build(&mut cycle).await;
                }
                self.halt(cycle, &err);
                Err(err)
            }
        }
    }

    /// Resolve a BUILD that did not produce a hedge against the authoritative source.
    ///
    /// A leg whose fill wait timed out may still have filled at the venue, so
    /// failure reports alone never prove the book is flat.
    async fn settle_failed_build(&mut self, cycle: &mut HedgeCycle) {
        match self.reconciler.reconcile().await {
            Ok(result) if result.flat => return,
            Ok(result) => warn!(
                cycle_id = cycle.id,
                position_a = %result.authoritative_a,
                position_b = %result.authoritative_b,
                "Failed BUILD left exposure - closing"
            ),
            Err(e) => warn!(cycle_id = cycle.id, error = %e, "Could not read positions after failed BUILD - closing"),
        }

        let reports = self.executor.force_close_all().await;
        for report in &reports {
            for fill in &report.fills {
                self.record_fill(cycle, report.leg, fill, FillRole::Exit, None);
            }
        }
        cycle.recovery.extend(reports);

        let verify_delay = Duration::from_millis(self.config.verify_delay_ms);
        match self.reconciler.verify_flat(self.config.verify_attempts, verify_delay).await {
            Ok(result) if result.flat => {}
            Ok(result) => self.block(format!(
                "positions open after failed BUILD: leg A {}, leg B {}",
                result.authoritative_a, result.authoritative_b
            )),
            Err(e) => self.block(format!("flatness unverified after failed BUILD: {}", e)),
        }
    }

    /// Pre-trade gate. Places no orders and leaves no trace on failure.
    async fn plan_build(&mut self) -> Result<BuildPlan, HedgeError> {
        if let Some(reason) = &self.state.blocked {
            warn!(%reason, "BUILD refused - engine blocked until recovery");
            return Err(HedgeError::BuildBlocked(reason.clone()));
        }
        if self.shutdown.is_triggered() {
            return Err(HedgeError::Cancelled);
        }

        let reconciled = self.reconciler.reconcile().await?;
        if reconciled.status == ReconcileStatus::Critical {
            return Err(HedgeError::ReconciliationDriftCritical {
                net_delta: reconciled.net_delta,
                threshold: self.reconciler.critical_threshold().await,
            });
        }
        if self.reconciler.is_halted() {
            warn!(flat = reconciled.flat, "BUILD refused - critical net-delta halt awaiting recovery");
            return Err(HedgeError::BuildBlocked(
                "critical net-delta halt outstanding".to_string(),
            ));
        }
        if !reconciled.flat {
            warn!(
                position_a = %reconciled.authoritative_a,
                position_b = %reconciled.authoritative_b,
                dust_tolerance = %self.reconciler.dust_tolerance(),
                "BUILD refused - open position"
            );
            return Err(HedgeError::OpenPositionOnBuild {
                position_a: reconciled.authoritative_a,
                position_b: reconciled.authoritative_b,
            });
        }

        let direction = BuildDirection::for_cycle(self.state.completed);
        let leg_a = self.executor.leg(LegId::A);
        let leg_b = self.executor.leg(LegId::B);

        let (bbo_a, bbo_b) = tokio::join!(leg_a.best_bid_offer(), leg_b.best_bid_offer());
        let (price_a, price_b) = (bbo_a?.mid(), bbo_b?.mid());

        let target = self.config.target_notional;
        let sample_a = sample_quantity(target, price_a, leg_a.instrument.size_increment);
        let sample_b = sample_quantity(target, price_b, leg_b.instrument.size_increment);
        let (curve_a, curve_b) = tokio::join!(
            LinearImpact::sample(leg_a.client.as_ref(), direction.side(LegId::A), sample_a),
            LinearImpact::sample(leg_b.client.as_ref(), direction.side(LegId::B), sample_b),
        );

        let sizing = self
            .sizer
            .size(
                target,
                &LegQuote {
                    instrument: &leg_a.instrument,
                    price: price_a,
                    curve: &curve_a,
                },
                &LegQuote {
                    instrument: &leg_b.instrument,
                    price: price_b,
                    curve: &curve_b,
                },
            )
            .map_err(|e| HedgeError::NothingToTrade(e.to_string()))?;

        if !sizing.is_tradeable() {
            return Err(HedgeError::NothingToTrade(format!(
                "no quantity pair for notional {} within slippage bound",
                target
            )));
        }
        if sizing.imbalance > self.config.max_accepted_imbalance {
            warn!(
                imbalance = %sizing.imbalance,
                max = %self.config.max_accepted_imbalance,
                quantity_a = %sizing.quantity_a,
                quantity_b = %sizing.quantity_b,
                "BUILD refused - imbalance too high"
            );
            return Err(HedgeError::ImbalanceTooHigh {
                imbalance: sizing.imbalance,
                max: self.config.max_accepted_imbalance,
            });
        }

        let max_bps = self.sizer.max_slippage_bps();
        let (exit_a, exit_b) = tokio::join!(
            leg_a.client.check_exit_capacity(sizing.quantity_a, max_bps),
            leg_b.client.check_exit_capacity(sizing.quantity_b, max_bps),
        );
        for (leg, capacity) in [(LegId::A, exit_a?), (LegId::B, exit_b?)] {
            if !capacity.can_exit {
                return Err(HedgeError::NothingToTrade(format!(
                    "leg {} exit capacity {} below quantity within {} bps",
                    leg, capacity.max_quantity, max_bps
                )));
            }
        }

        let proposal = ProposedTrade {
            leg_a: LegExposure {
                symbol: leg_a.symbol().to_string(),
                current: reconciled.authoritative_a,
                proposed: sizing.quantity_a,
            },
            leg_b: LegExposure {
                symbol: leg_b.symbol().to_string(),
                current: reconciled.authoritative_b,
                proposed: sizing.quantity_b,
            },
        };
        self.risk.pre_trade_check(&proposal, Utc::now()).into_result()?;

        Ok(BuildPlan { direction, sizing })
    }

    /// Close a built cycle and verify flatness on the authoritative source.
    pub async fn unwind(&mut self) -> Result<HedgeCycle, HedgeError> {
        let mut cycle = match self.state.current.take() {
            Some(cycle) if cycle.phase == CyclePhase::Built => cycle,
            other => {
                self.state.current = other;
                return Err(HedgeError::NothingToTrade("no built cycle to unwind".to_string()));
            }
        };
        cycle.transition(CyclePhase::Unwinding);

        let close_a = cycle.built_quantity(LegId::A);
        let close_b = cycle.built_quantity(LegId::B);
        let request_a = self.executor.request(LegId::A, cycle.direction.side(LegId::A).opposite(), close_a, "unwind");
        let request_b = self.executor.request(LegId::B, cycle.direction.side(LegId::B).opposite(), close_b, "unwind");

        let timeout_secs = self.config.cycle_timeout_secs;
        let closed = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.executor.execute_closing(&request_a, &request_b),
        )
        .await;
        let Ok(report) = closed else {
            return Err(self.abort(cycle, HedgeError::CycleTimeout(timeout_secs)).await);
        };

        let entries: Vec<LegOrderResult> = LegId::BOTH
            .iter()
            .map(|leg| cycle.build.as_ref().map(|b| b.result(*leg).clone()))
            .collect::<Option<Vec<_>>>()
            .unwrap_or_default();

        for (i, leg) in LegId::BOTH.iter().enumerate() {
            self.record_fill(&mut cycle, *leg, report.result(*leg), FillRole::Exit, entries.get(i));
        }

        // Any leg that did not report a full close is chased on its authoritative position.
        for (i, (leg, target)) in [(LegId::A, close_a), (LegId::B, close_b)].into_iter().enumerate() {
            let closed = report.result(leg).filled_quantity;
            if closed < target {
                warn!(cycle_id = cycle.id, %leg, %closed, %target, "Leg not fully closed, retrying on authoritative position");
                let retry = self.executor.close_leg(leg).await;
                for fill in &retry.fills {
                    self.record_fill(&mut cycle, leg, fill, FillRole::Exit, entries.get(i));
                }
                cycle.recovery.push(retry);
            }
        }
        cycle.unwind = Some(report);

        let verify_delay = Duration::from_millis(self.config.verify_delay_ms);
        match self.reconciler.verify_flat(self.config.verify_attempts, verify_delay).await {
            Ok(result) if result.flat => {
                cycle.transition(CyclePhase::Flat);
                self.state.completed += 1;
                self.risk.record_cycle_success();
                self.finish(&mut cycle);
                info!(
                    cycle_id = cycle.id,
                    realized_pnl = %cycle.realized_pnl,
                    fees = %cycle.fees,
                    completed = self.state.completed,
                    "Cycle flat"
                );
                self.state.history.push(cycle.clone());
                Ok(cycle)
            }
            Ok(result) => {
                let err = HedgeError::UnwindNotVerified {
                    position_a: result.authoritative_a,
                    position_b: result.authoritative_b,
                };
                self.block(err.to_string());
                self.halt(cycle, &err);
                Err(err)
            }
            Err(e) => {
                self.block(format!("flatness could not be verified: {}", e));
                let err = HedgeError::Exchange(e);
                self.halt(cycle, &err);
                Err(err)
            }
        }
    }

    /// Force-close everything and, if flatness verifies, unblock BUILD.
    pub async fn recover(&mut self) -> Result<bool, HedgeError> {
        warn!(blocked = ?self.state.blocked, "Recovery: force-closing all legs");
        let reports = self.executor.force_close_all().await;

        if let Some(mut cycle) = self.state.current.take() {
            for report in &reports {
                for fill in &report.fills {
                    self.record_fill(&mut cycle, report.leg, fill, FillRole::Exit, None);
                }
            }
            cycle.recovery.extend(reports);
            let err = HedgeError::BuildBlocked("closed by recovery".to_string());
            self.halt(cycle, &err);
        }

        let verify_delay = Duration::from_millis(self.config.verify_delay_ms);
        let result = self.reconciler.verify_flat(self.config.verify_attempts, verify_delay).await?;
        if result.flat {
            self.state.blocked = None;
            self.reconciler.clear_halt();
            info!("Recovery complete - flatness verified, BUILD unblocked");
            Ok(true)
        } else {
            error!(
                position_a = %result.authoritative_a,
                position_b = %result.authoritative_b,
                "Recovery failed - positions remain"
            );
            Ok(false)
        }
    }

    /// Shutdown path: unwind a built cycle, close residuals, report flatness.
    pub async fn drive_to_safe_state(&mut self) -> bool {
        if self.state.current.as_ref().is_some_and(|c| c.phase == CyclePhase::Built) {
            info!("Unwinding live cycle before exit");
            if let Err(e) = self.unwind().await {
                warn!(error = %e, "Unwind during shutdown did not verify flat");
            }
        }

        if let Ok(result) = self.reconciler.reconcile().await {
            if result.flat {
                return true;
            }
        }

        match self.recover().await {
            Ok(flat) => flat,
            Err(e) => {
                error!(error = %e, "Could not verify positions at shutdown");
                false
            }
        }
    }

    /// Whole-cycle timeout: close whatever is open and halt.
    async fn abort(&mut self, mut cycle: HedgeCycle, err: HedgeError) -> HedgeError {
        error!(cycle_id = cycle.id, phase = %cycle.phase, error = %err, "Cycle aborted - closing open positions");
        let reports = self.executor.force_close_all().await;
        for report in &reports {
            for fill in &report.fills {
                self.record_fill(&mut cycle, report.leg, fill, FillRole::Exit, None);
            }
        }
        cycle.recovery.extend(reports);

        let verify_delay = Duration::from_millis(self.config.verify_delay_ms);
        match self.reconciler.verify_flat(self.config.verify_attempts, verify_delay).await {
            Ok(result) if result.flat => {}
            Ok(result) => self.block(format!(
                "positions open after abort: leg A {}, leg B {}",
                result.authoritative_a, result.authoritative_b
            )),
            Err(e) => self.block(format!("flatness unverified after abort: {}", e)),
        }

        self.halt(cycle, &err);
        err
    }

    fn block(&mut self, reason: String) {
        error!(%reason, "BUILD blocked until recovery re-verifies flatness");
        self.state.blocked = Some(reason);
    }

    fn halt(&mut self, mut cycle: HedgeCycle, err: &HedgeError) {
        cycle.failure = Some(err.to_string());
        cycle.transition(CyclePhase::Halted);
        self.risk.record_cycle_failure();
        self.finish(&mut cycle);
        error!(
            cycle_id = cycle.id,
            error = %err,
            realized_pnl = %cycle.realized_pnl,
            daily_pnl = %self.risk.safety_state().daily_pnl,
            blocked = self.state.blocked.is_some(),
            "Cycle halted"
        );
        self.state.history.push(cycle);
    }

    fn finish(&mut self, cycle: &mut HedgeCycle) {
        cycle.finished_at = Some(Utc::now());
        self.risk.record_pnl(cycle.realized_pnl, Utc::now());
        if let Err(e) = self.logger.export_cycle_metrics(std::slice::from_ref(cycle)) {
            warn!(cycle_id = cycle.id, error = %e, "Failed to export cycle");
        }
    }

    /// Journal one fill and fold its PnL into the cycle.
    ///
    /// Exit fills realize against `entry` when the opening fill is known.
    fn record_fill(
        &self,
        cycle: &mut HedgeCycle,
        leg: LegId,
        result: &LegOrderResult,
        role: FillRole,
        entry: Option<&LegOrderResult>,
    ) {
        let Some(price) = result.average_price.filter(|_| result.has_fill()) else {
            return;
        };

        let gross = match (role, entry.and_then(|e| e.average_price.map(|p| (p, e.side)))) {
            (FillRole::Exit, Some((entry_price, entry_side))) => {
                (price - entry_price) * result.filled_quantity * entry_side.sign()
            }
            _ => Decimal::ZERO,
        };
        let realized_pnl = gross - result.fee;
        cycle.realized_pnl += realized_pnl;
        cycle.fees += result.fee;

        let handle = self.executor.leg(leg);
        let record = FillRecord {
            cycle_id: cycle.id,
            leg,
            venue: handle.venue.clone(),
            symbol: handle.symbol().to_string(),
            timestamp: Utc::now(),
            side: result.side,
            price,
            quantity: result.filled_quantity,
            role,
            fee: result.fee,
            realized_pnl,
        };
        if let Err(e) = self.logger.log_fill(&record) {
            warn!(cycle_id = cycle.id, %leg, error = %e, "Failed to journal fill");
        }
    }
}

/// Quantity used to calibrate a leg's slippage curve.
fn sample_quantity(target: Decimal, price: Decimal, increment: Decimal) -> Decimal {
    if price <= Decimal::ZERO {
        return increment;
    }
    round_to_increment(target / price, increment).max(increment)
}
