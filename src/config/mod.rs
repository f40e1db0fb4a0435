//! Configuration management for the pairs hedger.
//!
//! Loads settings from an optional `config.toml` and `HEDGE__*` environment variables.

use crate::exchange::{Instrument, OrderKind};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// The two hedge legs
    #[serde(default)]
    pub legs: LegsConfig,
    /// Leg quantity sizing
    #[serde(default)]
    pub sizing: SizingConfig,
    /// Pre-trade risk limits
    #[serde(default)]
    pub risk: RiskConfig,
    /// Position reconciliation thresholds
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Order placement, retries and timeouts
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Cycle sequencing
    #[serde(default)]
    pub cycle: CycleConfig,
    /// Simulated venue parameters
    #[serde(default)]
    pub paper: PaperConfig,
    /// Trade journal
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegConfig {
    /// Venue identifier used in logs and the trade journal
    pub venue: String,
    pub symbol: String,
    /// Minimum price increment
    pub tick_size: Decimal,
    /// Minimum quantity increment
    pub size_increment: Decimal,
}

impl LegConfig {
    pub fn instrument(&self) -> Instrument {
        Instrument::new(self.symbol.clone(), self.tick_size, self.size_increment)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegsConfig {
    #[serde(default = "default_leg_a")]
    pub a: LegConfig,
    #[serde(default = "default_leg_b")]
    pub b: LegConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Notional imbalance above which the tick search runs (0.01 = 1%)
    #[serde(default = "default_imbalance_tolerance")]
    pub imbalance_tolerance: Decimal,
    /// Maximum acceptable estimated slippage per leg, in basis points
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: Decimal,
    /// Increments tried in each direction per leg during the search
    #[serde(default = "default_search_ticks")]
    pub search_ticks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum absolute position per instrument, in base units
    #[serde(default = "default_max_position")]
    pub max_position_per_instrument: Decimal,
    /// Maximum realized loss per UTC day, in quote currency (positive number)
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,
    /// Allowed pre-trade net delta as a fraction of the proposed size
    #[serde(default = "default_net_delta_tolerance")]
    pub net_delta_tolerance: Decimal,
    /// Consecutive failed cycles before new cycles are refused
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Reference order size in base units; thresholds below are fractions of it
    #[serde(default = "default_order_size")]
    pub order_size: Decimal,
    /// Cached vs authoritative drift that triggers a warning
    #[serde(default = "default_drift_fraction")]
    pub drift_fraction: Decimal,
    /// Cached vs authoritative drift above which the cache is overwritten
    #[serde(default = "default_recovery_fraction")]
    pub recovery_fraction: Decimal,
    /// Net delta warning threshold
    #[serde(default = "default_net_delta_warning")]
    pub net_delta_warning_fraction: Decimal,
    /// Net delta critical threshold (halts new trading)
    #[serde(default = "default_net_delta_critical")]
    pub net_delta_critical_fraction: Decimal,
    /// Absolute quantity below which a position counts as closed
    #[serde(default = "default_dust_tolerance")]
    pub dust_tolerance: Decimal,
    /// Background reconciliation interval
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Order style for BUILD and UNWIND legs
    #[serde(default = "default_order_kind")]
    pub order_kind: OrderKind,
    /// Attempts per leg on transport failures
    #[serde(default = "default_max_transport_attempts")]
    pub max_transport_attempts: u32,
    /// First backoff delay; doubles per attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Re-quote and resubmit attempts after a stale-price rejection
    #[serde(default = "default_reprice_attempts")]
    pub reprice_attempts: u32,
    /// Per-order fill-wait timeout
    #[serde(default = "default_fill_timeout")]
    pub fill_timeout_secs: u64,
    /// Attempts when closing a leg against its authoritative position
    #[serde(default = "default_unwind_max_attempts")]
    pub unwind_max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Target notional per leg, in quote currency
    #[serde(default = "default_target_notional")]
    pub target_notional: Decimal,
    /// Number of cycles to run (0 = until shutdown)
    #[serde(default)]
    pub iterations: u32,
    /// Time the hedge is held between BUILD and UNWIND
    #[serde(default = "default_hold_secs")]
    pub hold_secs: u64,
    #[serde(default = "default_pause_secs")]
    pub pause_between_cycles_secs: u64,
    /// Authoritative polls when verifying flatness
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,
    #[serde(default = "default_verify_delay_ms")]
    pub verify_delay_ms: u64,
    /// Whole-cycle timeout for a BUILD or UNWIND placement
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,
    /// Largest achieved sizing imbalance a BUILD will accept
    #[serde(default = "default_max_accepted_imbalance")]
    pub max_accepted_imbalance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_paper_bid")]
    pub bid_a: Decimal,
    #[serde(default = "default_paper_ask")]
    pub ask_a: Decimal,
    #[serde(default = "default_paper_bid")]
    pub bid_b: Decimal,
    #[serde(default = "default_paper_ask")]
    pub ask_b: Decimal,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
    /// Quantity absorbed per bp of slippage; unset = no depth data
    #[serde(default)]
    pub depth_per_bps: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_leg_a() -> LegConfig {
    LegConfig {
        venue: "paper-a".to_string(),
        symbol: "ETH-PERP".to_string(),
        tick_size: Decimal::new(1, 2),       // 0.01
        size_increment: Decimal::new(1, 3),  // 0.001
    }
}

fn default_leg_b() -> LegConfig {
    LegConfig {
        venue: "paper-b".to_string(),
        symbol: "ETH-PERP".to_string(),
        tick_size: Decimal::new(1, 1),       // 0.1
        size_increment: Decimal::new(1, 3),  // 0.001
    }
}

fn default_imbalance_tolerance() -> Decimal {
    Decimal::new(1, 2) // 0.01 (1%)
}

fn default_max_slippage_bps() -> Decimal {
    Decimal::new(10, 0) // 10 bps
}

fn default_search_ticks() -> u32 {
    1
}

fn default_max_position() -> Decimal {
    Decimal::new(5, 0) // 5 units
}

fn default_max_daily_loss() -> Decimal {
    Decimal::new(50, 0) // $50
}

fn default_net_delta_tolerance() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_order_size() -> Decimal {
    Decimal::new(1, 1) // 0.1 units
}

fn default_drift_fraction() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_recovery_fraction() -> Decimal {
    Decimal::new(25, 2) // 0.25
}

fn default_net_delta_warning() -> Decimal {
    Decimal::new(1, 2) // 0.01 (1% of order size)
}

fn default_net_delta_critical() -> Decimal {
    Decimal::new(2, 2) // 0.02 (2% of order size)
}

fn default_dust_tolerance() -> Decimal {
    Decimal::new(1, 6) // 0.000001
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_order_kind() -> OrderKind {
    OrderKind::ImmediateOrCancel
}

fn default_max_transport_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_backoff_cap_ms() -> u64 {
    8_000
}

fn default_reprice_attempts() -> u32 {
    1
}

fn default_fill_timeout() -> u64 {
    10
}

fn default_unwind_max_attempts() -> u32 {
    5
}

fn default_target_notional() -> Decimal {
    Decimal::new(100, 0) // $100 per leg
}

fn default_hold_secs() -> u64 {
    30
}

fn default_pause_secs() -> u64 {
    5
}

fn default_verify_attempts() -> u32 {
    5
}

fn default_verify_delay_ms() -> u64 {
    1_000
}

fn default_cycle_timeout() -> u64 {
    120
}

fn default_max_accepted_imbalance() -> Decimal {
    Decimal::new(5, 2) // 0.05 (5%)
}

fn default_paper_bid() -> Decimal {
    Decimal::new(299_990, 2) // 2999.90
}

fn default_paper_ask() -> Decimal {
    Decimal::new(300_010, 2) // 3000.10
}

fn default_fee_rate() -> Decimal {
    Decimal::new(4, 4) // 0.0004 (0.04% taker)
}

fn default_db_path() -> String {
    "data/hedger.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("HEDGE"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        for leg in [&self.legs.a, &self.legs.b] {
            anyhow::ensure!(
                leg.tick_size > Decimal::ZERO && leg.size_increment > Decimal::ZERO,
                "tick_size and size_increment must be positive for {}",
                leg.symbol
            );
        }

        anyhow::ensure!(
            self.sizing.imbalance_tolerance >= Decimal::ZERO
                && self.sizing.imbalance_tolerance < Decimal::ONE,
            "imbalance_tolerance must be between 0 and 1"
        );

        anyhow::ensure!(
            self.sizing.max_slippage_bps > Decimal::ZERO,
            "max_slippage_bps must be positive"
        );

        anyhow::ensure!(
            self.risk.max_position_per_instrument > Decimal::ZERO
                && self.risk.max_daily_loss > Decimal::ZERO,
            "max_position_per_instrument and max_daily_loss must be positive"
        );

        anyhow::ensure!(
            self.reconcile.net_delta_warning_fraction < self.reconcile.net_delta_critical_fraction,
            "net delta warning threshold must be below the critical threshold"
        );

        anyhow::ensure!(
            self.reconcile.drift_fraction <= self.reconcile.recovery_fraction,
            "drift_fraction must not exceed recovery_fraction"
        );

        anyhow::ensure!(
            self.execution.max_transport_attempts >= 1 && self.execution.unwind_max_attempts >= 1,
            "retry budgets must allow at least one attempt"
        );

        anyhow::ensure!(
            self.cycle.verify_attempts >= 1,
            "verify_attempts must be at least 1"
        );

        anyhow::ensure!(
            self.execution.fill_timeout_secs < self.cycle.cycle_timeout_secs,
            "fill timeout must be shorter than the cycle timeout"
        );

        Ok(())
    }
}

impl Default for LegsConfig {
    fn default() -> Self {
        Self {
            a: default_leg_a(),
            b: default_leg_b(),
        }
    }
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            imbalance_tolerance: default_imbalance_tolerance(),
            max_slippage_bps: default_max_slippage_bps(),
            search_ticks: default_search_ticks(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_per_instrument: default_max_position(),
            max_daily_loss: default_max_daily_loss(),
            net_delta_tolerance: default_net_delta_tolerance(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            order_size: default_order_size(),
            drift_fraction: default_drift_fraction(),
            recovery_fraction: default_recovery_fraction(),
            net_delta_warning_fraction: default_net_delta_warning(),
            net_delta_critical_fraction: default_net_delta_critical(),
            dust_tolerance: default_dust_tolerance(),
            interval_secs: default_reconcile_interval(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_kind: default_order_kind(),
            max_transport_attempts: default_max_transport_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            reprice_attempts: default_reprice_attempts(),
            fill_timeout_secs: default_fill_timeout(),
            unwind_max_attempts: default_unwind_max_attempts(),
        }
    }
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            target_notional: default_target_notional(),
            iterations: 0,
            hold_secs: default_hold_secs(),
            pause_between_cycles_secs: default_pause_secs(),
            verify_attempts: default_verify_attempts(),
            verify_delay_ms: default_verify_delay_ms(),
            cycle_timeout_secs: default_cycle_timeout(),
            max_accepted_imbalance: default_max_accepted_imbalance(),
        }
    }
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            bid_a: default_paper_bid(),
            ask_a: default_paper_ask(),
            bid_b: default_paper_bid(),
            ask_b: default_paper_ask(),
            fee_rate: default_fee_rate(),
            depth_per_bps: None,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}
