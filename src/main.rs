//! Pairs Hedger - Main Entry Point
//!
//! Runs BUILD/UNWIND hedge cycles against two paper venues.

use anyhow::Result;
use clap::{Parser, Subcommand};
use pairs_hedger::config::Config;
use pairs_hedger::exchange::{ExchangeClient, LegHandle, LegId, OrderKind, PaperExchange};
use pairs_hedger::persistence::{SqliteJournal, TradeLogger};
use pairs_hedger::risk::{PositionReconciler, RiskGuard, RiskLimits};
use pairs_hedger::strategy::{BalancedSizer, CycleStateMachine, DualLegExecutor};
use pairs_hedger::utils::ShutdownSignal;
use pairs_hedger::HedgeError;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Pairs Hedger CLI
#[derive(Parser)]
#[command(name = "pairs-hedger")]
#[command(version, about = "Delta-neutral dual-leg hedge cycles across two venues")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run hedge cycles (default)
    Run {
        /// Number of cycles to run (0 = until shutdown)
        #[arg(short, long)]
        iterations: Option<u32>,

        /// Target notional per leg, in quote currency
        #[arg(short, long)]
        notional: Option<rust_decimal::Decimal>,

        /// Order kind for BUILD and UNWIND legs
        #[arg(long, value_parser = parse_order_kind)]
        order_kind: Option<OrderKind>,

        /// Per-order fill timeout in seconds
        #[arg(long)]
        fill_timeout: Option<u64>,
    },

    /// Show journaled cycle statistics
    Status {
        /// Path to SQLite database
        #[arg(short, long, default_value = "data/hedger.db")]
        db: String,
    },
}

fn parse_order_kind(value: &str) -> Result<OrderKind, String> {
    match value.to_ascii_lowercase().as_str() {
        "ioc" | "immediate_or_cancel" => Ok(OrderKind::ImmediateOrCancel),
        "market" => Ok(OrderKind::Market),
        "post_only" | "post-only" => Ok(OrderKind::PostOnly),
        other => Err(format!("unknown order kind '{}' (ioc, market, post_only)", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    if let Some(Commands::Status { db }) = &cli.command {
        return show_status(db);
    }

    let mut config = Config::load()?;
    apply_overrides(cli.command, &mut config);
    config.validate()?;
    log_config(&config);

    let flat = run(config).await?;
    if !flat {
        error!("Exiting with open positions - manual intervention required");
        std::process::exit(1);
    }

    info!("Pairs hedger shutdown complete");
    Ok(())
}

/// Layer `run` flags over the loaded configuration.
fn apply_overrides(command: Option<Commands>, config: &mut Config) {
    let Some(Commands::Run {
        iterations,
        notional,
        order_kind,
        fill_timeout,
    }) = command
    else {
        return;
    };
    if let Some(iterations) = iterations {
        config.cycle.iterations = iterations;
    }
    if let Some(notional) = notional {
        config.cycle.target_notional = notional;
    }
    if let Some(kind) = order_kind {
        config.execution.order_kind = kind;
    }
    if let Some(secs) = fill_timeout {
        config.execution.fill_timeout_secs = secs;
    }
}

/// Drive cycles until the iteration count is reached or shutdown is requested.
///
/// Returns whether both legs were verified flat on exit.
async fn run(config: Config) -> Result<bool> {
    let shutdown = ShutdownSignal::new();
    spawn_signal_listener(shutdown.clone());

    let venue_a = paper_venue(&config, LegId::A);
    let venue_b = paper_venue(&config, LegId::B);
    for venue in [&venue_a, &venue_b] {
        venue.connect().await?;
    }

    let leg_a = LegHandle::new(LegId::A, config.legs.a.venue.clone(), config.legs.a.instrument(), venue_a.clone());
    let leg_b = LegHandle::new(LegId::B, config.legs.b.venue.clone(), config.legs.b.instrument(), venue_b.clone());

    if let Some(parent) = Path::new(&config.persistence.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let journal = Arc::new(SqliteJournal::new(&config.persistence.db_path)?);

    let limits = RiskLimits::from(&config.risk);
    let risk = match journal.load_safety_state()? {
        Some(state) => {
            info!(
                daily_pnl = %state.daily_pnl,
                reset_date = %state.reset_date,
                consecutive_failures = state.consecutive_failures,
                "Restored safety state"
            );
            RiskGuard::restore(limits, state)
        }
        None => RiskGuard::new(limits, chrono::Utc::now().date_naive()),
    };

    let reconciler = Arc::new(PositionReconciler::new(
        leg_a.clone(),
        leg_b.clone(),
        config.reconcile.clone(),
    ));
    let background = reconciler
        .clone()
        .spawn_periodic(Duration::from_secs(config.reconcile.interval_secs), shutdown.clone());

    let executor = DualLegExecutor::new(
        leg_a,
        leg_b,
        config.execution.clone(),
        config.reconcile.dust_tolerance,
        shutdown.clone(),
    );
    let logger: Arc<dyn TradeLogger> = journal.clone();
    let mut machine = CycleStateMachine::new(
        executor,
        reconciler,
        BalancedSizer::new(config.sizing.clone()),
        risk,
        logger,
        config.cycle.clone(),
        shutdown.clone(),
    );

    let pause = Duration::from_secs(config.cycle.pause_between_cycles_secs);
    let mut attempted = 0u32;

    while !shutdown.is_triggered() {
        if config.cycle.iterations > 0 && attempted >= config.cycle.iterations {
            break;
        }
        attempted += 1;

        match machine.run_cycle().await {
            Ok(cycle) => info!(
                cycle_id = cycle.id,
                realized_pnl = %cycle.realized_pnl,
                completed = machine.state().completed,
                "Cycle complete"
            ),
            Err(HedgeError::Cancelled) => break,
            Err(e) => {
                let open_position = matches!(e, HedgeError::OpenPositionOnBuild { .. });
                if e.is_pre_trade() && !open_position {
                    warn!(error = %e, "Cycle skipped");
                } else {
                    error!(error = %e, "Cycle failed");
                }

                if open_position || machine.needs_recovery() {
                    match machine.recover().await {
                        Ok(true) => info!("Recovered to flat"),
                        Ok(false) => {
                            error!("Recovery could not flatten positions - stopping");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Recovery failed - stopping");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = journal.save_safety_state(machine.risk().safety_state()) {
            warn!(error = %e, "Failed to save safety state");
        }

        if !shutdown.sleep(pause).await {
            break;
        }
    }

    info!("Driving to safe state");
    let flat = machine.drive_to_safe_state().await;
    if let Err(e) = journal.save_safety_state(machine.risk().safety_state()) {
        warn!(error = %e, "Failed to save safety state");
    }

    shutdown.trigger();
    if let Err(e) = background.await {
        warn!(error = %e, "Background reconciliation task ended abnormally");
    }

    disconnect_venues(&[venue_a, venue_b]).await;

    Ok(flat)
}

/// Best-effort disconnect; a failure is logged and the rest still close.
async fn disconnect_venues(venues: &[Arc<dyn ExchangeClient>]) {
    for venue in venues {
        if let Err(e) = venue.disconnect().await {
            warn!(error = %e, "Venue disconnect failed");
        }
    }
}

/// Paper venue for one leg, quoting the configured book.
fn paper_venue(config: &Config, leg: LegId) -> Arc<dyn ExchangeClient> {
    let (leg_config, bid, ask) = match leg {
        LegId::A => (&config.legs.a, config.paper.bid_a, config.paper.ask_a),
        LegId::B => (&config.legs.b, config.paper.bid_b, config.paper.ask_b),
    };
    let mut venue = PaperExchange::new(leg_config.venue.clone(), leg_config.symbol.clone(), bid, ask)
        .with_fee_rate(config.paper.fee_rate);
    if let Some(depth) = config.paper.depth_per_bps {
        venue = venue.with_depth(depth);
    }
    Arc::new(venue)
}

/// Trigger `shutdown` on Ctrl-C or SIGTERM.
fn spawn_signal_listener(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
                    tokio::signal::ctrl_c().await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await.ok();

        info!("Shutdown signal received - finishing current phase");
        shutdown.trigger();
    });
}

/// Initialize logging with file and console output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "pairs-hedger.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("pairs_hedger=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("Configuration:");
    info!(
        "   Leg A: {} {} (tick {}, size {})",
        config.legs.a.venue, config.legs.a.symbol, config.legs.a.tick_size, config.legs.a.size_increment
    );
    info!(
        "   Leg B: {} {} (tick {}, size {})",
        config.legs.b.venue, config.legs.b.symbol, config.legs.b.tick_size, config.legs.b.size_increment
    );
    info!("   Target Notional: {}", config.cycle.target_notional);
    info!(
        "   Iterations: {}",
        if config.cycle.iterations == 0 {
            "until shutdown".to_string()
        } else {
            config.cycle.iterations.to_string()
        }
    );
    info!("   Hold: {}s", config.cycle.hold_secs);
    info!("   Order Kind: {:?}", config.execution.order_kind);
    info!("   Fill Timeout: {}s", config.execution.fill_timeout_secs);
    info!("   Max Slippage: {} bps", config.sizing.max_slippage_bps);
    info!("   Max Position: {}", config.risk.max_position_per_instrument);
    info!("   Max Daily Loss: {}", config.risk.max_daily_loss);
}

/// Print journaled cycle statistics.
fn show_status(db_path: &str) -> Result<()> {
    if !Path::new(db_path).exists() {
        println!("Database not found: {}", db_path);
        println!("   The hedger has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let journal = SqliteJournal::new(db_path)?;
    let summary = journal.cycle_summary()?;

    println!("Cycle Summary");
    println!("   ├─ Total Cycles:   {}", summary.total_cycles);
    println!("   ├─ Flat:           {}", summary.flat_cycles);
    println!("   ├─ Halted:         {}", summary.halted_cycles);
    println!("   ├─ Fills:          {}", summary.fill_count);
    println!("   ├─ Realized PnL:   {:.4}", summary.realized_pnl);
    println!("   ├─ Fees:           {:.4}", summary.fees);
    match summary.last_finished {
        Some(ts) => println!("   └─ Last Finished:  {}", ts.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("   └─ Last Finished:  -"),
    }

    match journal.load_safety_state()? {
        Some(state) => {
            println!("\nSafety State");
            println!("   ├─ Daily PnL:      {:.4} ({})", state.daily_pnl, state.reset_date);
            println!("   ├─ Total PnL:      {:.4}", state.total_pnl);
            println!("   └─ Failure Streak: {}", state.consecutive_failures);
        }
        None => println!("\nNo safety state saved."),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_run_flags_override_config() {
        let cli = Cli::try_parse_from([
            "pairs-hedger",
            "run",
            "--iterations",
            "3",
            "--notional",
            "250",
            "--order-kind",
            "market",
            "--fill-timeout",
            "2",
        ])
        .unwrap();

        let mut config = Config::default();
        apply_overrides(cli.command, &mut config);
        assert_eq!(config.cycle.iterations, 3);
        assert_eq!(config.cycle.target_notional, dec!(250));
        assert_eq!(config.execution.order_kind, OrderKind::Market);
        assert_eq!(config.execution.fill_timeout_secs, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_iterations_out_of_range_rejected() {
        assert!(Cli::try_parse_from(["pairs-hedger", "run", "--iterations", "5000000000"]).is_err());
    }

    #[tokio::test]
    async fn test_venues_disconnected_on_exit() {
        let config = Config::default();
        let venues = [paper_venue(&config, LegId::A), paper_venue(&config, LegId::B)];
        for venue in &venues {
            venue.connect().await.unwrap();
        }

        disconnect_venues(&venues).await;

        for (venue, leg) in venues.iter().zip([&config.legs.a, &config.legs.b]) {
            let request = pairs_hedger::exchange::LegOrderRequest::new(
                leg.instrument(),
                pairs_hedger::exchange::OrderSide::Buy,
                dec!(0.01),
                OrderKind::Market,
                "exit-check",
            );
            let err = venue.place_order(&request).await.unwrap_err();
            assert!(matches!(err, pairs_hedger::exchange::ExchangeError::NotConnected));
        }
    }

    #[test]
    fn test_status_leaves_config_alone() {
        let cli = Cli::try_parse_from(["pairs-hedger", "status"]).unwrap();
        let mut config = Config::default();
        apply_overrides(cli.command, &mut config);
        assert_eq!(config.cycle.iterations, Config::default().cycle.iterations);
    }
}
