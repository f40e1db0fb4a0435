//! Trade journal.
//!
//! Records every fill and finished cycle, and keeps the risk guard's safety
//! counters so the daily loss limit survives a restart on the same UTC day:
//! - Fill history (entry and exit legs)
//! - Cycle history with per-leg detail as JSON
//! - Safety state singleton

use crate::exchange::{LegId, OrderSide};
use crate::risk::SafetyState;
use crate::strategy::{CyclePhase, HedgeCycle};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info};

/// Whether a fill opened or closed exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FillRole {
    Entry,
    Exit,
}

impl fmt::Display for FillRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FillRole::Entry => write!(f, "entry"),
            FillRole::Exit => write!(f, "exit"),
        }
    }
}

/// One executed leg order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FillRecord {
    pub cycle_id: u64,
    pub leg: LegId,
    pub venue: String,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub role: FillRole,
    pub fee: Decimal,
    /// Entry fills carry only their fee; exits carry price difference less fee.
    pub realized_pnl: Decimal,
}

/// Sink for fills and finished cycles.
pub trait TradeLogger: Send + Sync {
    fn log_fill(&self, record: &FillRecord) -> Result<()>;

    fn export_cycle_metrics(&self, cycles: &[HedgeCycle]) -> Result<()>;
}

/// Log-only sink.
#[derive(Debug, Default)]
pub struct TracingTradeLogger;

impl TradeLogger for TracingTradeLogger {
    fn log_fill(&self, record: &FillRecord) -> Result<()> {
        info!(
            cycle_id = record.cycle_id,
            leg = %record.leg,
            venue = %record.venue,
            side = %record.side,
            price = %record.price,
            quantity = %record.quantity,
            role = %record.role,
            fee = %record.fee,
            realized_pnl = %record.realized_pnl,
            "Fill"
        );
        Ok(())
    }

    fn export_cycle_metrics(&self, cycles: &[HedgeCycle]) -> Result<()> {
        for cycle in cycles {
            info!(
                cycle_id = cycle.id,
                phase = %cycle.phase,
                direction = %cycle.direction,
                realized_pnl = %cycle.realized_pnl,
                fees = %cycle.fees,
                failure = cycle.failure.as_deref().unwrap_or("-"),
                "Cycle finished"
            );
        }
        Ok(())
    }
}

/// Aggregate over the journal, for the `status` command.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSummary {
    pub total_cycles: u64,
    pub flat_cycles: u64,
    pub halted_cycles: u64,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    pub fill_count: u64,
    pub last_finished: Option<DateTime<Utc>>,
}

/// SQLite-backed journal.
pub struct SqliteJournal {
    conn: Mutex<Connection>,
}

impl SqliteJournal {
    /// Open (or create) the journal at `db_path`. `":memory:"` gives a throwaway journal.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let journal = Self {
            conn: Mutex::new(conn),
        };
        journal.init_schema()?;

        info!("Trade journal initialized at {:?}", db_path.as_ref());
        Ok(journal)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            -- Safety counters (singleton row)
            CREATE TABLE IF NOT EXISTS safety_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                daily_pnl TEXT NOT NULL,
                reset_date TEXT NOT NULL,
                consecutive_failures INTEGER NOT NULL,
                total_pnl TEXT NOT NULL,
                last_saved TEXT NOT NULL
            );

            -- Fill history
            CREATE TABLE IF NOT EXISTS fills (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id INTEGER NOT NULL,
                leg TEXT NOT NULL,
                venue TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                side TEXT NOT NULL,
                price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                role TEXT NOT NULL,
                fee TEXT NOT NULL,
                realized_pnl TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_fills_timestamp ON fills(timestamp);

            -- Finished cycles
            CREATE TABLE IF NOT EXISTS cycles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id INTEGER NOT NULL,
                phase TEXT NOT NULL,
                direction TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                realized_pnl TEXT NOT NULL,
                fees TEXT NOT NULL,
                failure TEXT,
                detail TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cycles_started ON cycles(started_at);
            "#,
        )?;

        debug!("Journal schema initialized");
        Ok(())
    }

    pub fn save_safety_state(&self, state: &SafetyState) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO safety_state (id, daily_pnl, reset_date, consecutive_failures, total_pnl, last_saved)
            VALUES (1, ?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                daily_pnl = ?1,
                reset_date = ?2,
                consecutive_failures = ?3,
                total_pnl = ?4,
                last_saved = ?5
            "#,
            params![
                state.daily_pnl.to_string(),
                state.reset_date.to_string(),
                state.consecutive_failures,
                state.total_pnl.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!(daily_pnl = %state.daily_pnl, "Safety state saved");
        Ok(())
    }

    pub fn load_safety_state(&self) -> Result<Option<SafetyState>> {
        let row: Option<(String, String, u32, String)> = self
            .conn()
            .query_row(
                "SELECT daily_pnl, reset_date, consecutive_failures, total_pnl FROM safety_state WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((daily_pnl, reset_date, consecutive_failures, total_pnl)) = row else {
            return Ok(None);
        };

        let state = SafetyState {
            daily_pnl: Decimal::from_str(&daily_pnl)
                .with_context(|| format!("Corrupt daily_pnl in journal: {}", daily_pnl))?,
            reset_date: NaiveDate::from_str(&reset_date)
                .with_context(|| format!("Corrupt reset_date in journal: {}", reset_date))?,
            consecutive_failures,
            total_pnl: Decimal::from_str(&total_pnl)
                .with_context(|| format!("Corrupt total_pnl in journal: {}", total_pnl))?,
        };

        info!(
            daily_pnl = %state.daily_pnl,
            reset_date = %state.reset_date,
            consecutive_failures = state.consecutive_failures,
            "Loaded safety state from journal"
        );
        Ok(Some(state))
    }

    pub fn cycle_summary(&self) -> Result<CycleSummary> {
        let conn = self.conn();

        let mut stmt = conn.prepare("SELECT phase, realized_pnl, fees, finished_at FROM cycles")?;
        let rows: Vec<(String, String, String, Option<String>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
            .collect::<rusqlite::Result<_>>()?;

        let fill_count: u64 = conn.query_row("SELECT COUNT(*) FROM fills", [], |row| row.get(0))?;

        let mut summary = CycleSummary {
            total_cycles: rows.len() as u64,
            flat_cycles: 0,
            halted_cycles: 0,
            realized_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            fill_count,
            last_finished: None,
        };

        for (phase, pnl, fees, finished_at) in rows {
            if phase == CyclePhase::Flat.to_string() {
                summary.flat_cycles += 1;
            } else if phase == CyclePhase::Halted.to_string() {
                summary.halted_cycles += 1;
            }
            summary.realized_pnl += Decimal::from_str(&pnl)
                .with_context(|| format!("Corrupt realized_pnl in journal: {}", pnl))?;
            summary.fees += Decimal::from_str(&fees)
                .with_context(|| format!("Corrupt fees in journal: {}", fees))?;

            let finished = finished_at
                .map(|ts| {
                    DateTime::parse_from_rfc3339(&ts)
                        .with_context(|| format!("Corrupt finished_at in journal: {}", ts))
                })
                .transpose()?
                .map(|dt| dt.with_timezone(&Utc));
            if finished > summary.last_finished {
                summary.last_finished = finished;
            }
        }

        Ok(summary)
    }
}

impl TradeLogger for SqliteJournal {
    fn log_fill(&self, record: &FillRecord) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO fills (cycle_id, leg, venue, symbol, timestamp, side, price, quantity,
                               role, fee, realized_pnl)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.cycle_id,
                record.leg.to_string(),
                record.venue,
                record.symbol,
                record.timestamp.to_rfc3339(),
                record.side.to_string(),
                record.price.to_string(),
                record.quantity.to_string(),
                record.role.to_string(),
                record.fee.to_string(),
                record.realized_pnl.to_string(),
            ],
        )?;
        debug!(cycle_id = record.cycle_id, leg = %record.leg, role = %record.role, "Fill journaled");
        Ok(())
    }

    fn export_cycle_metrics(&self, cycles: &[HedgeCycle]) -> Result<()> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        for cycle in cycles {
            let detail = serde_json::to_string(cycle).context("Failed to serialize cycle")?;
            tx.execute(
                r#"
                INSERT INTO cycles (cycle_id, phase, direction, started_at, finished_at,
                                    realized_pnl, fees, failure, detail)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    cycle.id,
                    cycle.phase.to_string(),
                    cycle.direction.to_string(),
                    cycle.started_at.to_rfc3339(),
                    cycle.finished_at.map(|ts| ts.to_rfc3339()),
                    cycle.realized_pnl.to_string(),
                    cycle.fees.to_string(),
                    cycle.failure,
                    detail,
                ],
            )?;
        }

        tx.commit()?;
        debug!(count = cycles.len(), "Cycles journaled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::BuildDirection;
    use rust_decimal_macros::dec;

    fn fill(role: FillRole, pnl: Decimal) -> FillRecord {
        FillRecord {
            cycle_id: 1,
            leg: LegId::A,
            venue: "paper-a".into(),
            symbol: "ETH-PERP".into(),
            timestamp: Utc::now(),
            side: OrderSide::Buy,
            price: dec!(3001),
            quantity: dec!(0.1),
            role,
            fee: dec!(0.12),
            realized_pnl: pnl,
        }
    }

    fn finished_cycle(id: u64, phase: CyclePhase, pnl: Decimal) -> HedgeCycle {
        let mut cycle = HedgeCycle::new(id, BuildDirection::LongAShortB);
        cycle.phase = phase;
        cycle.realized_pnl = pnl;
        cycle.fees = dec!(0.24);
        cycle.finished_at = Some(Utc::now());
        cycle
    }

    #[test]
    fn test_safety_state_survives_reopen() {
        let journal = SqliteJournal::new(":memory:").unwrap();
        assert!(journal.load_safety_state().unwrap().is_none());

        let state = SafetyState {
            daily_pnl: dec!(-12.5),
            reset_date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            consecutive_failures: 2,
            total_pnl: dec!(-40),
        };
        journal.save_safety_state(&state).unwrap();
        assert_eq!(journal.load_safety_state().unwrap(), Some(state.clone()));

        let mut updated = state;
        updated.consecutive_failures = 0;
        journal.save_safety_state(&updated).unwrap();
        assert_eq!(journal.load_safety_state().unwrap().unwrap().consecutive_failures, 0);
    }

    #[test]
    fn test_corrupt_safety_state_is_an_error() {
        let journal = SqliteJournal::new(":memory:").unwrap();
        let state = SafetyState {
            daily_pnl: dec!(-60),
            reset_date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            consecutive_failures: 0,
            total_pnl: dec!(-60),
        };
        journal.save_safety_state(&state).unwrap();
        journal
            .conn()
            .execute("UPDATE safety_state SET daily_pnl = 'sixty' WHERE id = 1", [])
            .unwrap();

        // A zero in place of the unreadable loss would re-open trading
        let err = journal.load_safety_state().unwrap_err();
        assert!(err.to_string().contains("daily_pnl"));
    }

    #[test]
    fn test_corrupt_cycle_row_fails_summary() {
        let journal = SqliteJournal::new(":memory:").unwrap();
        journal
            .export_cycle_metrics(&[finished_cycle(1, CyclePhase::Flat, dec!(-0.44))])
            .unwrap();
        journal
            .conn()
            .execute("UPDATE cycles SET fees = '' WHERE cycle_id = 1", [])
            .unwrap();

        assert!(journal.cycle_summary().is_err());
    }

    #[test]
    fn test_cycle_summary() {
        let journal = SqliteJournal::new(":memory:").unwrap();
        journal.log_fill(&fill(FillRole::Entry, dec!(-0.12))).unwrap();
        journal.log_fill(&fill(FillRole::Exit, dec!(-0.32))).unwrap();
        journal
            .export_cycle_metrics(&[
                finished_cycle(1, CyclePhase::Flat, dec!(-0.44)),
                finished_cycle(2, CyclePhase::Halted, dec!(-1)),
            ])
            .unwrap();

        let summary = journal.cycle_summary().unwrap();
        assert_eq!(summary.total_cycles, 2);
        assert_eq!(summary.flat_cycles, 1);
        assert_eq!(summary.halted_cycles, 1);
        assert_eq!(summary.realized_pnl, dec!(-1.44));
        assert_eq!(summary.fees, dec!(0.48));
        assert_eq!(summary.fill_count, 2);
        assert!(summary.last_finished.is_some());
    }

    #[test]
    fn test_cycle_detail_is_json() {
        let journal = SqliteJournal::new(":memory:").unwrap();
        journal
            .export_cycle_metrics(&[finished_cycle(7, CyclePhase::Flat, dec!(0))])
            .unwrap();

        let detail: String = journal
            .conn()
            .query_row("SELECT detail FROM cycles WHERE cycle_id = 7", [], |row| row.get(0))
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&detail).unwrap();
        assert_eq!(value["phase"], "flat");
        assert_eq!(value["direction"], "long_a_short_b");
    }

    #[test]
    fn test_tracing_logger_accepts_everything() {
        let logger = TracingTradeLogger;
        assert!(logger.log_fill(&fill(FillRole::Entry, dec!(0))).is_ok());
        assert!(logger.export_cycle_metrics(&[finished_cycle(1, CyclePhase::Flat, dec!(0))]).is_ok());
    }
}
