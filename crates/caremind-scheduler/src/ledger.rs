//! Run ledger — append-only persistence for execution records.
//!
//! The ledger is the sole source of truth for "has this campaign
//! already fired in this period"; the scheduler keeps no in-memory
//! state, so a process restart can never double-fire within a period.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use caremind_core::error::{CaremindError, Result};

use crate::run::{PeriodKey, Run, RunStatus};

/// Append-only run storage with period-scoped queries.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Persist one run. Runs are never updated after creation.
    async fn record(&self, run: &Run) -> Result<()>;

    /// Whether any run (any status) exists for this campaign/period.
    async fn has_run(&self, campaign_id: &str, period: &PeriodKey) -> Result<bool>;

    /// All runs for a campaign/period, for the reporting layer.
    async fn runs_for_period(&self, campaign_id: &str, period: &PeriodKey) -> Result<Vec<Run>>;

    /// Delete runs recorded strictly before `cutoff`. Returns the
    /// number deleted. Callers must clamp `cutoff` so no run a current
    /// due-check could read is removed (see the retention sweep).
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// In-memory ledger for tests and embedded use.
#[derive(Default)]
pub struct MemoryRunLedger {
    runs: Mutex<Vec<Run>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every run, for assertions.
    pub fn all(&self) -> Vec<Run> {
        self.runs.lock().expect("ledger lock poisoned").clone()
    }
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn record(&self, run: &Run) -> Result<()> {
        self.runs
            .lock()
            .expect("ledger lock poisoned")
            .push(run.clone());
        Ok(())
    }

    async fn has_run(&self, campaign_id: &str, period: &PeriodKey) -> Result<bool> {
        Ok(self
            .runs
            .lock()
            .expect("ledger lock poisoned")
            .iter()
            .any(|r| r.campaign_id == campaign_id && r.period == *period))
    }

    async fn runs_for_period(&self, campaign_id: &str, period: &PeriodKey) -> Result<Vec<Run>> {
        Ok(self
            .runs
            .lock()
            .expect("ledger lock poisoned")
            .iter()
            .filter(|r| r.campaign_id == campaign_id && r.period == *period)
            .cloned()
            .collect())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut runs = self.runs.lock().expect("ledger lock poisoned");
        let before = runs.len();
        runs.retain(|r| r.at >= cutoff);
        Ok(before - runs.len())
    }
}

/// SQLite-backed ledger — survives restarts.
pub struct SqliteRunLedger {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteRunLedger {
    /// Open or create the ledger database.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| CaremindError::Storage(format!("DB open: {e}")))?;
        let ledger = Self { conn: Mutex::new(conn) };
        ledger.migrate()?;
        Ok(ledger)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .lock()
            .expect("ledger lock poisoned")
            .execute_batch(
                "
            -- Immutable dispatch records, one per recipient per period.
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                campaign_id TEXT NOT NULL,
                phone TEXT NOT NULL,
                at TEXT NOT NULL,
                period TEXT NOT NULL,           -- dedup key: local day or cron instant
                payload TEXT NOT NULL,           -- JSON: what was sent
                provider_response TEXT NOT NULL, -- raw provider blob
                status TEXT NOT NULL,            -- 'ok', 'error', 'skipped'
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_runs_campaign_period
                ON runs(campaign_id, period);
            CREATE INDEX IF NOT EXISTS idx_runs_at ON runs(at);
         ",
            )
            .map_err(|e| CaremindError::Storage(format!("Migration: {e}")))?;
        Ok(())
    }

    fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
        let at_str: String = row.get(3)?;
        let period_str: String = row.get(4)?;
        let payload_str: String = row.get(5)?;
        let response_str: String = row.get(6)?;
        let status_str: String = row.get(7)?;

        Ok(Run {
            id: row.get(0)?,
            campaign_id: row.get(1)?,
            phone: row.get(2)?,
            at: DateTime::parse_from_rfc3339(&at_str)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            period: PeriodKey::parse(&period_str)
                .unwrap_or(PeriodKey::Instant(DateTime::<Utc>::MIN_UTC)),
            payload: serde_json::from_str(&payload_str).unwrap_or_default(),
            provider_response: serde_json::from_str(&response_str).unwrap_or_default(),
            status: status_str.parse().unwrap_or(RunStatus::Error),
            error: row.get(8)?,
        })
    }
}

#[async_trait]
impl RunLedger for SqliteRunLedger {
    async fn record(&self, run: &Run) -> Result<()> {
        self.conn
            .lock()
            .expect("ledger lock poisoned")
            .execute(
                "INSERT INTO runs
                 (id, campaign_id, phone, at, period, payload, provider_response, status, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    run.id,
                    run.campaign_id,
                    run.phone,
                    run.at.to_rfc3339(),
                    run.period.as_string(),
                    run.payload.to_string(),
                    run.provider_response.to_string(),
                    run.status.as_str(),
                    run.error,
                ],
            )
            .map_err(|e| CaremindError::Storage(format!("Record run: {e}")))?;
        Ok(())
    }

    async fn has_run(&self, campaign_id: &str, period: &PeriodKey) -> Result<bool> {
        let count: i64 = self
            .conn
            .lock()
            .expect("ledger lock poisoned")
            .query_row(
                "SELECT COUNT(*) FROM runs WHERE campaign_id = ?1 AND period = ?2",
                rusqlite::params![campaign_id, period.as_string()],
                |row| row.get(0),
            )
            .map_err(|e| CaremindError::Storage(format!("Period query: {e}")))?;
        Ok(count > 0)
    }

    async fn runs_for_period(&self, campaign_id: &str, period: &PeriodKey) -> Result<Vec<Run>> {
        let conn = self.conn.lock().expect("ledger lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, campaign_id, phone, at, period, payload, provider_response, status, error
                 FROM runs WHERE campaign_id = ?1 AND period = ?2 ORDER BY at",
            )
            .map_err(|e| CaremindError::Storage(format!("Period query: {e}")))?;
        let rows = stmt
            .query_map(
                rusqlite::params![campaign_id, period.as_string()],
                Self::row_to_run,
            )
            .map_err(|e| CaremindError::Storage(format!("Period query: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let deleted = self
            .conn
            .lock()
            .expect("ledger lock poisoned")
            .execute(
                "DELETE FROM runs WHERE at < ?1",
                rusqlite::params![cutoff.to_rfc3339()],
            )
            .map_err(|e| CaremindError::Storage(format!("Prune runs: {e}")))?;
        Ok(deleted)
    }
}
