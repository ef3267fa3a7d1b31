//! Run ledger: one record per sync run plus its failures (SQLite).

use crate::models::{SyncFailure, SyncRun};

mod repo;

pub use repo::SqliteLedger;

/// Result type used throughout the run ledger.
pub type LedgerResult<T> = anyhow::Result<T>;

/// Status of a run as stored in `sync_runs.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
        }
    }
}

/// Counters written when a run closes.
#[derive(Debug, Clone, Default)]
pub struct RunTotals {
    pub last_calendar_date: Option<i64>,
    pub instruments_synced: i32,
    pub rows_written: i64,
    pub failures: i32,
}

/// One failure, ready to be recorded.
#[derive(Debug, Clone)]
pub struct FailureEntry<'a> {
    pub phase: &'a str,
    pub table: &'a str,
    pub code: Option<&'a str>,
    pub kind: &'a str,
    pub message: &'a str,
}

/// Portable surface, SQLite implementation lives in `repo.rs`.
pub trait RunLedger {
    /// Opens a run in `running` state and returns its id.
    fn start_run(&self, conn: &mut diesel::SqliteConnection, started_at: &str) -> LedgerResult<i32>;

    /// Marks every run still `running` as `aborted`; returns how many were closed.
    ///
    /// A run left `running` belongs to a process that died before closing it.
    fn abort_stale(&self, conn: &mut diesel::SqliteConnection, finished_at: &str) -> LedgerResult<usize>;

    /// Closes a run with its final status and counters.
    fn finish_run(
        &self,
        conn: &mut diesel::SqliteConnection,
        run_id: i32,
        finished_at: &str,
        status: RunStatus,
        totals: &RunTotals,
    ) -> LedgerResult<()>;

    /// Appends one failure to a run.
    fn record_failure(
        &self,
        conn: &mut diesel::SqliteConnection,
        run_id: i32,
        occurred_at: &str,
        entry: &FailureEntry<'_>,
    ) -> LedgerResult<i32>;

    /// Most recent run, if any.
    fn last_run(&self, conn: &mut diesel::SqliteConnection) -> LedgerResult<Option<SyncRun>>;

    /// Failures of one run in insertion order.
    fn failures(&self, conn: &mut diesel::SqliteConnection, run_id: i32) -> LedgerResult<Vec<SyncFailure>>;
}
