//! Diesel models mapping to the bookkeeping schema.
//!
//! These types mirror the tables defined in the embedded migrations and in
//! [`crate::schema`]:
//! - [`crate::schema::sync_runs`]: one row per orchestrator run
//! - [`crate::schema::sync_failures`]: every failure caught during a run

use diesel::prelude::*;
use serde::Serialize;

use crate::schema::*;

/// A row in [`crate::schema::sync_runs`].
#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize)]
#[diesel(table_name = sync_runs, check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncRun {
    /// Database primary key (SQLite INTEGER PRIMARY KEY rowid).
    pub id: i32,
    /// Start time in RFC3339 UTC.
    pub started_at: String,
    /// Finish time in RFC3339 UTC; NULL while running or after a crash.
    pub finished_at: Option<String>,
    /// One of `running`, `completed`, `aborted`.
    pub status: String,
    /// Newest trading day known to the calendar when the run finished.
    pub last_calendar_date: Option<i64>,
    /// Instruments for which new rows were fetched.
    pub instruments_synced: i32,
    /// Rows written across series and derived tables.
    pub rows_written: i64,
    /// Number of failures recorded for the run.
    pub failures: i32,
}

/// Insertable form of [`SyncRun`] for opening a run.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = sync_runs)]
pub struct NewSyncRun<'a> {
    pub started_at: &'a str,
    pub status: &'a str,
}

/// Counters written when a run closes.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = sync_runs)]
pub struct FinishSyncRun<'a> {
    pub finished_at: &'a str,
    pub status: &'a str,
    pub last_calendar_date: Option<i64>,
    pub instruments_synced: i32,
    pub rows_written: i64,
    pub failures: i32,
}

/// A row in [`crate::schema::sync_failures`].
#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Associations, Serialize)]
#[diesel(table_name = sync_failures, belongs_to(SyncRun, foreign_key = run_id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncFailure {
    pub id: i32,
    pub run_id: i32,
    /// Phase name, e.g. `SYNC_SERIES`.
    pub phase: String,
    pub table_name: String,
    /// Instrument code; NULL for table-level failures.
    pub code: Option<String>,
    /// `fetch`, `write`, `key_violation` or `derive`.
    pub kind: String,
    pub message: String,
    pub occurred_at: String,
}

/// Insertable form of [`SyncFailure`].
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = sync_failures)]
pub struct NewSyncFailure<'a> {
    pub run_id: i32,
    pub phase: &'a str,
    pub table_name: &'a str,
    pub code: Option<&'a str>,
    pub kind: &'a str,
    pub message: &'a str,
    pub occurred_at: &'a str,
}
