//! Summary of one sync run, returned by the orchestrator and printed by the CLI.

use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;

use crate::error::{FailureKind, Phase, SyncError};

/// Counters for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableStats {
    /// Instruments (or fan-out parts) processed without error.
    pub synced: usize,
    /// Instruments already up to date.
    pub skipped: usize,
    pub failed: usize,
    pub rows_written: usize,
}

/// One failure as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub phase: Phase,
    pub table: Option<String>,
    pub code: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

impl FailureRecord {
    pub fn new(phase: Phase, err: &SyncError) -> Self {
        Self {
            phase,
            table: err.table().map(str::to_string),
            code: err.code().map(str::to_string),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub run_id: Option<i32>,
    pub started_at: String,
    pub finished_at: Option<String>,
    /// Newest trading day in the calendar at the end of the run.
    pub last_calendar_date: Option<i64>,
    pub tables: IndexMap<String, TableStats>,
    pub failures: Vec<FailureRecord>,
}

impl SyncReport {
    pub fn table_mut(&mut self, table: &str) -> &mut TableStats {
        self.tables.entry(table.to_string()).or_default()
    }

    pub fn rows_written(&self) -> usize {
        self.tables.values().map(|t| t.rows_written).sum()
    }

    pub fn instruments_synced(&self) -> usize {
        self.tables.values().map(|t| t.synced).sum()
    }

    pub fn failures_in(&self, table: &str) -> impl Iterator<Item = &FailureRecord> {
        self.failures
            .iter()
            .filter(move |f| f.table.as_deref() == Some(table))
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_calendar_date {
            Some(date) => writeln!(f, "LAST UPDATE: {date}")?,
            None => writeln!(f, "LAST UPDATE: none")?,
        }
        for (table, stats) in &self.tables {
            writeln!(
                f,
                "  {table:<20} synced={:<6} skipped={:<6} failed={:<4} rows={}",
                stats.synced, stats.skipped, stats.failed, stats.rows_written
            )?;
        }
        if !self.failures.is_empty() {
            writeln!(f, "failures: {}", self.failures.len())?;
            for failure in &self.failures {
                writeln!(f, "  [{}] {}", failure.phase, failure.message)?;
            }
        }
        Ok(())
    }
}
