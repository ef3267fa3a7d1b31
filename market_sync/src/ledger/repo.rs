use anyhow::Context;
use diesel::prelude::*;

use crate::{
    ledger::{FailureEntry, LedgerResult, RunLedger, RunStatus, RunTotals},
    models::{FinishSyncRun, NewSyncFailure, NewSyncRun, SyncFailure, SyncRun},
    schema::{sync_failures, sync_runs},
};

/// Run ledger stored in the `sync_runs` / `sync_failures` tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteLedger;

impl SqliteLedger {
    pub fn new() -> Self {
        Self
    }
}

impl RunLedger for SqliteLedger {
    fn start_run(&self, conn: &mut SqliteConnection, started_at: &str) -> LedgerResult<i32> {
        let row = NewSyncRun {
            started_at,
            status: RunStatus::Running.as_str(),
        };
        // INSERT .. RETURNING id (Sqlite 3.35+)
        let id = diesel::insert_into(sync_runs::table)
            .values(&row)
            .returning(sync_runs::id)
            .get_result(conn)?;
        Ok(id)
    }

    fn abort_stale(&self, conn: &mut SqliteConnection, finished_at: &str) -> LedgerResult<usize> {
        let closed = diesel::update(
            sync_runs::table.filter(sync_runs::status.eq(RunStatus::Running.as_str())),
        )
        .set((
            sync_runs::status.eq(RunStatus::Aborted.as_str()),
            sync_runs::finished_at.eq(Some(finished_at)),
        ))
        .execute(conn)?;
        Ok(closed)
    }

    fn finish_run(
        &self,
        conn: &mut SqliteConnection,
        run_id: i32,
        finished_at: &str,
        status: RunStatus,
        totals: &RunTotals,
    ) -> LedgerResult<()> {
        let changes = FinishSyncRun {
            finished_at,
            status: status.as_str(),
            last_calendar_date: totals.last_calendar_date,
            instruments_synced: totals.instruments_synced,
            rows_written: totals.rows_written,
            failures: totals.failures,
        };
        let updated = diesel::update(sync_runs::table.find(run_id))
            .set(&changes)
            .execute(conn)?;
        if updated == 0 {
            anyhow::bail!("sync run {run_id} not found");
        }
        Ok(())
    }

    fn record_failure(
        &self,
        conn: &mut SqliteConnection,
        run_id: i32,
        occurred_at: &str,
        entry: &FailureEntry<'_>,
    ) -> LedgerResult<i32> {
        let row = NewSyncFailure {
            run_id,
            phase: entry.phase,
            table_name: entry.table,
            code: entry.code,
            kind: entry.kind,
            message: entry.message,
            occurred_at,
        };
        let id = diesel::insert_into(sync_failures::table)
            .values(&row)
            .returning(sync_failures::id)
            .get_result(conn)
            .with_context(|| format!("record failure for run {run_id}"))?;
        Ok(id)
    }

    fn last_run(&self, conn: &mut SqliteConnection) -> LedgerResult<Option<SyncRun>> {
        let run = sync_runs::table
            .order(sync_runs::id.desc())
            .select(SyncRun::as_select())
            .first(conn)
            .optional()?;
        Ok(run)
    }

    fn failures(&self, conn: &mut SqliteConnection, run_id: i32) -> LedgerResult<Vec<SyncFailure>> {
        let rows = sync_failures::table
            .filter(sync_failures::run_id.eq(run_id))
            .order(sync_failures::id.asc())
            .select(SyncFailure::as_select())
            .load(conn)?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate;

    fn conn() -> (tempfile::TempDir, SqliteConnection) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let path = path.to_str().unwrap();
        migrate::run_sqlite(path).unwrap();
        (dir, SqliteConnection::establish(path).unwrap())
    }

    #[test]
    fn run_lifecycle_round_trip() {
        let (_dir, mut conn) = conn();
        let ledger = SqliteLedger::new();
        assert!(ledger.last_run(&mut conn).unwrap().is_none());

        let id = ledger.start_run(&mut conn, "2024-01-02T01:00:00.000Z").unwrap();
        ledger
            .record_failure(
                &mut conn,
                id,
                "2024-01-02T01:00:05.000Z",
                &FailureEntry {
                    phase: "SYNC_SERIES",
                    table: "stock_daily",
                    code: Some("000002.SZ"),
                    kind: "fetch",
                    message: "timeout",
                },
            )
            .unwrap();
        ledger
            .finish_run(
                &mut conn,
                id,
                "2024-01-02T01:10:00.000Z",
                RunStatus::Completed,
                &RunTotals {
                    last_calendar_date: Some(20240102),
                    instruments_synced: 2,
                    rows_written: 10,
                    failures: 1,
                },
            )
            .unwrap();

        let run = ledger.last_run(&mut conn).unwrap().unwrap();
        assert_eq!(run.id, id);
        assert_eq!(run.status, "completed");
        assert_eq!(run.last_calendar_date, Some(20240102));

        let failures = ledger.failures(&mut conn, id).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].code.as_deref(), Some("000002.SZ"));
    }

    #[test]
    fn stale_running_runs_are_aborted() {
        let (_dir, mut conn) = conn();
        let ledger = SqliteLedger::new();
        let crashed = ledger.start_run(&mut conn, "2024-01-02T01:00:00.000Z").unwrap();
        let done = ledger.start_run(&mut conn, "2024-01-03T01:00:00.000Z").unwrap();
        ledger
            .finish_run(
                &mut conn,
                done,
                "2024-01-03T01:05:00.000Z",
                RunStatus::Completed,
                &RunTotals::default(),
            )
            .unwrap();

        assert_eq!(ledger.abort_stale(&mut conn, "2024-01-04T01:00:00.000Z").unwrap(), 1);
        assert_eq!(ledger.abort_stale(&mut conn, "2024-01-04T01:00:00.000Z").unwrap(), 0);

        let run: SyncRun = sync_runs::table
            .find(crashed)
            .select(SyncRun::as_select())
            .first(&mut conn)
            .unwrap();
        assert_eq!(run.status, "aborted");
        assert_eq!(run.finished_at.as_deref(), Some("2024-01-04T01:00:00.000Z"));
        assert_eq!(ledger.last_run(&mut conn).unwrap().unwrap().status, "completed");
    }

    #[test]
    fn finishing_unknown_run_errors() {
        let (_dir, mut conn) = conn();
        let err = SqliteLedger::new()
            .finish_run(&mut conn, 42, "x", RunStatus::Aborted, &RunTotals::default())
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
