//! Phased synchronization run.
//!
//! ```text
//! INIT -> REFRESH_REFERENCE -> SYNC_SERIES -> DERIVE -> FINALIZE_KEYS -> DONE
//! ```
//!
//! - `INIT`: migrate the bookkeeping tables and open a run in the ledger. Failing here
//!   is the only way a run ends early.
//! - `REFRESH_REFERENCE`: rebuild the trading calendar, then replace every reference
//!   table. Fan-out tables issue one request per value through a bounded pool and
//!   keep the union of the parts that succeeded.
//! - `SYNC_SERIES`: per series table, per instrument of its universe: plan, fetch from
//!   the planned date, throttle, append, attach the key once the table has rows.
//! - `DERIVE`: recompute derived tables for every instrument of their source whose raw
//!   sync did not fail in this run.
//! - `FINALIZE_KEYS`: attach keys still missing on series and derived tables.
//!
//! Every instrument- or table-scoped failure is logged, recorded in the ledger and
//! reported; the run carries on. Provider calls never hold a database connection:
//! storage work runs on the blocking pool with a connection checked out per operation.

use std::{collections::HashSet, sync::Arc};

use futures::{StreamExt, stream};
use market_data_ingestor::{
    models::{request::QueryRequest, row_set::RowSet, trade_date::TradeDate},
    providers::{DataProvider, ProviderError},
};
use tracing::{debug, info, warn};

use crate::{
    calendar::CalendarTracker,
    catalog::{Catalog, DerivedTable, ReferenceTable, SeriesMode, SeriesTable},
    config::SyncConfig,
    db::migrate,
    derive::{DerivedSeries, DerivedSeriesComputer, series_for},
    error::{Phase, SyncError},
    ledger::{FailureEntry, RunLedger, RunStatus, RunTotals, SqliteLedger},
    planner::{FetchPlan, IncrementalFetchPlanner},
    report::{FailureRecord, SyncReport},
    storage::{ReadSpec, StorageError, StorageGateway, WriteMode},
    tz::{now_rfc3339, today_in},
};

/// Restricts a run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Tables to process; empty means all. The calendar is always refreshed.
    pub only: Vec<String>,
}

impl RunOptions {
    fn includes(&self, table: &str) -> bool {
        self.only.is_empty() || self.only.iter().any(|t| t.trim().eq_ignore_ascii_case(table))
    }
}

/// Mutable state of one run.
struct RunState {
    run_id: Option<i32>,
    report: SyncReport,
    /// (series table, code) pairs whose raw sync failed.
    failed: HashSet<(String, String)>,
    /// Tables whose key step already failed in this run.
    key_failed: HashSet<String>,
}

impl RunState {
    fn series_failed(&self, table: &str, code: &str) -> bool {
        self.failed.contains(&(table.to_string(), code.to_string()))
    }
}

/// Result of syncing one instrument.
enum Synced {
    UpToDate,
    Rows(usize),
}

pub struct SyncOrchestrator {
    storage: StorageGateway,
    provider: Arc<dyn DataProvider>,
    catalog: Arc<Catalog>,
    config: Arc<SyncConfig>,
    calendar: CalendarTracker,
    planner: IncrementalFetchPlanner,
    computer: DerivedSeriesComputer,
    ledger: SqliteLedger,
}

impl SyncOrchestrator {
    /// Opens the database named by `config`, sized for the largest worker pool.
    pub fn open(
        config: SyncConfig,
        catalog: Catalog,
        provider: Arc<dyn DataProvider>,
    ) -> Result<Self, SyncError> {
        let pool_size = u32::try_from(catalog.max_workers() + 1).unwrap_or(u32::MAX);
        let storage = StorageGateway::connect(&config.database_url, pool_size).map_err(|e| {
            SyncError::Init {
                message: format!("open {}: {e}", config.database_url),
            }
        })?;
        Self::new(storage, config, catalog, provider)
    }

    /// Builds an orchestrator on an existing gateway and applies pending migrations.
    pub fn new(
        storage: StorageGateway,
        config: SyncConfig,
        catalog: Catalog,
        provider: Arc<dyn DataProvider>,
    ) -> Result<Self, SyncError> {
        let mut conn = storage.conn().map_err(|e| SyncError::Init {
            message: e.to_string(),
        })?;
        migrate::run_pending(&mut *conn).map_err(|e| SyncError::Init {
            message: format!("{e:#}"),
        })?;
        drop(conn);

        let calendar = CalendarTracker::new(
            storage.clone(),
            &catalog.calendar,
            config.calendar.exchange.clone(),
        );
        let planner = IncrementalFetchPlanner::new(storage.clone(), calendar.clone(), config.epoch);
        let computer = DerivedSeriesComputer::new(storage.clone(), catalog.types.clone());
        Ok(Self {
            storage,
            provider,
            catalog: Arc::new(catalog),
            config: Arc::new(config),
            calendar,
            planner,
            computer,
            ledger: SqliteLedger::new(),
        })
    }

    pub fn storage(&self) -> &StorageGateway {
        &self.storage
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn calendar(&self) -> &CalendarTracker {
        &self.calendar
    }

    /// Runs every phase once.
    pub async fn run(&self, opts: &RunOptions) -> Result<SyncReport, SyncError> {
        let today = self
            .config
            .timezone()
            .map(today_in)
            .map_err(|e| SyncError::Init {
                message: format!("{e:#}"),
            })?;
        self.run_until(opts, today).await
    }

    /// Runs every phase once with `today` as the calendar's upper bound.
    pub async fn run_until(&self, opts: &RunOptions, today: TradeDate) -> Result<SyncReport, SyncError> {
        let started_at = now_rfc3339();
        info!(phase = %Phase::Init, %today, "sync run starting");
        let stamp = started_at.clone();
        let run_id = self
            .with_ledger(move |ledger, conn| {
                let aborted = ledger.abort_stale(conn, &stamp)?;
                if aborted > 0 {
                    warn!(aborted, "previous runs never finished; marked aborted");
                }
                ledger.start_run(conn, &stamp)
            })
            .await
            .map_err(|e| SyncError::Init {
                message: format!("open run: {e:#}"),
            })?;

        let mut state = RunState {
            run_id: Some(run_id),
            report: SyncReport {
                run_id: Some(run_id),
                started_at,
                ..SyncReport::default()
            },
            failed: HashSet::new(),
            key_failed: HashSet::new(),
        };
        if let Ok(Some(last)) = self.last_calendar_date().await {
            info!(last_calendar_date = %last, "previous calendar");
        }

        info!(phase = %Phase::RefreshReference, "refreshing calendar and reference tables");
        if let Err(err) = self
            .calendar
            .refresh(self.provider.as_ref(), self.config.epoch, today)
            .await
        {
            self.fail(&mut state, Phase::RefreshReference, err).await;
        }
        for table in self.catalog.reference.iter().filter(|t| opts.includes(&t.table)) {
            self.refresh_reference(table, &mut state).await;
        }

        info!(phase = %Phase::SyncSeries, "syncing series tables");
        for table in self.catalog.series.iter().filter(|t| opts.includes(&t.table)) {
            self.sync_series(table, &mut state).await;
        }

        info!(phase = %Phase::Derive, "computing derived tables");
        for table in self.catalog.derived.iter().filter(|t| opts.includes(&t.table)) {
            self.derive_table(table, &mut state).await;
        }

        info!(phase = %Phase::FinalizeKeys, "attaching missing keys");
        let keyed: Vec<(String, Vec<String>)> = self
            .catalog
            .series
            .iter()
            .filter(|t| opts.includes(&t.table))
            .map(|t| (t.table.clone(), t.key()))
            .chain(
                self.catalog
                    .derived
                    .iter()
                    .filter(|t| opts.includes(&t.table))
                    .map(|t| (t.table.clone(), self.computer.schema().key)),
            )
            .collect();
        for (table, key) in keyed {
            self.ensure_key(&table, key, Phase::FinalizeKeys, &mut state).await;
        }

        state.report.last_calendar_date = match self.last_calendar_date().await {
            Ok(last) => last.map(TradeDate::to_int),
            Err(e) => {
                warn!(error = %e, "cannot read calendar");
                None
            }
        };
        let finished_at = now_rfc3339();
        state.report.finished_at = Some(finished_at.clone());
        let totals = RunTotals {
            last_calendar_date: state.report.last_calendar_date,
            instruments_synced: i32::try_from(state.report.instruments_synced()).unwrap_or(i32::MAX),
            rows_written: i64::try_from(state.report.rows_written()).unwrap_or(i64::MAX),
            failures: i32::try_from(state.report.failures.len()).unwrap_or(i32::MAX),
        };
        if let Err(e) = self
            .with_ledger(move |ledger, conn| {
                ledger.finish_run(conn, run_id, &finished_at, RunStatus::Completed, &totals)
            })
            .await
        {
            warn!(run_id, error = %format!("{e:#}"), "cannot close run");
        }

        info!(
            phase = %Phase::Done,
            run_id,
            last_calendar_date = ?state.report.last_calendar_date,
            rows = state.report.rows_written(),
            failures = state.report.failures.len(),
            "sync run finished"
        );
        Ok(state.report)
    }

    /// What the planner would do for `code` in series `table`.
    pub async fn plan(&self, table: &str, code: &str) -> Result<FetchPlan, SyncError> {
        let series = self.series_table(table)?;
        let planner = self.planner.clone();
        let code = code.to_string();
        let err_code = code.clone();
        self.storage
            .blocking(move |_| planner.plan(&series, &code))
            .await
            .map_err(|e| SyncError::storage(table, Some(&err_code), e))
    }

    /// Recomputes every derived table for one instrument.
    pub async fn derive_code(&self, code: &str) -> Vec<(String, Result<usize, SyncError>)> {
        let mut out = Vec::new();
        for table in &self.catalog.derived {
            let result = match self.catalog.series(&table.source) {
                Some(source) => {
                    let series: Arc<dyn DerivedSeries> = Arc::from(self.indicator(table));
                    self.derive_one(table.clone(), series, source.clone(), code.to_string())
                        .await
                }
                None => Err(SyncError::Derive {
                    table: table.table.clone(),
                    code: code.to_string(),
                    message: format!("unknown source {}", table.source),
                }),
            };
            out.push((table.table.clone(), result));
        }
        out
    }

    /// Drops a catalog table so the next run rebuilds it from the epoch.
    pub async fn reset(&self, table: &str) -> Result<(), SyncError> {
        let name = table.trim().to_lowercase();
        if !self.catalog.table_names().contains(&name.as_str()) {
            return Err(SyncError::Write {
                table: name.clone(),
                code: None,
                source: StorageError::schema(&name, "not a catalog table"),
            });
        }
        let target = name.clone();
        self.storage
            .blocking(move |s| s.drop_table(&target))
            .await
            .map_err(|e| SyncError::storage(&name, None, e))?;
        info!(table = %name, "table dropped");
        Ok(())
    }

    fn series_table(&self, table: &str) -> Result<SeriesTable, SyncError> {
        self.catalog.series(table).cloned().ok_or_else(|| SyncError::Write {
            table: table.to_string(),
            code: None,
            source: StorageError::schema(table, "not a series table"),
        })
    }

    async fn last_calendar_date(&self) -> Result<Option<TradeDate>, StorageError> {
        let calendar = self.calendar.clone();
        self.storage.blocking(move |_| calendar.last_date()).await
    }

    fn indicator(&self, table: &DerivedTable) -> Box<dyn DerivedSeries> {
        series_for(table.kind, &self.config.macd, &self.config.moving_average)
    }

    async fn with_ledger<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        F: FnOnce(&SqliteLedger, &mut diesel::SqliteConnection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.storage.clone();
        let ledger = self.ledger;
        tokio::task::spawn_blocking(move || {
            let mut conn = storage.conn()?;
            op(&ledger, &mut *conn)
        })
        .await?
    }

    /// Logs, reports and records one failure.
    async fn fail(&self, state: &mut RunState, phase: Phase, err: SyncError) {
        warn!(%phase, kind = %err.kind(), table = ?err.table(), code = ?err.code(), error = %err, "failure");
        let record = FailureRecord::new(phase, &err);
        if let Some(table) = &record.table {
            state.report.table_mut(table).failed += 1;
        }
        if let Some(run_id) = state.run_id {
            let entry = record.clone();
            let result = self
                .with_ledger(move |ledger, conn| {
                    ledger.record_failure(
                        conn,
                        run_id,
                        &now_rfc3339(),
                        &FailureEntry {
                            phase: entry.phase.as_str(),
                            table: entry.table.as_deref().unwrap_or(""),
                            code: entry.code.as_deref(),
                            kind: entry.kind.as_str(),
                            message: &entry.message,
                        },
                    )
                })
                .await;
            if let Err(e) = result {
                warn!(run_id, error = %format!("{e:#}"), "cannot record failure");
            }
        }
        state.report.failures.push(record);
    }

    /// Attaches `key` to `table` when the table exists without one.
    async fn ensure_key(&self, table: &str, key: Vec<String>, phase: Phase, state: &mut RunState) {
        if key.is_empty() || state.key_failed.contains(table) {
            return;
        }
        let target = table.to_string();
        let result = self
            .storage
            .blocking(move |s| {
                if !s.table_exists(&target)? || s.primary_key_exists(&target)? {
                    return Ok(false);
                }
                s.add_primary_key(&target, &key)?;
                Ok(true)
            })
            .await;
        match result {
            Ok(true) => info!(table, "primary key attached"),
            Ok(false) => {}
            Err(e) => {
                state.key_failed.insert(table.to_string());
                self.fail(state, phase, SyncError::storage(table, None, e)).await;
            }
        }
    }

    /// Distinct non-null values of `table.column`, sorted.
    async fn distinct_values(&self, table: &str, column: &str) -> Result<Vec<String>, StorageError> {
        let (table, column) = (table.to_string(), column.to_string());
        self.storage
            .blocking(move |s| {
                if !s.table_exists(&table)? {
                    return Err(StorageError::schema(&table, "table does not exist"));
                }
                let rows = s.read(&table, &ReadSpec::all().columns([column.clone()]).distinct())?;
                let mut values = rows.distinct_strings(&column);
                values.sort();
                Ok(values)
            })
            .await
    }

    async fn query_throttled(
        &self,
        request: QueryRequest,
        delay: std::time::Duration,
    ) -> Result<RowSet, ProviderError> {
        debug!(%request, "query");
        let result = self.provider.query(request).await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn refresh_reference(&self, table: &ReferenceTable, state: &mut RunState) {
        let mut base = QueryRequest::new(table.api.clone()).with_fields(table.fields.clone());
        for (k, v) in &table.params {
            base = base.param(k.clone(), v.clone());
        }
        if table.since_epoch {
            base = base.param("start_date", self.config.epoch.to_string());
        }

        let parts: Vec<(Option<String>, QueryRequest)> = match &table.fan_out {
            None => vec![(None, base)],
            Some(fan) => {
                let values = match &fan.from {
                    Some(from) => match self.distinct_values(&from.table, &from.column).await {
                        Ok(values) => values,
                        Err(e) => {
                            let err = SyncError::storage(&table.table, None, e);
                            self.fail(state, Phase::RefreshReference, err).await;
                            return;
                        }
                    },
                    None => fan.values.clone(),
                };
                values
                    .into_iter()
                    .map(|v| (Some(v.clone()), base.clone().param(fan.param.clone(), v)))
                    .collect()
            }
        };
        let total = parts.len();
        let delay = table.delay();

        let mut results = stream::iter(parts)
            .map(|(part, request)| async move { (part, self.query_throttled(request, delay).await) })
            .buffer_unordered(table.workers);

        let mut union = RowSet::default();
        let mut ok_parts = 0;
        while let Some((part, result)) = results.next().await {
            match result {
                Ok(rows) => {
                    ok_parts += 1;
                    union.extend(rows);
                }
                Err(e) => {
                    let err = SyncError::fetch(&table.table, part.as_deref(), e);
                    self.fail(state, Phase::RefreshReference, err).await;
                }
            }
        }
        drop(results);
        state.report.table_mut(&table.table).synced += ok_parts;

        if ok_parts == 0 && total > 0 {
            warn!(table = %table.table, "every request failed; previous contents kept");
            return;
        }
        if union.is_empty() {
            warn!(table = %table.table, "provider returned no rows; previous contents kept");
            return;
        }

        let rows = union.len();
        let name = table.table.clone();
        let schema = self.catalog.schema_for(table.key.clone());
        let result = self
            .storage
            .blocking(move |s| s.write(&name, &union, WriteMode::Replace, &schema))
            .await;
        match result {
            Ok(written) => {
                state.report.table_mut(&table.table).rows_written += written;
                info!(table = %table.table, rows, parts = total, ok_parts, "reference table replaced");
                self.ensure_key(&table.table, table.key.clone(), Phase::RefreshReference, state)
                    .await;
            }
            Err(e) => {
                let err = SyncError::storage(&table.table, None, e);
                self.fail(state, Phase::RefreshReference, err).await;
            }
        }
    }

    async fn sync_series(&self, table: &SeriesTable, state: &mut RunState) {
        let codes = match self
            .distinct_values(&table.universe.table, &table.universe.column)
            .await
        {
            Ok(codes) => codes,
            Err(e) => {
                let err = SyncError::storage(&table.table, None, e);
                self.fail(state, Phase::SyncSeries, err).await;
                return;
            }
        };
        info!(table = %table.table, instruments = codes.len(), workers = table.workers, "series sync");

        let mut results = stream::iter(codes)
            .map(|code| async move {
                let result = self.sync_instrument(table, &code).await;
                (code, result)
            })
            .buffer_unordered(table.workers);

        while let Some((code, result)) = results.next().await {
            match result {
                Ok(Synced::UpToDate) => state.report.table_mut(&table.table).skipped += 1,
                Ok(Synced::Rows(rows)) => {
                    let stats = state.report.table_mut(&table.table);
                    stats.synced += 1;
                    stats.rows_written += rows;
                }
                Err(err) => {
                    state.failed.insert((table.table.clone(), code));
                    self.fail(state, Phase::SyncSeries, err).await;
                }
            }
        }
        drop(results);
        self.ensure_key(&table.table, table.key(), Phase::SyncSeries, state).await;
    }

    async fn sync_instrument(&self, table: &SeriesTable, code: &str) -> Result<Synced, SyncError> {
        let plan = {
            let planner = self.planner.clone();
            let (series, owned) = (table.clone(), code.to_string());
            self.storage
                .blocking(move |_| planner.plan(&series, &owned))
                .await
                .map_err(|e| SyncError::storage(&table.table, Some(code), e))?
        };
        let FetchPlan::Fetch { start, fresh_table } = plan else {
            debug!(table = %table.table, code, "up to date");
            return Ok(Synced::UpToDate);
        };

        let mut request = QueryRequest::new(table.api.clone()).with_fields(table.fields.clone());
        for (k, v) in &table.params {
            request = request.param(k.clone(), v.clone());
        }
        request = request
            .param(table.code_column.clone(), code)
            .param("start_date", start.to_string());
        let rows = self
            .query_throttled(request, table.delay())
            .await
            .map_err(|e| SyncError::fetch(&table.table, Some(code), e))?;
        if rows.is_empty() {
            debug!(table = %table.table, code, %start, "no new rows");
            return Ok(Synced::Rows(0));
        }

        let mode = match table.mode {
            SeriesMode::Append => WriteMode::Append,
            SeriesMode::AppendDistinct => WriteMode::AppendDistinct,
        };
        let schema = self.catalog.schema_for(table.key());
        let name = table.table.clone();
        let written = self
            .storage
            .blocking(move |s| s.write(&name, &rows, mode, &schema))
            .await
            .map_err(|e| SyncError::storage(&table.table, Some(code), e))?;
        debug!(table = %table.table, code, %start, fresh_table, written, "rows appended");
        Ok(Synced::Rows(written))
    }

    async fn derive_table(&self, table: &DerivedTable, state: &mut RunState) {
        let Some(source) = self.catalog.series(&table.source) else {
            return;
        };
        let codes = {
            let computer = self.computer.clone();
            let source = source.clone();
            self.storage.blocking(move |_| computer.codes(&source)).await
        };
        let codes = match codes {
            Ok(codes) => codes,
            Err(e) => {
                let err = SyncError::storage(&table.table, None, e);
                self.fail(state, Phase::Derive, err).await;
                return;
            }
        };
        let (eligible, skipped): (Vec<String>, Vec<String>) = codes
            .into_iter()
            .partition(|code| !state.series_failed(&source.table, code));
        if !skipped.is_empty() {
            info!(table = %table.table, skipped = skipped.len(), "instruments with failed raw sync skipped");
        }
        state.report.table_mut(&table.table).skipped += skipped.len();

        let series: Arc<dyn DerivedSeries> = Arc::from(self.indicator(table));
        info!(table = %table.table, indicator = series.name(), instruments = eligible.len(), "deriving");
        let mut results = stream::iter(eligible)
            .map(|code| {
                let series = Arc::clone(&series);
                async move {
                    let result = self
                        .derive_one(table.clone(), series, source.clone(), code.clone())
                        .await;
                    (code, result)
                }
            })
            .buffer_unordered(table.workers);

        while let Some((_code, result)) = results.next().await {
            match result {
                Ok(rows) => {
                    let stats = state.report.table_mut(&table.table);
                    stats.synced += 1;
                    stats.rows_written += rows;
                }
                Err(err) => self.fail(state, Phase::Derive, err).await,
            }
        }
        drop(results);
        self.ensure_key(&table.table, self.computer.schema().key, Phase::Derive, state)
            .await;
    }

    async fn derive_one(
        &self,
        table: DerivedTable,
        series: Arc<dyn DerivedSeries>,
        source: SeriesTable,
        code: String,
    ) -> Result<usize, SyncError> {
        let computer = self.computer.clone();
        let (name, err_code) = (table.table.clone(), code.clone());
        tokio::task::spawn_blocking(move || {
            computer.compute_for(&table, series.as_ref(), &source, &code)
        })
        .await
        .map_err(|e| SyncError::Derive {
            table: name,
            code: err_code,
            message: e.to_string(),
        })?
    }
}
