//! Trading calendar tracking.
//!
//! The calendar table (`trade_cal.cal_date` by default) holds every open trading day
//! from the epoch to today. It is rebuilt from the provider at the start of each run
//! and bounds every "what is new" question the planner asks.

use market_data_ingestor::{
    models::{row_set::RowSet, trade_date::TradeDate},
    providers::DataProvider,
};
use serde_json::json;
use tracing::{info, warn};

use crate::{
    catalog::{SeriesTable, config::CalendarCfg},
    error::SyncError,
    storage::{
        ColumnType, SqlValue, StorageError, StorageGateway, TableSchema, WriteMode,
        value::quote_ident,
    },
};

#[derive(Clone)]
pub struct CalendarTracker {
    storage: StorageGateway,
    table: String,
    column: String,
    exchange: String,
}

impl CalendarTracker {
    pub fn new(storage: StorageGateway, cfg: &CalendarCfg, exchange: impl Into<String>) -> Self {
        Self {
            storage,
            table: cfg.table.clone(),
            column: cfg.column.clone(),
            exchange: exchange.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Replaces the calendar with the open days of `[start, today]`.
    ///
    /// An empty provider answer leaves the stored calendar untouched.
    pub async fn refresh(
        &self,
        provider: &dyn DataProvider,
        start: TradeDate,
        today: TradeDate,
    ) -> Result<Vec<TradeDate>, SyncError> {
        let dates = provider
            .trading_calendar(&self.exchange, start, today)
            .await
            .map_err(|e| SyncError::fetch(&self.table, None, e))?;
        if dates.is_empty() {
            warn!(table = %self.table, %start, %today, "provider returned no trading days; calendar kept");
            return Ok(dates);
        }

        let mut rows = RowSet::new([self.column.clone()]);
        for date in &dates {
            rows.push(vec![json!(date.to_int())]);
        }
        let table = self.table.clone();
        let column = self.column.clone();
        self.storage
            .blocking(move |storage| {
                let schema = TableSchema::default().pin(column.clone(), ColumnType::Integer);
                storage.write(&table, &rows, WriteMode::Replace, &schema)?;
                storage.add_primary_key(&table, &[column])
            })
            .await
            .map_err(|e| SyncError::storage(&self.table, None, e))?;

        info!(
            table = %self.table,
            exchange = %self.exchange,
            days = dates.len(),
            first = %dates[0],
            last = %dates[dates.len() - 1],
            "calendar refreshed"
        );
        Ok(dates)
    }

    /// Earliest calendar day after `after` that `series` does not hold for `code`.
    ///
    /// `None` means the instrument is caught up with the calendar.
    pub fn next_date_after(
        &self,
        series: &SeriesTable,
        code: &str,
        after: i64,
    ) -> Result<Option<TradeDate>, StorageError> {
        if !self.storage.table_exists(&self.table)? {
            return Ok(None);
        }
        let cal = quote_ident(&self.column);
        let mut sql = format!(
            "SELECT CAST(MIN(c.{cal}) AS INTEGER) AS value FROM {} AS c WHERE c.{cal} > ?",
            quote_ident(&self.table)
        );
        let mut binds = vec![SqlValue::Integer(after)];
        if self.storage.table_exists(&series.table)? {
            sql.push_str(&format!(
                " AND c.{cal} NOT IN (SELECT s.{date} FROM {series} AS s \
                 WHERE s.{code} = ? AND s.{date} IS NOT NULL)",
                date = quote_ident(&series.date_column),
                series = quote_ident(&series.table),
                code = quote_ident(&series.code_column),
            ));
            binds.push(SqlValue::from(code));
        }
        self.storage
            .query_i64(&sql, binds)?
            .map(|raw| self.decode(raw))
            .transpose()
    }

    /// Newest day in the calendar.
    pub fn last_date(&self) -> Result<Option<TradeDate>, StorageError> {
        if !self.storage.table_exists(&self.table)? {
            return Ok(None);
        }
        let sql = format!(
            "SELECT CAST(MAX({}) AS INTEGER) AS value FROM {}",
            quote_ident(&self.column),
            quote_ident(&self.table)
        );
        self.storage
            .query_i64(&sql, Vec::new())?
            .map(|raw| self.decode(raw))
            .transpose()
    }

    fn decode(&self, raw: i64) -> Result<TradeDate, StorageError> {
        TradeDate::from_int(raw).map_err(|e| StorageError::Decode {
            table: self.table.clone(),
            message: e.to_string(),
        })
    }
}
