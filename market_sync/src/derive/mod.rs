//! Derived series computed from raw daily bars.
//!
//! A [`DerivedSeries`] turns one instrument's bars into rows of a derived table.
//! Bars are read per instrument, sorted ascending by date and de-duplicated by
//! date before any recurrence runs, so state never crosses instruments and every
//! output row depends only on earlier bars of the same instrument.
//!
//! Results are written with [`WriteMode::AppendDistinct`] keyed on
//! (`ts_code`, `trade_date`): the first computation creates the table, later ones
//! only add rows for new dates.

pub mod macd;
pub mod moving_average;

use indexmap::IndexMap;
use market_data_ingestor::models::row_set::{RowSet, value_as_f64, value_as_i64};

use crate::{
    catalog::{DerivedKind, DerivedTable, SeriesTable},
    config::{MacdSettings, MovingAverageSettings},
    error::SyncError,
    storage::{ColumnType, ReadSpec, StorageError, StorageGateway, TableSchema, WriteMode},
};

pub use macd::Macd;
pub use moving_average::MovingAverage;

/// Code column of every derived table.
pub const CODE_COLUMN: &str = "ts_code";
/// Date column of every derived table.
pub const DATE_COLUMN: &str = "trade_date";

const CLOSE_COLUMN: &str = "close";
const VOLUME_COLUMN: &str = "vol";

/// One daily bar as needed by the indicators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    /// `YYYYMMDD`.
    pub date: i64,
    pub close: f64,
    pub vol: Option<f64>,
}

impl Bar {
    pub fn new(date: i64, close: f64) -> Self {
        Self {
            date,
            close,
            vol: None,
        }
    }
}

pub trait DerivedSeries: Send + Sync {
    fn name(&self) -> &str;

    /// Output columns, starting with [`CODE_COLUMN`] and [`DATE_COLUMN`].
    fn columns(&self) -> Vec<String>;

    /// Rows for `code`. `bars` must be ascending and unique by date.
    fn compute(&self, code: &str, bars: &[Bar]) -> RowSet;
}

/// Builds the indicator a catalog entry asks for.
pub fn series_for(
    kind: DerivedKind,
    macd: &MacdSettings,
    ma: &MovingAverageSettings,
) -> Box<dyn DerivedSeries> {
    match kind {
        DerivedKind::Macd => Box::new(Macd::new(macd.fast, macd.slow, macd.signal)),
        DerivedKind::MovingAverage => Box::new(MovingAverage::new(ma.windows.clone(), ma.volume)),
    }
}

/// Rounds half away from zero to 3 decimals.
pub fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Extracts bars from raw rows: ascending, one per date, rows without a date or
/// close dropped. The first row seen for a date wins.
pub fn prepare_bars(rows: &RowSet, date_column: &str) -> Result<Vec<Bar>, String> {
    let date_idx = rows
        .column_index(date_column)
        .ok_or_else(|| format!("source has no {date_column} column"))?;
    let close_idx = rows
        .column_index(CLOSE_COLUMN)
        .ok_or_else(|| format!("source has no {CLOSE_COLUMN} column"))?;
    let vol_idx = rows.column_index(VOLUME_COLUMN);

    let mut bars: Vec<Bar> = rows
        .items
        .iter()
        .filter_map(|row| {
            let date = value_as_i64(&row[date_idx])?;
            let close = value_as_f64(&row[close_idx]).filter(|c| c.is_finite())?;
            let vol = vol_idx.and_then(|i| value_as_f64(&row[i]));
            Some(Bar { date, close, vol })
        })
        .collect();
    bars.sort_by_key(|b| b.date);
    bars.dedup_by_key(|b| b.date);
    Ok(bars)
}

/// Computes derived tables from their source series, one instrument at a time.
#[derive(Clone)]
pub struct DerivedSeriesComputer {
    storage: StorageGateway,
    pinned: IndexMap<String, ColumnType>,
}

impl DerivedSeriesComputer {
    pub fn new(storage: StorageGateway, pinned: IndexMap<String, ColumnType>) -> Self {
        Self { storage, pinned }
    }

    pub fn schema(&self) -> TableSchema {
        TableSchema::new(self.pinned.clone(), vec![CODE_COLUMN.into(), DATE_COLUMN.into()])
    }

    /// Bars of `code` in `source`, ready for computation.
    pub fn load_bars(&self, source: &SeriesTable, code: &str) -> Result<Vec<Bar>, SyncError> {
        let available = self
            .storage
            .columns(&source.table)
            .map_err(|e| SyncError::storage(&source.table, Some(code), e))?;
        let mut wanted = vec![source.date_column.clone(), CLOSE_COLUMN.to_string()];
        if available.iter().any(|c| c.name == VOLUME_COLUMN) {
            wanted.push(VOLUME_COLUMN.to_string());
        }
        let spec = ReadSpec::all()
            .columns(wanted)
            .where_eq(&source.code_column, code)
            .order_by([source.date_column.clone()]);
        let rows = self
            .storage
            .read(&source.table, &spec)
            .map_err(|e| SyncError::storage(&source.table, Some(code), e))?;
        prepare_bars(&rows, &source.date_column).map_err(|message| SyncError::Derive {
            table: source.table.clone(),
            code: code.to_string(),
            message,
        })
    }

    /// Recomputes `table` for `code` and inserts the rows not stored yet.
    pub fn compute_for(
        &self,
        table: &DerivedTable,
        series: &dyn DerivedSeries,
        source: &SeriesTable,
        code: &str,
    ) -> Result<usize, SyncError> {
        let bars = self.load_bars(source, code)?;
        if bars.is_empty() {
            return Ok(0);
        }
        let rows = series.compute(code, &bars);
        self.storage
            .write(&table.table, &rows, WriteMode::AppendDistinct, &self.schema())
            .map_err(|e| SyncError::storage(&table.table, Some(code), e))
    }

    /// Distinct codes present in `source`, sorted.
    pub fn codes(&self, source: &SeriesTable) -> Result<Vec<String>, StorageError> {
        if !self.storage.table_exists(&source.table)? {
            return Ok(Vec::new());
        }
        let rows = self.storage.read(
            &source.table,
            &ReadSpec::all().columns([source.code_column.clone()]).distinct(),
        )?;
        let mut codes = rows.distinct_strings(&source.code_column);
        codes.sort();
        Ok(codes)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn bars_are_sorted_and_unique() {
        let mut rows = RowSet::new(["trade_date", "close", "vol"]);
        rows.push(vec![json!(20100105), json!(11.0), json!(100.0)]);
        rows.push(vec![json!("20100104"), json!(10.0), json!(null)]);
        rows.push(vec![json!(20100105), json!(99.0), json!(1.0)]);
        rows.push(vec![json!(20100106), json!(null), json!(1.0)]);

        let bars = prepare_bars(&rows, "trade_date").unwrap();
        assert_eq!(
            bars,
            vec![
                Bar { date: 20100104, close: 10.0, vol: None },
                Bar { date: 20100105, close: 11.0, vol: Some(100.0) },
            ]
        );
    }

    #[test]
    fn missing_close_column_is_reported() {
        let rows = RowSet::new(["trade_date", "open"]);
        let err = prepare_bars(&rows, "trade_date").unwrap_err();
        assert!(err.contains("close"));
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(round3(0.0625), 0.063);
        assert_eq!(round3(-0.0625), -0.063);
        assert_eq!(round3(10.5625), 10.563);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn derived_dates_strictly_increase_within_raw_dates(
            raw in proptest::collection::vec((0i64..400, 1.0f64..100.0), 0..60),
        ) {
            let mut rows = RowSet::new(["trade_date", "close"]);
            for (offset, close) in &raw {
                rows.push(vec![json!(20100101 + offset), json!(close)]);
            }
            let bars = prepare_bars(&rows, "trade_date").unwrap();
            let raw_dates: std::collections::HashSet<i64> =
                raw.iter().map(|(o, _)| 20100101 + o).collect();

            let series: Vec<Box<dyn DerivedSeries>> = vec![
                Box::new(Macd::new(3, 5, 4)),
                Box::new(MovingAverage::new(vec![2, 5], true)),
            ];
            for s in series {
                let out = s.compute("000001.SZ", &bars);
                let dates: Vec<i64> = out
                    .column(DATE_COLUMN)
                    .unwrap()
                    .filter_map(value_as_i64)
                    .collect();
                prop_assert_eq!(dates.len(), out.len());
                prop_assert!(dates.windows(2).all(|w| w[0] < w[1]));
                prop_assert!(dates.iter().all(|d| raw_dates.contains(d)));
            }
        }
    }
}
