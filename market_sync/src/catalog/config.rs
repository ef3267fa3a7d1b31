//! Dataset catalog: parsing, normalization, and loading.
//!
//! This module defines a TOML-backed "dataset catalog" that describes:
//! - The trading calendar table
//! - Reference tables (instrument lists, classifications, rates), replaced every run,
//!   optionally fanned out over a parameter (one request per market/exchange/index)
//! - Series tables (daily bars, fundamentals), appended incrementally per instrument
//! - Derived tables (MACD, moving averages) computed from a series table
//! - Pinned column types shared by every table (`ts_code` → `varchar(10)`, ...)
//!
//! Key behaviors:
//! - Normalization enforces lowercase table names, trims whitespace, and
//!   de-duplicates field and key lists while preserving order.
//! - Table names must be unique across all sections; derived tables must name a
//!   series table as their source.
//!
//! Entrypoints:
//! - The built-in catalog: [`default_catalog`]
//! - Parse + normalize from a TOML string: [`load_catalog_str`]
//! - Parse + normalize from a file path: [`load_catalog_path`]

use std::{collections::HashSet, mem, time::Duration};

use anyhow::{Context, bail};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use toml::from_str;

use crate::storage::{ColumnType, TableSchema};

const DEFAULT_CATALOG: &str = include_str!("default_catalog.toml");

fn default_workers() -> usize {
    1
}

fn default_code_column() -> String {
    "ts_code".to_string()
}

fn default_date_column() -> String {
    "trade_date".to_string()
}

/// Top-level catalog.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Catalog {
    #[serde(default)]
    pub calendar: CalendarCfg,
    /// Column name -> pinned type, applied to every table holding that column.
    #[serde(default)]
    pub types: IndexMap<String, ColumnType>,
    #[serde(default)]
    pub reference: Vec<ReferenceTable>,
    #[serde(default)]
    pub series: Vec<SeriesTable>,
    #[serde(default)]
    pub derived: Vec<DerivedTable>,
}

/// Where the trading calendar lives.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CalendarCfg {
    pub table: String,
    pub column: String,
}

impl Default for CalendarCfg {
    fn default() -> Self {
        Self {
            table: "trade_cal".to_string(),
            column: "cal_date".to_string(),
        }
    }
}

/// A `(table, column)` pair whose distinct values drive requests.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

/// One request per value of `param`.
///
/// Values are either listed explicitly or read from another table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FanOut {
    pub param: String,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub from: Option<ColumnRef>,
}

/// Table rebuilt wholesale from the provider every run.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReferenceTable {
    pub table: String,
    /// Provider dataset name.
    pub api: String,
    #[serde(default)]
    pub params: IndexMap<String, String>,
    #[serde(default)]
    pub fields: Vec<String>,
    /// Natural key; empty means no key is attached.
    #[serde(default)]
    pub key: Vec<String>,
    #[serde(default)]
    pub fan_out: Option<FanOut>,
    /// Send `start_date = <epoch>` with every request.
    #[serde(default)]
    pub since_epoch: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Pause after each provider call, in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
}

/// Write policy for a series table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesMode {
    /// Plain inserts; a duplicate is a key violation.
    #[default]
    Append,
    /// Rows whose `(code, date)` already exists are ignored.
    AppendDistinct,
}

/// Per-instrument time series, appended incrementally.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SeriesTable {
    pub table: String,
    pub api: String,
    /// Instruments to sync: distinct values of this column.
    pub universe: ColumnRef,
    #[serde(default = "default_code_column")]
    pub code_column: String,
    #[serde(default = "default_date_column")]
    pub date_column: String,
    #[serde(default)]
    pub params: IndexMap<String, String>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub mode: SeriesMode,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub delay_ms: u64,
}

impl SeriesTable {
    /// A series keyed by `ts_code`/`trade_date` whose universe is
    /// `universe_table.ts_code`.
    pub fn new(table: &str, api: &str, universe_table: &str) -> Self {
        Self {
            table: table.to_string(),
            api: api.to_string(),
            universe: ColumnRef {
                table: universe_table.to_string(),
                column: default_code_column(),
            },
            code_column: default_code_column(),
            date_column: default_date_column(),
            params: IndexMap::new(),
            fields: Vec::new(),
            mode: SeriesMode::default(),
            workers: default_workers(),
            delay_ms: 0,
        }
    }

    pub fn key(&self) -> Vec<String> {
        vec![self.code_column.clone(), self.date_column.clone()]
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl ReferenceTable {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Which computation fills a derived table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedKind {
    Macd,
    MovingAverage,
}

/// Table computed from a series table, per instrument.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DerivedTable {
    pub table: String,
    pub kind: DerivedKind,
    /// Name of the source series table.
    pub source: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// Worker/throttle override for one table, from the run configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TableOverride {
    pub workers: Option<usize>,
    pub delay_ms: Option<u64>,
}

impl Catalog {
    pub fn reference(&self, table: &str) -> Option<&ReferenceTable> {
        self.reference.iter().find(|t| t.table == table)
    }

    pub fn series(&self, table: &str) -> Option<&SeriesTable> {
        self.series.iter().find(|t| t.table == table)
    }

    pub fn derived(&self, table: &str) -> Option<&DerivedTable> {
        self.derived.iter().find(|t| t.table == table)
    }

    /// All table names, calendar first.
    pub fn table_names(&self) -> Vec<&str> {
        std::iter::once(self.calendar.table.as_str())
            .chain(self.reference.iter().map(|t| t.table.as_str()))
            .chain(self.series.iter().map(|t| t.table.as_str()))
            .chain(self.derived.iter().map(|t| t.table.as_str()))
            .collect()
    }

    /// Pinned types plus `key`.
    pub fn schema_for(&self, key: Vec<String>) -> TableSchema {
        TableSchema::new(self.types.clone(), key)
    }

    /// Largest worker pool of any table (at least 1).
    pub fn max_workers(&self) -> usize {
        self.reference
            .iter()
            .map(|t| t.workers)
            .chain(self.series.iter().map(|t| t.workers))
            .chain(self.derived.iter().map(|t| t.workers))
            .max()
            .unwrap_or(1)
            .max(1)
    }

    /// Applies per-table overrides; unknown table names are an error.
    pub fn apply_overrides(&mut self, overrides: &IndexMap<String, TableOverride>) -> anyhow::Result<()> {
        for (raw, ov) in overrides {
            let name = raw.trim().to_lowercase();
            if ov.workers == Some(0) {
                bail!("override for {name}: workers must be at least 1");
            }
            if let Some(t) = self.reference.iter_mut().find(|t| t.table == name) {
                t.workers = ov.workers.unwrap_or(t.workers);
                t.delay_ms = ov.delay_ms.unwrap_or(t.delay_ms);
            } else if let Some(t) = self.series.iter_mut().find(|t| t.table == name) {
                t.workers = ov.workers.unwrap_or(t.workers);
                t.delay_ms = ov.delay_ms.unwrap_or(t.delay_ms);
            } else if let Some(t) = self.derived.iter_mut().find(|t| t.table == name) {
                if ov.delay_ms.is_some() {
                    bail!("override for {name}: derived tables have no delay");
                }
                t.workers = ov.workers.unwrap_or(t.workers);
            } else {
                bail!("override for unknown table {name}");
            }
        }
        Ok(())
    }
}

/// Summary of changes performed during normalization.
///
/// All counters are additive for the processed catalog.
#[derive(Debug, Default)]
pub struct NormalizationReport {
    /// Number of table names that changed when lowercasing/trimming.
    pub tables_renamed: usize,
    /// Count of removed duplicate entries in `fields` lists.
    pub fields_deduped: usize,
    /// Count of removed duplicate entries in `key` lists.
    pub key_columns_deduped: usize,
}

fn normalize_name(raw: &mut String, what: &str, report: &mut NormalizationReport) -> anyhow::Result<()> {
    let name = raw.trim().to_lowercase();
    if name.is_empty() {
        bail!("{what} cannot be empty after trimming");
    }
    if name != *raw {
        report.tables_renamed += 1;
        *raw = name;
    }
    Ok(())
}

/// Trims and de-duplicates, preserving the first occurrence order.
fn dedupe_list(list: &mut Vec<String>, what: &str) -> anyhow::Result<usize> {
    let before = list.len();
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(before);
    for item in mem::take(list) {
        let item = item.trim().to_string();
        if item.is_empty() {
            bail!("{what} entries cannot be empty after trimming");
        }
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    *list = out;
    Ok(before - list.len())
}

fn check_workers(table: &str, workers: usize) -> anyhow::Result<()> {
    if workers == 0 {
        bail!("{table}: workers must be at least 1");
    }
    Ok(())
}

/// Normalize a catalog in-place.
///
/// What normalization does:
/// - Lowercase + trim table names (including universe, fan-out and source
///   references); reject duplicates after normalization
/// - Trim API names and column names
/// - Deduplicate `fields` and `key` lists, preserving the first occurrence order
/// - Reject zero worker counts, derived tables whose source is not a series table,
///   and fan-outs with neither `values` nor `from`
pub fn normalize_catalog(cat: &mut Catalog) -> anyhow::Result<NormalizationReport> {
    let mut report = NormalizationReport::default();

    normalize_name(&mut cat.calendar.table, "calendar.table", &mut report)?;
    cat.calendar.column = cat.calendar.column.trim().to_string();

    let types = mem::take(&mut cat.types);
    for (column, ty) in types {
        cat.types.insert(column.trim().to_string(), ty);
    }

    for t in &mut cat.reference {
        normalize_name(&mut t.table, "reference.table", &mut report)?;
        t.api = t.api.trim().to_string();
        report.fields_deduped += dedupe_list(&mut t.fields, "fields")?;
        report.key_columns_deduped += dedupe_list(&mut t.key, "key")?;
        check_workers(&t.table, t.workers)?;
        if let Some(fan) = &mut t.fan_out {
            fan.param = fan.param.trim().to_string();
            dedupe_list(&mut fan.values, "fan_out.values")?;
            if let Some(from) = &mut fan.from {
                normalize_name(&mut from.table, "fan_out.from.table", &mut report)?;
                from.column = from.column.trim().to_string();
            }
            if fan.values.is_empty() && fan.from.is_none() {
                bail!("{}: fan_out needs values or from", t.table);
            }
        }
    }

    for t in &mut cat.series {
        normalize_name(&mut t.table, "series.table", &mut report)?;
        normalize_name(&mut t.universe.table, "series.universe.table", &mut report)?;
        t.api = t.api.trim().to_string();
        t.universe.column = t.universe.column.trim().to_string();
        t.code_column = t.code_column.trim().to_string();
        t.date_column = t.date_column.trim().to_string();
        report.fields_deduped += dedupe_list(&mut t.fields, "fields")?;
        check_workers(&t.table, t.workers)?;
    }

    for t in &mut cat.derived {
        normalize_name(&mut t.table, "derived.table", &mut report)?;
        normalize_name(&mut t.source, "derived.source", &mut report)?;
        check_workers(&t.table, t.workers)?;
    }

    let mut seen = HashSet::new();
    for name in cat.table_names() {
        if !seen.insert(name) {
            bail!("duplicate table name after normalization: {name}");
        }
    }

    let series: HashSet<&str> = cat.series.iter().map(|t| t.table.as_str()).collect();
    if let Some(bad) = cat.derived.iter().find(|t| !series.contains(t.source.as_str())) {
        bail!("derived table {} has unknown source series {}", bad.table, bad.source);
    }

    Ok(report)
}

/// Parse and normalize a catalog from a TOML string.
pub fn load_catalog_str(toml_str: &str) -> anyhow::Result<Catalog> {
    let mut cat: Catalog = from_str(toml_str).context("failed to parse catalog TOML")?;
    let report = normalize_catalog(&mut cat).context("normalize_catalog failed")?;
    tracing::debug!(?report, "catalog normalized");
    Ok(cat)
}

/// Read a catalog TOML file from disk, parse, and normalize it.
///
/// See [`load_catalog_str`] for details on parsing and normalization.
pub fn load_catalog_path(path: impl AsRef<std::path::Path>) -> anyhow::Result<Catalog> {
    let text = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("read catalog file {}", path.as_ref().display()))?;
    load_catalog_str(&text)
}

/// The catalog compiled into the binary.
pub fn default_catalog() -> anyhow::Result<Catalog> {
    load_catalog_str(DEFAULT_CATALOG).context("built-in catalog")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = r#"
        [types]
        ts_code = "varchar(10)"
        trade_date = "integer"

        [[reference]]
        table = " Stock_Basic "
        api = "stock_basic"
        fields = ["ts_code", "name", "ts_code "]
        key = ["ts_code"]

        [[series]]
        table = "stock_daily"
        api = "daily"
        universe = { table = "STOCK_BASIC", column = "ts_code" }
        workers = 5
        delay_ms = 100

        [[derived]]
        table = "MACD"
        kind = "macd"
        source = "stock_daily"
    "#;

    #[test]
    fn normalizes_names_and_dedupes() {
        let cat = load_catalog_str(SMALL).unwrap();
        let stock_basic = &cat.reference[0];
        assert_eq!(stock_basic.table, "stock_basic");
        assert_eq!(stock_basic.fields, vec!["ts_code", "name"]);
        assert_eq!(cat.series[0].universe.table, "stock_basic");
        assert_eq!(cat.derived[0].table, "macd");
        assert_eq!(cat.types["ts_code"], ColumnType::Varchar(10));
        assert_eq!(cat.calendar.table, "trade_cal");
    }

    #[test]
    fn series_defaults_to_code_and_trade_date() {
        let cat = load_catalog_str(SMALL).unwrap();
        let daily = cat.series("stock_daily").unwrap();
        assert_eq!(daily.key(), vec!["ts_code", "trade_date"]);
        assert_eq!(daily.mode, SeriesMode::Append);
        assert_eq!(daily.delay(), Duration::from_millis(100));
        assert_eq!(cat.max_workers(), 5);
    }

    #[test]
    fn duplicate_table_collision_errors() {
        let toml_str = r#"
            [[reference]]
            table = "stock_basic"
            api = "stock_basic"
            [[reference]]
            table = "STOCK_BASIC"
            api = "stock_basic"
        "#;
        let err = load_catalog_str(toml_str).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate table name"));
    }

    #[test]
    fn derived_source_must_be_series() {
        let toml_str = r#"
            [[derived]]
            table = "macd"
            kind = "macd"
            source = "stock_daily"
        "#;
        let err = load_catalog_str(toml_str).unwrap_err();
        assert!(format!("{err:#}").contains("unknown source series"));
    }

    #[test]
    fn fan_out_requires_a_value_source() {
        let toml_str = r#"
            [[reference]]
            table = "index_basic"
            api = "index_basic"
            fan_out = { param = "market" }
        "#;
        assert!(load_catalog_str(toml_str).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let toml_str = r#"
            [[reference]]
            table = "stock_basic"
            api = "stock_basic"
            primary = "ts_code"
        "#;
        assert!(load_catalog_str(toml_str).is_err());
    }

    #[test]
    fn overrides_apply_and_reject_unknown_tables() {
        let mut cat = load_catalog_str(SMALL).unwrap();
        let mut overrides = IndexMap::new();
        overrides.insert(
            "Stock_Daily".to_string(),
            TableOverride {
                workers: Some(2),
                delay_ms: Some(0),
            },
        );
        cat.apply_overrides(&overrides).unwrap();
        assert_eq!(cat.series[0].workers, 2);
        assert_eq!(cat.series[0].delay_ms, 0);

        overrides.insert("moneyflow".to_string(), TableOverride::default());
        assert!(cat.apply_overrides(&overrides).is_err());
    }

    #[test]
    fn built_in_catalog_is_consistent() {
        let cat = default_catalog().unwrap();
        assert!(cat.reference("stock_basic").is_some());
        assert!(cat.series("stock_daily").is_some());
        assert_eq!(cat.derived("macd").unwrap().source, "stock_daily");
        let index_basic = cat.reference("index_basic").unwrap();
        assert_eq!(index_basic.fan_out.as_ref().unwrap().values.len(), 7);
        let fina = cat.series("fina_indicator").unwrap();
        assert_eq!(fina.date_column, "end_date");
        assert_eq!(fina.mode, SeriesMode::AppendDistinct);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn table_names_lowercased_and_unique(
            names in proptest::collection::vec("[A-Za-z_]{1,8}", 1..5),
        ) {
            let mut cat = Catalog::default();
            for (i, n) in names.iter().enumerate() {
                let table = if i % 2 == 0 { n.to_uppercase() } else { format!("  {n} ") };
                cat.reference.push(ReferenceTable {
                    table,
                    api: "stock_basic".into(),
                    params: IndexMap::new(),
                    fields: vec![],
                    key: vec![],
                    fan_out: None,
                    since_epoch: false,
                    workers: 1,
                    delay_ms: 0,
                });
            }

            if normalize_catalog(&mut cat).is_ok() {
                let names = cat.table_names();
                prop_assert!(names.iter().all(|k| k.chars().all(|c| !c.is_uppercase())));
                let unique: HashSet<_> = names.iter().collect();
                prop_assert_eq!(unique.len(), names.len());
            }
        }
    }
}
