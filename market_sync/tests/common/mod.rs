#![allow(dead_code)]

use std::{path::PathBuf, sync::Arc};

use diesel::QueryableByName;
use diesel::prelude::*;
use diesel::sql_types::{Integer, Text};
use market_data_ingestor::models::{row_set::RowSet, trade_date::TradeDate};
use market_data_ingestor::providers::memory::MemoryProvider;
use market_sync::catalog::{Catalog, load_catalog_str};
use market_sync::config::SyncConfig;
use market_sync::db::{connection, migrate};
use market_sync::orchestrator::SyncOrchestrator;
use market_sync::storage::StorageGateway;
use serde_json::json;
use tempfile::TempDir;

#[derive(QueryableByName)]
struct JournalMode {
    #[diesel(sql_type = Text)]
    journal_mode: String,
}
#[derive(QueryableByName)]
struct ForeignKeys {
    #[diesel(sql_type = Integer)]
    foreign_keys: i32,
}
#[derive(QueryableByName)]
struct BusyTimeout {
    #[diesel(sql_type = Integer, column_name = "timeout")]
    busy_timeout: i32,
}

pub struct TestDb {
    _dir: TempDir,    // keep alive for the life of the test
    pub path: String, // <tmpdir>/test.db
}

fn temp_path() -> (TempDir, String) {
    let dir = TempDir::new().expect("tempdir");
    let mut p = PathBuf::from(dir.path());
    p.push("test.db");
    let path = p.to_string_lossy().to_string();
    (dir, path)
}

/// Migrated database plus one raw connection.
pub fn setup_db() -> (TestDb, SqliteConnection) {
    let (dir, path) = temp_path();
    migrate::run_sqlite(&path).expect("migrations");
    let conn = connection::connect_sqlite(&path).expect("connect");
    (TestDb { _dir: dir, path }, conn)
}

/// Empty database behind a small pool.
pub fn setup_storage() -> (TestDb, StorageGateway) {
    let (dir, path) = temp_path();
    let storage = StorageGateway::connect(&path, 4).expect("pool");
    (TestDb { _dir: dir, path }, storage)
}

pub fn assert_sqlite_pragmas(conn: &mut SqliteConnection) {
    use diesel::sql_query;

    let jm: JournalMode = sql_query("PRAGMA journal_mode;").get_result(conn).unwrap();
    assert_eq!(jm.journal_mode.to_lowercase(), "wal"); // WAL is persistent per DB file

    let fk: ForeignKeys = sql_query("PRAGMA foreign_keys;").get_result(conn).unwrap();
    assert_eq!(fk.foreign_keys, 1);

    let bt: BusyTimeout = sql_query("PRAGMA busy_timeout;").get_result(conn).unwrap();
    assert_eq!(bt.busy_timeout, connection::BUSY_TIMEOUT_MS as i32);
}

pub fn date(value: i64) -> TradeDate {
    TradeDate::from_int(value).expect("valid date")
}

/// Two stocks, one index list fanned out per market, daily bars, and MACD.
pub const TEST_CATALOG: &str = r#"
    [types]
    ts_code = "varchar(10)"
    trade_date = "integer"
    cal_date = "integer"

    [[reference]]
    table = "stock_basic"
    api = "stock_basic"
    params = { list_status = "L" }
    fields = ["ts_code", "name"]
    key = ["ts_code"]

    [[reference]]
    table = "index_basic"
    api = "index_basic"
    key = ["ts_code"]
    fan_out = { param = "market", values = ["SSE", "SZSE"] }
    workers = 2

    [[series]]
    table = "stock_daily"
    api = "daily"
    universe = { table = "stock_basic", column = "ts_code" }
    workers = 2

    [[derived]]
    table = "macd"
    kind = "macd"
    source = "stock_daily"
    workers = 2
"#;

pub fn test_catalog() -> Catalog {
    load_catalog_str(TEST_CATALOG).expect("test catalog")
}

pub fn test_config(db: &TestDb) -> SyncConfig {
    SyncConfig {
        database_url: db.path.clone(),
        epoch: date(20100101),
        ..SyncConfig::default()
    }
}

pub const CALENDAR: [i64; 3] = [20100104, 20100105, 20100106];

pub fn calendar_rows(days: &[i64]) -> RowSet {
    let mut rows = RowSet::new(["exchange", "cal_date", "is_open"]);
    for day in days {
        rows.push(vec![json!("SSE"), json!(day.to_string()), json!(1)]);
    }
    // A closed day must never reach the calendar table.
    rows.push(vec![json!("SSE"), json!("20100109"), json!(0)]);
    rows
}

pub fn daily_rows(days: &[i64]) -> RowSet {
    let mut rows = RowSet::new(["ts_code", "trade_date", "close", "vol"]);
    for (i, day) in days.iter().enumerate() {
        let step = i as f64;
        rows.push(vec![json!("000001.SZ"), json!(day.to_string()), json!(10.0 + step), json!(1000.0)]);
        rows.push(vec![json!("600000.SH"), json!(day.to_string()), json!(20.0 - step), json!(500.0)]);
    }
    rows
}

/// Provider serving the test catalog's datasets over `days`.
pub fn seeded_provider(days: &[i64]) -> Arc<MemoryProvider> {
    let provider = MemoryProvider::new();
    provider.insert_dataset("trade_cal", calendar_rows(days), Some("cal_date"));

    let mut stocks = RowSet::new(["ts_code", "name", "list_status"]);
    stocks.push(vec![json!("000001.SZ"), json!("Ping An Bank"), json!("L")]);
    stocks.push(vec![json!("600000.SH"), json!("SPDB"), json!("L")]);
    provider.insert_dataset("stock_basic", stocks, None);

    let mut indices = RowSet::new(["ts_code", "name", "market"]);
    indices.push(vec![json!("000001.SH"), json!("SSE Composite"), json!("SSE")]);
    indices.push(vec![json!("399001.SZ"), json!("SZSE Component"), json!("SZSE")]);
    provider.insert_dataset("index_basic", indices, None);

    provider.insert_dataset("daily", daily_rows(days), Some("trade_date"));
    Arc::new(provider)
}

pub fn orchestrator(db: &TestDb, provider: Arc<MemoryProvider>) -> SyncOrchestrator {
    SyncOrchestrator::open(test_config(db), test_catalog(), provider).expect("orchestrator")
}
