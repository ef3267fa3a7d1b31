#![cfg(test)]
use market_data_ingestor::{
    models::{request::QueryRequest, trade_date::TradeDate},
    providers::{DataProvider, tushare::TushareProvider},
};
use serial_test::serial;

fn token_available() -> bool {
    dotenvy::dotenv().ok();
    std::env::var("TUSHARE_TOKEN").is_ok()
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_tushare_provider_daily_bars() {
    // This test requires TUSHARE_TOKEN to be set in the environment.
    if !token_available() {
        println!("Skipping test_tushare_provider_daily_bars: TUSHARE_TOKEN not set.");
        return;
    }

    let provider = TushareProvider::new().expect("Failed to create TushareProvider");

    let request = QueryRequest::new("daily")
        .param("ts_code", "000001.SZ")
        .param("start_date", "20240102")
        .param("end_date", "20240110")
        .with_fields(["ts_code", "trade_date", "close", "vol"]);

    let result = provider.query(request).await;
    assert!(result.is_ok(), "query returned an error: {:?}", result.err());

    let rows = result.unwrap();
    assert_eq!(rows.fields, vec!["ts_code", "trade_date", "close", "vol"]);
    assert!(!rows.is_empty(), "Expected at least one bar for 000001.SZ");
    assert!(
        rows.distinct_strings("ts_code") == vec!["000001.SZ".to_string()],
        "Expected rows for the requested code only"
    );
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_tushare_provider_trading_calendar() {
    if !token_available() {
        println!("Skipping test_tushare_provider_trading_calendar: TUSHARE_TOKEN not set.");
        return;
    }

    let provider = TushareProvider::new().expect("Failed to create TushareProvider");
    let start: TradeDate = "20240101".parse().unwrap();
    let end: TradeDate = "20240131".parse().unwrap();

    let days = provider
        .trading_calendar("SSE", start, end)
        .await
        .expect("calendar query failed");

    assert!(!days.is_empty());
    assert!(days.windows(2).all(|w| w[0] < w[1]));
    // 2024-01-01 is a holiday.
    assert!(days.first().unwrap().to_int() > 20240101);
}
