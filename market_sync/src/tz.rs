//! Time zone helpers.
//!
//! What this module provides:
//! - [`parse_tz`]: parse an IANA zone name (e.g. "Asia/Shanghai").
//! - [`today_in`] / [`today_at`]: the current trading-calendar day in the exchange's
//!   zone. A run started at 01:00 Shanghai time is already on the next day even
//!   though UTC is still on the previous one.
//! - [`now_rfc3339`] / [`to_rfc3339_millis`]: timestamps for the run ledger.
//!
//! All database timestamps are RFC-3339 UTC strings; local time only decides which
//! calendar day "today" is.

use anyhow::Context;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use market_data_ingestor::models::trade_date::TradeDate;

/// Parse an IANA time zone name.
pub fn parse_tz(name: &str) -> anyhow::Result<Tz> {
    name.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("bad tz: {name}"))
}

/// Calendar day of `now` in `tz`.
pub fn today_at(now: DateTime<Utc>, tz: Tz) -> TradeDate {
    TradeDate::new(now.with_timezone(&tz).date_naive())
}

/// Calendar day right now in `tz`.
pub fn today_in(tz: Tz) -> TradeDate {
    today_at(Utc::now(), tz)
}

/// Format a UTC datetime as an RFC-3339 string with millisecond precision.
pub fn to_rfc3339_millis(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn now_rfc3339() -> String {
    to_rfc3339_millis(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn shanghai_day_starts_before_utc_midnight() {
        // 2024-03-10 17:30Z is 2024-03-11 01:30 in Shanghai (+08:00).
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 17, 30, 0).unwrap();
        let tz = parse_tz("Asia/Shanghai").unwrap();
        assert_eq!(today_at(now, tz).to_int(), 20240311);
        assert_eq!(today_at(now, chrono_tz::UTC).to_int(), 20240310);
    }

    #[test]
    fn unknown_zone_is_error() {
        assert!(parse_tz("Mars/Olympus_Mons").is_err());
        assert!(parse_tz(" Asia/Shanghai ").is_ok());
    }

    #[test]
    fn millis_are_zero_padded() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap();
        assert_eq!(to_rfc3339_millis(dt), "2024-01-15T14:30:00.000Z");
    }
}
