//! Calendar dates in the provider's `YYYYMMDD` convention.
//!
//! Dates travel as strings on the wire (`"20100104"`) and are persisted as
//! integers (`20100104`). [`TradeDate`] accepts both and always renders the
//! compact form.

use std::{fmt, str::FromStr};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// A value that is not a valid `YYYYMMDD` date.
#[derive(Debug, Snafu)]
#[snafu(display("invalid trade date: {input:?}"))]
pub struct InvalidTradeDate {
    /// The rejected input, as received.
    pub input: String,
}

/// A trading (or calendar) day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct TradeDate(NaiveDate);

impl TradeDate {
    /// Wraps a chrono date.
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Builds a date from its integer form, e.g. `20100104`.
    pub fn from_int(value: i64) -> Result<Self, InvalidTradeDate> {
        let invalid = || InvalidTradeDate {
            input: value.to_string(),
        };
        if !(10_000_101..=99_991_231).contains(&value) {
            return Err(invalid());
        }
        let year = (value / 10_000) as i32;
        let month = ((value / 100) % 100) as u32;
        let day = (value % 100) as u32;
        NaiveDate::from_ymd_opt(year, month, day)
            .map(Self)
            .ok_or_else(invalid)
    }

    /// Integer form, e.g. `20100104`.
    pub fn to_int(self) -> i64 {
        i64::from(self.0.year()) * 10_000 + i64::from(self.0.month()) * 100 + i64::from(self.0.day())
    }

    /// The underlying chrono date.
    pub fn naive(self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for TradeDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y%m%d"))
    }
}

impl FromStr for TradeDate {
    type Err = InvalidTradeDate;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() != 8 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidTradeDate {
                input: s.to_string(),
            });
        }
        let value: i64 = trimmed.parse().map_err(|_| InvalidTradeDate {
            input: s.to_string(),
        })?;
        Self::from_int(value)
    }
}

impl TryFrom<u32> for TradeDate {
    type Error = InvalidTradeDate;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_int(i64::from(value))
    }
}

impl From<TradeDate> for u32 {
    fn from(date: TradeDate) -> Self {
        // always fits: years are capped at 9999
        date.to_int() as u32
    }
}

impl From<NaiveDate> for TradeDate {
    fn from(date: NaiveDate) -> Self {
        Self(date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_and_integer_forms() {
        let from_str: TradeDate = "20100104".parse().unwrap();
        let from_int = TradeDate::from_int(20100104).unwrap();
        assert_eq!(from_str, from_int);
        assert_eq!(from_str.to_int(), 20100104);
        assert_eq!(from_str.to_string(), "20100104");
    }

    #[test]
    fn rejects_impossible_dates() {
        assert!(TradeDate::from_int(20100230).is_err());
        assert!(TradeDate::from_int(201001).is_err());
        assert!("2010-01-04".parse::<TradeDate>().is_err());
        assert!("2010010".parse::<TradeDate>().is_err());
    }

    #[test]
    fn orders_chronologically() {
        let a = TradeDate::from_int(20091231).unwrap();
        let b = TradeDate::from_int(20100104).unwrap();
        assert!(a < b);
    }

    #[test]
    fn serde_uses_integer_form() {
        let d = TradeDate::from_int(20100104).unwrap();
        assert_eq!(serde_json::to_string(&d).unwrap(), "20100104");
        let back: TradeDate = serde_json::from_str("20100105").unwrap();
        assert_eq!(back.to_int(), 20100105);
    }
}
