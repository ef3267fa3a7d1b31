//! Simple moving averages of close (`ma<n>`) and volume (`ma_v_<n>`).
//!
//! A value is null until its window is filled; a volume average is also null when
//! any bar in its window lacks a volume.

use market_data_ingestor::models::row_set::RowSet;
use serde_json::{Value, json};

use super::{Bar, CODE_COLUMN, DATE_COLUMN, DerivedSeries, round3};

#[derive(Debug, Clone)]
pub struct MovingAverage {
    windows: Vec<usize>,
    volume: bool,
}

impl MovingAverage {
    /// Zero-length windows are ignored.
    pub fn new(mut windows: Vec<usize>, volume: bool) -> Self {
        windows.retain(|w| *w > 0);
        windows.sort_unstable();
        windows.dedup();
        Self { windows, volume }
    }
}

/// Mean of the `window` values ending at `end` (inclusive), from prefix sums.
fn window_mean(prefix: &[f64], end: usize, window: usize) -> Option<f64> {
    if end + 1 < window {
        return None;
    }
    Some((prefix[end + 1] - prefix[end + 1 - window]) / window as f64)
}

fn prefix_sums(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut prefix = vec![0.0];
    let mut acc = 0.0;
    for v in values {
        acc += v;
        prefix.push(acc);
    }
    prefix
}

impl DerivedSeries for MovingAverage {
    fn name(&self) -> &str {
        "moving_average"
    }

    fn columns(&self) -> Vec<String> {
        let mut cols = vec![CODE_COLUMN.to_string(), DATE_COLUMN.to_string()];
        cols.extend(self.windows.iter().map(|w| format!("ma{w}")));
        if self.volume {
            cols.extend(self.windows.iter().map(|w| format!("ma_v_{w}")));
        }
        cols
    }

    fn compute(&self, code: &str, bars: &[Bar]) -> RowSet {
        let mut out = RowSet::new(self.columns());
        let closes = prefix_sums(bars.iter().map(|b| b.close));
        let vols = prefix_sums(bars.iter().map(|b| b.vol.unwrap_or(0.0)));
        // Bars without volume seen so far, to null out windows containing one.
        let missing = prefix_sums(bars.iter().map(|b| if b.vol.is_some() { 0.0 } else { 1.0 }));

        for (i, bar) in bars.iter().enumerate() {
            let mut row = Vec::with_capacity(out.fields.len());
            row.push(json!(code));
            row.push(json!(bar.date));
            for w in &self.windows {
                row.push(window_mean(&closes, i, *w).map_or(Value::Null, |m| Value::from(round3(m))));
            }
            if self.volume {
                for w in &self.windows {
                    let complete = window_mean(&missing, i, *w) == Some(0.0);
                    let mean = window_mean(&vols, i, *w).filter(|_| complete);
                    row.push(mean.map_or(Value::Null, |m| Value::from(round3(m))));
                }
            }
            out.push(row);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(date: i64, close: f64, vol: Option<f64>) -> Bar {
        Bar { date, close, vol }
    }

    #[test]
    fn averages_fill_once_the_window_does() {
        let bars = vec![
            bar(20100104, 10.0, Some(100.0)),
            bar(20100105, 11.0, Some(200.0)),
            bar(20100106, 12.5, Some(300.0)),
            bar(20100107, 11.0, Some(400.0)),
        ];
        let out = MovingAverage::new(vec![3, 2], true).compute("000001.SZ", &bars);

        assert_eq!(out.fields, vec!["ts_code", "trade_date", "ma2", "ma3", "ma_v_2", "ma_v_3"]);
        assert_eq!(out.get(0, "ma2"), Some(&Value::Null));
        assert_eq!(out.get(1, "ma2"), Some(&json!(10.5)));
        assert_eq!(out.get(1, "ma3"), Some(&Value::Null));
        assert_eq!(out.get(2, "ma3"), Some(&json!(11.167)));
        assert_eq!(out.get(3, "ma3"), Some(&json!(11.5)));
        assert_eq!(out.get(3, "ma_v_2"), Some(&json!(350.0)));
    }

    #[test]
    fn missing_volume_nulls_only_windows_that_contain_it() {
        let bars = vec![
            bar(20100104, 10.0, None),
            bar(20100105, 10.0, Some(10.0)),
            bar(20100106, 10.0, Some(20.0)),
        ];
        let out = MovingAverage::new(vec![2], true).compute("000001.SZ", &bars);
        assert_eq!(out.get(1, "ma_v_2"), Some(&Value::Null));
        assert_eq!(out.get(2, "ma_v_2"), Some(&json!(15.0)));
        assert_eq!(out.get(1, "ma2"), Some(&json!(10.0)));
    }

    #[test]
    fn volume_columns_are_optional() {
        let ma = MovingAverage::new(vec![5, 0, 5, 10], false);
        assert_eq!(ma.columns(), vec!["ts_code", "trade_date", "ma5", "ma10"]);
    }
}
