//! MACD (Moving Average Convergence Divergence).
//!
//! Both EMAs are seeded with the first close, `dea` starts at zero:
//!
//! ```text
//! ema[t] = α·close[t] + (1-α)·ema[t-1]      α = 2/(period+1), ema[0] = close[0]
//! dif[t] = ema_fast[t] - ema_slow[t]
//! dea[t] = k·dif[t] + (1-k)·dea[t-1]         k = 2/(signal+1), dea[-1] = 0
//! macd[t] = 2·(dif[t] - dea[t])
//! ```
//!
//! State is carried at full precision; stored values are rounded to 3 decimals.

use market_data_ingestor::models::row_set::RowSet;
use serde_json::{Value, json};

use super::{Bar, CODE_COLUMN, DATE_COLUMN, DerivedSeries, round3};

#[derive(Debug, Clone)]
pub struct Macd {
    fast: usize,
    slow: usize,
    signal: usize,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self { fast, slow, signal }
    }
}

fn alpha(period: usize) -> f64 {
    2.0 / (period as f64 + 1.0)
}

impl DerivedSeries for Macd {
    fn name(&self) -> &str {
        "macd"
    }

    fn columns(&self) -> Vec<String> {
        [CODE_COLUMN, DATE_COLUMN, "close", "ema_fast", "ema_slow", "dif", "dea", "macd"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn compute(&self, code: &str, bars: &[Bar]) -> RowSet {
        let mut out = RowSet::new(self.columns());
        let Some(first) = bars.first() else {
            return out;
        };
        let (kf, ks, kd) = (alpha(self.fast), alpha(self.slow), alpha(self.signal));
        let mut ema_fast = first.close;
        let mut ema_slow = first.close;
        let mut dea = 0.0;

        for (i, bar) in bars.iter().enumerate() {
            if i > 0 {
                ema_fast = kf * bar.close + (1.0 - kf) * ema_fast;
                ema_slow = ks * bar.close + (1.0 - ks) * ema_slow;
            }
            let dif = ema_fast - ema_slow;
            dea = kd * dif + (1.0 - kd) * dea;
            let macd = 2.0 * (dif - dea);
            out.push(vec![
                json!(code),
                json!(bar.date),
                Value::from(bar.close),
                Value::from(round3(ema_fast)),
                Value::from(round3(ema_slow)),
                Value::from(round3(dif)),
                Value::from(round3(dea)),
                Value::from(round3(macd)),
            ]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use market_data_ingestor::models::row_set::value_as_f64;

    use super::*;

    fn column(rows: &RowSet, name: &str) -> Vec<f64> {
        rows.column(name).unwrap().filter_map(value_as_f64).collect()
    }

    fn bars(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Bar::new(20100104 + i as i64, *c))
            .collect()
    }

    #[test]
    fn matches_reference_values() {
        let out = Macd::new(3, 5, 4).compute("000001.SZ", &bars(&[10.0, 11.0, 12.0, 11.0, 10.0]));

        assert_eq!(column(&out, "ema_fast"), vec![10.0, 10.5, 11.25, 11.125, 10.563]);
        assert_eq!(column(&out, "ema_slow"), vec![10.0, 10.333, 10.889, 10.926, 10.617]);
        assert_eq!(column(&out, "dif"), vec![0.0, 0.167, 0.361, 0.199, -0.055]);
        assert_eq!(column(&out, "dea"), vec![0.0, 0.067, 0.184, 0.19, 0.092]);
        assert_eq!(column(&out, "macd"), vec![0.0, 0.2, 0.353, 0.018, -0.294]);
        assert_eq!(out.get(4, "ts_code"), Some(&json!("000001.SZ")));
        assert_eq!(out.get(4, "trade_date"), Some(&json!(20100108)));
    }

    #[test]
    fn first_row_is_flat() {
        let out = Macd::new(12, 26, 9).compute("600000.SH", &bars(&[7.31]));
        assert_eq!(out.len(), 1);
        assert_eq!(column(&out, "ema_fast"), vec![7.31]);
        assert_eq!(column(&out, "macd"), vec![0.0]);
    }

    #[test]
    fn no_bars_no_rows() {
        let out = Macd::new(12, 26, 9).compute("600000.SH", &[]);
        assert!(out.is_empty());
        assert_eq!(out.fields.len(), 8);
    }
}
