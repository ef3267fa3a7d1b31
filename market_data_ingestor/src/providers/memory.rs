//! Deterministic in-memory provider.
//!
//! Datasets are registered up front as [`RowSet`]s. Queries filter them the way the
//! remote API does: `start_date`/`end_date` bound the dataset's date column, any other
//! parameter naming a column is an equality filter, everything else is ignored.
//! Symbols can be marked as failing to exercise partial-failure paths, and every call
//! is recorded.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, PoisonError, RwLock},
};

use async_trait::async_trait;

use crate::{
    models::{
        request::QueryRequest,
        row_set::{RowSet, value_as_i64, value_as_string},
    },
    providers::{DataProvider, InternalSnafu, ProviderError},
};

#[derive(Debug, Clone)]
struct Dataset {
    rows: RowSet,
    date_column: Option<String>,
}

#[derive(Debug, Default)]
pub struct MemoryProvider {
    datasets: RwLock<HashMap<String, Dataset>>,
    failing: RwLock<HashSet<(String, String)>>,
    calls: Mutex<Vec<QueryRequest>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the rows served for `api_name`.
    ///
    /// `date_column` is the column `start_date`/`end_date` apply to.
    pub fn insert_dataset(&self, api_name: &str, rows: RowSet, date_column: Option<&str>) {
        let mut datasets = self.datasets.write().unwrap_or_else(PoisonError::into_inner);
        datasets.insert(
            api_name.to_string(),
            Dataset {
                rows,
                date_column: date_column.map(str::to_string),
            },
        );
    }

    /// Adds rows to an existing dataset (new trading days arriving).
    pub fn append_rows(&self, api_name: &str, rows: RowSet) {
        let mut datasets = self.datasets.write().unwrap_or_else(PoisonError::into_inner);
        match datasets.get_mut(api_name) {
            Some(dataset) => dataset.rows.extend(rows),
            None => {
                datasets.insert(
                    api_name.to_string(),
                    Dataset {
                        rows,
                        date_column: None,
                    },
                );
            }
        }
    }

    /// Makes every `api_name` query for `symbol` fail until healed.
    pub fn fail_symbol(&self, api_name: &str, symbol: &str) {
        self.failing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((api_name.to_string(), symbol.to_string()));
    }

    pub fn heal_symbol(&self, api_name: &str, symbol: &str) {
        self.failing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(api_name.to_string(), symbol.to_string()));
    }

    /// Every request received so far, in arrival order.
    pub fn calls(&self) -> Vec<QueryRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_calls(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn filter(dataset: &Dataset, request: &QueryRequest) -> RowSet {
        let rows = &dataset.rows;
        let date_idx = dataset
            .date_column
            .as_deref()
            .and_then(|c| rows.column_index(c));
        let bound = |key: &str| {
            request
                .params
                .get(key)
                .and_then(|v| v.trim().parse::<i64>().ok())
        };
        let start = bound("start_date");
        let end = bound("end_date");

        let equalities: Vec<(usize, &str)> = request
            .params
            .iter()
            .filter(|(k, v)| k.as_str() != "start_date" && k.as_str() != "end_date" && !v.is_empty())
            .filter_map(|(k, v)| rows.column_index(k).map(|i| (i, v.as_str())))
            .collect();

        let mut out = RowSet::new(rows.fields.clone());
        for row in &rows.items {
            if let Some(idx) = date_idx {
                let date = value_as_i64(&row[idx]);
                if start.is_some_and(|s| date.is_none_or(|d| d < s)) {
                    continue;
                }
                if end.is_some_and(|e| date.is_none_or(|d| d > e)) {
                    continue;
                }
            }
            let matches = equalities
                .iter()
                .all(|(i, want)| value_as_string(&row[*i]).as_deref() == Some(*want));
            if matches {
                out.items.push(row.clone());
            }
        }

        if request.fields.is_empty() {
            out
        } else {
            out.project(&request.fields)
        }
    }
}

#[async_trait]
impl DataProvider for MemoryProvider {
    async fn query(&self, request: QueryRequest) -> Result<RowSet, ProviderError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        if let Some(symbol) = request.symbol() {
            let failing = self.failing.read().unwrap_or_else(PoisonError::into_inner);
            if failing.contains(&(request.api_name.clone(), symbol.to_string())) {
                return InternalSnafu {
                    message: format!("injected failure for {} {}", request.api_name, symbol),
                }
                .fail();
            }
        }

        let datasets = self.datasets.read().unwrap_or_else(PoisonError::into_inner);
        Ok(match datasets.get(&request.api_name) {
            Some(dataset) => Self::filter(dataset, &request),
            None => RowSet::new(request.fields.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn provider() -> MemoryProvider {
        let mut daily = RowSet::new(["ts_code", "trade_date", "close"]);
        for (code, date, close) in [
            ("000001.SZ", "20100104", 10.0),
            ("000001.SZ", "20100105", 11.0),
            ("000002.SZ", "20100104", 7.0),
            ("000001.SZ", "20100106", 12.0),
        ] {
            daily.push(vec![json!(code), json!(date), json!(close)]);
        }
        let p = MemoryProvider::new();
        p.insert_dataset("daily", daily, Some("trade_date"));
        p
    }

    #[tokio::test]
    async fn filters_by_symbol_and_date_range() {
        let p = provider();
        let rows = p
            .query(
                QueryRequest::new("daily")
                    .param("ts_code", "000001.SZ")
                    .param("start_date", "20100105")
                    .param("unknown", "x")
                    .with_fields(["trade_date", "close"]),
            )
            .await
            .unwrap();
        assert_eq!(rows.fields, vec!["trade_date", "close"]);
        assert_eq!(
            rows.items,
            vec![vec![json!("20100105"), json!(11.0)], vec![json!("20100106"), json!(12.0)]]
        );
    }

    #[tokio::test]
    async fn unknown_dataset_is_empty() {
        let rows = provider()
            .query(QueryRequest::new("moneyflow").with_fields(["ts_code"]))
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(rows.fields, vec!["ts_code"]);
    }

    #[tokio::test]
    async fn injected_failures_can_be_healed() {
        let p = provider();
        p.fail_symbol("daily", "000002.SZ");
        let req = QueryRequest::new("daily").param("ts_code", "000002.SZ");
        assert!(p.query(req.clone()).await.is_err());
        p.heal_symbol("daily", "000002.SZ");
        assert_eq!(p.query(req).await.unwrap().len(), 1);
        assert_eq!(p.calls().len(), 2);
        p.clear_calls();
        assert!(p.calls().is_empty());
    }
}
