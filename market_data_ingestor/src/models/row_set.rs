//! Column-oriented tabular data as exchanged with providers and storage.
//!
//! A [`RowSet`] mirrors the provider payload (`{"fields": [...], "items": [[...]]}`):
//! one list of column names and a list of rows whose cells line up with those
//! names. Cells are plain JSON values so that heterogeneous datasets (bars,
//! fundamentals, contract listings) share one representation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tabular result: ordered column names plus rows of JSON cells.
///
/// Deserialized rows are padded with nulls (or truncated) to `fields.len()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawRowSet")]
pub struct RowSet {
    /// Column names, in order.
    pub fields: Vec<String>,
    /// Rows; every row has exactly `fields.len()` cells.
    #[serde(default)]
    pub items: Vec<Vec<Value>>,
}

/// Payload as received, before rows are squared up.
#[derive(Deserialize)]
struct RawRowSet {
    fields: Vec<String>,
    #[serde(default)]
    items: Vec<Vec<Value>>,
}

impl From<RawRowSet> for RowSet {
    fn from(raw: RawRowSet) -> Self {
        let mut set = RowSet::new(raw.fields);
        for row in raw.items {
            set.push(row);
        }
        set
    }
}

impl RowSet {
    /// An empty set with the given columns.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            items: Vec::new(),
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// `true` when there are no rows.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Position of a column, if present.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }

    /// Appends a row. Short rows are padded with nulls, long rows truncated.
    pub fn push(&mut self, mut row: Vec<Value>) {
        row.resize(self.fields.len(), Value::Null);
        self.items.push(row);
    }

    /// Cell at (`row`, `column`), if both exist.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.items.get(row).and_then(|r| r.get(idx))
    }

    /// All cells of one column, in row order.
    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &Value>> {
        let idx = self.column_index(name)?;
        Some(self.items.iter().map(move |row| &row[idx]))
    }

    /// Distinct non-null values of a column rendered as strings, first-seen order.
    pub fn distinct_strings(&self, name: &str) -> Vec<String> {
        let mut seen = indexmap::IndexSet::new();
        if let Some(cells) = self.column(name) {
            for cell in cells {
                if let Some(s) = value_as_string(cell) {
                    seen.insert(s);
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Keeps the rows for which `keep` returns `true`.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&[Value]) -> bool,
    {
        self.items.retain(|row| keep(row));
    }

    /// Restricts the set to `columns` (in that order); unknown names are dropped.
    pub fn project(&self, columns: &[String]) -> RowSet {
        let picked: Vec<(String, usize)> = columns
            .iter()
            .filter_map(|c| self.column_index(c).map(|i| (c.clone(), i)))
            .collect();
        RowSet {
            fields: picked.iter().map(|(c, _)| c.clone()).collect(),
            items: self
                .items
                .iter()
                .map(|row| picked.iter().map(|(_, i)| row[*i].clone()).collect())
                .collect(),
        }
    }

    /// Appends the rows of `other`, aligning by column name.
    ///
    /// Columns only present in `other` are added; cells missing on either side
    /// become null.
    pub fn extend(&mut self, other: RowSet) {
        if self.fields.is_empty() && self.items.is_empty() {
            *self = other;
            return;
        }
        for field in &other.fields {
            if self.column_index(field).is_none() {
                self.fields.push(field.clone());
                for row in &mut self.items {
                    row.push(Value::Null);
                }
            }
        }
        let mapping: Vec<usize> = other
            .fields
            .iter()
            .filter_map(|f| self.column_index(f))
            .collect();
        let width = self.fields.len();
        for row in other.items {
            let mut aligned = vec![Value::Null; width];
            for (cell, target) in row.into_iter().zip(&mapping) {
                aligned[*target] = cell;
            }
            self.items.push(aligned);
        }
    }
}

/// Reads a cell as an integer; numeric strings (`"20100104"`) are accepted.
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Reads a cell as a float; numeric strings are accepted.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Renders a scalar cell as a string; null, arrays and objects yield `None`.
pub fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn bars() -> RowSet {
        let mut rs = RowSet::new(["ts_code", "trade_date", "close"]);
        rs.push(vec![json!("000001.SZ"), json!("20100104"), json!(10.5)]);
        rs.push(vec![json!("000002.SZ"), json!("20100104"), json!(8.0)]);
        rs
    }

    #[test]
    fn deserializes_provider_payload() {
        let rs: RowSet = serde_json::from_value(json!({
            "fields": ["cal_date"],
            "items": [["20100104"], ["20100105"]],
            "has_more": false
        }))
        .unwrap();
        assert_eq!(rs.len(), 2);
        assert_eq!(rs.get(1, "cal_date"), Some(&json!("20100105")));
    }

    #[test]
    fn ragged_payload_rows_are_squared_up() {
        let rs: RowSet = serde_json::from_value(json!({
            "fields": ["cal_date", "is_open"],
            "items": [["20100104"], ["20100105", 1, "extra"]]
        }))
        .unwrap();
        assert_eq!(rs.items[0], vec![json!("20100104"), Value::Null]);
        assert_eq!(rs.items[1], vec![json!("20100105"), json!(1)]);
    }

    #[test]
    fn extend_aligns_columns_by_name() {
        let mut rs = bars();
        let mut more = RowSet::new(["close", "ts_code", "vol"]);
        more.push(vec![json!(3.3), json!("600000.SH"), json!(100)]);
        rs.extend(more);

        assert_eq!(rs.fields, vec!["ts_code", "trade_date", "close", "vol"]);
        assert_eq!(rs.items[0][3], Value::Null);
        assert_eq!(
            rs.items[2],
            vec![json!("600000.SH"), Value::Null, json!(3.3), json!(100)]
        );
    }

    #[test]
    fn project_keeps_requested_order() {
        let rs = bars().project(&["close".into(), "missing".into(), "ts_code".into()]);
        assert_eq!(rs.fields, vec!["close", "ts_code"]);
        assert_eq!(rs.items[1], vec![json!(8.0), json!("000002.SZ")]);
    }

    #[test]
    fn value_helpers_accept_numeric_strings() {
        assert_eq!(value_as_i64(&json!("20100104")), Some(20100104));
        assert_eq!(value_as_i64(&json!(20100104.0)), Some(20100104));
        assert_eq!(value_as_i64(&json!(1.5)), None);
        assert_eq!(value_as_f64(&json!("1.25")), Some(1.25));
        assert_eq!(value_as_string(&Value::Null), None);
    }

    #[test]
    fn distinct_strings_skips_nulls() {
        let mut rs = bars();
        rs.push(vec![Value::Null, json!("20100105"), json!(1)]);
        rs.push(vec![json!("000001.SZ"), json!("20100105"), json!(1)]);
        assert_eq!(rs.distinct_strings("ts_code"), vec!["000001.SZ", "000002.SZ"]);
    }
}
