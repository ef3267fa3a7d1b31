use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Parameters naming the instrument a request is about, in lookup order.
const SYMBOL_PARAMS: [&str; 4] = ["ts_code", "index_code", "exchange", "market"];

/// Universal request for one provider dataset.
///
/// This is vendor-agnostic in shape (dataset name, string parameters, field
/// list) and maps one-to-one onto a Tushare Pro call. Providers decide how to
/// interpret parameters; unknown parameters are ignored by convention.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Dataset name, e.g. `"daily"`, `"stock_basic"`, `"trade_cal"`.
    pub api_name: String,
    /// Request parameters (`ts_code`, `start_date`, `exchange`, ...).
    #[serde(default)]
    pub params: IndexMap<String, String>,
    /// Requested columns; empty means the provider's default set.
    #[serde(default)]
    pub fields: Vec<String>,
}

impl QueryRequest {
    /// A request for `api_name` with no parameters.
    pub fn new(api_name: impl Into<String>) -> Self {
        Self {
            api_name: api_name.into(),
            ..Default::default()
        }
    }

    /// Adds (or replaces) a parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Sets the requested columns.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// The instrument (or market/exchange) this request targets, if any.
    pub fn symbol(&self) -> Option<&str> {
        SYMBOL_PARAMS
            .iter()
            .find_map(|key| self.params.get(*key))
            .map(String::as_str)
    }
}

impl fmt::Display for QueryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.api_name)?;
        for (i, (k, v)) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        write!(f, ")")
    }
}
