use serde::Deserialize;

use crate::{
    models::row_set::RowSet,
    providers::{ApiSnafu, ProviderError},
};

#[derive(Deserialize, Debug)]
pub struct TushareResponse {
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<RowSet>,
}

impl TushareResponse {
    /// Turns the envelope into rows; a non-zero `code` is an API error.
    pub fn into_row_set(self) -> Result<RowSet, ProviderError> {
        if self.code != 0 {
            return ApiSnafu {
                message: format!(
                    "code {}: {}",
                    self.code,
                    self.msg.unwrap_or_else(|| "no message".to_string())
                ),
            }
            .fail();
        }
        Ok(self.data.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_envelope() {
        let raw = r#"{
            "request_id": "x",
            "code": 0,
            "msg": "",
            "data": {"fields": ["ts_code", "trade_date", "close"],
                     "items": [["000001.SZ", "20100104", 24.27]],
                     "has_more": false}
        }"#;
        let rows = serde_json::from_str::<TushareResponse>(raw)
            .unwrap()
            .into_row_set()
            .unwrap();
        assert_eq!(rows.fields, vec!["ts_code", "trade_date", "close"]);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn non_zero_code_is_api_error() {
        let raw = r#"{"code": 40203, "msg": "rate limited", "data": null}"#;
        let err = serde_json::from_str::<TushareResponse>(raw)
            .unwrap()
            .into_row_set()
            .unwrap_err();
        assert!(matches!(err, ProviderError::Api { .. }));
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn missing_data_is_empty() {
        let raw = r#"{"code": 0, "msg": null}"#;
        let rows = serde_json::from_str::<TushareResponse>(raw)
            .unwrap()
            .into_row_set()
            .unwrap();
        assert!(rows.is_empty());
    }
}
