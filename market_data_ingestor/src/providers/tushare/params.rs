use indexmap::IndexMap;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::models::request::QueryRequest;

/// Wire body of a Tushare Pro call.
#[derive(Debug, Serialize)]
pub struct TushareRequestBody<'a> {
    pub api_name: &'a str,
    pub token: &'a str,
    pub params: &'a IndexMap<String, String>,
    /// Comma separated; empty asks for the dataset's default columns.
    pub fields: String,
}

impl<'a> TushareRequestBody<'a> {
    pub fn new(request: &'a QueryRequest, token: &'a SecretString) -> Self {
        Self {
            api_name: &request.api_name,
            token: token.expose_secret(),
            params: &request.params,
            fields: request.fields.join(","),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_joins_fields_and_keeps_param_order() {
        let request = QueryRequest::new("daily")
            .param("ts_code", "000001.SZ")
            .param("start_date", "20100104")
            .with_fields(["ts_code", "trade_date", "close"]);
        let token = SecretString::from("abc".to_string());
        let body = serde_json::to_string(&TushareRequestBody::new(&request, &token)).unwrap();
        assert_eq!(
            body,
            r#"{"api_name":"daily","token":"abc","params":{"ts_code":"000001.SZ","start_date":"20100104"},"fields":"ts_code,trade_date,close"}"#
        );
    }
}
