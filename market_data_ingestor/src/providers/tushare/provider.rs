use std::num::NonZeroU32;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::Client;
use secrecy::SecretString;
use shared_utils::env::get_env_var;
use snafu::{OptionExt, ResultExt};
use tracing::debug;

use crate::{
    models::{request::QueryRequest, row_set::RowSet},
    providers::{
        ApiSnafu, ClientBuildSnafu, DataProvider, InvalidQuotaSnafu, MissingEnvVarSnafu,
        ProviderError, ProviderInitError, ReqwestSnafu,
        tushare::{params::TushareRequestBody, response::TushareResponse},
    },
};

pub const BASE_URL: &str = "http://api.tushare.pro";
pub const TOKEN_ENV: &str = "TUSHARE_TOKEN";

pub struct TushareProvider {
    client: Client,
    token: SecretString,
    base_url: String,
    limiter: DefaultDirectRateLimiter,
}

impl TushareProvider {
    /// Creates a new Tushare provider.
    ///
    /// Reads the API token from the `TUSHARE_TOKEN` environment variable and
    /// allows 200 calls a minute (the entry-level tier).
    pub fn new() -> Result<Self, ProviderInitError> {
        let per_minute: NonZeroU32 = nonzero!(200u32);
        Self::from_env(TOKEN_ENV, per_minute.get())
    }

    /// Reads the token from `token_env` and allows `requests_per_minute` calls.
    pub fn from_env(token_env: &str, requests_per_minute: u32) -> Result<Self, ProviderInitError> {
        let token = SecretString::from(get_env_var(token_env).context(MissingEnvVarSnafu)?);
        Self::with_token(token, BASE_URL, requests_per_minute)
    }

    pub fn with_token(
        token: SecretString,
        base_url: impl Into<String>,
        requests_per_minute: u32,
    ) -> Result<Self, ProviderInitError> {
        let per_minute = NonZeroU32::new(requests_per_minute).context(InvalidQuotaSnafu {
            message: "requests_per_minute must be positive",
        })?;
        let client = Client::builder().build().context(ClientBuildSnafu)?;

        Ok(Self {
            client,
            token,
            base_url: base_url.into(),
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
        })
    }
}

#[async_trait]
impl DataProvider for TushareProvider {
    async fn query(&self, request: QueryRequest) -> Result<RowSet, ProviderError> {
        self.limiter.until_ready().await;
        debug!(request = %request, "tushare query");

        let body = TushareRequestBody::new(&request, &self.token);
        let response = self
            .client
            .post(&self.base_url)
            .json(&body)
            .send()
            .await
            .context(ReqwestSnafu)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_msg = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown API error".to_string());
            return ApiSnafu {
                message: format!("HTTP {status}: {error_msg}"),
            }
            .fail();
        }

        let envelope = response
            .json::<TushareResponse>()
            .await
            .context(ReqwestSnafu)?;
        envelope.into_row_set()
    }
}
