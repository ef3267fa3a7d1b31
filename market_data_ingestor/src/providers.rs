//! Provider abstraction for market data sources.
//!
//! This module defines the [`DataProvider`] trait, which serves as a unified interface
//! for fetching tabular datasets (listings, daily bars, fundamentals, calendars) from a
//! market data vendor.
//!
//! Each concrete provider (the Tushare Pro REST client, the in-memory test double)
//! implements [`DataProvider`] to handle vendor-specific transport and validation.
//!
//! The trait is designed for async usage and supports dynamic dispatch
//! (`Arc<dyn DataProvider>`) so the sync engine never knows which vendor it talks to.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use market_data_ingestor::models::{request::QueryRequest, row_set::RowSet};
//! use market_data_ingestor::providers::{DataProvider, ProviderError};
//!
//! struct EmptyProvider;
//!
//! #[async_trait]
//! impl DataProvider for EmptyProvider {
//!     async fn query(&self, request: QueryRequest) -> Result<RowSet, ProviderError> {
//!         Ok(RowSet::new(request.fields))
//!     }
//! }
//! ```

pub mod memory;
pub mod tushare;

use async_trait::async_trait;
use shared_utils::env::MissingEnvVarError;
use snafu::{Backtrace, Snafu};

use crate::models::{
    request::QueryRequest,
    row_set::{RowSet, value_as_i64},
    trade_date::TradeDate,
};

/// Dataset holding the exchange calendar.
pub const TRADE_CAL_API: &str = "trade_cal";

/// Trait for fetching datasets from a market data provider.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Runs one dataset query.
    ///
    /// An empty [`RowSet`] means "no data for these parameters"; it is not an error.
    async fn query(&self, request: QueryRequest) -> Result<RowSet, ProviderError>;

    /// Open trading days of `exchange` within `[start, end]`, ascending and unique.
    ///
    /// The default implementation queries the `trade_cal` dataset.
    async fn trading_calendar(
        &self,
        exchange: &str,
        start: TradeDate,
        end: TradeDate,
    ) -> Result<Vec<TradeDate>, ProviderError> {
        let request = QueryRequest::new(TRADE_CAL_API)
            .param("exchange", exchange)
            .param("start_date", start.to_string())
            .param("end_date", end.to_string())
            .param("is_open", "1")
            .with_fields(["cal_date", "is_open"]);
        let rows = self.query(request).await?;

        let date_idx = rows.column_index("cal_date").ok_or_else(|| {
            ValidationSnafu {
                message: "trade_cal response has no cal_date column",
            }
            .build()
        })?;
        let open_idx = rows.column_index("is_open");

        let mut dates = Vec::with_capacity(rows.len());
        for row in &rows.items {
            if open_idx.and_then(|idx| row.get(idx)).and_then(value_as_i64) == Some(0) {
                continue;
            }
            let Some(raw) = row.get(date_idx).and_then(value_as_i64) else {
                continue;
            };
            let date = TradeDate::from_int(raw).map_err(|e| {
                ValidationSnafu {
                    message: e.to_string(),
                }
                .build()
            })?;
            dates.push(date);
        }
        dates.sort_unstable();
        dates.dedup();
        Ok(dates)
    }
}

/// Errors that can occur during the creation of a provider instance
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProviderInitError {
    /// missed environment variable.
    #[snafu(display("Missing environment variable: {source}"))]
    MissingEnvVar {
        source: MissingEnvVarError,
        backtrace: Backtrace,
    },

    /// failed to init reqwest client
    #[snafu(display("Failed to build HTTP client: {source}"))]
    ClientBuild {
        source: reqwest::Error,
        backtrace: Backtrace,
    },

    /// Rate limit of zero requests per minute.
    #[snafu(display("Invalid request quota: {message}"))]
    InvalidQuota {
        message: String,
        backtrace: Backtrace,
    },
}

/// Errors that can occur within a `DataProvider` implementation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProviderError {
    /// An error during an API request (e.g., network failure, timeout).
    #[snafu(display("API request failed: {source}"))]
    Reqwest {
        source: reqwest::Error,
        backtrace: Backtrace,
    },

    /// The provider's API returned a specific error message (e.g., invalid token).
    #[snafu(display("API error: {message}"))]
    Api {
        message: String,
        backtrace: Backtrace,
    },

    /// The request or response failed validation.
    #[snafu(display("Invalid parameters for provider: {message}"))]
    Validation {
        message: String,
        backtrace: Backtrace,
    },

    /// An internal error occurred while processing data within the provider.
    #[snafu(display("Internal provider error: {message}"))]
    Internal {
        message: String,
        backtrace: Backtrace,
    },
}
