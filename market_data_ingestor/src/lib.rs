//! Provider-facing half of the market data workspace.
//!
//! - [`models`] holds the wire-level shapes shared with the sync engine: the
//!   tabular [`models::row_set::RowSet`], [`models::trade_date::TradeDate`] and
//!   [`models::request::QueryRequest`].
//! - [`providers`] defines the [`providers::DataProvider`] trait plus the
//!   Tushare REST client and an in-memory provider.

pub mod models;
pub mod providers;
