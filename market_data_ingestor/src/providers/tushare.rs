//! Tushare Pro REST client.
//!
//! Every dataset is served by one POST endpoint taking
//! `{"api_name", "token", "params", "fields"}` and answering with
//! `{"code", "msg", "data": {"fields", "items"}}`.

pub mod params;
pub mod provider;
pub mod response;

pub use provider::TushareProvider;
