//! Incremental market data synchronization engine.
//!
//! The crate keeps a SQLite store of provider datasets up to date:
//! - [`storage`]: generic read/write path for dynamically shaped tables
//! - [`calendar`]: the trading calendar and "what is new" queries
//! - [`planner`]: per instrument, the date a series fetch starts from
//! - [`derive`]: MACD and moving averages computed from daily bars
//! - [`orchestrator`]: the phased run tying everything together
//!
//! Bookkeeping (runs and failures) lives in [`ledger`] on top of the Diesel
//! [`schema`] and [`models`].

pub mod calendar;
pub mod catalog;
pub mod config;
pub mod db;
pub mod derive;
pub mod error;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod planner;
pub mod report;
pub mod schema;
pub mod storage;
pub mod tz;
