//! Database utilities for connections and schema migrations.
//!
//! This module provides:
//! - SQLite connection helpers: [`connection::connect_sqlite`] opens a single tuned
//!   connection; [`connection::create_pool`] builds the r2d2 pool the sync engine
//!   checks connections out of. Both apply WAL, foreign_keys=ON and a busy timeout.
//! - Embedded Diesel migrations for the bookkeeping tables (`sync_runs`,
//!   `sync_failures`): [`migrate::run_sqlite`] and [`migrate::run_pending`].
//!
//! Example:
//! ```no_run
//! use market_sync::db::{connection, migrate};
//!
//! let db_path = std::env::temp_dir().join("market_sync_example.db");
//! let url = db_path.to_str().unwrap();
//! migrate::run_sqlite(url).expect("migrations");
//!
//! let pool = connection::create_pool(url, 4).expect("pool");
//! let _conn = pool.get().expect("checkout");
//! ```

pub mod connection;
pub mod migrate;
