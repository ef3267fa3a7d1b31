//! Catalog subsystem.
//!
//! The catalog describes every table the engine maintains: the trading calendar,
//! reference tables, series tables and derived tables, plus the column types pinned
//! across all of them. See [`crate::catalog::config`] for the TOML model and helpers.

pub mod config;

pub use config::{
    Catalog, ColumnRef, DerivedKind, DerivedTable, FanOut, ReferenceTable, SeriesMode, SeriesTable,
    TableOverride, default_catalog, load_catalog_path, load_catalog_str,
};
