//! Failures surfaced by a sync run.
//!
//! Instrument- and table-scoped failures never abort a run: the orchestrator turns
//! them into [`SyncError`]s, logs them, records them in the run ledger and moves on.
//! Only [`SyncError::Init`] ends a run early.

use std::fmt;

use market_data_ingestor::providers::ProviderError;
use serde::Serialize;
use thiserror::Error;

use crate::storage::StorageError;

/// Run phase, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Init,
    RefreshReference,
    SyncSeries,
    Derive,
    FinalizeKeys,
    Done,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::RefreshReference => "REFRESH_REFERENCE",
            Phase::SyncSeries => "SYNC_SERIES",
            Phase::Derive => "DERIVE",
            Phase::FinalizeKeys => "FINALIZE_KEYS",
            Phase::Done => "DONE",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification stored in `sync_failures.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    Write,
    KeyViolation,
    Derive,
    Init,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Fetch => "fetch",
            FailureKind::Write => "write",
            FailureKind::KeyViolation => "key_violation",
            FailureKind::Derive => "derive",
            FailureKind::Init => "init",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Provider call failed for one instrument or one fan-out part.
    #[error("fetch {table} {}: {source}", .code.as_deref().unwrap_or("*"))]
    Fetch {
        table: String,
        code: Option<String>,
        #[source]
        source: ProviderError,
    },

    /// Reading or writing storage failed.
    #[error("write {table} {}: {source}", .code.as_deref().unwrap_or("*"))]
    Write {
        table: String,
        code: Option<String>,
        #[source]
        source: StorageError,
    },

    /// Stored rows are not unique on the table's key.
    #[error("key violation on {table}: {source}")]
    KeyViolation {
        table: String,
        #[source]
        source: StorageError,
    },

    /// Derived series computation failed for one instrument.
    #[error("derive {table} {code}: {message}")]
    Derive {
        table: String,
        code: String,
        message: String,
    },

    /// Storage could not be opened or prepared; the run stops.
    #[error("initialization failed: {message}")]
    Init { message: String },
}

impl SyncError {
    /// Storage failure, classified: key violations get their own variant.
    pub fn storage(table: &str, code: Option<&str>, source: StorageError) -> Self {
        if source.is_key_violation() {
            SyncError::KeyViolation {
                table: table.to_string(),
                source,
            }
        } else {
            SyncError::Write {
                table: table.to_string(),
                code: code.map(str::to_string),
                source,
            }
        }
    }

    pub fn fetch(table: &str, code: Option<&str>, source: ProviderError) -> Self {
        SyncError::Fetch {
            table: table.to_string(),
            code: code.map(str::to_string),
            source,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::Fetch { .. } => FailureKind::Fetch,
            SyncError::Write { .. } => FailureKind::Write,
            SyncError::KeyViolation { .. } => FailureKind::KeyViolation,
            SyncError::Derive { .. } => FailureKind::Derive,
            SyncError::Init { .. } => FailureKind::Init,
        }
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            SyncError::Fetch { table, .. }
            | SyncError::Write { table, .. }
            | SyncError::KeyViolation { table, .. }
            | SyncError::Derive { table, .. } => Some(table),
            SyncError::Init { .. } => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            SyncError::Fetch { code, .. } | SyncError::Write { code, .. } => code.as_deref(),
            SyncError::Derive { code, .. } => Some(code),
            SyncError::KeyViolation { .. } | SyncError::Init { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_violations_are_split_out() {
        let err = SyncError::storage(
            "stock_daily",
            Some("000001.SZ"),
            StorageError::KeyViolation {
                table: "stock_daily".into(),
                message: "UNIQUE constraint failed".into(),
            },
        );
        assert_eq!(err.kind(), FailureKind::KeyViolation);
        assert_eq!(err.table(), Some("stock_daily"));
        assert_eq!(err.code(), None);

        let err = SyncError::storage("macd", Some("000001.SZ"), StorageError::schema("macd", "bad"));
        assert_eq!(err.kind(), FailureKind::Write);
        assert_eq!(err.code(), Some("000001.SZ"));
        assert!(err.to_string().starts_with("write macd 000001.SZ"));
    }

    #[test]
    fn phases_render_upper_case() {
        assert_eq!(Phase::RefreshReference.to_string(), "REFRESH_REFERENCE");
        assert_eq!(FailureKind::KeyViolation.to_string(), "key_violation");
    }
}
