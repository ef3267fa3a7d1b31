//! SQLite connection helpers.
//!
//! [`connect_sqlite`] opens one connection and applies the connection-wide PRAGMAs;
//! [`create_pool`] builds an r2d2 pool whose connections get the same PRAGMAs on
//! checkout. Journal mode is persistent per database file and is switched to WAL
//! once, when the pool is created.

use std::time::Duration;

use diesel::{
    Connection, SqliteConnection,
    connection::SimpleConnection,
    r2d2::{self, ConnectionManager, Pool, PooledConnection},
};
use tracing::{debug, warn};

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Milliseconds a connection waits on a locked database before failing.
pub const BUSY_TIMEOUT_MS: u32 = 30_000;

const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;";

/// Accepts bare paths as well as `sqlite:` / `sqlite://` prefixed URLs.
pub fn normalize_database_url(database_url: &str) -> &str {
    database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url)
}

fn apply_pragmas(conn: &mut SqliteConnection) -> diesel::QueryResult<()> {
    conn.batch_execute(&format!(
        "PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}; {CONNECTION_PRAGMAS}"
    ))
}

/// Open a SQLite connection and apply connection-wide PRAGMAs.
pub fn connect_sqlite(database_url: &str) -> anyhow::Result<SqliteConnection> {
    let mut conn = SqliteConnection::establish(normalize_database_url(database_url))?;

    // Better read concurrency while workers append
    conn.batch_execute("PRAGMA journal_mode = WAL;")?;
    apply_pragmas(&mut conn)?;
    Ok(conn)
}

#[derive(Debug)]
struct ConnectionCustomizer;

impl r2d2::CustomizeConnection<SqliteConnection, r2d2::Error> for ConnectionCustomizer {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        apply_pragmas(conn).map_err(r2d2::Error::QueryError)
    }
}

/// Build a connection pool holding at most `max_size` connections.
pub fn create_pool(database_url: &str, max_size: u32) -> Result<DbPool, r2d2::PoolError> {
    let url = normalize_database_url(database_url);
    {
        // WAL sticks to the file; a failure here resurfaces on first checkout.
        match SqliteConnection::establish(url) {
            Ok(mut conn) => {
                if let Err(e) = conn.batch_execute(&format!(
                    "PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}; PRAGMA journal_mode = WAL;"
                )) {
                    warn!(database = url, error = %e, "cannot switch to WAL");
                }
            }
            Err(e) => warn!(database = url, error = %e, "cannot open database to enable WAL"),
        }
    }

    debug!(database = url, max_size, "creating sqlite pool");
    let manager = ConnectionManager::<SqliteConnection>::new(url);
    Pool::builder()
        .max_size(max_size.max(1))
        .min_idle(Some(1))
        .connection_timeout(Duration::from_secs(30))
        .connection_customizer(Box::new(ConnectionCustomizer))
        .build(manager)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_sqlite_scheme() {
        assert_eq!(normalize_database_url("sqlite://data/market.db"), "data/market.db");
        assert_eq!(normalize_database_url("sqlite:market.db"), "market.db");
        assert_eq!(normalize_database_url("market.db"), "market.db");
    }

    #[test]
    fn unopenable_database_fails_pool_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("market.db");
        let err = create_pool(path.to_str().unwrap(), 1);
        assert!(err.is_err());
    }
}
