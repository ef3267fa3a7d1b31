//! Embedded bookkeeping migrations.

use anyhow::anyhow;
use diesel::{Connection, SqliteConnection, connection::SimpleConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tracing::info;

use crate::db::connection::normalize_database_url;

/// Embedded Diesel migrations bundled with this crate.
///
/// They only create the run ledger; market data tables are shaped at run time.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Applies pending migrations on an open connection and logs what ran.
pub fn run_pending(conn: &mut SqliteConnection) -> anyhow::Result<()> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow!(e))?;

    if applied.is_empty() {
        info!("no pending migrations");
    } else {
        for version in &applied {
            info!(%version, "applied migration");
        }
    }
    Ok(())
}

/// Runs pending Diesel migrations on a SQLite database at the given URL.
///
/// This sets the SQLite journal mode to WAL and applies all embedded migrations,
/// returning an error on failure.
pub fn run_sqlite(url: &str) -> anyhow::Result<()> {
    let mut conn = SqliteConnection::establish(normalize_database_url(url))?;
    conn.batch_execute("PRAGMA journal_mode=WAL;")?;
    run_pending(&mut conn)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn migrations_apply_on_temp_file() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let path = temp.path().to_string_lossy().to_string();

        run_sqlite(&path).expect("migration run");
        // second run is a no-op
        run_sqlite(&path).expect("migration rerun");

        let mut conn = SqliteConnection::establish(&path).unwrap();
        conn.batch_execute(
            "INSERT INTO sync_runs (started_at, status) VALUES ('2024-01-02T00:00:00.000Z', 'running')",
        )
        .unwrap();
    }
}
