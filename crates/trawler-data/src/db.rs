//! SQLite pool construction and idempotent startup migrations.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::error::{DataError, DataResult, QueryContext};

/// Handle to the embedded database shared by every store.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database file and apply pending
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or migrations fail.
    pub async fn open(path: &Path) -> DataResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .for_op("db.open")?;

        let database = Self { pool };
        database.migrate().await?;
        info!(path = %path.display(), "database ready");
        Ok(database)
    }

    /// Open a private in-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or migrations fail.
    pub async fn open_in_memory() -> DataResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|source| DataError::query("db.open_in_memory", source))?
            .foreign_keys(true);
        // A single connection keeps every query on the same in-memory file.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .for_op("db.open_in_memory")?;

        let database = Self { pool };
        database.migrate().await?;
        Ok(database)
    }

    async fn migrate(&self) -> DataResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|source| DataError::Migration { source })
    }

    /// Access the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool, flushing WAL state.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
