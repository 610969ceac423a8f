//! Pool setup and migration runner.
//!
//! Grounded on the teacher's `storage::database::Database::open` +
//! `run_migrations`, replacing the `Arc<Mutex<rusqlite::Connection>>` +
//! `spawn_blocking` bridge with a native `sqlx::PgPool`.

use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::Row;

use super::{schema, Result, StorageError};

#[derive(Debug, Clone)]
pub struct Storage {
    pool: sqlx::PgPool,
}

impl Storage {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// For tests that want a pool without touching migrations twice.
    pub fn from_pool(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        for migration in schema::all_migrations() {
            sqlx::query(migration)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }
        Ok(())
    }

    /// `information_schema` column detection (§4.F, §6): used by
    /// `setSyncState` / `tryClaimMailboxSync` to degrade gracefully on
    /// older schemas instead of failing on an unknown column.
    pub async fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        let row: Option<PgRow> = sqlx::query(
            "SELECT 1 FROM information_schema.columns WHERE table_name = $1 AND column_name = $2",
        )
        .bind(table)
        .bind(column)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    // Exercised against a live Postgres in integration tests only;
    // `Storage::connect` itself needs a real connection string.
    use super::*;

    #[test]
    fn migrations_list_is_non_empty() {
        assert!(!schema::all_migrations().is_empty());
    }

    #[allow(dead_code)]
    fn type_check_has_column_signature(s: &Storage) -> impl std::future::Future<Output = Result<bool>> + '_ {
        s.has_column("sync_states", "modseq")
    }
}
