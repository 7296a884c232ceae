//! Database migration helpers.
//!
//! Each [`Migration`] is recorded by name in a `_migrations` table once it
//! has been applied, inside the same transaction as its statements.

use std::collections::HashSet;

use sqlx::{Executor, PgPool};
use thiserror::Error;
use tracing::info;

use super::schema::{Migration, MIGRATIONS};

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration {name} failed: {message}")]
    MigrationFailed { name: String, message: String },
}

const CREATE_MIGRATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS _migrations (
    id SERIAL PRIMARY KEY,
    name VARCHAR(255) NOT NULL UNIQUE,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Applies the schema steps that a database has not seen yet.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending migrations and returns how many were applied.
    ///
    /// # Errors
    ///
    /// Stops at the first failing step; earlier steps stay applied.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        sqlx::query(CREATE_MIGRATIONS_TABLE)
            .execute(&self.pool)
            .await?;

        let applied: HashSet<String> = sqlx::query_scalar("SELECT name FROM _migrations")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .collect();

        let pending = pending_migrations(&applied);
        for migration in &pending {
            self.apply(migration).await?;
            info!(migration = migration.name, "Applied migration");
        }

        Ok(pending.len())
    }

    async fn apply(&self, migration: &Migration) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        // unprepared execution allows the multi-statement index block
        (&mut *tx)
            .execute(migration.sql)
            .await
            .map_err(|e| MigrationError::MigrationFailed {
                name: migration.name.to_string(),
                message: e.to_string(),
            })?;

        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

/// Steps not yet recorded, in application order.
fn pending_migrations(applied: &HashSet<String>) -> Vec<Migration> {
    MIGRATIONS
        .iter()
        .filter(|m| !applied.contains(m.name))
        .copied()
        .collect()
}
