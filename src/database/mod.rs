//! Connection pool setup and embedded schema migrations.

use std::str::FromStr;

use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::errors::{DbError, DbResult};

// Embed all migration SQL files at compile time
const MIGRATION_ENTITIES: &str = include_str!("../../migrations/20250601000000_entities.sql");
const MIGRATION_DELETE_OPERATIONS: &str =
    include_str!("../../migrations/20250601000001_delete_operations.sql");

// List of migrations with their names and SQL content, applied in order
const MIGRATIONS: &[(&str, &str)] = &[
    ("20250601000000_entities.sql", MIGRATION_ENTITIES),
    (
        "20250601000001_delete_operations.sql",
        MIGRATION_DELETE_OPERATIONS,
    ),
];

/// Open a pool against the given database URL and bring the schema up to
/// date. `sqlite::memory:` works for tests and harnesses.
pub async fn init_pool(db_url: &str) -> DbResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(db_url)
        .map_err(|e| DbError::ConnectionPool(e.to_string()))?
        .create_if_missing(true);

    // A memory database lives and dies with its connection; pool exactly
    // one and keep it open so every caller sees the same schema.
    let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(|e| DbError::ConnectionPool(e.to_string()))?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// Apply any migrations not yet recorded in the `schema_migrations` ledger.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    for &(name, sql) in MIGRATIONS {
        let applied: Option<String> =
            sqlx::query_scalar("SELECT name FROM schema_migrations WHERE name = ?")
                .bind(name)
                .fetch_optional(pool)
                .await?;
        if applied.is_some() {
            debug!("migration {} already applied", name);
            continue;
        }

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| DbError::Transaction(e.to_string()))?;

        for statement in sql.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| DbError::Migration(format!("{}: {}", name, e)))?;
        }

        sqlx::query("INSERT INTO schema_migrations (name, applied_at) VALUES (?, ?)")
            .bind(name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration(format!("{}: {}", name, e)))?;

        tx.commit()
            .await
            .map_err(|e| DbError::Transaction(e.to_string()))?;
        info!("applied migration {}", name);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        // A second pass over an already-migrated schema is a no-op.
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert!(tables.contains(&"entities".to_string()));
        assert!(tables.contains(&"delete_operations".to_string()));
    }
}
