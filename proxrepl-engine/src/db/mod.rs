//! Database layer using SQLite
//!
//! The job store: durable record of nodes, job definitions, run history and
//! per-run phase logs. Single source of truth for scheduling.

pub mod migrations;

pub mod host_backup_jobs;
pub mod job_logs;
pub mod migration_jobs;
pub mod nodes;
pub mod recovery_jobs;
pub mod settings;
pub mod sync_jobs;
pub mod vm_registry;

use proxrepl_common::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(database_url: &str) -> Result<Self> {
        // Create parent directory if needed
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            if path != ":memory:" {
                if let Some(parent) = Path::new(path).parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        proxrepl_common::Error::System(format!("Failed to create DB directory: {}", e))
                    })?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| proxrepl_common::Error::System(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true)
            .foreign_keys(true);

        // In-memory databases must stay on a single connection: every new
        // connection would otherwise open its own empty database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 16 };

        // Create connection pool
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| proxrepl_common::Error::System(format!("Database connection failed: {}", e)))?;

        tracing::info!("Database connection established");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool).await?;
        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Database connection closed");
    }

    /// Health check - verify database connectivity
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| proxrepl_common::Error::System(format!("Database health check failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) async fn test_db() -> Database {
    let db = Database::new("sqlite://:memory:")
        .await
        .expect("Failed to create database");
    db.migrate().await.expect("Failed to run migrations");
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_connection() {
        let db = test_db().await;
        db.health_check().await.expect("Health check failed");
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = test_db().await;
        db.migrate().await.expect("Second migration run failed");
    }
}
