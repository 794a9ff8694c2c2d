//! Database connection and pool management

use mailqueue_common::config::StorageConfig;
use mailqueue_common::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::time::Duration;
use tracing::info;

/// Database pool wrapper
#[derive(Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Create a new database pool from configuration
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        if config.backend != "sqlite" {
            return Err(Error::Config(format!(
                "Unsupported database backend: {}",
                config.backend
            )));
        }

        info!(
            backend = %config.backend,
            path = %config.path.display(),
            "Connecting to database"
        );

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect: {}", e)))?;

        info!("Database connection established");

        Ok(Self { pool })
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Close all connections
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            path: dir.path().join("queue.db"),
            ..StorageConfig::default()
        };

        let db = DatabasePool::new(&config).await.unwrap();
        db.migrate().await.unwrap();
        db.health_check().await.unwrap();
        // Migrations are idempotent
        db.migrate().await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_rejects_other_backends() {
        let config = StorageConfig {
            backend: "postgres".to_string(),
            ..StorageConfig::default()
        };
        assert!(matches!(
            DatabasePool::new(&config).await,
            Err(Error::Config(_))
        ));
    }
}
