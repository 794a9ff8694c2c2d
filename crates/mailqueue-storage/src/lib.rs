//! mailqueue Storage - Durable queue store
//!
//! This crate provides the [`QueueStore`] abstraction and its backends:
//! an in-memory store and a SQLite store, plus the shared [`RateLedger`].

pub mod db;
pub mod memory;
pub mod models;
pub mod rate_ledger;
pub mod sqlite;
pub mod store;

pub use db::DatabasePool;
pub use memory::MemoryQueueStore;
pub use models::{MessageId, MessageStatus, QueueSizes, QueuedMessage};
pub use rate_ledger::{RateLedger, SqliteRateLedger, WindowLimit};
pub use sqlite::SqliteQueueStore;
pub use store::{QueueStore, StoreError};

use mailqueue_common::config::StorageConfig;
use mailqueue_common::{Error, Result};
use std::sync::Arc;
use tracing::info;

/// An opened storage backend
pub struct Storage {
    pub queue: Arc<dyn QueueStore>,
    /// Rate grants shared through the database. `None` for the memory
    /// backend, whose queue cannot be shared across processes either.
    pub rate_ledger: Option<Arc<dyn RateLedger>>,
    db: Option<DatabasePool>,
}

impl Storage {
    /// Close database connections, if any
    pub async fn close(&self) {
        if let Some(db) = &self.db {
            db.close().await;
            info!("Database connections closed");
        }
    }
}

/// Open the configured backend, running migrations when needed
pub async fn create_storage(config: &StorageConfig) -> Result<Storage> {
    match config.backend.as_str() {
        "memory" => Ok(Storage {
            queue: Arc::new(MemoryQueueStore::new()),
            rate_ledger: None,
            db: None,
        }),
        "sqlite" => {
            let db = DatabasePool::new(config).await?;
            db.migrate().await?;
            db.health_check().await?;
            Ok(Storage {
                queue: Arc::new(SqliteQueueStore::new(&db)),
                rate_ledger: Some(Arc::new(SqliteRateLedger::new(&db))),
                db: Some(db),
            })
        }
        other => Err(Error::Config(format!(
            "Unsupported storage backend: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_memory_store() {
        let config = StorageConfig {
            backend: "memory".to_string(),
            ..StorageConfig::default()
        };
        let storage = create_storage(&config).await.unwrap();
        assert_eq!(storage.queue.sizes().await.unwrap(), QueueSizes::default());
        assert!(storage.rate_ledger.is_none());
        storage.close().await;
    }

    #[tokio::test]
    async fn test_create_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: "sqlite".to_string(),
            path: dir.path().join("mailqueue.db"),
            ..StorageConfig::default()
        };
        let storage = create_storage(&config).await.unwrap();
        assert_eq!(storage.queue.sizes().await.unwrap().ready, 0);

        let ledger = storage.rate_ledger.clone().unwrap();
        let limits = [WindowLimit::per_hour(1)];
        let now = chrono::Utc::now();
        assert!(ledger.try_grant("default", &limits, now).await.unwrap().is_none());
        assert!(ledger.try_grant("default", &limits, now).await.unwrap().is_some());

        storage.close().await;
        assert!(storage.queue.sizes().await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let config = StorageConfig {
            backend: "redis".to_string(),
            ..StorageConfig::default()
        };
        assert!(matches!(create_storage(&config).await, Err(Error::Config(_))));
    }
}
