//! Queue store abstraction
//!
//! A store holds every message in exactly one of the ready, scheduled-retry,
//! dead or in-flight collections. All moves between collections are atomic
//! with respect to concurrent callers, which makes the store the only
//! synchronization point between workers.

use crate::models::{MessageId, MessageStatus, QueueSizes, QueuedMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by queue stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Message {0} not found")]
    NotFound(MessageId),

    #[error("Message {id} is {actual}, expected {expected}")]
    InvalidState {
        id: MessageId,
        actual: MessageStatus,
        expected: MessageStatus,
    },

    #[error("Message {0} already exists")]
    Duplicate(MessageId),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// The store could not be reached; the operation may be retried as-is
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        let unavailable = match &e {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => true,
            // SQLITE_BUSY / SQLITE_LOCKED
            sqlx::Error::Database(db) => {
                let message = db.message().to_ascii_lowercase();
                message.contains("locked") || message.contains("busy")
            }
            _ => false,
        };

        if unavailable {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Database(e)
        }
    }
}

impl From<StoreError> for mailqueue_common::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidMessage(reason) => mailqueue_common::Error::InvalidMessage(reason),
            StoreError::NotFound(id) => mailqueue_common::Error::NotFound(id.to_string()),
            StoreError::Database(err) => mailqueue_common::Error::Database(err.to_string()),
            other => mailqueue_common::Error::Storage(other.to_string()),
        }
    }
}

/// Durable FIFO queue with scheduled-retry and dead-letter collections
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append a pending message to the ready collection
    async fn enqueue(&self, message: QueuedMessage) -> Result<MessageId, StoreError>;

    /// Claim the oldest ready message, waiting at most `timeout` for one to appear
    async fn dequeue_ready(&self, timeout: Duration) -> Result<Option<QueuedMessage>, StoreError>;

    /// Claim up to `limit` scheduled retries due at `now`, oldest due first
    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueuedMessage>, StoreError>;

    /// Mark an in-flight message sent. A second ack is a no-op.
    async fn ack(&self, id: MessageId) -> Result<(), StoreError>;

    /// Record a failed attempt and schedule the next one after `delay`
    ///
    /// Returns the resulting status: `Dead` when the attempt exhausted
    /// `max_attempts`, `ScheduledRetry` otherwise.
    async fn schedule_retry(
        &self,
        id: MessageId,
        delay: Duration,
        error: &str,
    ) -> Result<MessageStatus, StoreError>;

    /// Record a failed attempt and archive the message as dead
    async fn dead_letter(&self, id: MessageId, error: &str) -> Result<(), StoreError>;

    /// Return a claimed but unattempted message to the front of ready
    async fn release(&self, id: MessageId) -> Result<(), StoreError>;

    /// Refresh the claim time of an in-flight message
    async fn touch(&self, id: MessageId) -> Result<(), StoreError>;

    /// Move a dead message to the back of ready with a fresh attempt budget
    async fn requeue_dead(&self, id: MessageId) -> Result<(), StoreError>;

    /// Return in-flight messages claimed longer than `older_than` ago to ready
    async fn reclaim_stale(&self, older_than: Duration) -> Result<u64, StoreError>;

    async fn sizes(&self) -> Result<QueueSizes, StoreError>;

    async fn get(&self, id: MessageId) -> Result<Option<QueuedMessage>, StoreError>;

    /// Most recently archived dead messages first
    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueuedMessage>, StoreError>;

    /// Permanently delete one dead message
    async fn purge_dead(&self, id: MessageId) -> Result<(), StoreError>;

    /// Permanently delete every dead message
    async fn purge_all_dead(&self) -> Result<u64, StoreError>;

    /// Drop `sent` records older than `older_than`
    async fn prune_sent(&self, older_than: Duration) -> Result<u64, StoreError>;
}

/// Reject messages that must never enter the queue
pub(crate) fn check_new(message: &QueuedMessage) -> Result<(), StoreError> {
    if message.max_attempts < 1 {
        return Err(StoreError::InvalidMessage(
            "max_attempts must be at least 1".to_string(),
        ));
    }
    if message.account.is_empty() {
        return Err(StoreError::InvalidMessage("account is required".to_string()));
    }
    if message.payload.to.is_empty() {
        return Err(StoreError::InvalidMessage(
            "at least one recipient is required".to_string(),
        ));
    }
    Ok(())
}

/// `now - age`, saturating for absurd ages
pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    now - to_chrono(age)
}

/// `now + delay`, saturating for absurd delays
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + to_chrono(delay)
}

fn to_chrono(d: Duration) -> chrono::Duration {
    const CAP: Duration = Duration::from_secs(100 * 365 * 24 * 3600);
    chrono::Duration::from_std(d.min(CAP)).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailqueue_common::EmailMessage;

    #[test]
    fn test_check_new() {
        let payload = EmailMessage::new("a@example.com", "Hi").with_body("x");
        assert!(check_new(&QueuedMessage::new("default", payload.clone(), 3)).is_ok());
        assert!(matches!(
            check_new(&QueuedMessage::new("default", payload.clone(), 0)),
            Err(StoreError::InvalidMessage(_))
        ));
        assert!(check_new(&QueuedMessage::new("", payload, 1)).is_err());
    }

    #[test]
    fn test_time_helpers_saturate() {
        let now = Utc::now();
        assert!(after(now, Duration::from_secs(60)) > now);
        assert!(cutoff(now, Duration::from_secs(60)) < now);
        assert!(after(now, Duration::MAX) > now);
    }

    #[test]
    fn test_unavailable_mapping() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_unavailable());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_unavailable());
    }
}
