//! SQLite queue store
//!
//! Every state transition is a single `UPDATE ... WHERE status = <expected>`
//! statement, so SQLite's write lock makes each move atomic across
//! connections and processes sharing the database file.

use crate::db::DatabasePool;
use crate::models::{MessageId, MessageStatus, QueueSizes, QueuedMessage};
use crate::store::{after, check_new, cutoff, QueueStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{FromRow, SqlitePool};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// How often a waiting `dequeue_ready` re-polls the database
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, FromRow)]
struct MessageRow {
    seq: i64,
    id: String,
    account: String,
    payload: String,
    status: String,
    attempt_count: i64,
    max_attempts: i64,
    next_attempt_at: Option<i64>,
    claimed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
    last_error: Option<String>,
}

impl TryFrom<MessageRow> for QueuedMessage {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, detail: String| {
            StoreError::Corrupt(format!("row {} ({}): {}", row.seq, what, detail))
        };

        Ok(QueuedMessage {
            id: Uuid::parse_str(&row.id).map_err(|e| corrupt("id", e.to_string()))?,
            account: row.account.clone(),
            payload: serde_json::from_str(&row.payload)
                .map_err(|e| corrupt("payload", e.to_string()))?,
            attempt_count: u32::try_from(row.attempt_count)
                .map_err(|e| corrupt("attempt_count", e.to_string()))?,
            max_attempts: u32::try_from(row.max_attempts)
                .map_err(|e| corrupt("max_attempts", e.to_string()))?,
            status: row.status.parse().map_err(|e| corrupt("status", e))?,
            next_attempt_at: row.next_attempt_at.map(from_millis).transpose()?,
            claimed_at: row.claimed_at.map(from_millis).transpose()?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            last_error: row.last_error.clone(),
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", ms)))
}

pub(crate) fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// [`QueueStore`] backed by a SQLite database
#[derive(Clone)]
pub struct SqliteQueueStore {
    pool: SqlitePool,
    ready_signal: std::sync::Arc<Notify>,
}

impl SqliteQueueStore {
    /// Create a store on a migrated database
    pub fn new(db: &DatabasePool) -> Self {
        Self {
            pool: db.pool().clone(),
            ready_signal: std::sync::Arc::new(Notify::new()),
        }
    }

    /// Current status of a message, used to explain a failed compare-and-move
    async fn status_of(&self, id: MessageId) -> Result<Option<MessageStatus>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM queue_messages WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(status,)| status.parse().map_err(StoreError::Corrupt))
            .transpose()
    }

    async fn transition_error(&self, id: MessageId, expected: MessageStatus) -> StoreError {
        match self.status_of(id).await {
            Ok(Some(actual)) => StoreError::InvalidState {
                id,
                actual,
                expected,
            },
            Ok(None) => StoreError::NotFound(id),
            Err(e) => e,
        }
    }

    async fn claim_next_ready(&self) -> Result<Option<QueuedMessage>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE queue_messages
            SET status = 'in_flight', claimed_at = ?1, updated_at = ?1
            WHERE seq = (
                SELECT seq FROM queue_messages
                WHERE status = 'pending'
                ORDER BY ready_rank ASC, seq ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(millis(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueuedMessage::try_from).transpose()
    }

    /// Move an in-flight message to the front of ready
    async fn move_to_front(&self, id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'pending',
                claimed_at = NULL,
                updated_at = ?2,
                ready_rank = (
                    SELECT COALESCE(MIN(ready_rank), 0) - 1
                    FROM queue_messages
                    WHERE status = 'pending'
                )
            WHERE id = ?1 AND status = 'in_flight'
            "#,
        )
        .bind(id)
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn enqueue(&self, message: QueuedMessage) -> Result<MessageId, StoreError> {
        check_new(&message)?;

        let payload = serde_json::to_string(&message.payload)
            .map_err(|e| StoreError::InvalidMessage(format!("unserializable payload: {}", e)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO queue_messages (
                id, account, payload, status, attempt_count, max_attempts,
                ready_rank, created_at, updated_at, last_error
            )
            VALUES (
                ?1, ?2, ?3, 'pending', ?4, ?5,
                (SELECT COALESCE(MAX(ready_rank), 0) + 1 FROM queue_messages),
                ?6, ?7, ?8
            )
            "#,
        )
        .bind(message.id.to_string())
        .bind(&message.account)
        .bind(&payload)
        .bind(i64::from(message.attempt_count))
        .bind(i64::from(message.max_attempts))
        .bind(millis(message.created_at))
        .bind(millis(Utc::now()))
        .bind(&message.last_error)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(StoreError::Duplicate(message.id));
            }
            Err(e) => return Err(e.into()),
        }

        self.ready_signal.notify_one();
        Ok(message.id)
    }

    async fn dequeue_ready(&self, timeout: Duration) -> Result<Option<QueuedMessage>, StoreError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(message) = self.claim_next_ready().await? {
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            // Other processes cannot signal us, so wake up periodically as well.
            let wait = POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.ready_signal.notified() => {}
            }
        }
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueuedMessage>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE queue_messages
            SET status = 'in_flight', claimed_at = ?1, updated_at = ?1
            WHERE seq IN (
                SELECT seq FROM queue_messages
                WHERE status = 'scheduled_retry' AND next_attempt_at <= ?2
                ORDER BY next_attempt_at ASC, seq ASC
                LIMIT ?3
            )
            AND status = 'scheduled_retry'
            RETURNING *
            "#,
        )
        .bind(millis(Utc::now()))
        .bind(millis(now))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not preserve the subquery order
        let mut rows = rows;
        rows.sort_by_key(|r| (r.next_attempt_at, r.seq));
        rows.into_iter().map(QueuedMessage::try_from).collect()
    }

    async fn ack(&self, id: MessageId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'sent', claimed_at = NULL, updated_at = ?2,
                attempt_count = MIN(attempt_count + 1, max_attempts)
            WHERE id = ?1 AND status = 'in_flight'
            "#,
        )
        .bind(id.to_string())
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        match self.status_of(id).await? {
            Some(MessageStatus::Sent) => {
                debug!("Duplicate ack for message {}", id);
                Ok(())
            }
            Some(actual) => Err(StoreError::InvalidState {
                id,
                actual,
                expected: MessageStatus::InFlight,
            }),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn schedule_retry(
        &self,
        id: MessageId,
        delay: Duration,
        error: &str,
    ) -> Result<MessageStatus, StoreError> {
        let now = Utc::now();

        let row: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE queue_messages
            SET attempt_count = attempt_count + 1,
                status = CASE
                    WHEN attempt_count + 1 >= max_attempts THEN 'dead'
                    ELSE 'scheduled_retry'
                END,
                next_attempt_at = CASE
                    WHEN attempt_count + 1 >= max_attempts THEN NULL
                    ELSE ?2
                END,
                claimed_at = NULL,
                last_error = ?3,
                updated_at = ?4
            WHERE id = ?1 AND status = 'in_flight'
            RETURNING status
            "#,
        )
        .bind(id.to_string())
        .bind(millis(after(now, delay)))
        .bind(error)
        .bind(millis(now))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((status,)) => status.parse().map_err(StoreError::Corrupt),
            None => Err(self.transition_error(id, MessageStatus::InFlight).await),
        }
    }

    async fn dead_letter(&self, id: MessageId, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET attempt_count = MIN(attempt_count + 1, max_attempts),
                status = 'dead',
                next_attempt_at = NULL,
                claimed_at = NULL,
                last_error = ?2,
                updated_at = ?3
            WHERE id = ?1 AND status = 'in_flight'
            "#,
        )
        .bind(id.to_string())
        .bind(error)
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, MessageStatus::InFlight).await);
        }
        Ok(())
    }

    async fn release(&self, id: MessageId) -> Result<(), StoreError> {
        if self.move_to_front(&id.to_string()).await? == 0 {
            return Err(self.transition_error(id, MessageStatus::InFlight).await);
        }
        self.ready_signal.notify_one();
        Ok(())
    }

    async fn touch(&self, id: MessageId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE queue_messages SET claimed_at = ?2 WHERE id = ?1 AND status = 'in_flight'",
        )
        .bind(id.to_string())
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, MessageStatus::InFlight).await);
        }
        Ok(())
    }

    async fn requeue_dead(&self, id: MessageId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'pending',
                attempt_count = 0,
                next_attempt_at = NULL,
                updated_at = ?2,
                ready_rank = (SELECT COALESCE(MAX(ready_rank), 0) + 1 FROM queue_messages)
            WHERE id = ?1 AND status = 'dead'
            "#,
        )
        .bind(id.to_string())
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, MessageStatus::Dead).await);
        }

        info!("Requeued dead message {}", id);
        self.ready_signal.notify_one();
        Ok(())
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<u64, StoreError> {
        let threshold = millis(cutoff(Utc::now(), older_than));
        let mut reclaimed = 0u64;

        // Newest first, so the oldest stale message ends up at the very front.
        loop {
            let candidate: Option<(String,)> = sqlx::query_as(
                r#"
                SELECT id FROM queue_messages
                WHERE status = 'in_flight' AND (claimed_at IS NULL OR claimed_at <= ?1)
                ORDER BY seq DESC
                LIMIT 1
                "#,
            )
            .bind(threshold)
            .fetch_optional(&self.pool)
            .await?;

            let Some((id,)) = candidate else { break };

            // Zero rows means another worker acked or reclaimed it first.
            reclaimed += self.move_to_front(&id).await?;
        }

        if reclaimed > 0 {
            self.ready_signal.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn sizes(&self) -> Result<QueueSizes, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM queue_messages GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut sizes = QueueSizes::default();
        for (status, count) in rows {
            let status: MessageStatus = status.parse().map_err(StoreError::Corrupt)?;
            sizes.add(status, count.max(0) as u64);
        }
        Ok(sizes)
    }

    async fn get(&self, id: MessageId) -> Result<Option<QueuedMessage>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>("SELECT * FROM queue_messages WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(QueuedMessage::try_from).transpose()
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueuedMessage>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT * FROM queue_messages
            WHERE status = 'dead'
            ORDER BY updated_at DESC, seq DESC
            LIMIT ?1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueuedMessage::try_from).collect()
    }

    async fn purge_dead(&self, id: MessageId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = ?1 AND status = 'dead'")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, MessageStatus::Dead).await);
        }

        info!("Purged dead message {}", id);
        Ok(())
    }

    async fn purge_all_dead(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE status = 'dead'")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn prune_sent(&self, older_than: Duration) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM queue_messages WHERE status = 'sent' AND updated_at <= ?1")
                .bind(millis(cutoff(Utc::now(), older_than)))
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailqueue_common::config::StorageConfig;
    use mailqueue_common::EmailMessage;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn open_at(path: &std::path::Path) -> SqliteQueueStore {
        let config = StorageConfig {
            path: path.to_path_buf(),
            ..StorageConfig::default()
        };
        let db = DatabasePool::new(&config).await.unwrap();
        db.migrate().await.unwrap();
        SqliteQueueStore::new(&db)
    }

    async fn open_store() -> (SqliteQueueStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = open_at(&dir.path().join("queue.db")).await;
        (store, dir)
    }

    fn message(max_attempts: u32) -> QueuedMessage {
        let mut payload = EmailMessage::new("user@example.com", "Hello").with_body("Hi");
        payload.cc.push("cc@example.com".into());
        QueuedMessage::new("default", payload, max_attempts)
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_fifo() {
        let (store, _dir) = open_store().await;
        let original = message(3);
        let first = store.enqueue(original.clone()).await.unwrap();
        let second = store.enqueue(message(3)).await.unwrap();

        let a = store.dequeue_ready(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(a.id, first);
        assert_eq!(a.status, MessageStatus::InFlight);
        assert_eq!(a.payload, original.payload);
        assert!(a.claimed_at.is_some());

        let b = store.dequeue_ready(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(b.id, second);
        assert!(store.dequeue_ready(Duration::from_millis(150)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (store, _dir) = open_store().await;
        let msg = message(3);
        store.enqueue(msg.clone()).await.unwrap();
        assert!(matches!(
            store.enqueue(msg).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dequeue_across_pools() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");
        let producer = open_at(&path).await;

        let mut enqueued = Vec::new();
        for _ in 0..20 {
            enqueued.push(producer.enqueue(message(3)).await.unwrap());
        }

        // One pool per consumer, each racing on its own task
        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = open_at(&path).await;
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(message) = store.dequeue_ready(Duration::ZERO).await.unwrap() {
                    claimed.push(message.id);
                }
                claimed
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            claimed.extend(handle.await.unwrap());
        }
        claimed.sort();
        enqueued.sort();
        assert_eq!(claimed, enqueued);
        assert_eq!(producer.sizes().await.unwrap().in_flight, 20);
    }

    #[tokio::test]
    async fn test_ack_idempotent() {
        let (store, _dir) = open_store().await;
        let id = store.enqueue(message(3)).await.unwrap();
        store.dequeue_ready(Duration::ZERO).await.unwrap();

        store.ack(id).await.unwrap();
        store.ack(id).await.unwrap();
        assert_eq!(store.sizes().await.unwrap().sent, 1);

        assert!(matches!(
            store.ack(Uuid::now_v7()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_schedule_retry_then_dead() {
        let (store, _dir) = open_store().await;
        let id = store.enqueue(message(2)).await.unwrap();
        store.dequeue_ready(Duration::ZERO).await.unwrap();

        let status = store
            .schedule_retry(id, Duration::from_secs(60), "451 later")
            .await
            .unwrap();
        assert_eq!(status, MessageStatus::ScheduledRetry);
        assert!(store.due_retries(Utc::now(), 10).await.unwrap().is_empty());

        let due = store
            .due_retries(Utc::now() + chrono::Duration::seconds(120), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempt_count, 1);

        let status = store.schedule_retry(id, Duration::ZERO, "451 again").await.unwrap();
        assert_eq!(status, MessageStatus::Dead);

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 2);
        assert_eq!(stored.last_error.as_deref(), Some("451 again"));
    }

    #[tokio::test]
    async fn test_due_retries_ordered_by_due_time() {
        let (store, _dir) = open_store().await;
        let a = store.enqueue(message(5)).await.unwrap();
        let b = store.enqueue(message(5)).await.unwrap();
        store.dequeue_ready(Duration::ZERO).await.unwrap();
        store.dequeue_ready(Duration::ZERO).await.unwrap();

        store.schedule_retry(a, Duration::from_secs(20), "x").await.unwrap();
        store.schedule_retry(b, Duration::from_secs(10), "x").await.unwrap();

        let due = store
            .due_retries(Utc::now() + chrono::Duration::seconds(30), 10)
            .await
            .unwrap();
        let ids: Vec<MessageId> = due.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![b, a]);
    }

    #[tokio::test]
    async fn test_dead_letter_requeue_and_purge() {
        let (store, _dir) = open_store().await;
        let id = store.enqueue(message(3)).await.unwrap();
        store.dequeue_ready(Duration::ZERO).await.unwrap();

        store.dead_letter(id, "550 unknown user").await.unwrap();
        let dead = store.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt_count, 1);

        assert!(matches!(
            store.dead_letter(id, "again").await,
            Err(StoreError::InvalidState { .. })
        ));

        store.requeue_dead(id).await.unwrap();
        let again = store.dequeue_ready(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.attempt_count, 0);

        store.dead_letter(id, "550 unknown user").await.unwrap();
        store.purge_dead(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
        assert!(matches!(
            store.purge_dead(id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_release_and_reclaim_go_to_front() {
        let (store, _dir) = open_store().await;
        let first = store.enqueue(message(3)).await.unwrap();
        let second = store.enqueue(message(3)).await.unwrap();

        store.dequeue_ready(Duration::ZERO).await.unwrap();
        store.release(first).await.unwrap();
        let claimed = store.dequeue_ready(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);

        assert_eq!(store.reclaim_stale(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(store.reclaim_stale(Duration::ZERO).await.unwrap(), 1);

        let next = store.dequeue_ready(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(next.id, first);
        let last = store.dequeue_ready(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(last.id, second);
    }

    #[tokio::test]
    async fn test_sizes_and_prune() {
        let (store, _dir) = open_store().await;
        let sent = store.enqueue(message(3)).await.unwrap();
        store.enqueue(message(3)).await.unwrap();
        store.dequeue_ready(Duration::ZERO).await.unwrap();
        store.ack(sent).await.unwrap();

        let sizes = store.sizes().await.unwrap();
        assert_eq!(sizes.ready, 1);
        assert_eq!(sizes.sent, 1);
        assert_eq!(sizes.outstanding(), 1);

        assert_eq!(store.prune_sent(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(store.sizes().await.unwrap().sent, 0);
    }
}
