//! Rate grant ledger
//!
//! Sliding-window rate limiting needs the timestamps of recent sends. When
//! several processes share one database the timestamps have to live there
//! too, otherwise each process enforces the ceiling on its own and together
//! they exceed it.

use crate::db::DatabasePool;
use crate::sqlite::millis;
use crate::store::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::time::Duration;
use tracing::{debug, warn};

/// Ceiling for one rolling window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub span: Duration,
    pub ceiling: u32,
}

impl WindowLimit {
    pub const fn new(span: Duration, ceiling: u32) -> Self {
        Self { span, ceiling }
    }

    pub const fn per_minute(ceiling: u32) -> Self {
        Self::new(Duration::from_secs(60), ceiling)
    }

    pub const fn per_hour(ceiling: u32) -> Self {
        Self::new(Duration::from_secs(3600), ceiling)
    }
}

/// Shared record of rate limiter grants
#[async_trait]
pub trait RateLedger: Send + Sync {
    /// Record a grant for `account` at `now` if every window in `limits` admits it
    ///
    /// Returns `None` when the grant was recorded, otherwise how long until
    /// all windows admit one more. Check and record are one atomic step.
    async fn try_grant(
        &self,
        account: &str,
        limits: &[WindowLimit],
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>, StoreError>;

    /// Grants recorded for `account` inside the window of `span` ending at `now`
    async fn count(
        &self,
        account: &str,
        span: Duration,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    /// Forget grants recorded at or before `before`
    async fn prune(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

fn span_millis(span: Duration) -> i64 {
    i64::try_from(span.as_millis()).unwrap_or(i64::MAX)
}

/// [`RateLedger`] stored in the `rate_grants` table
#[derive(Clone)]
pub struct SqliteRateLedger {
    pool: SqlitePool,
}

impl SqliteRateLedger {
    /// Create a ledger on a migrated database
    pub fn new(db: &DatabasePool) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Wait imposed by one window, run inside the grant transaction
    async fn window_wait(
        conn: &mut SqliteConnection,
        account: &str,
        limit: WindowLimit,
        now_ms: i64,
    ) -> Result<Option<Duration>, StoreError> {
        if limit.ceiling == 0 {
            return Ok(Some(limit.span));
        }

        let span_ms = span_millis(limit.span);
        // The ceiling-th most recent grant inside the window. While it
        // exists the window is full, and it admits again once that grant
        // slides out.
        let blocking: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT granted_at FROM rate_grants
            WHERE account = ?1 AND granted_at > ?2
            ORDER BY granted_at DESC, id DESC
            LIMIT 1 OFFSET ?3
            "#,
        )
        .bind(account)
        .bind(now_ms.saturating_sub(span_ms))
        .bind(i64::from(limit.ceiling - 1))
        .fetch_optional(&mut *conn)
        .await?;

        Ok(blocking.map(|(granted_at,)| {
            let wait = granted_at.saturating_add(span_ms).saturating_sub(now_ms);
            Duration::from_millis(u64::try_from(wait).unwrap_or(0))
        }))
    }

    async fn grant_locked(
        conn: &mut SqliteConnection,
        account: &str,
        limits: &[WindowLimit],
        now_ms: i64,
    ) -> Result<Option<Duration>, StoreError> {
        let mut retry_after: Option<Duration> = None;
        for limit in limits {
            if let Some(wait) = Self::window_wait(conn, account, *limit, now_ms).await? {
                retry_after = Some(retry_after.map_or(wait, |w| w.max(wait)));
            }
        }

        if retry_after.is_none() {
            sqlx::query("INSERT INTO rate_grants (account, granted_at) VALUES (?1, ?2)")
                .bind(account)
                .bind(now_ms)
                .execute(&mut *conn)
                .await?;
        }
        Ok(retry_after)
    }
}

#[async_trait]
impl RateLedger for SqliteRateLedger {
    async fn try_grant(
        &self,
        account: &str,
        limits: &[WindowLimit],
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>, StoreError> {
        let now_ms = millis(now);
        let mut conn = self.pool.acquire().await?;

        // IMMEDIATE takes the write lock up front, so two processes cannot
        // both count the same free slot.
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let outcome = Self::grant_locked(&mut *conn, account, limits, now_ms).await;

        match outcome {
            Ok(None) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(None)
            }
            other => {
                if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    warn!("Failed to roll back rate grant for {}: {}", account, e);
                }
                if let Ok(Some(wait)) = &other {
                    debug!("Rate ledger denied account {}, retry after {:?}", account, wait);
                }
                other
            }
        }
    }

    async fn count(
        &self,
        account: &str,
        span: Duration,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM rate_grants WHERE account = ?1 AND granted_at > ?2",
        )
        .bind(account)
        .bind(millis(now).saturating_sub(span_millis(span)))
        .fetch_one(&self.pool)
        .await?;

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn prune(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM rate_grants WHERE granted_at <= ?1")
            .bind(millis(before))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
