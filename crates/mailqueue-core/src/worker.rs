//! Delivery worker
//!
//! Each pass claims a bounded batch (rate-deferred messages whose wait is
//! over, then due retries, then fresh ready messages), attempts every message
//! the rate limiter admits and records the outcome in the queue store.
//! Messages the limiter turns away stay claimed by this worker until their
//! wait elapses, and count toward the batch bound meanwhile.

use crate::dispatch::Dispatcher;
use crate::rate_limiter::{Decision, RateLimiter};
use crate::retry::{FailureKind, RetryDecision, RetryScheduler};
use crate::transport::DeliveryResult;
use chrono::Utc;
use mailqueue_common::config::QueueConfig;
use mailqueue_storage::{MessageId, MessageStatus, QueueStore, QueuedMessage, StoreError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Worker tuning
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    /// Longest idle wait for new work
    pub poll_interval: Duration,
    /// Claims older than this are presumed abandoned
    pub stale_after: Duration,
    pub shutdown_grace: Duration,
    /// First delay after a store outage, doubled up to `store_backoff_max`
    pub store_backoff: Duration,
    pub store_backoff_max: Duration,
    pub sent_retention: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for WorkerSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            poll_interval: config.poll_interval(),
            stale_after: config.stale_after(),
            shutdown_grace: config.shutdown_grace(),
            store_backoff: Duration::from_millis(config.store_backoff_ms),
            store_backoff_max: Duration::from_millis(config.store_backoff_max_ms),
            sent_retention: Duration::from_secs(config.sent_retention_secs),
        }
    }
}

impl WorkerSettings {
    fn housekeeping_interval(&self) -> Duration {
        (self.stale_after / 4).max(Duration::from_secs(1))
    }
}

/// A claimed message waiting out a rate limit
struct Held {
    message: QueuedMessage,
    ready_at: Instant,
}

enum Outcome {
    Sent,
    Retry { delay: Duration, reason: String },
    Dead { reason: String },
}

struct Running {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Consumes the queue and drives messages to a terminal state
pub struct Worker {
    name: String,
    store: Arc<dyn QueueStore>,
    dispatcher: Arc<Dispatcher>,
    limiter: Arc<RateLimiter>,
    retry: RetryScheduler,
    settings: WorkerSettings,
    running: Mutex<Option<Running>>,
}

impl Worker {
    pub fn new(store: Arc<dyn QueueStore>, dispatcher: Arc<Dispatcher>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            name: "worker".to_string(),
            store,
            dispatcher,
            limiter,
            retry: RetryScheduler::default(),
            settings: WorkerSettings::default(),
            running: Mutex::new(None),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryScheduler) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the processing loop. Returns `false` if it is already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!(worker = %self.name, "Worker already running");
            return false;
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run(shutdown.clone()));
        *running = Some(Running { shutdown, handle });
        true
    }

    /// Stop claiming work and wait for the current attempt to finish
    ///
    /// Returns `false` if the grace period ran out and the loop was aborted.
    /// An aborted attempt leaves its message in flight until it is reclaimed.
    pub async fn stop(&self) -> bool {
        let Some(Running {
            shutdown,
            mut handle,
        }) = self.running.lock().await.take()
        else {
            return true;
        };

        info!(worker = %self.name, "Stopping delivery worker");
        shutdown.cancel();

        match tokio::time::timeout(self.settings.shutdown_grace, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(worker = %self.name, "Delivery worker task failed: {}", e);
                false
            }
            Err(_) => {
                warn!(
                    worker = %self.name,
                    "Shutdown grace period of {:?} elapsed, abandoning in-flight attempt",
                    self.settings.shutdown_grace
                );
                handle.abort();
                false
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            worker = %self.name,
            "Delivery worker started (batch size {}, poll interval {:?})",
            self.settings.batch_size, self.settings.poll_interval
        );

        let mut held: Vec<Held> = Vec::new();
        let mut next_housekeeping = Instant::now();
        let mut store_backoff = self.settings.store_backoff;

        while !shutdown.is_cancelled() {
            if Instant::now() >= next_housekeeping {
                self.housekeeping(&held).await;
                next_housekeeping = Instant::now() + self.settings.housekeeping_interval();
            }

            let (mut batch, store_error) = self.next_batch(&mut held).await;
            let claimed = batch.len();

            while let Some(message) = batch.pop_front() {
                if shutdown.is_cancelled() {
                    batch.push_front(message);
                    break;
                }
                self.process(message, &mut held, &shutdown).await;
            }
            // Claimed but never attempted
            self.release_all(batch).await;

            match store_error {
                Some(e) => {
                    warn!(
                        worker = %self.name,
                        "Queue store error, backing off for {:?}: {}", store_backoff, e
                    );
                    pause(&shutdown, store_backoff).await;
                    store_backoff = (store_backoff * 2).min(self.settings.store_backoff_max);
                }
                None => {
                    store_backoff = self.settings.store_backoff;
                    if claimed == 0 && held.len() >= self.settings.batch_size {
                        pause(&shutdown, self.idle_wait(&held)).await;
                    }
                }
            }
        }

        self.release_all(held.into_iter().map(|h| h.message)).await;
        info!(worker = %self.name, "Delivery worker stopped");
    }

    /// Claim the next batch. When nothing is available right away, waits on
    /// the store for up to the poll interval (or until a held message is due).
    async fn next_batch(&self, held: &mut Vec<Held>) -> (VecDeque<QueuedMessage>, Option<StoreError>) {
        let now = Instant::now();
        let (due, waiting): (Vec<Held>, Vec<Held>) = std::mem::take(held)
            .into_iter()
            .partition(|h| h.ready_at <= now);
        *held = waiting;

        let mut batch: VecDeque<QueuedMessage> = due.into_iter().map(|h| h.message).collect();
        let mut capacity = self
            .settings
            .batch_size
            .saturating_sub(batch.len() + held.len());

        if capacity > 0 {
            match self.store.due_retries(Utc::now(), capacity).await {
                Ok(retries) => {
                    capacity = capacity.saturating_sub(retries.len());
                    batch.extend(retries);
                }
                Err(e) => return (batch, Some(e)),
            }
        }

        while capacity > 0 {
            let wait = if batch.is_empty() {
                self.idle_wait(held)
            } else {
                Duration::ZERO
            };
            match self.store.dequeue_ready(wait).await {
                Ok(Some(message)) => {
                    batch.push_back(message);
                    capacity -= 1;
                }
                Ok(None) => break,
                Err(e) => return (batch, Some(e)),
            }
        }

        (batch, None)
    }

    fn idle_wait(&self, held: &[Held]) -> Duration {
        let now = Instant::now();
        held.iter()
            .map(|h| h.ready_at.saturating_duration_since(now))
            .fold(self.settings.poll_interval, Duration::min)
    }

    async fn process(&self, message: QueuedMessage, held: &mut Vec<Held>, shutdown: &CancellationToken) {
        match self.limiter.try_acquire(&message.account).await {
            Decision::Granted => self.attempt(message, shutdown).await,
            Decision::Denied { retry_after } => {
                debug!(
                    worker = %self.name,
                    "Deferring message {} for {:?}, account {} is rate limited",
                    message.id, retry_after, message.account
                );
                held.push(Held {
                    ready_at: Instant::now() + retry_after,
                    message,
                });
            }
        }
    }

    async fn attempt(&self, message: QueuedMessage, shutdown: &CancellationToken) {
        let attempt = message.next_attempt();
        debug!(
            worker = %self.name,
            "Delivering message {} via {} (attempt {}/{})",
            message.id, message.account, attempt, message.max_attempts
        );

        let result = self
            .dispatcher
            .deliver(Some(message.id), &message.account, &message.payload)
            .await;

        let outcome = match result {
            DeliveryResult::Sent { external_id } => {
                info!(
                    worker = %self.name,
                    "Message {} delivered as {} (attempt {})",
                    message.id, external_id, attempt
                );
                Outcome::Sent
            }
            DeliveryResult::TransientFailure { reason } => {
                match self
                    .retry
                    .decide(attempt, message.max_attempts, FailureKind::Transient)
                {
                    RetryDecision::Retry { delay } => {
                        warn!(
                            worker = %self.name,
                            "Message {} failed (attempt {}/{}), retrying in {:?}: {}",
                            message.id, attempt, message.max_attempts, delay, reason
                        );
                        Outcome::Retry { delay, reason }
                    }
                    RetryDecision::NoRetry => {
                        error!(
                            worker = %self.name,
                            "Message {} failed after {} attempts, giving up: {}",
                            message.id, attempt, reason
                        );
                        Outcome::Dead { reason }
                    }
                }
            }
            DeliveryResult::PermanentFailure { reason } => {
                error!(
                    worker = %self.name,
                    "Message {} permanently failed: {}", message.id, reason
                );
                Outcome::Dead { reason }
            }
        };

        self.record(message.id, outcome, shutdown).await;
    }

    /// Persist an attempt outcome, retrying the same operation while the
    /// store is unavailable
    ///
    /// Once shutdown is requested the store gets one more try. If that fails
    /// too the message is left in flight, to be reclaimed and attempted again.
    async fn record(&self, id: MessageId, outcome: Outcome, shutdown: &CancellationToken) {
        let mut backoff = self.settings.store_backoff;
        loop {
            let result = match &outcome {
                Outcome::Sent => self.store.ack(id).await,
                Outcome::Retry { delay, reason } => {
                    self.store
                        .schedule_retry(id, *delay, reason)
                        .await
                        .map(|status| {
                            if status == MessageStatus::Dead {
                                warn!(worker = %self.name, "Message {} exhausted its attempts", id);
                            }
                        })
                }
                Outcome::Dead { reason } => self.store.dead_letter(id, reason).await,
            };

            match result {
                Ok(()) => return,
                Err(e) if e.is_unavailable() && shutdown.is_cancelled() => {
                    error!(
                        worker = %self.name,
                        "Store unavailable at shutdown, leaving message {} in flight: {}", id, e
                    );
                    return;
                }
                Err(e) if e.is_unavailable() => {
                    warn!(
                        worker = %self.name,
                        "Store unavailable while recording outcome of {}, retrying in {:?}: {}",
                        id, backoff, e
                    );
                    pause(shutdown, backoff).await;
                    backoff = (backoff * 2).min(self.settings.store_backoff_max);
                }
                Err(e) => {
                    error!(
                        worker = %self.name,
                        "Failed to record outcome of message {}: {}", id, e
                    );
                    return;
                }
            }
        }
    }

    async fn release_all(&self, messages: impl IntoIterator<Item = QueuedMessage>) {
        for message in messages {
            match self.store.release(message.id).await {
                Ok(()) => debug!(worker = %self.name, "Released message {}", message.id),
                Err(e) => warn!(
                    worker = %self.name,
                    "Failed to release message {}, it stays claimed until reclaimed: {}",
                    message.id, e
                ),
            }
        }
    }

    async fn housekeeping(&self, held: &[Held]) {
        // Renew our own claims first so they are not reclaimed below
        for h in held {
            if let Err(e) = self.store.touch(h.message.id).await {
                warn!(worker = %self.name, "Failed to renew claim on {}: {}", h.message.id, e);
            }
        }

        match self.store.reclaim_stale(self.settings.stale_after).await {
            Ok(0) => {}
            Ok(n) => warn!(worker = %self.name, "Reclaimed {} stale in-flight messages", n),
            Err(e) => warn!(worker = %self.name, "Stale reclaim failed: {}", e),
        }

        match self.store.prune_sent(self.settings.sent_retention).await {
            Ok(0) => {}
            Ok(n) => debug!(worker = %self.name, "Pruned {} sent messages", n),
            Err(e) => warn!(worker = %self.name, "Pruning sent messages failed: {}", e),
        }

        let forgotten = self.limiter.cleanup().await;
        if forgotten > 0 {
            debug!(worker = %self.name, "Dropped rate limit state for {} idle accounts", forgotten);
        }
    }
}

async fn pause(shutdown: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
