//! In-memory queue store
//!
//! Process-local and not durable. Used for tests, embedding and the
//! `memory` storage backend.

use crate::models::{MessageId, MessageStatus, QueueSizes, QueuedMessage};
use crate::store::{after, check_new, cutoff, QueueStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

struct Entry {
    message: QueuedMessage,
    /// Enqueue order, tiebreak for retries due at the same instant
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<MessageId, Entry>,
    ready: VecDeque<MessageId>,
    retry: BTreeMap<(DateTime<Utc>, u64), MessageId>,
    dead: BTreeSet<(DateTime<Utc>, MessageId)>,
    next_seq: u64,
}

impl Inner {
    fn entry_mut(&mut self, id: MessageId) -> Result<&mut Entry, StoreError> {
        self.entries.get_mut(&id).ok_or(StoreError::NotFound(id))
    }

    /// Fetch an entry that must currently be in `expected`
    fn in_state(&mut self, id: MessageId, expected: MessageStatus) -> Result<&mut Entry, StoreError> {
        let entry = self.entry_mut(id)?;
        if entry.message.status != expected {
            return Err(StoreError::InvalidState {
                id,
                actual: entry.message.status,
                expected,
            });
        }
        Ok(entry)
    }

    fn claim(&mut self, id: MessageId, now: DateTime<Utc>) -> Option<QueuedMessage> {
        let entry = self.entries.get_mut(&id)?;
        entry.message.status = MessageStatus::InFlight;
        entry.message.claimed_at = Some(now);
        entry.message.updated_at = now;
        Some(entry.message.clone())
    }

    fn archive(&mut self, id: MessageId, now: DateTime<Utc>) {
        self.dead.insert((now, id));
    }
}

/// In-memory [`QueueStore`]
#[derive(Default)]
pub struct MemoryQueueStore {
    inner: Mutex<Inner>,
    ready_signal: Notify,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, mut message: QueuedMessage) -> Result<MessageId, StoreError> {
        check_new(&message)?;

        let id = message.id;
        {
            let mut inner = self.inner.lock().await;
            if inner.entries.contains_key(&id) {
                return Err(StoreError::Duplicate(id));
            }

            message.status = MessageStatus::Pending;
            message.claimed_at = None;
            message.next_attempt_at = None;

            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.entries.insert(id, Entry { message, seq });
            inner.ready.push_back(id);
        }

        self.ready_signal.notify_one();
        Ok(id)
    }

    async fn dequeue_ready(&self, timeout: Duration) -> Result<Option<QueuedMessage>, StoreError> {
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut inner = self.inner.lock().await;
                while let Some(id) = inner.ready.pop_front() {
                    if let Some(message) = inner.claim(id, Utc::now()) {
                        return Ok(Some(message));
                    }
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }

            // Either woken by an enqueue or the deadline passed; re-check both.
            let _ = tokio::time::timeout_at(deadline, self.ready_signal.notified()).await;
        }
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueuedMessage>, StoreError> {
        let mut inner = self.inner.lock().await;

        let due: Vec<(DateTime<Utc>, u64)> = inner
            .retry
            .range(..)
            .take_while(|((at, _), _)| *at <= now)
            .take(limit)
            .map(|(key, _)| *key)
            .collect();

        let claimed_at = Utc::now();
        let mut messages = Vec::with_capacity(due.len());
        for key in due {
            if let Some(id) = inner.retry.remove(&key) {
                if let Some(message) = inner.claim(id, claimed_at) {
                    messages.push(message);
                }
            }
        }

        Ok(messages)
    }

    async fn ack(&self, id: MessageId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = inner.entry_mut(id)?;

        match entry.message.status {
            MessageStatus::InFlight => {
                entry.message.status = MessageStatus::Sent;
                entry.message.attempt_count =
                    (entry.message.attempt_count + 1).min(entry.message.max_attempts);
                entry.message.claimed_at = None;
                entry.message.updated_at = Utc::now();
                Ok(())
            }
            MessageStatus::Sent => {
                debug!("Duplicate ack for message {}", id);
                Ok(())
            }
            actual => Err(StoreError::InvalidState {
                id,
                actual,
                expected: MessageStatus::InFlight,
            }),
        }
    }

    async fn schedule_retry(
        &self,
        id: MessageId,
        delay: Duration,
        error: &str,
    ) -> Result<MessageStatus, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let entry = inner.in_state(id, MessageStatus::InFlight)?;
        let seq = entry.seq;
        let message = &mut entry.message;
        message.attempt_count += 1;
        message.last_error = Some(error.to_string());
        message.claimed_at = None;
        message.updated_at = now;

        if message.attempt_count >= message.max_attempts {
            message.status = MessageStatus::Dead;
            message.next_attempt_at = None;
            inner.archive(id, now);
            return Ok(MessageStatus::Dead);
        }

        let due = after(now, delay);
        message.status = MessageStatus::ScheduledRetry;
        message.next_attempt_at = Some(due);
        inner.retry.insert((due, seq), id);
        Ok(MessageStatus::ScheduledRetry)
    }

    async fn dead_letter(&self, id: MessageId, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let message = &mut inner.in_state(id, MessageStatus::InFlight)?.message;
        message.attempt_count = (message.attempt_count + 1).min(message.max_attempts);
        message.status = MessageStatus::Dead;
        message.next_attempt_at = None;
        message.claimed_at = None;
        message.last_error = Some(error.to_string());
        message.updated_at = now;

        inner.archive(id, now);
        Ok(())
    }

    async fn release(&self, id: MessageId) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock().await;
            let message = &mut inner.in_state(id, MessageStatus::InFlight)?.message;
            message.status = MessageStatus::Pending;
            message.claimed_at = None;
            message.updated_at = Utc::now();
            inner.ready.push_front(id);
        }

        self.ready_signal.notify_one();
        Ok(())
    }

    async fn touch(&self, id: MessageId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let message = &mut inner.in_state(id, MessageStatus::InFlight)?.message;
        message.claimed_at = Some(Utc::now());
        Ok(())
    }

    async fn requeue_dead(&self, id: MessageId) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock().await;
            let message = &mut inner.in_state(id, MessageStatus::Dead)?.message;
            message.status = MessageStatus::Pending;
            message.attempt_count = 0;
            message.next_attempt_at = None;
            message.updated_at = Utc::now();

            inner.dead.retain(|(_, dead_id)| *dead_id != id);
            inner.ready.push_back(id);
        }

        self.ready_signal.notify_one();
        Ok(())
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<u64, StoreError> {
        let reclaimed = {
            let mut inner = self.inner.lock().await;
            let now = Utc::now();
            let threshold = cutoff(now, older_than);

            let mut stale: Vec<(u64, MessageId)> = inner
                .entries
                .values()
                .filter(|e| e.message.status == MessageStatus::InFlight)
                .filter(|e| e.message.claimed_at.map_or(true, |at| at <= threshold))
                .map(|e| (e.seq, e.message.id))
                .collect();

            // Oldest ends up at the very front.
            stale.sort_unstable_by(|a, b| b.cmp(a));
            for (_, id) in &stale {
                if let Some(entry) = inner.entries.get_mut(id) {
                    entry.message.status = MessageStatus::Pending;
                    entry.message.claimed_at = None;
                    entry.message.updated_at = now;
                }
                inner.ready.push_front(*id);
            }
            stale.len()
        };

        for _ in 0..reclaimed {
            self.ready_signal.notify_one();
        }
        Ok(reclaimed as u64)
    }

    async fn sizes(&self) -> Result<QueueSizes, StoreError> {
        let inner = self.inner.lock().await;
        let mut sizes = QueueSizes::default();
        for entry in inner.entries.values() {
            sizes.add(entry.message.status, 1);
        }
        Ok(sizes)
    }

    async fn get(&self, id: MessageId) -> Result<Option<QueuedMessage>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.get(&id).map(|e| e.message.clone()))
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueuedMessage>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .dead
            .iter()
            .rev()
            .take(limit)
            .filter_map(|(_, id)| inner.entries.get(id).map(|e| e.message.clone()))
            .collect())
    }

    async fn purge_dead(&self, id: MessageId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.in_state(id, MessageStatus::Dead)?;
        inner.entries.remove(&id);
        inner.dead.retain(|(_, dead_id)| *dead_id != id);
        Ok(())
    }

    async fn purge_all_dead(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let dead = std::mem::take(&mut inner.dead);
        for (_, id) in &dead {
            inner.entries.remove(id);
        }
        Ok(dead.len() as u64)
    }

    async fn prune_sent(&self, older_than: Duration) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let threshold = cutoff(Utc::now(), older_than);
        let before = inner.entries.len();
        inner.entries.retain(|_, e| {
            !(e.message.status == MessageStatus::Sent && e.message.updated_at <= threshold)
        });
        Ok((before - inner.entries.len()) as u64)
    }
}
