//! Producer API: submit messages and manage the dead-letter collection

use crate::dispatch::Dispatcher;
use crate::rate_limiter::RateLimiter;
use crate::transport::DeliveryResult;
use mailqueue_common::{Config, EmailMessage};
use mailqueue_storage::{MessageId, QueueStore, QueuedMessage, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Message {0} not found in the dead-letter collection")]
    NotFound(MessageId),

    #[error("Direct delivery is not configured")]
    DirectDeliveryUnavailable,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ProducerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidMessage(reason) => ProducerError::InvalidMessage(reason),
            StoreError::NotFound(id) => ProducerError::NotFound(id),
            StoreError::InvalidState { id, .. } => ProducerError::NotFound(id),
            other => ProducerError::Store(other),
        }
    }
}

impl From<ProducerError> for mailqueue_common::Error {
    fn from(e: ProducerError) -> Self {
        match e {
            ProducerError::InvalidMessage(reason) => mailqueue_common::Error::InvalidMessage(reason),
            ProducerError::NotFound(_) => mailqueue_common::Error::NotFound(e.to_string()),
            ProducerError::DirectDeliveryUnavailable => mailqueue_common::Error::Config(e.to_string()),
            ProducerError::Store(store) => store.into(),
        }
    }
}

/// Collection sizes as reported to producers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub ready_count: u64,
    pub retry_count: u64,
    pub dead_count: u64,
    pub in_flight_count: u64,
    pub sent_count: u64,
}

struct DirectDelivery {
    dispatcher: Arc<Dispatcher>,
    limiter: Arc<RateLimiter>,
}

pub struct Producer {
    store: Arc<dyn QueueStore>,
    config: Arc<Config>,
    direct: Option<DirectDelivery>,
}

impl Producer {
    pub fn new(store: Arc<dyn QueueStore>, config: Arc<Config>) -> Self {
        Self {
            store,
            config,
            direct: None,
        }
    }

    /// Enable [`send_now`](Self::send_now)
    ///
    /// Direct sends count against the same ceilings as queued ones only when
    /// `limiter` shares its grants with the workers, either by being the same
    /// instance or through the store's [`RateLedger`](mailqueue_storage::RateLedger).
    pub fn with_direct_delivery(mut self, dispatcher: Arc<Dispatcher>, limiter: Arc<RateLimiter>) -> Self {
        self.direct = Some(DirectDelivery {
            dispatcher,
            limiter,
        });
        self
    }

    /// Validate the payload and resolve its sending account
    fn check(&self, payload: &EmailMessage, account: Option<&str>) -> Result<String, ProducerError> {
        payload
            .validate()
            .map_err(|e| ProducerError::InvalidMessage(e.to_string()))?;

        if payload.template.is_some() && !self.config.templates.enabled {
            return Err(ProducerError::InvalidMessage(
                "templates are not enabled".to_string(),
            ));
        }

        let account = account
            .or(payload.account.as_deref())
            .unwrap_or(&self.config.default_account);
        if !self.config.has_account(account) {
            return Err(ProducerError::InvalidMessage(format!(
                "unknown account '{}'",
                account
            )));
        }
        Ok(account.to_string())
    }

    /// Queue a message for delivery
    ///
    /// `account` overrides the payload's account; `max_attempts` overrides the
    /// configured default.
    pub async fn enqueue(
        &self,
        payload: EmailMessage,
        account: Option<&str>,
        max_attempts: Option<u32>,
    ) -> Result<MessageId, ProducerError> {
        let account = self.check(&payload, account)?;
        let max_attempts = max_attempts.unwrap_or(self.config.queue.max_attempts);
        if max_attempts == 0 {
            return Err(ProducerError::InvalidMessage(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let message = QueuedMessage::new(account, payload, max_attempts);
        let id = self.store.enqueue(message).await?;
        debug!("Enqueued message {}", id);
        Ok(id)
    }

    pub async fn stats(&self) -> Result<QueueStats, ProducerError> {
        let sizes = self.store.sizes().await?;
        Ok(QueueStats {
            ready_count: sizes.ready,
            retry_count: sizes.scheduled_retry,
            dead_count: sizes.dead,
            in_flight_count: sizes.in_flight,
            sent_count: sizes.sent,
        })
    }

    /// Give a dead message a fresh attempt budget at the back of the queue
    pub async fn requeue_dead(&self, id: MessageId) -> Result<(), ProducerError> {
        self.store.requeue_dead(id).await?;
        info!("Requeued dead message {}", id);
        Ok(())
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<QueuedMessage>, ProducerError> {
        Ok(self.store.dead_letters(limit).await?)
    }

    pub async fn purge_dead(&self, id: MessageId) -> Result<(), ProducerError> {
        self.store.purge_dead(id).await?;
        info!("Purged dead message {}", id);
        Ok(())
    }

    pub async fn purge_all_dead(&self) -> Result<u64, ProducerError> {
        let purged = self.store.purge_all_dead().await?;
        info!("Purged {} dead messages", purged);
        Ok(purged)
    }

    /// Deliver immediately, bypassing the queue but not the rate limit
    ///
    /// Waits for rate limit headroom. The result is returned as-is; nothing
    /// is retried or recorded.
    pub async fn send_now(&self, payload: EmailMessage, account: Option<&str>) -> Result<DeliveryResult, ProducerError> {
        let direct = self
            .direct
            .as_ref()
            .ok_or(ProducerError::DirectDeliveryUnavailable)?;
        let account = self.check(&payload, account)?;

        direct.limiter.acquire(&account).await;
        Ok(direct.dispatcher.deliver(None, &account, &payload).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{RenderedMessage, Transport};
    use async_trait::async_trait;
    use mailqueue_common::config::{AccountConfig, SmtpSecurity};
    use mailqueue_storage::{MemoryQueueStore, MessageStatus};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn account(from: &str) -> AccountConfig {
        AccountConfig {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: None,
            password: None,
            security: SmtpSecurity::Starttls,
            timeout_secs: 30,
            from_email: from.to_string(),
            from_name: None,
            reply_to: None,
            max_per_hour: None,
            max_per_minute: None,
        }
    }

    fn config() -> Arc<Config> {
        let mut config = Config::default();
        config
            .accounts
            .insert("default".to_string(), account("noreply@example.com"));
        config
            .accounts
            .insert("marketing".to_string(), account("news@example.com"));
        Arc::new(config)
    }

    fn email() -> EmailMessage {
        EmailMessage::new("user@example.org", "Hello").with_body("Hi")
    }

    fn producer() -> (Arc<MemoryQueueStore>, Producer) {
        let store = Arc::new(MemoryQueueStore::new());
        let producer = Producer::new(store.clone(), config());
        (store, producer)
    }

    #[tokio::test]
    async fn test_enqueue_defaults() {
        let (store, producer) = producer();
        let id = producer.enqueue(email(), None, None).await.unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.account, "default");
        assert_eq!(stored.max_attempts, 3);
        assert_eq!(stored.attempt_count, 0);
        assert_eq!(stored.status, MessageStatus::Pending);
        assert_eq!(
            producer.stats().await.unwrap(),
            QueueStats {
                ready_count: 1,
                ..QueueStats::default()
            }
        );
    }

    #[tokio::test]
    async fn test_enqueue_account_resolution() {
        let (store, producer) = producer();

        let mut payload = email();
        payload.account = Some("marketing".to_string());
        let id = producer.enqueue(payload.clone(), None, Some(7)).await.unwrap();
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.account, "marketing");
        assert_eq!(stored.max_attempts, 7);

        // Explicit argument wins over the payload
        let id = producer
            .enqueue(payload, Some("default"), None)
            .await
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().account, "default");
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid() {
        let (store, producer) = producer();

        let no_content = EmailMessage::new("user@example.org", "Hello");
        assert!(matches!(
            producer.enqueue(no_content, None, None).await,
            Err(ProducerError::InvalidMessage(_))
        ));

        assert!(matches!(
            producer.enqueue(email(), Some("nope"), None).await,
            Err(ProducerError::InvalidMessage(_))
        ));

        assert!(matches!(
            producer.enqueue(email(), None, Some(0)).await,
            Err(ProducerError::InvalidMessage(_))
        ));

        assert_eq!(store.sizes().await.unwrap().ready, 0);
    }

    #[tokio::test]
    async fn test_template_requires_templates_enabled() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut config = (*config()).clone();
        config.templates.enabled = false;
        let producer = Producer::new(store, Arc::new(config));

        let payload = EmailMessage::new("user@example.org", "Hello")
            .with_template("welcome.html", serde_json::json!({}));
        assert!(matches!(
            producer.enqueue(payload, None, None).await,
            Err(ProducerError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_dead_letter_management() {
        let (store, producer) = producer();
        let a = producer.enqueue(email(), None, None).await.unwrap();
        let b = producer.enqueue(email(), None, None).await.unwrap();
        for _ in 0..2 {
            store.dequeue_ready(Duration::ZERO).await.unwrap();
        }
        store.dead_letter(a, "550 rejected").await.unwrap();
        store.dead_letter(b, "550 rejected").await.unwrap();
        assert_eq!(producer.stats().await.unwrap().dead_count, 2);
        assert_eq!(producer.dead_letters(10).await.unwrap().len(), 2);

        producer.requeue_dead(a).await.unwrap();
        let requeued = store.get(a).await.unwrap().unwrap();
        assert_eq!(requeued.status, MessageStatus::Pending);
        assert_eq!(requeued.attempt_count, 0);

        // Only dead messages can be requeued
        assert!(matches!(
            producer.requeue_dead(a).await,
            Err(ProducerError::NotFound(_))
        ));

        producer.purge_dead(b).await.unwrap();
        assert!(store.get(b).await.unwrap().is_none());
        assert_eq!(producer.purge_all_dead().await.unwrap(), 0);

        let stats = producer.stats().await.unwrap();
        assert_eq!(stats.dead_count, 0);
        assert_eq!(stats.ready_count, 1);
    }

    struct CountingTransport;

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(&self, account: &str, _message: &RenderedMessage, _timeout: Duration) -> DeliveryResult {
            DeliveryResult::Sent {
                external_id: format!("<direct@{}>", account),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_now_respects_rate_limit() {
        let (store, producer) = producer();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(CountingTransport),
            Duration::from_secs(30),
        ));
        let limiter = Arc::new(RateLimiter::new(vec![
            crate::rate_limiter::WindowLimit::per_minute(1),
        ]));
        let producer = producer.with_direct_delivery(dispatcher, limiter);

        let started = tokio::time::Instant::now();
        let first = producer.send_now(email(), None).await.unwrap();
        assert_eq!(
            first,
            DeliveryResult::Sent {
                external_id: "<direct@default>".into()
            }
        );
        producer.send_now(email(), None).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(60));

        // Nothing touches the queue
        assert_eq!(store.sizes().await.unwrap().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_send_now_requires_direct_delivery() {
        let (_, producer) = producer();
        assert!(matches!(
            producer.send_now(email(), None).await,
            Err(ProducerError::DirectDeliveryUnavailable)
        ));
    }
}
