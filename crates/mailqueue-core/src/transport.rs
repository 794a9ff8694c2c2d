//! Transport abstraction: hands a rendered message to the outside world

use crate::retry::FailureKind;
use async_trait::async_trait;
use mailqueue_common::EmailMessage;
use mailqueue_storage::MessageId;
use std::time::Duration;

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// Accepted by the remote side
    Sent { external_id: String },
    /// Worth retrying later
    TransientFailure { reason: String },
    /// Will never succeed as-is
    PermanentFailure { reason: String },
}

impl DeliveryResult {
    pub fn is_sent(&self) -> bool {
        matches!(self, DeliveryResult::Sent { .. })
    }

    /// `None` when the attempt succeeded
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            DeliveryResult::Sent { .. } => None,
            DeliveryResult::TransientFailure { .. } => Some(FailureKind::Transient),
            DeliveryResult::PermanentFailure { .. } => Some(FailureKind::Permanent),
        }
    }
}

/// A message whose template, if any, has already been expanded
#[derive(Debug, Clone)]
pub struct RenderedMessage {
    /// Queue id, absent for direct sends
    pub queue_id: Option<MessageId>,
    pub email: EmailMessage,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Attempt delivery through `account`, giving up after `timeout`
    async fn send(&self, account: &str, message: &RenderedMessage, timeout: Duration) -> DeliveryResult;
}
