//! Queue record models

use chrono::{DateTime, Utc};
use mailqueue_common::EmailMessage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for queued messages (time-ordered UUIDv7)
pub type MessageId = Uuid;

/// Lifecycle status of a queued message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting in the ready collection
    Pending,
    /// Claimed by exactly one worker
    InFlight,
    /// Waiting for `next_attempt_at`
    ScheduledRetry,
    Sent,
    Dead,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::InFlight => "in_flight",
            MessageStatus::ScheduledRetry => "scheduled_retry",
            MessageStatus::Sent => "sent",
            MessageStatus::Dead => "dead",
        }
    }

    /// `sent` and `dead` admit no further transitions through the worker path
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Dead)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "in_flight" => Ok(MessageStatus::InFlight),
            "scheduled_retry" => Ok(MessageStatus::ScheduledRetry),
            "sent" => Ok(MessageStatus::Sent),
            "dead" => Ok(MessageStatus::Dead),
            other => Err(format!("unknown message status '{}'", other)),
        }
    }
}

/// A unit of work held by the queue store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: MessageId,

    /// Sending account, selects the rate limiter bucket
    pub account: String,

    pub payload: EmailMessage,

    /// Delivery attempts made so far
    pub attempt_count: u32,

    pub max_attempts: u32,

    pub status: MessageStatus,

    /// Due time while in `scheduled_retry`
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// When the current worker claimed the message
    pub claimed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub last_error: Option<String>,
}

impl QueuedMessage {
    /// Create a pending message with a fresh id
    pub fn new(account: impl Into<String>, payload: EmailMessage, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            account: account.into(),
            payload,
            attempt_count: 0,
            max_attempts,
            status: MessageStatus::Pending,
            next_attempt_at: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// Number of the attempt about to be made
    pub fn next_attempt(&self) -> u32 {
        self.attempt_count + 1
    }
}

/// Point-in-time collection sizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSizes {
    pub ready: u64,
    pub scheduled_retry: u64,
    pub dead: u64,
    pub in_flight: u64,
    pub sent: u64,
}

impl QueueSizes {
    pub(crate) fn add(&mut self, status: MessageStatus, count: u64) {
        match status {
            MessageStatus::Pending => self.ready += count,
            MessageStatus::InFlight => self.in_flight += count,
            MessageStatus::ScheduledRetry => self.scheduled_retry += count,
            MessageStatus::Sent => self.sent += count,
            MessageStatus::Dead => self.dead += count,
        }
    }

    /// Messages that have not reached a terminal state
    pub fn outstanding(&self) -> u64 {
        self.ready + self.scheduled_retry + self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::InFlight,
            MessageStatus::ScheduledRetry,
            MessageStatus::Sent,
            MessageStatus::Dead,
        ] {
            assert_eq!(status.as_str().parse::<MessageStatus>(), Ok(status));
        }
        assert!("bogus".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(MessageStatus::Sent.is_terminal());
        assert!(MessageStatus::Dead.is_terminal());
        assert!(!MessageStatus::ScheduledRetry.is_terminal());
    }

    #[test]
    fn test_sizes_outstanding() {
        let mut sizes = QueueSizes::default();
        sizes.add(MessageStatus::Pending, 2);
        sizes.add(MessageStatus::InFlight, 1);
        sizes.add(MessageStatus::Dead, 4);
        assert_eq!(sizes.outstanding(), 3);
        assert_eq!(sizes.dead, 4);
    }
}
