//! mailqueue Core - Delivery pipeline
//!
//! Workers pull messages from a [`QueueStore`](mailqueue_storage::QueueStore),
//! pace them through the [`RateLimiter`], hand them to a [`Transport`] and
//! settle failures with the [`RetryScheduler`].

pub mod dispatch;
pub mod producer;
pub mod rate_limiter;
pub mod renderer;
pub mod retry;
pub mod smtp;
pub mod transport;
pub mod worker;

pub use dispatch::Dispatcher;
pub use producer::{Producer, ProducerError, QueueStats};
pub use rate_limiter::{Decision, RateLimiter, RemainingQuota, WindowLimit, WindowQuota};
pub use renderer::{RenderError, RenderedContent, Renderer, TemplateRenderer};
pub use retry::{FailureKind, RetryDecision, RetryScheduler};
pub use smtp::SmtpTransport;
pub use transport::{DeliveryResult, RenderedMessage, Transport};
pub use worker::{Worker, WorkerSettings};
