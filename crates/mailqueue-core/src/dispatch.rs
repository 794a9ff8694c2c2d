//! Render-then-send for a single delivery attempt

use crate::renderer::{RenderError, Renderer};
use crate::transport::{DeliveryResult, RenderedMessage, Transport};
use mailqueue_common::EmailMessage;
use mailqueue_storage::MessageId;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Turns a queued payload into a transport call
///
/// A render failure is reported as a permanent failure. A transport that
/// does not answer within the send timeout is reported as transient.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    renderer: Option<Arc<dyn Renderer>>,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, send_timeout: Duration) -> Self {
        Self {
            transport,
            renderer: None,
            send_timeout,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Expand the message template, if any
    pub fn render(&self, email: &EmailMessage) -> Result<EmailMessage, RenderError> {
        let Some(template) = email.template.as_deref() else {
            return Ok(email.clone());
        };
        let renderer = self.renderer.as_ref().ok_or(RenderError::Disabled)?;
        let content = renderer.render(template, &email.template_data)?;

        let mut rendered = email.clone();
        if let Some(subject) = content.subject {
            rendered.subject = subject;
        }
        if content.body.is_some() {
            rendered.body = content.body;
        }
        if content.html.is_some() {
            rendered.html = content.html;
        }
        rendered.template = None;
        rendered.template_data = serde_json::Value::Null;
        Ok(rendered)
    }

    pub async fn deliver(&self, queue_id: Option<MessageId>, account: &str, email: &EmailMessage) -> DeliveryResult {
        let email = match self.render(email) {
            Ok(email) => email,
            Err(e) => {
                warn!("Render failed for message {:?}: {}", queue_id, e);
                return DeliveryResult::PermanentFailure {
                    reason: e.to_string(),
                };
            }
        };

        let message = RenderedMessage { queue_id, email };
        match tokio::time::timeout(
            self.send_timeout,
            self.transport.send(account, &message, self.send_timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => DeliveryResult::TransientFailure {
                reason: format!("Delivery timed out after {:?}", self.send_timeout),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::TemplateRenderer;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records what it was asked to send
    #[derive(Default)]
    struct CapturingTransport {
        sent: Mutex<Vec<(String, EmailMessage)>>,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for CapturingTransport {
        async fn send(&self, account: &str, message: &RenderedMessage, _timeout: Duration) -> DeliveryResult {
            tokio::time::sleep(self.delay).await;
            self.sent
                .lock()
                .unwrap()
                .push((account.to_string(), message.email.clone()));
            DeliveryResult::Sent {
                external_id: "<x@example.com>".into(),
            }
        }
    }

    fn renderer() -> Arc<dyn Renderer> {
        let mut renderer = TemplateRenderer::empty(true);
        renderer
            .add_template("welcome.html", "<p>Hi {{ name }}</p>")
            .unwrap();
        renderer
            .add_template("welcome.subject.txt", "Welcome {{ name }}")
            .unwrap();
        Arc::new(renderer)
    }

    #[tokio::test]
    async fn test_renders_before_sending() {
        let transport = Arc::new(CapturingTransport::default());
        let dispatcher =
            Dispatcher::new(transport.clone(), Duration::from_secs(5)).with_renderer(renderer());

        let email = EmailMessage::new("a@example.com", "placeholder")
            .with_body("text part")
            .with_template("welcome.html", json!({ "name": "Ann" }));
        let result = dispatcher.deliver(None, "default", &email).await;
        assert!(result.is_sent());

        let sent = transport.sent.lock().unwrap();
        let (account, email) = &sent[0];
        assert_eq!(account, "default");
        assert_eq!(email.subject, "Welcome Ann");
        assert_eq!(email.html.as_deref(), Some("<p>Hi Ann</p>"));
        assert_eq!(email.body.as_deref(), Some("text part"));
        assert_eq!(email.template, None);
    }

    #[tokio::test]
    async fn test_render_failure_is_permanent() {
        let transport = Arc::new(CapturingTransport::default());
        let dispatcher =
            Dispatcher::new(transport.clone(), Duration::from_secs(5)).with_renderer(renderer());

        let email = EmailMessage::new("a@example.com", "x").with_template("missing.html", json!({}));
        let result = dispatcher.deliver(None, "default", &email).await;
        assert!(matches!(result, DeliveryResult::PermanentFailure { .. }));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_template_without_renderer_is_permanent() {
        let transport = Arc::new(CapturingTransport::default());
        let dispatcher = Dispatcher::new(transport, Duration::from_secs(5));

        let email = EmailMessage::new("a@example.com", "x").with_template("welcome.html", json!({}));
        let result = dispatcher.deliver(None, "default", &email).await;
        assert!(matches!(result, DeliveryResult::PermanentFailure { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let transport = Arc::new(CapturingTransport {
            delay: Duration::from_secs(60),
            ..CapturingTransport::default()
        });
        let dispatcher = Dispatcher::new(transport, Duration::from_secs(30));

        let email = EmailMessage::new("a@example.com", "x").with_body("y");
        let result = dispatcher.deliver(None, "default", &email).await;
        assert!(matches!(result, DeliveryResult::TransientFailure { .. }));
    }
}
