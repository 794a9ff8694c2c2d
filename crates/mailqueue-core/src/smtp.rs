//! SMTP transport built on lettre

use crate::transport::{DeliveryResult, RenderedMessage, Transport};
use async_trait::async_trait;
use lettre::{
    message::{
        header::{ContentType, HeaderName, HeaderValue},
        Attachment, Mailbox, MultiPart, SinglePart,
    },
    transport::smtp::authentication::Credentials,
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use mailqueue_common::config::{AccountConfig, SmtpSecurity};
use mailqueue_common::EmailAddress;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

type Mailer = AsyncSmtpTransport<Tokio1Executor>;

/// Delivers through named SMTP accounts, one pooled connection per account
pub struct SmtpTransport {
    accounts: HashMap<String, AccountConfig>,
    mailers: RwLock<HashMap<String, Mailer>>,
}

impl SmtpTransport {
    pub fn new(accounts: HashMap<String, AccountConfig>) -> Self {
        Self {
            accounts,
            mailers: RwLock::new(HashMap::new()),
        }
    }

    async fn mailer(&self, name: &str, account: &AccountConfig) -> Result<Mailer, lettre::transport::smtp::Error> {
        if let Some(mailer) = self.mailers.read().await.get(name) {
            return Ok(mailer.clone());
        }

        let mailer = build_mailer(account)?;
        info!(
            "Created SMTP transport for account {} ({}:{}, {})",
            name, account.host, account.port, account.security
        );
        self.mailers
            .write()
            .await
            .insert(name.to_string(), mailer.clone());
        Ok(mailer)
    }
}

fn build_mailer(account: &AccountConfig) -> Result<Mailer, lettre::transport::smtp::Error> {
    let builder = match account.security {
        SmtpSecurity::Tls => Mailer::relay(&account.host)?,
        SmtpSecurity::Starttls => Mailer::starttls_relay(&account.host)?,
        SmtpSecurity::None => Mailer::builder_dangerous(&account.host),
    };

    let mut builder = builder
        .port(account.port)
        .timeout(Some(Duration::from_secs(account.timeout_secs)));

    if let (Some(username), Some(password)) = (&account.username, &account.password) {
        builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
    }

    Ok(builder.build())
}

fn mailbox(address: &EmailAddress) -> Result<Mailbox, String> {
    let email: Address = address
        .email
        .parse()
        .map_err(|e| format!("Invalid address '{}': {}", address.email, e))?;
    Ok(Mailbox::new(address.name.clone(), email))
}

fn raw_header(name: &str, value: &str) -> Result<HeaderValue, String> {
    let name = HeaderName::new_from_ascii(name.to_string())
        .map_err(|_| format!("Invalid header name '{}'", name))?;
    Ok(HeaderValue::new(name, value.to_string()))
}

/// Build the wire message; any error here is permanent
fn build_email(account: &AccountConfig, message: &RenderedMessage) -> Result<(Message, String), String> {
    let email = &message.email;

    let from = match &email.from {
        Some(from) => from.clone(),
        None => {
            let from = EmailAddress::new(account.from_email.clone());
            match &account.from_name {
                Some(name) => from.with_name(name.clone()),
                None => from,
            }
        }
    };
    let reply_to = email
        .reply_to
        .clone()
        .or_else(|| account.reply_to.as_deref().map(EmailAddress::from));

    let domain = from.domain().unwrap_or("mailqueue").to_string();
    let local = message.queue_id.unwrap_or_else(Uuid::new_v4);
    let message_id = format!("<{}@{}>", local, domain);

    let mut builder = Message::builder()
        .from(mailbox(&from)?)
        .subject(email.subject.clone())
        .message_id(Some(message_id.clone()));

    if let Some(reply_to) = &reply_to {
        builder = builder.reply_to(mailbox(reply_to)?);
    }
    for to in &email.to {
        builder = builder.to(mailbox(to)?);
    }
    for cc in &email.cc {
        builder = builder.cc(mailbox(cc)?);
    }
    for bcc in &email.bcc {
        builder = builder.bcc(mailbox(bcc)?);
    }

    if let Some((x_priority, importance)) = email.priority.headers() {
        builder = builder
            .raw_header(raw_header("X-Priority", x_priority)?)
            .raw_header(raw_header("Importance", importance)?);
    }
    for (name, value) in &email.headers {
        builder = builder.raw_header(raw_header(name, value)?);
    }

    enum Content {
        Single(SinglePart),
        Multi(MultiPart),
    }

    let content = match (&email.body, &email.html) {
        (Some(text), Some(html)) => Content::Multi(MultiPart::alternative_plain_html(
            text.clone(),
            html.clone(),
        )),
        (None, Some(html)) => Content::Single(SinglePart::html(html.clone())),
        (Some(text), None) => Content::Single(SinglePart::plain(text.clone())),
        (None, None) => Content::Single(SinglePart::plain(String::new())),
    };

    let built = if email.attachments.is_empty() {
        match content {
            Content::Single(part) => builder.singlepart(part),
            Content::Multi(part) => builder.multipart(part),
        }
    } else {
        let mut mixed = match content {
            Content::Single(part) => MultiPart::mixed().singlepart(part),
            Content::Multi(part) => MultiPart::mixed().multipart(part),
        };
        for attachment in &email.attachments {
            let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                format!(
                    "Invalid content type '{}' for attachment {}: {}",
                    attachment.content_type, attachment.filename, e
                )
            })?;
            mixed = mixed.singlepart(
                Attachment::new(attachment.filename.clone())
                    .body(attachment.content.clone(), content_type),
            );
        }
        builder.multipart(mixed)
    };

    let built = built.map_err(|e| format!("Failed to build email: {}", e))?;
    Ok((built, message_id))
}

fn classify(error: &lettre::transport::smtp::Error) -> DeliveryResult {
    let reason = error.to_string();
    if error.is_permanent() {
        DeliveryResult::PermanentFailure { reason }
    } else if error.is_transient() || error.is_timeout() {
        DeliveryResult::TransientFailure { reason }
    } else if error.is_client() {
        // Malformed request on our side
        DeliveryResult::PermanentFailure { reason }
    } else {
        // Connection, TLS and I/O trouble
        DeliveryResult::TransientFailure { reason }
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, account_name: &str, message: &RenderedMessage, timeout: Duration) -> DeliveryResult {
        let Some(account) = self.accounts.get(account_name) else {
            return DeliveryResult::PermanentFailure {
                reason: format!("SMTP account '{}' not found", account_name),
            };
        };

        let (email, message_id) = match build_email(account, message) {
            Ok(built) => built,
            Err(reason) => return DeliveryResult::PermanentFailure { reason },
        };

        let mailer = match self.mailer(account_name, account).await {
            Ok(mailer) => mailer,
            Err(e) => {
                return DeliveryResult::TransientFailure {
                    reason: format!("Failed to create SMTP transport: {}", e),
                }
            }
        };

        match tokio::time::timeout(timeout, mailer.send(email)).await {
            Ok(Ok(response)) => {
                debug!("SMTP response for {}: {:?}", message_id, response.code());
                DeliveryResult::Sent {
                    external_id: message_id,
                }
            }
            Ok(Err(e)) => classify(&e),
            Err(_) => DeliveryResult::TransientFailure {
                reason: format!("SMTP send timed out after {:?}", timeout),
            },
        }
    }
}
