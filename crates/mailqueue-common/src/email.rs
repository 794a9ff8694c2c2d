//! Email payload types
//!
//! The queue treats an [`EmailMessage`] as an opaque payload; only the
//! producer validates it and only the dispatcher reads it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Email address with optional display name
///
/// Deserializes from either `"user@example.com"` or
/// `{"email": "user@example.com", "name": "User"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AddressRepr")]
pub struct EmailAddress {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AddressRepr {
    Plain(String),
    Full {
        email: String,
        #[serde(default)]
        name: Option<String>,
    },
}

impl From<AddressRepr> for EmailAddress {
    fn from(repr: AddressRepr) -> Self {
        match repr {
            AddressRepr::Plain(email) => Self { email, name: None },
            AddressRepr::Full { email, name } => Self { email, name },
        }
    }
}

impl EmailAddress {
    /// Create an address without a display name
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    /// Attach a display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Domain part of the address, if the address is well formed
    pub fn domain(&self) -> Option<&str> {
        self.email
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|d| !d.is_empty())
    }

    /// Structural check: `local@domain`, no whitespace or angle brackets
    pub fn is_valid(&self) -> bool {
        let Some((local, domain)) = self.email.rsplit_once('@') else {
            return false;
        };
        !local.is_empty()
            && !domain.is_empty()
            && !domain.starts_with('.')
            && !domain.ends_with('.')
            && !self
                .email
                .chars()
                .any(|c| c.is_whitespace() || c == '<' || c == '>' || c == ',')
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.email),
            None => write!(f, "{}", self.email),
        }
    }
}

impl From<&str> for EmailAddress {
    fn from(email: &str) -> Self {
        Self::new(email)
    }
}

/// Email attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,

    /// Raw content, base64 encoded on the wire
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,

    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

impl Attachment {
    pub fn new(filename: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content,
            content_type: default_content_type(),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Email priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// `X-Priority` / `Importance` header values, `None` for normal mail
    pub fn headers(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Priority::High => Some(("1", "high")),
            Priority::Low => Some(("5", "low")),
            Priority::Normal => None,
        }
    }
}

/// Complete email message as submitted by a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: Vec<EmailAddress>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<EmailAddress>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<EmailAddress>,

    /// Sender, defaults to the account's sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<EmailAddress>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<EmailAddress>,

    #[serde(default)]
    pub subject: String,

    /// Plain text body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,

    /// Template name, rendered at delivery time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub template_data: serde_json::Value,

    /// Custom headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub priority: Priority,

    /// Named sending account, defaults to the configured default account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

impl EmailMessage {
    /// Create a plain text message to a single recipient
    pub fn new(to: impl Into<EmailAddress>, subject: impl Into<String>) -> Self {
        Self {
            to: vec![to.into()],
            cc: Vec::new(),
            bcc: Vec::new(),
            from: None,
            reply_to: None,
            subject: subject.into(),
            body: None,
            html: None,
            attachments: Vec::new(),
            template: None,
            template_data: serde_json::Value::Null,
            headers: BTreeMap::new(),
            priority: Priority::Normal,
            account: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    pub fn with_template(mut self, name: impl Into<String>, data: serde_json::Value) -> Self {
        self.template = Some(name.into());
        self.template_data = data;
        self
    }

    /// Every envelope recipient: to, cc and bcc
    pub fn recipients(&self) -> impl Iterator<Item = &EmailAddress> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    /// Check the message is deliverable in principle
    pub fn validate(&self) -> crate::Result<()> {
        if self.to.is_empty() {
            return Err(invalid("at least one recipient is required"));
        }

        if let Some(bad) = self
            .recipients()
            .chain(self.from.iter())
            .chain(self.reply_to.iter())
            .find(|a| !a.is_valid())
        {
            return Err(invalid(format!("invalid address '{}'", bad.email)));
        }

        let has_content = self.body.as_deref().is_some_and(|b| !b.is_empty())
            || self.html.as_deref().is_some_and(|h| !h.is_empty())
            || self.template.as_deref().is_some_and(|t| !t.is_empty());
        if !has_content {
            return Err(invalid("one of body, html or template is required"));
        }

        for name in self.headers.keys() {
            let printable = !name.is_empty()
                && name.bytes().all(|b| b.is_ascii_graphic() && b != b':');
            if !printable {
                return Err(invalid(format!("invalid header name '{}'", name)));
            }
        }

        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> crate::Error {
    crate::Error::InvalidMessage(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_address_display() {
        let plain = EmailAddress::new("a@example.com");
        assert_eq!(plain.to_string(), "a@example.com");

        let named = EmailAddress::new("a@example.com").with_name("Alice");
        assert_eq!(named.to_string(), "Alice <a@example.com>");
        assert_eq!(named.domain(), Some("example.com"));
    }

    #[test]
    fn test_address_validation() {
        assert!(EmailAddress::new("user@example.com").is_valid());
        assert!(!EmailAddress::new("user").is_valid());
        assert!(!EmailAddress::new("@example.com").is_valid());
        assert!(!EmailAddress::new("user@").is_valid());
        assert!(!EmailAddress::new("us er@example.com").is_valid());
    }

    #[test]
    fn test_deserialize_mixed_addresses() {
        let json = r#"{
            "to": ["a@example.com", {"email": "b@example.com", "name": "Bee"}],
            "subject": "Hi",
            "body": "Hello"
        }"#;
        let msg: EmailMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.to[0], EmailAddress::new("a@example.com"));
        assert_eq!(
            msg.to[1],
            EmailAddress::new("b@example.com").with_name("Bee")
        );
        assert_eq!(msg.priority, Priority::Normal);
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_attachment_base64() {
        let json = r#"{"filename": "a.txt", "content": "aGVsbG8="}"#;
        let att: Attachment = serde_json::from_str(json).unwrap();
        assert_eq!(att.content, b"hello".to_vec());
        assert_eq!(att.content_type, "application/octet-stream");
    }

    #[test]
    fn test_validate_requires_recipient() {
        let mut msg = EmailMessage::new("a@example.com", "Hi").with_body("x");
        msg.to.clear();
        assert!(matches!(
            msg.validate(),
            Err(crate::Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_validate_requires_content() {
        let msg = EmailMessage::new("a@example.com", "Hi");
        assert!(msg.validate().is_err());

        let templated = EmailMessage::new("a@example.com", "Hi")
            .with_template("welcome.html", serde_json::json!({"name": "A"}));
        assert!(templated.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_cc_and_headers() {
        let mut msg = EmailMessage::new("a@example.com", "Hi").with_body("x");
        msg.cc.push(EmailAddress::new("not-an-address"));
        assert!(msg.validate().is_err());

        let mut msg = EmailMessage::new("a@example.com", "Hi").with_body("x");
        msg.headers.insert("X-Bad Header".into(), "v".into());
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_recipients_include_cc_and_bcc() {
        let mut msg = EmailMessage::new("a@example.com", "Hi").with_body("x");
        msg.cc.push("b@example.com".into());
        msg.bcc.push("c@example.com".into());
        let all: Vec<&str> = msg.recipients().map(|a| a.email.as_str()).collect();
        assert_eq!(all, vec!["a@example.com", "b@example.com", "c@example.com"]);
    }

    #[test]
    fn test_priority_headers() {
        assert_eq!(Priority::High.headers(), Some(("1", "high")));
        assert_eq!(Priority::Low.headers(), Some(("5", "low")));
        assert_eq!(Priority::Normal.headers(), None);
    }
}
