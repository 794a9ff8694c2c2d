//! Template rendering
//!
//! Templates are rendered at delivery time, never at enqueue time. A template
//! whose name ends in `.html` fills the HTML part, any other template fills the
//! plain text body. An optional sibling `<stem>.subject.txt` template renders
//! the subject line.

use mailqueue_common::config::TemplateConfig;
use minijinja::{AutoEscape, Environment, ErrorKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Template '{0}' not found")]
    NotFound(String),

    #[error("Failed to render template '{name}': {reason}")]
    Render { name: String, reason: String },

    #[error("Templates are not enabled")]
    Disabled,
}

/// Output of a template render; `None` leaves the message field untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedContent {
    pub subject: Option<String>,
    pub body: Option<String>,
    pub html: Option<String>,
}

pub trait Renderer: Send + Sync {
    fn render(&self, template: &str, data: &serde_json::Value) -> Result<RenderedContent, RenderError>;
}

/// minijinja-backed renderer loading templates from a directory
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl TemplateRenderer {
    pub fn new(config: &TemplateConfig) -> Self {
        let mut renderer = Self::empty(config.auto_escape);
        renderer
            .env
            .set_loader(minijinja::path_loader(&config.template_dir));
        renderer
    }

    /// A renderer with no templates until [`add_template`](Self::add_template) is called
    pub fn empty(auto_escape: bool) -> Self {
        let mut env = Environment::new();
        if !auto_escape {
            env.set_auto_escape_callback(|_| AutoEscape::None);
        }
        Self { env }
    }

    pub fn add_template(&mut self, name: impl Into<String>, source: impl Into<String>) -> Result<(), RenderError> {
        let name = name.into();
        self.env
            .add_template_owned(name.clone(), source.into())
            .map_err(|e| RenderError::Render {
                name,
                reason: e.to_string(),
            })
    }

    /// Render `name`, `Ok(None)` if it does not exist
    fn render_optional(&self, name: &str, data: &serde_json::Value) -> Result<Option<String>, RenderError> {
        let template = match self.env.get_template(name) {
            Ok(template) => template,
            Err(e) if e.kind() == ErrorKind::TemplateNotFound => return Ok(None),
            Err(e) => {
                return Err(RenderError::Render {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        };
        template
            .render(data)
            .map(Some)
            .map_err(|e| RenderError::Render {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }
}

fn subject_template(name: &str) -> String {
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    format!("{}.subject.txt", stem)
}

impl Renderer for TemplateRenderer {
    fn render(&self, template: &str, data: &serde_json::Value) -> Result<RenderedContent, RenderError> {
        let empty = serde_json::Value::Object(Default::default());
        let data = if data.is_null() { &empty } else { data };

        let content = self
            .render_optional(template, data)?
            .ok_or_else(|| RenderError::NotFound(template.to_string()))?;

        let subject = self
            .render_optional(&subject_template(template), data)?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let mut rendered = RenderedContent {
            subject,
            ..RenderedContent::default()
        };
        if template.ends_with(".html") {
            rendered.html = Some(content);
        } else {
            rendered.body = Some(content);
        }
        Ok(rendered)
    }
}
