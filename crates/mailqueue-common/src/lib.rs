//! mailqueue Common - Shared types and configuration
//!
//! This crate provides the configuration model, the email payload types
//! and the error type shared across all mailqueue components.

pub mod config;
pub mod email;
pub mod error;

pub use config::Config;
pub use email::{Attachment, EmailAddress, EmailMessage, Priority};
pub use error::{Error, Result};
