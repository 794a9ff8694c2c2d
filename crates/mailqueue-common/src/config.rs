//! Configuration for mailqueue

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix, e.g. `MAIL_QUEUE__BATCH_SIZE`
pub const ENV_PREFIX: &str = "MAIL";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Named SMTP accounts
    #[serde(default)]
    pub accounts: HashMap<String, AccountConfig>,

    /// Account used when a message does not name one
    #[serde(default = "default_account_name")]
    pub default_account: String,

    /// Queue processing configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Retry backoff configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Template configuration
    #[serde(default)]
    pub templates: TemplateConfig,

    /// Queue store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Timeout for a single delivery attempt, in seconds
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accounts: HashMap::new(),
            default_account: default_account_name(),
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            templates: TemplateConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            send_timeout_secs: default_send_timeout(),
        }
    }
}

fn default_account_name() -> String {
    "default".to_string()
}

fn default_send_timeout() -> u64 {
    30
}

/// SMTP connection security
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    None,
    Tls,
    Starttls,
}

impl std::fmt::Display for SmtpSecurity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmtpSecurity::None => write!(f, "none"),
            SmtpSecurity::Tls => write!(f, "tls"),
            SmtpSecurity::Starttls => write!(f, "starttls"),
        }
    }
}

/// A single named SMTP account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// SMTP server host
    pub host: String,

    /// SMTP server port
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    pub username: Option<String>,

    pub password: Option<String>,

    #[serde(default = "default_security")]
    pub security: SmtpSecurity,

    /// Connection timeout in seconds
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,

    /// Default sender address for this account
    pub from_email: String,

    /// Default sender display name
    pub from_name: Option<String>,

    /// Default reply-to address
    pub reply_to: Option<String>,

    /// Per-account hourly ceiling, overrides `rate_limit.max_per_hour`
    pub max_per_hour: Option<u32>,

    /// Per-account minute ceiling, overrides `rate_limit.max_per_minute`
    pub max_per_minute: Option<u32>,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_security() -> SmtpSecurity {
    SmtpSecurity::Starttls
}

fn default_smtp_timeout() -> u64 {
    60
}

/// Queue processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Whether workers are started
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Number of worker instances
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Attempts allowed when a message does not specify its own
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Messages claimed per worker iteration
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Idle wait between polls, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// In-flight messages older than this are reclaimed
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// How long `stop` waits for an outstanding send
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Initial backoff when the store is unavailable, in milliseconds
    #[serde(default = "default_store_backoff")]
    pub store_backoff_ms: u64,

    /// Upper bound for the store backoff, in milliseconds
    #[serde(default = "default_store_backoff_max")]
    pub store_backoff_max_ms: u64,

    /// How long `sent` records are kept
    #[serde(default = "default_sent_retention")]
    pub sent_retention_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval(),
            stale_after_secs: default_stale_after(),
            shutdown_grace_secs: default_shutdown_grace(),
            store_backoff_ms: default_store_backoff(),
            store_backoff_max_ms: default_store_backoff_max(),
            sent_retention_secs: default_sent_retention(),
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_batch_size() -> usize {
    10
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_stale_after() -> u64 {
    900
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_store_backoff() -> u64 {
    500
}

fn default_store_backoff_max() -> u64 {
    30_000
}

fn default_sent_retention() -> u64 {
    86_400
}

/// Retry backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry, in seconds
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,

    /// Upper bound for any retry delay, in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Random spread applied to each delay, as a fraction (0.2 = ±20%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

fn default_base_delay() -> u64 {
    300
}

fn default_max_delay() -> u64 {
    14_400
}

fn default_jitter() -> f64 {
    0.2
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum sends per rolling hour, per account
    #[serde(default = "default_max_per_hour")]
    pub max_per_hour: u32,

    /// Maximum sends per rolling minute, per account
    pub max_per_minute: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_hour: default_max_per_hour(),
            max_per_minute: None,
        }
    }
}

fn default_max_per_hour() -> u32 {
    100
}

/// Template configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,

    /// Escape HTML/XML templates
    #[serde(default = "default_true")]
    pub auto_escape: bool,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            template_dir: default_template_dir(),
            auto_escape: true,
        }
    }
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("templates/emails")
}

/// Queue store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Store backend: "memory" or "sqlite"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Database path (for sqlite)
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a writer waits on a locked database, in seconds
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: default_storage_path(),
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout(),
        }
    }
}

fn default_storage_backend() -> String {
    "sqlite".to_string()
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("mailqueue.db")
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout() -> u64 {
    5
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info,mailqueue=debug".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered with `MAIL_*` environment variables
    ///
    /// Without an explicit path, `$MAIL_CONFIG`, `./mailqueue.toml` and
    /// `/etc/mailqueue/mailqueue.toml` are tried in order.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_paths().into_iter().find(|p| p.exists()),
        };

        let mut builder = config::Config::builder();
        if let Some(file) = &file {
            tracing::debug!(path = %file.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(file.as_path()).format(config::FileFormat::Toml),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn default_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var("MAIL_CONFIG") {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("./mailqueue.toml"));
        paths.push(PathBuf::from("/etc/mailqueue/mailqueue.toml"));
        paths
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> crate::Result<()> {
        for (name, account) in &self.accounts {
            if account.port == 0 {
                return Err(crate::Error::Config(format!(
                    "Account '{}': port must be between 1 and 65535",
                    name
                )));
            }
            if account.host.is_empty() {
                return Err(crate::Error::Config(format!(
                    "Account '{}': host is required",
                    name
                )));
            }
            if matches!(account.max_per_hour, Some(0)) || matches!(account.max_per_minute, Some(0)) {
                return Err(crate::Error::Config(format!(
                    "Account '{}': rate limits must be greater than 0",
                    name
                )));
            }
        }

        if !self.accounts.is_empty() && !self.accounts.contains_key(&self.default_account) {
            return Err(crate::Error::Config(format!(
                "Default account '{}' is not configured",
                self.default_account
            )));
        }

        if self.rate_limit.max_per_hour == 0 {
            return Err(crate::Error::Config(
                "rate_limit.max_per_hour must be greater than 0".to_string(),
            ));
        }
        if matches!(self.rate_limit.max_per_minute, Some(0)) {
            return Err(crate::Error::Config(
                "rate_limit.max_per_minute must be greater than 0".to_string(),
            ));
        }

        if self.queue.max_attempts == 0 {
            return Err(crate::Error::Config(
                "queue.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.queue.batch_size == 0 || self.queue.workers == 0 {
            return Err(crate::Error::Config(
                "queue.batch_size and queue.workers must be at least 1".to_string(),
            ));
        }

        if self.queue.poll_interval_ms == 0 {
            return Err(crate::Error::Config(
                "queue.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        // A claim must outlive the longest possible attempt, or housekeeping
        // hands a message that is still being sent to another worker.
        let longest_attempt = self
            .accounts
            .values()
            .map(|a| a.timeout_secs)
            .fold(self.send_timeout_secs, u64::max);
        if self.queue.stale_after_secs <= longest_attempt {
            return Err(crate::Error::Config(format!(
                "queue.stale_after_secs ({}) must exceed the longest send timeout ({}s)",
                self.queue.stale_after_secs, longest_attempt
            )));
        }

        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(crate::Error::Config(
                "retry.jitter must be within [0, 1)".to_string(),
            ));
        }
        if self.retry.base_delay_secs > self.retry.max_delay_secs {
            return Err(crate::Error::Config(
                "retry.base_delay_secs must not exceed retry.max_delay_secs".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve an account by name, falling back to the default account
    pub fn account(&self, name: Option<&str>) -> crate::Result<&AccountConfig> {
        let name = name.unwrap_or(&self.default_account);
        self.accounts.get(name).ok_or_else(|| {
            let mut available: Vec<&str> = self.accounts.keys().map(String::as_str).collect();
            available.sort_unstable();
            crate::Error::NotFound(format!(
                "SMTP account '{}' not found. Available accounts: {}",
                name,
                available.join(", ")
            ))
        })
    }

    /// Check if an account exists
    pub fn has_account(&self, name: &str) -> bool {
        self.accounts.contains_key(name)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}
