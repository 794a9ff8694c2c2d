//! mailqueue - Delivery daemon and queue management CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mailqueue_common::config::{Config, LoggingConfig};
use mailqueue_common::{EmailMessage, Error};
use mailqueue_core::{
    DeliveryResult, Dispatcher, Producer, RateLimiter, RetryScheduler, SmtpTransport,
    TemplateRenderer, Worker, WorkerSettings,
};
use mailqueue_storage::{create_storage, QueueStore, Storage};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

/// Queued email delivery with per-account rate limiting and retries
#[derive(Parser, Debug)]
#[command(name = "mailqueue")]
#[command(about = "Queued email delivery with rate limiting and retries", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file. Falls back to $MAIL_CONFIG, ./mailqueue.toml and
    /// /etc/mailqueue/mailqueue.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run delivery workers until interrupted (default)
    Run,
    /// Queue the message in a JSON file, or `-` to read it from stdin
    Enqueue {
        message: PathBuf,
        /// Sending account, overrides the message's own
        #[arg(long)]
        account: Option<String>,
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Show collection sizes
    Stats,
    /// List dead-lettered messages, newest first
    Dead {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Move a dead message back to the queue
    Requeue { id: Uuid },
    /// Delete dead messages
    Purge {
        #[arg(required_unless_present = "all")]
        id: Option<Uuid>,
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
    /// Deliver a message immediately, bypassing the queue
    Send {
        message: PathBuf,
        #[arg(long)]
        account: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run_cli(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            match e.downcast_ref::<Error>() {
                Some(err) if err.is_client_error() => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run_cli(cli: Cli) -> Result<()> {
    let config = Arc::new(Config::load(cli.config.as_deref())?);
    init_logging(&config.logging);

    let storage = create_storage(&config.storage).await?;
    let outcome = run_command(cli.command.unwrap_or(Commands::Run), config, &storage).await;
    storage.close().await;
    outcome
}

async fn run_command(command: Commands, config: Arc<Config>, storage: &Storage) -> Result<()> {
    let store = storage.queue.clone();

    match command {
        Commands::Run => {
            let limiter = build_limiter(&config, storage);
            run_workers(config, store, limiter).await
        }
        Commands::Enqueue {
            message,
            account,
            max_attempts,
        } => {
            let producer = Producer::new(store, config);
            let id = producer
                .enqueue(read_message(&message)?, account.as_deref(), max_attempts)
                .await
                .map_err(Error::from)?;
            println!("{}", id);
            Ok(())
        }
        Commands::Stats => {
            let stats = Producer::new(store, config)
                .stats()
                .await
                .map_err(Error::from)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::Dead { limit } => {
            let dead = Producer::new(store, config)
                .dead_letters(limit)
                .await
                .map_err(Error::from)?;
            for message in dead {
                println!(
                    "{}  {}  attempts {}/{}  {}  {}",
                    message.id,
                    message.account,
                    message.attempt_count,
                    message.max_attempts,
                    message.updated_at.to_rfc3339(),
                    message.last_error.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        Commands::Requeue { id } => {
            Producer::new(store, config)
                .requeue_dead(id)
                .await
                .map_err(Error::from)?;
            println!("Requeued {}", id);
            Ok(())
        }
        Commands::Purge { id, all } => {
            let producer = Producer::new(store, config);
            match (id, all) {
                (_, true) => {
                    let purged = producer.purge_all_dead().await.map_err(Error::from)?;
                    println!("Purged {} dead messages", purged);
                }
                (Some(id), false) => {
                    producer.purge_dead(id).await.map_err(Error::from)?;
                    println!("Purged {}", id);
                }
                (None, false) => {
                    return Err(Error::Validation("a message id or --all is required".into()).into())
                }
            }
            Ok(())
        }
        Commands::Send { message, account } => {
            let producer = Producer::new(store, config.clone()).with_direct_delivery(
                Arc::new(build_dispatcher(&config)),
                build_limiter(&config, storage),
            );
            let result = producer
                .send_now(read_message(&message)?, account.as_deref())
                .await
                .map_err(Error::from)?;
            match result {
                DeliveryResult::Sent { external_id } => {
                    println!("Sent {}", external_id);
                    Ok(())
                }
                DeliveryResult::TransientFailure { reason } => {
                    Err(Error::Smtp(format!("temporary failure: {}", reason)).into())
                }
                DeliveryResult::PermanentFailure { reason } => {
                    Err(Error::Smtp(format!("permanent failure: {}", reason)).into())
                }
            }
        }
    }
}

fn read_message(source: &Path) -> Result<EmailMessage> {
    let json = if source == Path::new("-") {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .context("Failed to read message from stdin")?;
        input
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("Failed to read {}", source.display()))?
    };
    parse_message(&json)
}

fn parse_message(json: &str) -> Result<EmailMessage> {
    serde_json::from_str(json)
        .map_err(|e| Error::InvalidMessage(format!("malformed message JSON: {}", e)).into())
}

fn build_dispatcher(config: &Config) -> Dispatcher {
    let transport = Arc::new(SmtpTransport::new(config.accounts.clone()));
    let dispatcher = Dispatcher::new(transport, config.send_timeout());
    if config.templates.enabled {
        dispatcher.with_renderer(Arc::new(TemplateRenderer::new(&config.templates)))
    } else {
        dispatcher
    }
}

/// Rate limiter whose grants are shared with every process on the same database
fn build_limiter(config: &Config, storage: &Storage) -> Arc<RateLimiter> {
    let limiter = RateLimiter::from_config(config);
    Arc::new(match &storage.rate_ledger {
        Some(ledger) => limiter.with_ledger(ledger.clone()),
        None => limiter,
    })
}

async fn run_workers(
    config: Arc<Config>,
    store: Arc<dyn QueueStore>,
    limiter: Arc<RateLimiter>,
) -> Result<()> {
    info!("Starting mailqueue...");

    if !config.queue.enabled {
        info!("Queue processing disabled, nothing to run");
        return Ok(());
    }
    if config.accounts.is_empty() {
        warn!("No SMTP accounts configured, every delivery will fail permanently");
    }

    let dispatcher = Arc::new(build_dispatcher(&config));
    let retry = RetryScheduler::from_config(&config.retry);
    let settings = WorkerSettings::from(&config.queue);

    let workers: Vec<Arc<Worker>> = (1..=config.queue.workers)
        .map(|i| {
            Arc::new(
                Worker::new(store.clone(), dispatcher.clone(), limiter.clone())
                    .with_name(format!("worker-{}", i))
                    .with_retry(retry.clone())
                    .with_settings(settings.clone()),
            )
        })
        .collect();

    for worker in &workers {
        worker.start().await;
    }
    info!("mailqueue started with {} workers", workers.len());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let mut stopping = tokio::task::JoinSet::new();
    for worker in workers {
        stopping.spawn(async move { worker.stop().await });
    }
    let mut clean = true;
    while let Some(stopped) = stopping.join_next().await {
        clean &= matches!(stopped, Ok(true));
    }
    if !clean {
        warn!("Some workers were aborted; their in-flight messages will be reclaimed on restart");
    }

    info!("mailqueue shutdown complete");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();

        let cli = Cli::parse_from(["mailqueue", "--config", "q.toml", "dead", "--limit", "5"]);
        assert_eq!(cli.config, Some(PathBuf::from("q.toml")));
        assert!(matches!(cli.command, Some(Commands::Dead { limit: 5 })));

        let cli = Cli::parse_from(["mailqueue"]);
        assert!(cli.command.is_none());

        assert!(Cli::try_parse_from(["mailqueue", "purge"]).is_err());
        let cli = Cli::parse_from(["mailqueue", "purge", "--all"]);
        assert!(matches!(cli.command, Some(Commands::Purge { id: None, all: true })));
    }

    #[test]
    fn test_parse_message() {
        let message = parse_message(r#"{"to": ["a@example.com"], "subject": "Hi", "body": "x"}"#).unwrap();
        assert_eq!(message.subject, "Hi");

        let err = parse_message("{not json").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidMessage(_))));

        assert!(read_message(Path::new("/nonexistent/message.json")).is_err());
    }

    #[tokio::test]
    async fn test_limiter_shared_through_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.path = dir.path().join("mailqueue.db");
        config.rate_limit.max_per_hour = 1;

        // `run` and `send` open the database independently
        let daemon = create_storage(&config.storage).await.unwrap();
        let client = create_storage(&config.storage).await.unwrap();
        let workers = build_limiter(&config, &daemon);
        let direct = build_limiter(&config, &client);
        assert!(workers.is_shared());

        assert!(workers.try_acquire("default").await.is_granted());
        assert!(!direct.try_acquire("default").await.is_granted());

        config.storage.backend = "memory".to_string();
        let memory = create_storage(&config.storage).await.unwrap();
        assert!(!build_limiter(&config, &memory).is_shared());
    }
}
