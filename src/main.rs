//! # StockWatch: scheduled shortage checks with e-mail reports
//!
//! Usage:
//!   stockwatch run                       # Start the scheduler until Ctrl-C
//!   stockwatch trigger task-1a2b         # Run one task now and print the outcome
//!   stockwatch validate                  # Check config and every stored task
//!   stockwatch tasks                     # List stored tasks
//!   stockwatch --config ./sw.toml run    # Custom config file
//!
//! Secrets may come from the environment instead of the config file:
//! `STOCKWATCH_SMTP_PASSWORD`, `STOCKWATCH_CALCULATOR_API_KEY`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use stockwatch_channels::{EmailNotifier, SmtpMailTransport};
use stockwatch_core::StockWatchConfig;
use stockwatch_core::traits::TaskStore;
use stockwatch_providers::HttpCalculator;
use stockwatch_scheduler::{
    FileTaskStore, RunOutcome, Scheduler, SqliteTaskStore, TaskExecutor, validate_task,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "stockwatch",
    version,
    about = "📦 StockWatch: scheduled stock availability checks with e-mail reports"
)]
struct Cli {
    /// Config file (default: ~/.stockwatch/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the scheduler and run until Ctrl-C
    Run,
    /// Run one task immediately
    Trigger {
        /// Task id
        task_id: String,
    },
    /// Validate configuration and stored tasks
    Validate,
    /// List stored tasks
    Tasks,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(path: Option<&str>) -> Result<StockWatchConfig> {
    let mut config = match path {
        Some(p) => StockWatchConfig::load_from(&expand_path(p))?,
        None => StockWatchConfig::load()?,
    };

    if let Ok(password) = std::env::var("STOCKWATCH_SMTP_PASSWORD") {
        config.smtp.password = password;
    }
    if let Ok(key) = std::env::var("STOCKWATCH_CALCULATOR_API_KEY") {
        config.calculator.api_key = key;
    }
    Ok(config)
}

fn open_store(config: &StockWatchConfig) -> Result<Arc<dyn TaskStore>> {
    let path = expand_path(&config.store.path);
    let store: Arc<dyn TaskStore> = match config.store.backend.as_str() {
        "sqlite" => {
            let file = if path.extension().is_some() {
                path
            } else {
                path.join("tasks.db")
            };
            Arc::new(SqliteTaskStore::open(&file)?)
        }
        "json" => Arc::new(FileTaskStore::new(&path)?),
        other => bail!("unknown store backend '{other}'"),
    };
    Ok(store)
}

/// Wire store, calculator, notifier, executor and scheduler together.
fn build_scheduler(config: &StockWatchConfig, store: Arc<dyn TaskStore>) -> Result<Arc<Scheduler>> {
    let shutdown = CancellationToken::new();

    let transport = Arc::new(SmtpMailTransport::new(&config.smtp)?);
    let notifier = EmailNotifier::new(
        transport,
        config.notifications.clone(),
        config.retry.mail.clone(),
        config.smtp.timeout(),
    )
    .with_shutdown(shutdown.clone());

    let calculator = Arc::new(HttpCalculator::new(&config.calculator));
    let executor = TaskExecutor::new(
        store,
        calculator,
        config.retry.calculation.clone(),
        config.calculator.timeout(),
    )
    .with_channel(Arc::new(notifier));

    Ok(Scheduler::new(
        Arc::new(executor),
        config.scheduler.clone(),
        shutdown,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "stockwatch=debug,stockwatch_core=debug,stockwatch_channels=debug,stockwatch_providers=debug,stockwatch_scheduler=debug"
    } else {
        "stockwatch=info,stockwatch_core=info,stockwatch_channels=info,stockwatch_providers=info,stockwatch_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Trigger { task_id } => trigger(config, &task_id).await,
        Command::Validate => validate(config).await,
        Command::Tasks => list_tasks(config).await,
    }
}

async fn run(config: StockWatchConfig) -> Result<()> {
    config.validate()?;
    let store = open_store(&config)?;
    let scheduler = build_scheduler(&config, store)?;

    let summary = scheduler.reconcile_from_store().await?;
    tracing::info!(
        "📦 StockWatch running: {} trigger(s) installed, {} invalid task(s)",
        summary.installed,
        summary.invalid
    );

    let handle = scheduler.spawn();
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("🛑 Ctrl-C received");

    let clean = scheduler.shutdown().await;
    handle.await.context("scheduler loop")?;

    let stats = scheduler.stats();
    tracing::info!(
        "📊 fired={} completed={} skipped={} failed={} skipped_overlap={}",
        stats.fired,
        stats.completed,
        stats.skipped,
        stats.failed,
        stats.skipped_overlap
    );
    if !clean {
        bail!("shutdown grace period elapsed with executions still running");
    }
    Ok(())
}

async fn trigger(config: StockWatchConfig, task_id: &str) -> Result<()> {
    config.validate()?;
    let store = open_store(&config)?;
    let scheduler = build_scheduler(&config, store)?;

    let outcome = scheduler.trigger_now(task_id).await;
    scheduler.shutdown().await;
    println!("{task_id}: {outcome}");

    match outcome {
        RunOutcome::Failed(e) => Err(e.into()),
        _ => Ok(()),
    }
}

async fn validate(config: StockWatchConfig) -> Result<()> {
    let mut problems = 0;
    match config.validate() {
        Ok(()) => println!("✅ Configuration OK"),
        Err(e) => {
            problems += 1;
            println!("❌ Configuration: {e}");
        }
    }

    let store = open_store(&config)?;
    let tasks = store.list().await?;
    for task in &tasks {
        match validate_task(task) {
            Ok(schedule) => println!("✅ {} '{}' ({schedule})", task.id, task.name),
            Err(e) => {
                problems += 1;
                println!("❌ {}: {e}", task.id);
            }
        }
    }
    println!("{} task(s) checked, {problems} problem(s)", tasks.len());

    if problems > 0 {
        bail!("{problems} problem(s) found");
    }
    Ok(())
}

async fn list_tasks(config: StockWatchConfig) -> Result<()> {
    let store = open_store(&config)?;
    let tasks = store.list().await?;
    if tasks.is_empty() {
        println!("No tasks in {}", display_store(&config));
        return Ok(());
    }

    println!("{:<38} {:<24} {:<18} {:<9} {:<7}", "ID", "NAME", "SCHEDULE", "NOTIFY", "ACTIVE");
    for task in &tasks {
        println!(
            "{:<38} {:<24} {:<18} {:<9} {:<7}",
            task.id,
            truncate(&task.name, 24),
            truncate(&task.schedule, 18),
            task.notify_condition.to_string(),
            if task.active { "yes" } else { "no" }
        );
    }
    Ok(())
}

fn display_store(config: &StockWatchConfig) -> String {
    format!(
        "{} store at {}",
        config.store.backend,
        expand_path(&config.store.path).display()
    )
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let cut: String = s.chars().take(width.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
