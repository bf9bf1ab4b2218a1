//! # pacer
//!
//! Command-line front end for the pacer scheduler.
//!
//! Usage:
//!   pacer run --config pacer.toml --tasks tasks.json   # run until Ctrl-C
//!   pacer check-config --config pacer.toml             # validate and print
//!   pacer preview --config pacer.toml --tasks tasks.json
//!   pacer retry-schedule --retries 5

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pacer_core::config::PacerConfig;
use pacer_core::domain::{Channel, ExecutionReport, Task};
use pacer_core::impls::InMemoryTaskStore;
use pacer_core::ports::{Executor, ExecutorError};
use pacer_core::queue::{RetryPolicy, format_duration};
use pacer_core::{Scheduler, SchedulerBuilder, SchedulerHandle, TaskRequest};

#[derive(Parser)]
#[command(name = "pacer", version, about = "Multi-channel delivery scheduler")]
struct Cli {
    /// Verbose logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler over an in-memory store until Ctrl-C
    Run {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// JSON array of tasks to seed the store with
        #[arg(short, long)]
        tasks: Option<PathBuf>,
        /// Simulated duration of one delivery, in milliseconds
        #[arg(long, default_value = "500")]
        exec_ms: u64,
    },
    /// Validate a config file and print the effective configuration
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show which task would run next on each channel
    Preview {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long)]
        tasks: Option<PathBuf>,
    },
    /// Print the retry backoff schedule
    RetrySchedule {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long, default_value = "3")]
        retries: u32,
    },
}

/// One entry of the `--tasks` file.
#[derive(Debug, Deserialize)]
struct SeedTask {
    content_code: String,
    channel: Channel,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    max_retry: Option<u32>,
    #[serde(default)]
    payload: serde_json::Value,
}

impl From<SeedTask> for TaskRequest {
    fn from(seed: SeedTask) -> Self {
        let mut request = TaskRequest::new(seed.content_code, seed.channel)
            .priority(seed.priority)
            .payload(seed.payload);
        if let Some(target) = seed.target {
            request = request.target(target);
        }
        if let Some(at) = seed.scheduled_time {
            request = request.at(at);
        }
        if let Some(max_retry) = seed.max_retry {
            request = request.max_retry(max_retry);
        }
        request
    }
}

/// Stand-in for the UI driver: logs the delivery and reports success.
struct LoggingExecutor {
    delay: Duration,
}

#[async_trait]
impl Executor for LoggingExecutor {
    async fn execute(&self, task: &Task) -> Result<ExecutionReport, ExecutorError> {
        info!(
            task_id = %task.id,
            channel = %task.channel,
            content = %task.content_code,
            target = task.target.as_deref().unwrap_or("-"),
            "delivering"
        );
        tokio::time::sleep(self.delay).await;
        Ok(ExecutionReport::success().with_message("logged"))
    }
}

fn load_config(path: Option<&Path>) -> Result<PacerConfig> {
    match path {
        Some(path) => PacerConfig::load_from(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(PacerConfig::default()),
    }
}

fn load_seed(path: &Path) -> Result<Vec<SeedTask>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading tasks from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing tasks in {}", path.display()))
}

async fn build(config: PacerConfig, tasks: Option<&Path>, exec_ms: u64) -> Result<Arc<Scheduler>> {
    let scheduler = SchedulerBuilder::new(config)
        .store(Arc::new(InMemoryTaskStore::new()))
        .executor(Arc::new(LoggingExecutor {
            delay: Duration::from_millis(exec_ms),
        }))
        .build()?;
    if let Some(path) = tasks {
        let seed = load_seed(path)?;
        let n = seed.len();
        for task in seed {
            scheduler.schedule_task(task.into()).await?;
        }
        info!(count = n, "seeded tasks");
    }
    Ok(scheduler)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    match cli.command {
        Command::Run {
            config,
            tasks,
            exec_ms,
        } => {
            let config = load_config(config.as_deref())?;
            let scheduler = build(config, tasks.as_deref(), exec_ms).await?;
            let report = scheduler.start().await?;
            info!(reloaded = report.reloaded, missed = report.missed, "recovery done");

            let handle = SchedulerHandle::spawn(scheduler);
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("shutdown requested");
            handle.shutdown_and_join().await;
        }
        Command::CheckConfig { config } => {
            let config = load_config(Some(&config))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("config ok");
        }
        Command::Preview { config, tasks } => {
            let config = load_config(config.as_deref())?;
            let scheduler = build(config, tasks.as_deref(), 0).await?;
            scheduler.queues().start_all();
            for preview in scheduler.queues().previews() {
                let task = preview
                    .task
                    .as_ref()
                    .map(|t| format!("{} ({}, priority {})", t.id, t.content_code, t.priority))
                    .unwrap_or_else(|| "-".to_string());
                let reason = preview
                    .reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "ready".to_string());
                let at = preview
                    .next_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<20} {:<12} {:<28} {}", preview.channel, reason, at, task);
            }
            let next = scheduler.next_task_preview();
            println!("next: {}", serde_json::to_string_pretty(&next)?);
        }
        Command::RetrySchedule { config, retries } => {
            let config = load_config(config.as_deref())?;
            let policy = RetryPolicy::from(&config.retry);
            for n in 0..retries {
                let delay = policy.next_delay(n).as_secs();
                println!("retry {:>2}: {:>6}s  {}", n + 1, delay, format_duration(delay));
            }
        }
    }
    Ok(())
}
