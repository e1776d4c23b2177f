//! CLI command definitions for daybreak.
//!
//! Provides operator commands for scheduling the daily batch, immediate
//! sends, running the worker pool, running the queue monitor, and reading
//! queue status. Results print as pretty JSON so they can be piped into
//! other tooling.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::config::DispatchConfig;
use crate::metrics::init_metrics;
use crate::monitor::{MonitorEvent, QueueMonitor};
use crate::queue::{JobBroker, RedisBroker};
use crate::scheduler::DeliveryScheduler;
use crate::store::{JsonContentStore, LoggingChannelClient};
use crate::worker::WorkerPool;

/// Daily content delivery scheduling and queue monitoring.
#[derive(Parser)]
#[command(name = "daybreak")]
#[command(about = "Schedule, send, and monitor daily content deliveries")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379", global = true)]
    pub redis_url: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Schedule the daily delivery batch from a content file.
    Schedule(ScheduleArgs),

    /// Send one content unit immediately and wait for the result.
    Send(SendArgs),

    /// Run the delivery worker pool until interrupted.
    Work(WorkArgs),

    /// Run the queue monitor until interrupted.
    Monitor(MonitorArgs),

    /// Print queue counts and health.
    Status(StatusArgs),
}

/// Arguments for `daybreak schedule`.
#[derive(Parser, Debug)]
pub struct ScheduleArgs {
    /// JSON file with the due content batch (array of content+recipient records).
    #[arg(short, long)]
    pub content_file: PathBuf,

    /// Delivery queue name.
    #[arg(short, long, default_value = "distribution")]
    pub queue: String,
}

/// Arguments for `daybreak send`.
#[derive(Parser, Debug)]
pub struct SendArgs {
    /// JSON file the content unit is looked up in.
    #[arg(short, long)]
    pub content_file: PathBuf,

    /// Advisor id the send is attributed to.
    #[arg(long)]
    pub advisor_id: String,

    /// Content unit to send.
    #[arg(long)]
    pub content_id: String,

    /// Recipient phone number.
    #[arg(long)]
    pub phone_number: String,

    /// Delivery queue name.
    #[arg(short, long, default_value = "distribution")]
    pub queue: String,
}

/// Arguments for `daybreak work`.
#[derive(Parser, Debug)]
pub struct WorkArgs {
    /// Number of worker tasks.
    #[arg(short = 'n', long, default_value = "4")]
    pub num_workers: usize,

    /// Delivery queue name.
    #[arg(short, long, default_value = "distribution")]
    pub queue: String,
}

/// Arguments for `daybreak monitor`.
#[derive(Parser, Debug)]
pub struct MonitorArgs {
    /// Comma-separated queue names to observe.
    #[arg(short, long, default_value = "distribution,batch,retry,analytics")]
    pub queues: String,
}

/// Arguments for `daybreak status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Comma-separated queue names to report on.
    #[arg(short, long, default_value = "distribution,batch,retry,analytics")]
    pub queues: String,
}

/// Parse the CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    init_metrics()?;

    match cli.command {
        Commands::Schedule(args) => run_schedule_command(&cli.redis_url, args).await,
        Commands::Send(args) => run_send_command(&cli.redis_url, args).await,
        Commands::Work(args) => run_work_command(&cli.redis_url, args).await,
        Commands::Monitor(args) => run_monitor_command(&cli.redis_url, args).await,
        Commands::Status(args) => run_status_command(&cli.redis_url, args).await,
    }
}

fn base_config(redis_url: &str) -> anyhow::Result<DispatchConfig> {
    let mut config = DispatchConfig::from_env()?;
    config.redis_url = redis_url.to_string();
    Ok(config)
}

async fn connect_broker(
    config: &DispatchConfig,
    queue: &str,
) -> anyhow::Result<Arc<dyn JobBroker>> {
    let broker = RedisBroker::connect(&config.redis_url, queue, config.stall_timeout).await?;
    Ok(Arc::new(broker))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_schedule_command(redis_url: &str, args: ScheduleArgs) -> anyhow::Result<()> {
    let mut config = base_config(redis_url)?;
    config.queue_name = args.queue.clone();

    let store = Arc::new(JsonContentStore::from_path(&args.content_file)?);
    let broker = connect_broker(&config, &args.queue).await?;
    let scheduler = DeliveryScheduler::new(config, broker, store);

    let outcome = scheduler.schedule_daily_delivery(None).await;
    print_json(&outcome)
}

async fn run_send_command(redis_url: &str, args: SendArgs) -> anyhow::Result<()> {
    let mut config = base_config(redis_url)?;
    config.queue_name = args.queue.clone();

    let store = Arc::new(JsonContentStore::from_path(&args.content_file)?);
    let broker = connect_broker(&config, &args.queue).await?;
    let scheduler = DeliveryScheduler::new(config, broker, store);

    let result = scheduler
        .send_immediate(&args.advisor_id, &args.content_id, &args.phone_number)
        .await?;
    print_json(&result)
}

async fn run_work_command(redis_url: &str, args: WorkArgs) -> anyhow::Result<()> {
    let mut config = base_config(redis_url)?;
    config.queue_name = args.queue.clone();
    config.num_workers = args.num_workers;

    let broker = connect_broker(&config, &args.queue).await?;
    let channel = Arc::new(LoggingChannelClient::new());
    let mut pool = WorkerPool::new(config, broker, channel);

    pool.start()?;
    info!("Worker pool running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        jobs_sent = stats.jobs_sent,
        jobs_failed = stats.jobs_failed,
        "Worker pool finished"
    );
    Ok(())
}

async fn run_monitor_command(redis_url: &str, args: MonitorArgs) -> anyhow::Result<()> {
    let config = base_config(redis_url)?;
    let mut monitor = QueueMonitor::new(config.clone());
    for queue in split_queues(&args.queues) {
        monitor.add_queue(connect_broker(&config, &queue).await?);
    }

    let mut events = monitor.subscribe();
    monitor.start_monitoring();
    info!("Monitoring queues; press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                if let Ok(MonitorEvent::AlertRaised(alert)) = event {
                    print_json(&alert)?;
                }
            }
        }
    }

    monitor.stop_monitoring().await;
    Ok(())
}

#[derive(Debug, Serialize)]
struct QueueStatus {
    queue: String,
    counts: crate::queue::JobCounts,
    healthy: bool,
}

async fn run_status_command(redis_url: &str, args: StatusArgs) -> anyhow::Result<()> {
    let config = base_config(redis_url)?;

    let mut statuses = Vec::new();
    for queue in split_queues(&args.queues) {
        let broker = connect_broker(&config, &queue).await?;
        let counts = broker.counts().await?;
        let paused = broker.is_paused().await?;
        let ready = broker.is_ready().await;
        statuses.push(QueueStatus {
            queue,
            counts,
            healthy: !paused && ready,
        });
    }
    print_json(&statuses)
}

fn split_queues(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_schedule() {
        let cli = Cli::parse_from([
            "daybreak",
            "schedule",
            "--content-file",
            "batch.json",
            "--queue",
            "distribution",
        ]);
        match cli.command {
            Commands::Schedule(args) => {
                assert_eq!(args.content_file, PathBuf::from("batch.json"));
                assert_eq!(args.queue, "distribution");
            }
            _ => panic!("expected schedule command"),
        }
    }

    #[test]
    fn test_cli_parses_send_with_globals() {
        let cli = Cli::parse_from([
            "daybreak",
            "--redis-url",
            "redis://cache:6379",
            "send",
            "--content-file",
            "batch.json",
            "--advisor-id",
            "a-1",
            "--content-id",
            "c-1",
            "--phone-number",
            "+919876543210",
        ]);
        assert_eq!(cli.redis_url, "redis://cache:6379");
        match cli.command {
            Commands::Send(args) => {
                assert_eq!(args.advisor_id, "a-1");
                assert_eq!(args.content_id, "c-1");
            }
            _ => panic!("expected send command"),
        }
    }

    #[test]
    fn test_cli_work_defaults() {
        let cli = Cli::parse_from(["daybreak", "work"]);
        match cli.command {
            Commands::Work(args) => {
                assert_eq!(args.num_workers, 4);
                assert_eq!(args.queue, "distribution");
            }
            _ => panic!("expected work command"),
        }
    }

    #[test]
    fn test_split_queues() {
        assert_eq!(
            split_queues("distribution, batch ,retry"),
            vec!["distribution", "batch", "retry"]
        );
        assert!(split_queues("").is_empty());
    }
}
