use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ensemble_core::config::AppConfig;
use ensemble_core::event::EventBus;
use ensemble_core::run::Run;
use ensemble_core::schedule::Schedule;
use ensemble_core::traits::RunStore;
use ensemble_core::types::{RunId, SessionId};

use ensemble_engine::{HttpTrigger, NewSchedule, RunLogger, ScheduleManager, SchedulePoller};
use ensemble_store::SqliteStore;

#[derive(Parser)]
#[command(name = "ensemble", version, about = "Workflow, team and schedule runtime")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "ensemble.toml", env = "ENSEMBLE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll for due schedules and fire them until interrupted
    Scheduler,
    /// Manage cron schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Inspect stored runs
    Run {
        #[command(subcommand)]
        action: RunAction,
    },
    /// Show the effective configuration
    Config,
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Create a schedule
    Create {
        /// Schedule name
        #[arg(long)]
        name: String,
        /// Cron expression, 5 or 6 fields (e.g. "0 9 * * 1-5")
        #[arg(long)]
        cron: String,
        /// Endpoint the trigger posts to
        #[arg(long)]
        endpoint: String,
        /// `UTC`, a fixed offset such as +05:30, or a zone name such as Europe/Berlin
        #[arg(long, default_value = "UTC")]
        timezone: String,
        /// JSON payload sent with every firing
        #[arg(long)]
        payload: Option<String>,
        /// Extra attempts when a firing fails
        #[arg(long, default_value = "0")]
        max_retries: u32,
        /// Seconds between attempts
        #[arg(long, default_value = "60")]
        retry_delay: u64,
    },
    /// List schedules
    List,
    /// Enable a schedule and recompute its next run
    Enable { id: String },
    /// Disable a schedule
    Disable { id: String },
    /// Delete a schedule
    Delete { id: String },
    /// Show a schedule's firing history
    Runs { id: String },
}

#[derive(Subcommand)]
enum RunAction {
    /// Print a run snapshot as JSON
    Show { run_id: String },
    /// List the runs of a session
    List {
        #[arg(long)]
        session: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ensemble=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
        AppConfig::default()
    };

    if let Commands::Config = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let db_path = config.store_path();
    let store = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("opening store at {}", db_path.display()))?,
    );

    match cli.command {
        Commands::Scheduler => run_scheduler(&config, store).await?,
        Commands::Schedule { action } => schedule_command(action, store).await?,
        Commands::Run { action } => run_command(action, store).await?,
        Commands::Config => {}
    }

    Ok(())
}

async fn run_scheduler(config: &AppConfig, store: Arc<SqliteStore>) -> anyhow::Result<()> {
    if !config.scheduler.enabled {
        warn!("Scheduler disabled in config, nothing to do");
        return Ok(());
    }

    let cancel = tokio_util::sync::CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down scheduler...");
        cancel_clone.cancel();
    });

    let event_bus = Arc::new(EventBus::default());
    if let (Some(log_dir), Some(log)) = (config.log_dir(), config.log.as_ref()) {
        let logger = RunLogger::new(log_dir, log.level);
        let bus = event_bus.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { logger.run(bus, cancel).await });
    }

    let trigger = Arc::new(HttpTrigger::from_config(&config.scheduler)?);
    let poller = SchedulePoller::new(&config.scheduler, store, trigger, event_bus, cancel);
    info!(
        poller_id = %poller.poller_id(),
        base_url = %config.scheduler.base_url,
        "Scheduler starting"
    );
    poller.run().await;
    Ok(())
}

async fn schedule_command(action: ScheduleAction, store: Arc<SqliteStore>) -> anyhow::Result<()> {
    let manager = ScheduleManager::new(store);
    match action {
        ScheduleAction::Create {
            name,
            cron,
            endpoint,
            timezone,
            payload,
            max_retries,
            retry_delay,
        } => {
            let payload = match payload {
                Some(raw) => serde_json::from_str(&raw).context("--payload must be JSON")?,
                None => serde_json::Value::Null,
            };
            let schedule = manager
                .create(
                    NewSchedule::new(name, cron, endpoint)
                        .with_timezone(timezone)
                        .with_payload(payload)
                        .with_retries(max_retries, retry_delay),
                )
                .await?;
            println!("Created schedule {}", schedule.id);
            print_schedule(&schedule);
        }
        ScheduleAction::List => {
            let schedules = manager.list().await?;
            if schedules.is_empty() {
                println!("No schedules.");
            }
            for schedule in &schedules {
                print_schedule(schedule);
            }
        }
        ScheduleAction::Enable { id } => {
            let schedule = manager.enable(&id).await?;
            print_schedule(&schedule);
        }
        ScheduleAction::Disable { id } => {
            let schedule = manager.disable(&id).await?;
            print_schedule(&schedule);
        }
        ScheduleAction::Delete { id } => {
            manager.delete(&id).await?;
            println!("Deleted schedule {}", id);
        }
        ScheduleAction::Runs { id } => {
            let runs = manager.list_schedule_runs(&id).await?;
            if runs.is_empty() {
                println!("No firings recorded.");
            }
            for run in &runs {
                println!(
                    "  {}  attempt {:<2} {:<8} run={}{}",
                    run.triggered_at.format("%Y-%m-%d %H:%M:%S"),
                    run.attempt,
                    run.status,
                    run.run_id.as_deref().unwrap_or("-"),
                    run.error
                        .as_deref()
                        .map(|e| format!("  error: {}", e))
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

fn print_schedule(schedule: &Schedule) {
    let next = schedule
        .next_run_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  {}  {:<20} {:<16} {:<8} {:<9} next: {}  -> {}",
        schedule.id,
        schedule.name,
        schedule.cron_expr,
        schedule.timezone,
        if schedule.enabled { "enabled" } else { "disabled" },
        next,
        schedule.endpoint
    );
}

async fn run_command(action: RunAction, store: Arc<SqliteStore>) -> anyhow::Result<()> {
    match action {
        RunAction::Show { run_id } => {
            let run = store
                .load_run(&RunId::from_str(&run_id))
                .await?
                .with_context(|| format!("run {} not found", run_id))?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        RunAction::List { session } => {
            let runs = store.list_runs(&SessionId::from_str(&session)).await?;
            if runs.is_empty() {
                println!("No runs for session {}.", session);
            }
            for run in &runs {
                print_run(run);
            }
        }
    }
    Ok(())
}

fn print_run(run: &Run) {
    println!(
        "  {}  {:<20} {:<10} steps={:<3} pending={:<2} {}",
        run.run_id,
        run.target,
        run.state,
        run.step_outputs.len(),
        run.pending_requirements.len(),
        run.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
}
