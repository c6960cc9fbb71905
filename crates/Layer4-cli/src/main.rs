//! Hive CLI - Main entry point

mod commands;
mod daemon;

use clap::{ArgGroup, Parser, Subcommand};
use hive_foundation::HiveConfig;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Hive - task orchestration for long-running agent work
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Load this config file instead of the global + project `hive.json`
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler loop and the cron scheduler until Ctrl-C
    Run,

    /// Manage tasks
    #[command(subcommand)]
    Task(TaskCommand),

    /// Manage cron jobs
    #[command(subcommand)]
    Cron(CronCommand),

    /// Send a signal to the running daemon
    #[command(subcommand)]
    Signal(SignalCommand),
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    /// Enqueue a new task
    Add {
        title: String,

        #[arg(short = 'm', long, default_value = "")]
        description: String,

        /// low, normal, high or critical
        #[arg(short, long, default_value = "normal")]
        priority: String,

        /// Chat thread the task's notifications belong to
        #[arg(long)]
        thread: Option<String>,

        /// Require plan approval before execution
        #[arg(long)]
        plan_approval: bool,
    },

    /// List tasks
    List {
        /// Only tasks with this status
        #[arg(short, long)]
        status: Option<String>,

        /// Print the raw JSON records
        #[arg(long)]
        json: bool,
    },

    /// Re-run a finished task with feedback
    Revise { id: String, feedback: String },

    /// Leave a message in a task's inbox
    Message { id: String, text: String },
}

#[derive(Subcommand, Debug)]
pub enum CronCommand {
    /// Add a cron job
    #[command(group(ArgGroup::new("schedule").required(true).args(["at", "every", "cron"])))]
    #[command(group(ArgGroup::new("payload").required(true).args(["task", "script"])))]
    Add {
        name: String,

        /// One-shot at an RFC 3339 timestamp
        #[arg(long)]
        at: Option<String>,

        /// Fixed interval, e.g. `90s`, `15m`, `2h`, `1d`
        #[arg(long)]
        every: Option<String>,

        /// 5-field cron expression
        #[arg(long)]
        cron: Option<String>,

        /// IANA timezone for `--cron` (default UTC)
        #[arg(long, requires = "cron")]
        tz: Option<String>,

        /// Enqueue a task with this title on every fire
        #[arg(long)]
        task: Option<String>,

        /// Task description
        #[arg(long, requires = "task", default_value = "")]
        description: String,

        /// Run this shell command inline on every fire
        #[arg(long)]
        script: Option<String>,

        /// Keep a one-shot job after it fires (disabled)
        #[arg(long)]
        keep: bool,

        /// Chat thread reused by every spawned task
        #[arg(long)]
        thread: Option<String>,
    },

    /// List cron jobs
    List {
        #[arg(long)]
        json: bool,
    },

    /// Remove a cron job and its history
    Remove { id: String },

    Enable { id: String },

    Disable { id: String },

    /// Fire a job now
    Run { id: String },

    /// Show a job's run history
    Runs {
        id: String,

        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum SignalCommand {
    /// Hard freeze: pause running tasks, start nothing new
    Freeze {
        /// Freeze only this task
        #[arg(long)]
        task: Option<String>,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Lift a freeze
    Resume {
        #[arg(long)]
        task: Option<String>,
    },

    /// Ask running tasks to checkpoint and stop for the day
    Rest,

    /// Ask a task to stop at a safe boundary and check in
    Align { id: String, message: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = match &args.config {
        Some(path) => HiveConfig::load_from(path)?,
        None => HiveConfig::load()?,
    };
    if let Some(dir) = args.data_dir {
        config = config.with_data_dir(dir);
    }

    match args.command {
        Command::Run => daemon::run(config).await,
        Command::Task(command) => commands::task(&config, command),
        Command::Cron(command) => commands::cron(&config, command).await,
        Command::Signal(command) => commands::signal(&config, command),
    }
}
