//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::messages::AlertSeverity;

/// fleetctl - control plane for agent fleets
#[derive(Parser)]
#[command(
    name = "fleetctl",
    about = "Locks, messaging, elevation and rollback for agent fleets",
    version,
    after_help = "Logs are written to: ~/.local/share/fleetctl/logs/fleetctl.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Run a service that answers bus requests until interrupted
    Serve {
        /// Service name; requests are read from bus:{service}:requests
        #[arg(short, long, default_value = "fleetctl")]
        service: String,

        /// Seconds between heartbeats and expired grant sweeps
        #[arg(long, default_value = "10")]
        heartbeat_secs: u64,
    },

    /// Send a task request to a service and print the reply
    Request {
        /// Target service
        service: String,

        /// Task type, e.g. ping or echo
        task_type: String,

        /// JSON payload
        #[arg(short, long)]
        payload: Option<String>,

        /// Seconds to wait for the reply
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Priority 1 to 10
        #[arg(long, default_value = "5")]
        priority: u8,
    },

    /// Publish a system alert
    Publish {
        /// Alert title
        title: String,

        /// Alert body
        #[arg(short, long, default_value = "")]
        message: String,

        /// info, warning, error or critical
        #[arg(short, long, default_value = "info")]
        severity: AlertSeverity,

        /// Channel to publish on
        #[arg(long, default_value = crate::pubsub::channels::SYSTEM_ALERTS)]
        channel: String,
    },

    /// Show dead-lettered bus messages, newest first
    Dlq {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "20")]
        count: usize,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Inspect locks
    Lock {
        #[command(subcommand)]
        command: LockCommand,
    },

    /// Show an agent's last reported status
    Agent {
        /// Agent id
        agent_id: String,
    },

    /// Undo journaled file changes
    Rollback {
        #[command(subcommand)]
        command: RollbackCommand,
    },

    /// Reapply rolled back file changes
    Redo {
        #[command(subcommand)]
        command: RedoCommand,
    },
}

#[derive(Subcommand)]
pub enum LockCommand {
    /// Show whether a lock is held and for how long
    Status {
        /// Lock name (without the lock: prefix)
        name: String,
    },
}

#[derive(Subcommand)]
pub enum RollbackCommand {
    /// Summarize a plan's (or task's) journal
    Info {
        /// Plan id, or task id with --task
        id: String,

        /// Treat the id as a task id
        #[arg(long)]
        task: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Roll back every step of a plan
    Plan {
        plan_id: String,

        /// Report what would change without touching files
        #[arg(long)]
        dry_run: bool,
    },

    /// Roll back one step
    Step {
        plan_id: String,
        step_id: String,

        #[arg(long)]
        dry_run: bool,
    },

    /// Roll back a task
    Task {
        task_id: String,

        #[arg(long)]
        dry_run: bool,
    },

    /// Delete a plan's (or task's) journal
    Clear {
        id: String,

        #[arg(long)]
        task: bool,
    },
}

#[derive(Subcommand)]
pub enum RedoCommand {
    /// Redo every rolled back step of a plan
    Plan {
        plan_id: String,

        #[arg(long)]
        dry_run: bool,
    },

    /// Redo one step
    Step {
        plan_id: String,
        step_id: String,

        #[arg(long)]
        dry_run: bool,
    },

    /// Redo a task
    Task {
        task_id: String,

        #[arg(long)]
        dry_run: bool,
    },
}

/// Output format for inspection commands
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Log file location used by the binary
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fleetctl")
        .join("logs")
        .join("fleetctl.log")
}
