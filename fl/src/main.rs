//! fleetctl - agent fleet control plane
//!
//! CLI entry point for serving a bus endpoint and inspecting or repairing
//! fleet state.

use std::fs;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use fleetctl::cli::{Cli, Command, LockCommand, OutputFormat, RedoCommand, RollbackCommand, get_log_path};
use fleetctl::config::Config;
use fleetctl::messages::{AgentState, AlertSeverity, Message, MessageKind, SystemAlert, TaskRequest, TaskStatus};
use fleetctl::pubsub::{Delivery, channels, handler};
use fleetctl::rollback::{FileAction, RollbackInfo, RollbackResult};
use fleetctl::runtime::ControlPlane;
use fleetctl::service::{BUILTIN_TASK_TYPES, register_builtin_handlers};

/// Send tracing output to the shared log file so it never mixes with command output
fn setup_logging(verbose: bool) -> Result<()> {
    let log_path = get_log_path();
    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    // Several fleetctl processes share one file
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open {}", log_path.display()))?;

    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(filter)
        .init();

    info!(verbose, pid = std::process::id(), "fleetctl logging to {}", log_path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose).context("Failed to setup logging")?;

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(
        "fleetctl loaded config: backend={:?}, store={}",
        config.store.backend,
        config.store.path.display()
    );

    // Dispatch command
    match cli.command {
        Some(Command::Serve {
            service,
            heartbeat_secs,
        }) => cmd_serve(config, &service, heartbeat_secs).await,
        Some(Command::Request {
            service,
            task_type,
            payload,
            timeout,
            priority,
        }) => cmd_request(config, &service, &task_type, payload.as_deref(), timeout, priority).await,
        Some(Command::Publish {
            title,
            message,
            severity,
            channel,
        }) => cmd_publish(config, &channel, severity, &title, &message).await,
        Some(Command::Dlq { count, format }) => cmd_dlq(config, count, format).await,
        Some(Command::Lock { command }) => match command {
            LockCommand::Status { name } => cmd_lock_status(config, &name).await,
        },
        Some(Command::Agent { agent_id }) => cmd_agent(config, &agent_id).await,
        Some(Command::Rollback { command }) => cmd_rollback(config, command).await,
        Some(Command::Redo { command }) => cmd_redo(config, command).await,
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Control plane for one-shot commands, under a throwaway service name
async fn cli_plane(config: Config) -> Result<ControlPlane> {
    let id = uuid::Uuid::now_v7().simple().to_string();
    ControlPlane::new(config, format!("fleetctl-cli-{}", &id[id.len() - 8..])).await
}

/// Answer bus requests until SIGINT/SIGTERM
async fn cmd_serve(config: Config, service: &str, heartbeat_secs: u64) -> Result<()> {
    let plane = ControlPlane::new(config, service).await?;
    register_builtin_handlers(plane.bus()).await;
    plane
        .pubsub()
        .subscribe(
            channels::SYSTEM_ALERTS,
            handler(|delivery: Delivery| async move {
                if let MessageKind::SystemAlert(alert) = &delivery.message.kind {
                    info!(severity = ?alert.severity, title = %alert.title, source = %delivery.message.source, "System alert");
                }
                Ok(())
            }),
            false,
        )
        .await?;
    plane.start().await?;

    let capabilities = BUILTIN_TASK_TYPES.iter().map(|s| s.to_string()).collect();
    plane
        .agents()
        .update_status(service, AgentState::Idle, None, capabilities)
        .await?;

    println!(
        "{} serving as {} (tasks: {})",
        "fleetctl".green().bold(),
        service.cyan(),
        BUILTIN_TASK_TYPES.join(", ")
    );
    info!(%service, "Serving. Press Ctrl+C to stop.");

    let mut ticker = tokio::time::interval(Duration::from_secs(heartbeat_secs.max(1)));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                _ = ticker.tick() => tick(&plane, service).await,
                _ = sigint.recv() => {
                    warn!("SIGINT received");
                    break;
                }
                _ = sigterm.recv() => {
                    warn!("SIGTERM received");
                    break;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        loop {
            tokio::select! {
                _ = ticker.tick() => tick(&plane, service).await,
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    info!("Service shutting down...");
    if let Err(e) = plane
        .agents()
        .update_status(service, AgentState::Offline, None, Vec::new())
        .await
    {
        warn!(error = %e, "Failed to report offline status");
    }
    plane.stop().await;
    Ok(())
}

async fn tick(plane: &ControlPlane, service: &str) {
    if let Err(e) = plane.agents().heartbeat(service).await {
        warn!(error = %e, "Heartbeat failed");
    }
    plane.elevation().cleanup_expired().await;
}

async fn cmd_request(
    config: Config,
    service: &str,
    task_type: &str,
    payload: Option<&str>,
    timeout: Option<u64>,
    priority: u8,
) -> Result<()> {
    let payload: Value = match payload {
        Some(raw) => serde_json::from_str(raw).context("Invalid JSON payload")?,
        None => Value::Null,
    };
    let plane = cli_plane(config).await?;
    plane.start().await?;

    let request = Message::new(
        plane.service(),
        MessageKind::TaskRequest(TaskRequest::new(task_type, payload).with_priority(priority)),
    );
    let reply = plane
        .bus()
        .send_request(service, request, timeout.map(Duration::from_secs))
        .await;
    plane.stop().await;
    let reply = reply.context(format!("No reply from {}", service))?;

    match reply.kind {
        MessageKind::TaskResponse(response) => {
            let status = match response.status {
                TaskStatus::Completed => response.status.to_string().green(),
                TaskStatus::Failed | TaskStatus::Cancelled => response.status.to_string().red(),
                _ => response.status.to_string().yellow(),
            };
            println!("{} {} from {}", "Status:".bold(), status, reply.source.cyan());
            if let Some(result) = &response.result {
                println!("{}", serde_json::to_string_pretty(result)?);
            }
            if let Some(error) = &response.error {
                println!("{} {}", "Error:".red().bold(), error);
            }
            if response.status == TaskStatus::Failed {
                return Err(eyre::eyre!("Task {} failed", response.task_id));
            }
            Ok(())
        }
        other => {
            println!("{}", serde_json::to_string_pretty(&other)?);
            Ok(())
        }
    }
}

async fn cmd_publish(config: Config, channel: &str, severity: AlertSeverity, title: &str, body: &str) -> Result<()> {
    let plane = cli_plane(config).await?;
    let message = Message::new(
        "fleetctl",
        MessageKind::SystemAlert(SystemAlert {
            severity,
            title: title.to_string(),
            message: body.to_string(),
        }),
    );
    let delivered = plane.pubsub().publish(channel, &message).await?;
    println!("Published to {} ({} subscribers)", channel.cyan(), delivered);
    Ok(())
}

async fn cmd_dlq(config: Config, count: usize, format: OutputFormat) -> Result<()> {
    let plane = cli_plane(config).await?;
    let letters = plane.bus().dead_letters(count).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&letters)?),
        OutputFormat::Text => {
            if letters.is_empty() {
                println!("Dead-letter stream is empty");
                return Ok(());
            }
            for letter in &letters {
                println!(
                    "{} {} {}",
                    letter.failed_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                    letter.stream.cyan(),
                    letter.entry_id
                );
                println!("  {} {}", "error:".red(), letter.error);
                println!("  {} {}", "payload:".dimmed(), letter.payload);
            }
        }
    }
    Ok(())
}

async fn cmd_lock_status(config: Config, name: &str) -> Result<()> {
    let plane = cli_plane(config).await?;
    if plane.locks().is_locked(name).await? {
        let ttl = plane.locks().remaining_ttl(name).await?;
        match ttl {
            Some(ttl) => println!("{} {} (expires in {:.1}s)", name, "locked".red(), ttl.as_secs_f64()),
            None => println!("{} {} (no expiry)", name, "locked".red()),
        }
    } else {
        println!("{} {}", name, "free".green());
    }
    Ok(())
}

async fn cmd_agent(config: Config, agent_id: &str) -> Result<()> {
    let plane = cli_plane(config).await?;
    match plane.agents().get_status(agent_id).await? {
        Some(record) => {
            println!("{} {}", "Agent:".bold(), record.agent_id);
            println!("{} {}", "Status:".bold(), record.status);
            if let Some(task) = &record.current_task {
                println!("{} {}", "Task:".bold(), task);
            }
            if let Some(at) = record.last_heartbeat {
                println!("{} {}", "Last heartbeat:".bold(), at.to_rfc3339());
            }
        }
        None => println!("No status recorded for {}", agent_id),
    }
    Ok(())
}

async fn cmd_rollback(config: Config, command: RollbackCommand) -> Result<()> {
    let plane = cli_plane(config).await?;
    let journal = plane.journal();
    match command {
        RollbackCommand::Info { id, task, format } => {
            let info = if task {
                journal.get_task_rollback_info(&id).await?
            } else {
                journal.get_rollback_info(&id).await?
            };
            match info {
                Some(info) => print_info(&info, &format),
                None => {
                    println!("No rollback data for {}", id);
                    Ok(())
                }
            }
        }
        RollbackCommand::Plan { plan_id, dry_run } => report("Rollback", &journal.rollback_plan(&plan_id, dry_run).await),
        RollbackCommand::Step {
            plan_id,
            step_id,
            dry_run,
        } => report("Rollback", &journal.rollback_step(&plan_id, &step_id, dry_run).await),
        RollbackCommand::Task { task_id, dry_run } => report("Rollback", &journal.rollback_task(&task_id, dry_run).await),
        RollbackCommand::Clear { id, task } => {
            let cleared = if task {
                journal.clear_task_rollback_data(&id).await?
            } else {
                journal.clear_rollback_data(&id).await?
            };
            if cleared {
                println!("Cleared rollback data for {}", id);
            } else {
                println!("No rollback data for {}", id);
            }
            Ok(())
        }
    }
}

async fn cmd_redo(config: Config, command: RedoCommand) -> Result<()> {
    let plane = cli_plane(config).await?;
    let journal = plane.journal();
    let result = match command {
        RedoCommand::Plan { plan_id, dry_run } => journal.redo_plan(&plan_id, dry_run).await,
        RedoCommand::Step {
            plan_id,
            step_id,
            dry_run,
        } => journal.redo_step(&plan_id, &step_id, dry_run).await,
        RedoCommand::Task { task_id, dry_run } => journal.redo_task(&task_id, dry_run).await,
    };
    report("Redo", &result)
}

fn print_info(info: &RollbackInfo, format: &OutputFormat) -> Result<()> {
    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string_pretty(info)?);
        return Ok(());
    }
    println!("{} {}", "Journal:".bold(), info.id);
    println!("{} {}", "Created:".bold(), info.created_at.to_rfc3339());
    println!(
        "{} {} ({} rolled back)",
        "Files:".bold(),
        info.total_files,
        info.rolled_back_files
    );
    for step in &info.steps {
        let state = if step.completed { "done".green() } else { "open".yellow() };
        println!("  {} [{}] {}", step.step_id.cyan(), state, step.step_title);
        for file in &step.files {
            println!("    {}", file);
        }
    }
    println!(
        "{} rollback={} redo={}",
        "Available:".bold(),
        info.can_rollback,
        info.can_redo
    );
    Ok(())
}

fn report(verb: &str, result: &RollbackResult) -> Result<()> {
    if let Some(error) = &result.error {
        println!("{} {}", format!("{} failed:", verb).red().bold(), error);
        return Err(eyre::eyre!("{} failed: {}", verb, error));
    }
    let heading = if result.dry_run {
        format!("{} (dry run)", verb)
    } else {
        verb.to_string()
    };
    println!("{}", heading.bold());
    for action in &result.actions {
        let label = match action.action {
            FileAction::Restore => "restore".yellow(),
            FileAction::Delete => "delete".red(),
            FileAction::Recreate => "recreate".green(),
        };
        println!("  {:>8} {}", label, action.path);
    }
    for error in &result.errors {
        println!("  {:>8} {}: {}", "error".red().bold(), error.path, error.error);
    }
    if result.success {
        println!("{} {} file(s)", "OK".green().bold(), result.actions.len());
        Ok(())
    } else {
        Err(eyre::eyre!("{} finished with {} error(s)", verb, result.errors.len()))
    }
}
