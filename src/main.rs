//! massdispatch - Throttled batch messaging through an external delivery agent
//!
//! Command-line front end: runs a batch with live progress, checks that the
//! agent is ready, and prints the effective configuration.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use massdispatch::{
    agent::AgentBridge,
    batch::{Attachment, MessageId, SenderIdentity},
    config::DispatchConfig,
    dispatcher::{Dispatcher, Outcome},
    progress::EventLogEntry,
    report, ProcessAgent, Recipient, SendRequest, SimulatedAgent,
};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "massdispatch")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Throttled batch messaging through an external delivery agent")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MASSDISPATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message per recipient
    Send {
        /// JSON file with an array of {name?, company?, email?, phone}
        #[arg(short, long)]
        recipients: PathBuf,

        /// Message template, e.g. "Hola {name}, de {company}"
        #[arg(
            short,
            long,
            conflicts_with = "template_file",
            required_unless_present = "template_file"
        )]
        template: Option<String>,

        /// Read the message template from a file
        #[arg(long)]
        template_file: Option<PathBuf>,

        /// File to attach to every message (repeatable)
        #[arg(short, long)]
        attach: Vec<PathBuf>,

        /// Only send to the first few recipients
        #[arg(long)]
        dry_run: bool,

        /// Use the built-in simulated agent instead of the real one
        #[arg(long)]
        simulate: bool,

        /// Name the batch is sent on behalf of
        #[arg(long)]
        sender_name: Option<String>,

        /// Where to write the delivery report
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },

    /// Check that the agent is installed and its session is active
    Doctor {
        /// Check the simulated agent instead
        #[arg(long)]
        simulate: bool,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("massdispatch={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    let config = match &cli.config {
        Some(path) => DispatchConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => DispatchConfig::default(),
    };

    match cli.command {
        Commands::Send {
            recipients,
            template,
            template_file,
            attach,
            dry_run,
            simulate,
            sender_name,
            report_dir,
        } => {
            let template = match (template, template_file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read template {}", path.display()))?,
                (None, None) => bail!("Either --template or --template-file is required"),
            };
            let request = SendRequest {
                template,
                attachments: load_attachments(&attach)?,
                recipients: load_recipients(&recipients)?,
                throttle: None,
                dry_run,
                sender: SenderIdentity {
                    name: sender_name.unwrap_or_default(),
                    email: None,
                },
            };
            let report_dir = report_dir.unwrap_or_else(|| config.report.dir.clone());
            run_send(&config, bridge(&config, simulate), request, &report_dir).await?;
        }
        Commands::Doctor { simulate } => {
            run_doctor(&cli.config, bridge(&config, simulate)).await?;
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

fn bridge(config: &DispatchConfig, simulate: bool) -> Arc<dyn AgentBridge> {
    if simulate {
        Arc::new(SimulatedAgent::new())
    } else {
        Arc::new(ProcessAgent::new(config.agent.clone()))
    }
}

fn load_recipients(path: &Path) -> Result<Vec<Recipient>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read recipients from {}", path.display()))?;
    let recipients: Vec<Recipient> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON array of recipients", path.display()))?;
    Ok(recipients)
}

fn load_attachments(paths: &[PathBuf]) -> Result<Vec<Attachment>> {
    paths
        .iter()
        .map(|path| {
            Attachment::from_path(path)
                .with_context(|| format!("Failed to read attachment {}", path.display()))
        })
        .collect()
}

/// Keyboard control
#[derive(Debug, Clone, Copy)]
enum Control {
    PauseResume,
    Cancel,
}

/// Read controls on a plain thread so a pending stdin read never holds up
/// runtime shutdown.
fn spawn_stdin_controls() -> mpsc::Receiver<Control> {
    let (tx, rx) = mpsc::channel(8);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            let control = match line.trim() {
                "p" | "P" => Control::PauseResume,
                "c" | "C" => Control::Cancel,
                "" => continue,
                other => {
                    eprintln!("Unknown command {:?}; use 'p' to pause/resume, 'c' to cancel", other);
                    continue;
                }
            };
            if tx.blocking_send(control).is_err() {
                break;
            }
        }
    });
    rx
}

async fn run_send(
    config: &DispatchConfig,
    bridge: Arc<dyn AgentBridge>,
    request: SendRequest,
    report_dir: &Path,
) -> Result<()> {
    let dispatcher = Dispatcher::from_config(bridge, config);
    let mut progress_rx = dispatcher.watch_progress();

    let started = dispatcher
        .send_messages(request)
        .await
        .context("Batch not started")?;
    println!("📨 Sending {} message(s)", started.total);
    println!("   Type 'p' + Enter to pause/resume, 'c' + Enter to cancel");
    println!();

    let mut controls = spawn_stdin_controls();
    let mut last_printed: Option<MessageId> = None;

    loop {
        tokio::select! {
            changed = progress_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let progress = *progress_rx.borrow_and_update();
                print_new_entries(&dispatcher.event_log().await, &mut last_printed);
                println!("   {}", progress);
                if !progress.is_active {
                    break;
                }
            }
            Some(control) = controls.recv() => match control {
                Control::PauseResume => match dispatcher.pause_resume().await {
                    Ok(Some(p)) if p.is_paused => println!("⏸  Paused"),
                    Ok(Some(_)) => println!("▶  Resumed"),
                    Ok(None) => {}
                    Err(e) => eprintln!("✗ {}", e),
                },
                Control::Cancel => {
                    dispatcher.cancel_send().await;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted; cancelling batch");
                dispatcher.cancel_send().await;
            }
        }
    }

    let final_progress = dispatcher.progress();
    let outcome = dispatcher.outcome().await;
    println!();
    match outcome {
        Some(Outcome::Completed) => println!("✓ Batch completed: {}", final_progress),
        Some(Outcome::Cancelled) => println!("■ Batch cancelled: {}", final_progress),
        Some(Outcome::Stalled) => println!("✗ Agent stopped responding: {}", final_progress),
        None => println!("Batch ended: {}", final_progress),
    }

    match dispatcher.download_report().await {
        Some(report) => {
            let path = report::write_to_dir(report_dir, &report).await?;
            println!("📄 Report: {}", path.display());
        }
        None => println!("No deliveries recorded; no report written"),
    }

    if outcome == Some(Outcome::Stalled) {
        bail!("The agent stopped reporting progress");
    }
    Ok(())
}

/// Print log entries newer than `last_printed`, oldest first.
fn print_new_entries(entries: &[EventLogEntry], last_printed: &mut Option<MessageId>) {
    let fresh: Vec<&EventLogEntry> = entries
        .iter()
        .take_while(|e| Some(e.id) != *last_printed)
        .collect();
    for entry in fresh.iter().rev() {
        match &entry.error {
            Some(error) => println!("  ✗ {} ({}): {}", entry.recipient_label, entry.address, error),
            None => println!("  ✓ {} ({})", entry.recipient_label, entry.address),
        }
    }
    if let Some(newest) = entries.first() {
        *last_printed = Some(newest.id);
    }
}

async fn run_doctor(config_path: &Option<PathBuf>, bridge: Arc<dyn AgentBridge>) -> Result<()> {
    println!("🔍 massdispatch Doctor");
    println!();

    println!("Checking messaging agent...");
    let presence = bridge.detect_agent().await;
    let session_ok = if presence.available {
        println!(
            "  ✓ Agent available (version {})",
            presence.version.as_deref().unwrap_or("unknown")
        );
        let active = bridge.check_session_active().await;
        if active {
            println!("  ✓ Messaging session is authenticated");
        } else {
            println!("  ✗ Messaging session is not authenticated");
        }
        active
    } else {
        println!("  ✗ Agent not available");
        false
    };

    println!();
    println!("Checking configuration...");
    match config_path {
        Some(path) if path.exists() => {
            println!("  ✓ Configuration file found: {}", path.display())
        }
        Some(path) => println!("  ✗ Configuration file missing: {}", path.display()),
        None => println!("  ℹ No configuration file given (using defaults)"),
    }

    println!();
    if session_ok {
        println!("Doctor check complete!");
        Ok(())
    } else {
        bail!("The agent is not ready to send")
    }
}

fn show_config(config: Option<&DispatchConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
