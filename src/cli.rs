//! Recovery Core command line
//!
//! Inspection tools for operators: classify an error, preview the recovery
//! decision for an attempt, look at or clear a Phoenix snapshot, and print the
//! effective configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::sync::Arc;

use crate::classifier::{ErrorCategory, ErrorClassifier};
use crate::collaborators::MemoryStore;
use crate::config::{LogFormat, RecoveryConfig};
use crate::observability::telemetry::init_tracing;
use crate::snapshot::SnapshotManager;
use crate::strategy::{RecoveryAction, StrategyDecider};

#[derive(Parser)]
#[command(name = "recovery-core")]
#[command(about = "Fault recovery core: error classification, recovery decisions and Phoenix snapshots")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Log output format (overrides the config file)
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify an error message
    Classify {
        /// Error text
        error: String,
    },

    /// Show the recovery strategy for a failed attempt
    Decide {
        /// Error text
        error: String,

        /// 1-based attempt number
        #[arg(short, long, default_value_t = 1)]
        attempt: u32,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Inspect or remove the Phoenix recovery snapshot
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// Print the snapshot, if one exists
    Show {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Delete the snapshot
    Clear,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color || std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    let mut config = RecoveryConfig::load(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_tracing(&config.logging);

    match cli.command {
        Commands::Classify { error } => {
            let classifier = ErrorClassifier::new(&config.classifier);
            let category = classifier.classify(&error);
            println!("{}", paint_category(category));
        }
        Commands::Decide {
            error,
            attempt,
            json,
        } => {
            let classifier = Arc::new(ErrorClassifier::new(&config.classifier));
            let decider = StrategyDecider::new(config.strategy.clone(), classifier);
            let strategy = decider.decide(&error, attempt, None);
            if json {
                let text = serde_json::to_string_pretty(&strategy)
                    .context("Failed to serialize strategy")?;
                println!("{}", text);
            } else {
                println!("{:<14} {}", "Category:".dimmed(), paint_category(strategy.category));
                println!("{:<14} {}", "Action:".dimmed(), paint_action(strategy.action));
                println!("{:<14} {}s", "Backoff:".dimmed(), strategy.backoff);
                println!("{:<14} {}", "Max retries:".dimmed(), strategy.max_retries);
                println!("{:<14} {}", "Needs context:".dimmed(), strategy.context_needed);
                println!("{:<14} {}", "Reason:".dimmed(), strategy.reason);
            }
        }
        Commands::Snapshot { action } => {
            let manager = SnapshotManager::new(&config.snapshot, Arc::new(MemoryStore::new()));
            match action {
                SnapshotAction::Show { json } => match manager.load_snapshot() {
                    Some(snapshot) if json => {
                        let text = serde_json::to_string_pretty(&snapshot)
                            .context("Failed to serialize snapshot")?;
                        println!("{}", text);
                    }
                    Some(snapshot) => {
                        println!("{} {}", "Snapshot:".bold(), manager.path().display());
                        println!("  task_id:  {}", snapshot.task_id);
                        println!("  step_id:  {}", snapshot.step_id);
                        println!("  reason:   {}", snapshot.reason);
                        println!("  saved_at: {}", snapshot.timestamp.to_rfc3339());
                        println!(
                            "  state:    {} external, {} in-process",
                            snapshot.external_state.len(),
                            snapshot.running_state.len()
                        );
                    }
                    None => {
                        println!(
                            "{} {}",
                            "No recovery snapshot at".dimmed(),
                            manager.path().display()
                        );
                    }
                },
                SnapshotAction::Clear => {
                    if manager.clear_snapshot() {
                        println!("{} {}", "Cleared".green(), manager.path().display());
                    } else {
                        println!("{}", "Nothing to clear".dimmed());
                    }
                }
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

fn paint_category(category: ErrorCategory) -> colored::ColoredString {
    let name = category.as_str();
    match category {
        ErrorCategory::Transient => name.green(),
        ErrorCategory::Infrastructure => name.yellow(),
        ErrorCategory::Logic | ErrorCategory::State => name.magenta(),
        ErrorCategory::Permission | ErrorCategory::UserInput => name.cyan(),
        ErrorCategory::Verification => name.blue(),
        ErrorCategory::Unknown => name.red(),
    }
}

fn paint_action(action: RecoveryAction) -> colored::ColoredString {
    let name = action.to_string();
    match action {
        RecoveryAction::Retry | RecoveryAction::WaitAndRetry => name.green(),
        RecoveryAction::Heal | RecoveryAction::Restart => name.yellow(),
        RecoveryAction::AskUser | RecoveryAction::Escalate => name.red().bold(),
    }
}
