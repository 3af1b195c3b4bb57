//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod config_cmd;
mod exec;
mod run;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use queue_worker::config::{load_settings_with_options, LoadOptions};

#[derive(Parser)]
#[command(name = "queue-worker")]
#[command(about = "Queue-driven job worker")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Resolve relative paths from current working directory instead of config file location
    #[arg(long, global = true)]
    cwd: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to the broker and process jobs until interrupted
    Run {
        /// Queue to consume (overrides config and QUEUE_NAME)
        #[arg(short, long)]
        queue: Option<String>,
        /// Number of jobs to process at once
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },

    /// Run the pipeline for the given job identities without a broker
    Exec {
        /// Job identities (file names) to process
        #[arg(required = true)]
        identities: Vec<String>,
        /// Number of jobs to process at once
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the resolved settings as JSON
    Show,
    /// Verify the configured commands can be found
    Check,
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
        use_cwd: cli.cwd,
    };
    let (mut settings, config) = load_settings_with_options(options)
        .await
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Run { queue, concurrency } => {
            if let Some(queue) = queue {
                settings.queue_name = queue;
            }
            if let Some(concurrency) = concurrency {
                settings.concurrency = concurrency.max(1);
            }
            run::cmd_run(&settings).await
        }
        Commands::Exec {
            identities,
            concurrency,
        } => {
            if let Some(concurrency) = concurrency {
                settings.concurrency = concurrency.max(1);
            }
            exec::cmd_exec(&settings, &identities).await
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => config_cmd::cmd_config_show(&settings, &config),
            ConfigCommands::Check => config_cmd::cmd_config_check(&settings),
        },
    }
}
