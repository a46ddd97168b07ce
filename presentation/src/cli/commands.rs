//! CLI command definitions

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Streamed answer with status lines and a closing summary
    Full,
    /// Only the answer text, suitable for piping
    Answer,
    /// JSON object with the answer and its metadata
    Json,
}

/// CLI arguments for techsage
#[derive(Parser, Debug)]
#[command(name = "techsage")]
#[command(author, version, about = "Ask questions about a codebase through pooled backend agents")]
#[command(long_about = r#"
Techsage answers questions about locally cloned source repositories. Each
configured technology is served by backend agent processes that are spawned
on demand, pooled, and reused across questions.

Configuration files are loaded from (in priority order):
1. --config <path>     Explicit config file
2. ./techsage.toml     Project-level config (also .techsage.toml)
3. ~/.config/techsage/config.toml   Global config
4. TECHSAGE_* environment variables override everything

Example:
  techsage ask react "How does reconciliation work?"
  techsage ask tokio "What does spawn_blocking do?" --output answer
  techsage chat react
  techsage list
"#)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v = info, -vv = debug, -vvv = trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress the spinner, status lines, and summary
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Disable loading of configuration files
    #[arg(long, global = true)]
    pub no_config: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ask a single question about a technology
    Ask {
        /// Technology to query (see `techsage list`)
        technology: String,

        /// The question to ask
        question: String,

        /// Skip the answer cache for this run
        #[arg(long)]
        no_cache: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "full")]
        output: OutputFormat,
    },

    /// List the configured technologies
    List,

    /// Interactive chat against one technology
    Chat {
        /// Technology to chat about
        technology: String,
    },

    /// Show service metrics for this process
    Metrics,
}
