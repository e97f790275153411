//! restfeed CLI
//!
//! Command-line tools for inspecting restfeed server journals and consumer
//! checkpoints.
//!
//! # Commands
//!
//! - `inspect` - Display object state journal statistics
//! - `changes` - Print the change log of a journal
//! - `checkpoints` - List or reset consumer checkpoints

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// restfeed journal and checkpoint tools.
#[derive(Parser)]
#[command(name = "restfeed")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the journal or checkpoint file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display object state journal statistics
    Inspect {
        /// List live keys
        #[arg(short, long)]
        keys: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the change log of an object state journal
    Changes {
        /// Only show changes after this revision
        #[arg(short, long, default_value = "0")]
        since: u64,

        /// Maximum number of changes to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Manage consumer checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List stored checkpoints
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Remove checkpoints so the next follow starts from scratch
    Reset {
        /// Collection URL (all checkpoints if omitted)
        url: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { keys, format } => {
            let path = cli.path.ok_or("Journal path required for inspect")?;
            commands::inspect::run(&path, keys, &format)?;
        }
        Commands::Changes {
            since,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Journal path required for changes")?;
            commands::changes::run(&path, since, limit, &format)?;
        }
        Commands::Checkpoints { action } => {
            let path = cli.path.ok_or("Checkpoint file required for checkpoints")?;
            match action {
                CheckpointAction::List { format } => commands::checkpoints::list(&path, &format)?,
                CheckpointAction::Reset { url } => {
                    let removed = commands::checkpoints::reset(&path, url.as_deref())?;
                    println!("Removed {removed} checkpoint(s)");
                }
            }
        }
        Commands::Version => {
            println!("restfeed CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("restfeed protocol v{}", restfeed_protocol::VERSION);
        }
    }

    Ok(())
}
