//! ncsync CLI
//!
//! Command-line tools for the ncsync slot synchronization engine.
//!
//! # Commands
//!
//! - `simulate` - Run an in-process cluster and report how it converged
//! - `report` - Summarize a session report file
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// ncsync command-line tools.
#[derive(Parser)]
#[command(name = "ncsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process cluster over the loopback transport
    Simulate {
        /// Cluster description (JSON)
        config: PathBuf,

        /// How long to let the cluster sync, in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Summarize a session report file
    Report {
        /// Report file written by a node
        file: PathBuf,

        /// Only include sessions on this slot
        #[arg(short, long)]
        slot: Option<u16>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            config,
            duration,
            format,
        } => {
            commands::simulate::run(&config, duration, &format)?;
        }
        Commands::Report { file, slot, format } => {
            commands::report::run(&file, slot, &format)?;
        }
        Commands::Version => {
            println!("ncsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
