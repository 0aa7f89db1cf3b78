//! regsync CLI
//!
//! Command-line runner for registry sync jobs.
//!
//! # Commands
//!
//! - `validate` - Parse a job file and check every component resolves
//! - `run` - Run the jobs of a job file until interrupted
//! - `components` - List the built-in readers and writers

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Mirrors service registries and config centers.
#[derive(Parser)]
#[command(name = "regsync")]
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
    /// Parse a job file and check that every component resolves
    Validate {
        /// JSON file holding an array of jobs
        #[arg(short, long)]
        jobs: PathBuf,
    },

    /// Run the jobs of a job file until Ctrl-C
    Run {
        /// JSON file holding an array of jobs
        #[arg(short, long)]
        jobs: PathBuf,

        /// Default reconcile interval in milliseconds
        #[arg(long)]
        reconcile_interval_ms: Option<u64>,

        /// Worker pool size
        #[arg(long)]
        workers: Option<usize>,
    },

    /// List built-in components
    Components,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Validate { jobs } => {
            commands::validate::run(&jobs)?;
        }
        Commands::Run {
            jobs,
            reconcile_interval_ms,
            workers,
        } => {
            commands::run::run(&jobs, reconcile_interval_ms, workers)?;
        }
        Commands::Components => {
            let plugins = commands::builtin_plugins();
            println!("Readers: {}", plugins.reader_names().join(", "));
            println!("Writers: {}", plugins.writer_names().join(", "));
        }
        Commands::Version => {
            println!("regsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
