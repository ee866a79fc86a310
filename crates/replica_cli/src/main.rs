//! Replica CLI
//!
//! Command-line tools for inspecting and exercising master/slave replication.
//!
//! # Commands
//!
//! - `simulate` - Run the stale-slave resync scenario in-process
//! - `status` - Display the persisted replication state of a slave
//! - `list-databases` - List databases with their sizes
//! - `repair` - Rewrite one database's files

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Replica command-line tools.
#[derive(Parser)]
#[command(name = "replica")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
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
    /// Run the stale-slave resync scenario against an in-process master
    Simulate {
        /// Master log capacity in kilobytes
        #[arg(long, default_value = "1024")]
        oplog_size_kb: usize,

        /// Writes made while the slave is offline
        #[arg(short, long, default_value = "1000")]
        writes: u64,

        /// Payload bytes per written document
        #[arg(short, long, default_value = "2000")]
        doc_bytes: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Display the persisted replication state
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List databases and their sizes
    ListDatabases {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Repair one database
    Repair {
        /// Database to repair
        #[arg(long)]
        db: String,

        /// Keep a copy of the original files
        #[arg(short, long)]
        backup: bool,
    },

    /// Show version information
    Version,
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
        Commands::Simulate {
            oplog_size_kb,
            writes,
            doc_bytes,
            format,
        } => {
            let options = commands::simulate::SimulateOptions {
                oplog_size_kb,
                writes,
                doc_bytes,
            };
            commands::simulate::run(cli.path.as_deref(), &options, &format)?;
        }
        Commands::Status { format } => {
            let path = cli.path.ok_or("Data path required for status")?;
            commands::status::run(&path, &format)?;
        }
        Commands::ListDatabases { format } => {
            let path = cli.path.ok_or("Data path required for list-databases")?;
            commands::list_databases::run(&path, &format)?;
        }
        Commands::Repair { db, backup } => {
            let path = cli.path.ok_or("Data path required for repair")?;
            commands::repair::run(&path, &db, backup)?;
        }
        Commands::Version => {
            println!("Replica CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
