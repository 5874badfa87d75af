//! Vellum CLI
//!
//! Command-line tools for Vellum data directories.
//!
//! # Commands
//!
//! - `inspect` - Display manifest, WAL and collection statistics
//! - `verify` - Check WAL and datafile integrity
//! - `dump-wal` - Dump WAL entries for debugging
//! - `recalc-count` - Recount documents and fix stored counts
//! - `compact` - Rewrite datafiles without dead records
//! - `cleanup` - Reclaim dropped databases and collections

mod commands;

use clap::{Parser, Subcommand};
use commands::Format;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Vellum command-line tools.
#[derive(Parser)]
#[command(name = "vellum")]
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
    /// Display manifest, WAL and collection statistics
    Inspect {
        /// Show per-collection details
        #[arg(short, long)]
        collections: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Check WAL and datafile integrity
    Verify {
        /// Check the WAL
        #[arg(short, long)]
        wal: bool,

        /// Check datafiles
        #[arg(short, long)]
        datafiles: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Dump WAL entries for debugging
    DumpWal {
        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Entries to skip first
        #[arg(short, long, default_value = "0")]
        skip: usize,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Recount documents and fix stored counts
    RecalcCount {
        /// Database (all if omitted)
        #[arg(short, long)]
        database: Option<String>,

        /// Collection (all if omitted)
        #[arg(short, long)]
        collection: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Rewrite datafiles without dead records
    Compact {
        /// Dead-record ratio above which a datafile is rewritten
        #[arg(short, long, default_value = "0.0")]
        threshold: f64,

        /// Dry run - show what would be done
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Reclaim dropped databases and collections
    Cleanup {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect {
            collections,
            format,
        } => {
            let path = cli.path.ok_or("data directory path required for inspect")?;
            commands::inspect::run(&path, collections, format)?;
        }
        Commands::Verify {
            wal,
            datafiles,
            format,
        } => {
            let path = cli.path.ok_or("data directory path required for verify")?;
            let all = !wal && !datafiles;
            commands::verify::run(&path, wal || all, datafiles || all, format)?;
        }
        Commands::DumpWal {
            limit,
            skip,
            format,
        } => {
            let path = cli.path.ok_or("data directory path required for dump-wal")?;
            commands::dump_wal::run(&path, limit, skip, format)?;
        }
        Commands::RecalcCount {
            database,
            collection,
            format,
        } => {
            let path = cli.path.ok_or("data directory path required for recalc-count")?;
            commands::recalc_count::run(&path, database.as_deref(), collection.as_deref(), format)?;
        }
        Commands::Compact {
            threshold,
            dry_run,
            format,
        } => {
            let path = cli.path.ok_or("data directory path required for compact")?;
            commands::compact::run(&path, threshold, dry_run, format)?;
        }
        Commands::Cleanup { format } => {
            let path = cli.path.ok_or("data directory path required for cleanup")?;
            commands::cleanup::run(&path, format)?;
        }
        Commands::Version => {
            println!("Vellum CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Vellum Core v{}", vellum_core::VERSION);
        }
    }

    Ok(())
}
