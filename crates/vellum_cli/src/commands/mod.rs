//! CLI command implementations.

pub mod cleanup;
pub mod compact;
pub mod dump_wal;
pub mod inspect;
pub mod recalc_count;
pub mod verify;

use clap::ValueEnum;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use vellum_core::dir::DataDir;
use vellum_core::{CatalogService, Config, NoFaults};

/// Boxed error type shared by every command.
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// Human-readable text.
    #[default]
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Opens a data directory without starting an engine. Takes the directory
/// lock, so it fails while a server is running on it.
pub fn open_dir(path: &Path) -> CliResult<DataDir> {
    if !path.join("MANIFEST").exists() && !path.join("wal.log").exists() {
        return Err(format!("no data directory found at {}", path.display()).into());
    }
    Ok(DataDir::open_path(path, false, Arc::new(NoFaults))?)
}

/// Opens the engine, running recovery. The background collector stays off.
pub fn open_engine(path: &Path, config: Config) -> CliResult<CatalogService> {
    let config = config.create_if_missing(false).background_collector(false);
    Ok(CatalogService::open(path, config)?)
}

/// Prints `value` as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Formats a byte count.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
