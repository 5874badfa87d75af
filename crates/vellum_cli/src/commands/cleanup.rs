//! Cleanup command implementation.

use super::{open_engine, print_json, CliResult, Format};
use serde::Serialize;
use std::path::Path;
use vellum_core::Config;

/// What a cleanup run did.
#[derive(Debug, Serialize)]
pub struct CleanupResult {
    /// WAL entries moved into datafiles first.
    pub collected: usize,
    /// Dropped collections and databases whose files were removed.
    pub reclaimed: usize,
    /// Database slots in use afterwards.
    pub database_slots: usize,
}

/// Runs the cleanup command.
pub fn run(path: &Path, format: Format) -> CliResult<()> {
    let result = cleanup(path)?;
    match format {
        Format::Json => print_json(&result)?,
        Format::Text => {
            println!("Collected:      {}", result.collected);
            println!("Reclaimed:      {}", result.reclaimed);
            println!("Database slots: {}", result.database_slots);
        }
    }
    Ok(())
}

/// Collects the WAL, then reclaims everything dropped.
pub fn cleanup(path: &Path) -> CliResult<CleanupResult> {
    let service = open_engine(path, Config::default())?;
    let stats = service.flush_wal(true)?.unwrap_or_default();
    let reclaimed = stats.reclaimed + service.run_cleanup()?;
    let result = CleanupResult {
        collected: stats.applied,
        reclaimed,
        database_slots: service.database_slots(),
    };
    service.close()?;
    Ok(result)
}
