//! Compact command implementation.
//!
//! Opens the engine once so recovery and a collector pass bring every
//! datafile up to date, then rewrites datafiles offline.

use super::{format_size, open_dir, open_engine, print_json, CliResult, Format};
use serde::Serialize;
use std::path::Path;
use vellum_core::Config;

/// Compaction figures for one datafile.
#[derive(Debug, Serialize)]
pub struct CompactResult {
    /// Database name.
    pub database: String,
    /// Collection name.
    pub collection: String,
    /// Records before compaction.
    pub records_before: u64,
    /// Live documents, which is also the record count afterwards.
    pub live: u64,
    /// Bytes before compaction.
    pub bytes_before: u64,
    /// Bytes after compaction (unchanged on a dry run or when skipped).
    pub bytes_after: u64,
    /// Whether the datafile was rewritten.
    pub compacted: bool,
}

/// Runs the compact command.
pub fn run(path: &Path, threshold: f64, dry_run: bool, format: Format) -> CliResult<()> {
    let results = compact(path, threshold, dry_run)?;
    match format {
        Format::Json => print_json(&results)?,
        Format::Text => print_text_output(&results, dry_run),
    }
    Ok(())
}

/// Compacts every live datafile whose dead-record ratio exceeds
/// `threshold`.
pub fn compact(path: &Path, threshold: f64, dry_run: bool) -> CliResult<Vec<CompactResult>> {
    {
        let service = open_engine(path, Config::default())?;
        service.flush_wal(true)?;
        service.close()?;
    }

    let dir = open_dir(path)?;
    let manifest = dir
        .load_manifest()?
        .ok_or("data directory has no manifest")?;

    let mut results = Vec::new();
    for db in manifest.databases.values().filter(|db| !db.dropped) {
        for meta in db.live_collections() {
            let mut datafile = dir.open_datafile(db.id, meta.id)?;
            let before = datafile.stats();
            let eligible = datafile.dead_records() > 0 && datafile.dead_ratio() > threshold;
            let compacted = eligible && !dry_run;
            if compacted {
                dir.compact_datafile(db.id, meta.id, &mut datafile)?;
                tracing::info!(database = %db.name, collection = %meta.name, "datafile compacted");
            }
            results.push(CompactResult {
                database: db.name.clone(),
                collection: meta.name.clone(),
                records_before: before.records,
                live: before.live,
                bytes_before: before.size,
                bytes_after: datafile.stats().size,
                compacted,
            });
        }
    }
    Ok(results)
}

fn print_text_output(results: &[CompactResult], dry_run: bool) {
    if dry_run {
        println!("(dry run - no changes will be made)");
        println!();
    }
    for r in results {
        let action = if r.compacted {
            "compacted"
        } else if r.records_before > r.live {
            "would compact"
        } else {
            "nothing to do"
        };
        println!(
            "{}/{}: {} records, {} live, {} -> {} ({action})",
            r.database,
            r.collection,
            r.records_before,
            r.live,
            format_size(r.bytes_before),
            format_size(r.bytes_after)
        );
    }
}
