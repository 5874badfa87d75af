//! Inspect command implementation.

use super::{format_size, open_dir, print_json, CliResult, Format};
use serde::Serialize;
use std::path::Path;
use vellum_core::dir::DataDir;
use vellum_core::wal::{WalIterator, WalRecord};
use vellum_storage::StorageBackend;

/// Data directory inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Data directory path.
    pub path: String,
    /// Server id from the manifest.
    pub server_id: String,
    /// Whether the last process closed cleanly.
    pub clean_shutdown: bool,
    /// Collected watermark.
    pub collected_seq: u64,
    /// Highest revision recorded in the manifest.
    pub max_revision: u64,
    /// WAL file size in bytes.
    pub wal_size: u64,
    /// Complete WAL entries.
    pub wal_entries: usize,
    /// Document entries the collector has not moved yet.
    pub wal_pending: usize,
    /// Databases, live and awaiting reclamation.
    pub databases: Vec<DatabaseInfo>,
}

/// One database.
#[derive(Debug, Serialize)]
pub struct DatabaseInfo {
    /// Internal id.
    pub id: u64,
    /// Name.
    pub name: String,
    /// Dropped and awaiting reclamation.
    pub dropped: bool,
    /// Collections (only with `--collections`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collections: Option<Vec<CollectionInfo>>,
}

/// One collection and its datafile.
#[derive(Debug, Serialize)]
pub struct CollectionInfo {
    /// Internal id.
    pub id: u64,
    /// Name.
    pub name: String,
    /// Dropped and awaiting reclamation.
    pub dropped: bool,
    /// Count stored in the manifest.
    pub count: u64,
    /// Index definitions.
    pub indexes: usize,
    /// Live documents in the datafile.
    pub live: u64,
    /// Records in the datafile.
    pub records: u64,
    /// Datafile size in bytes.
    pub size: u64,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_collections: bool, format: Format) -> CliResult<()> {
    let result = inspect(path, show_collections)?;
    match format {
        Format::Json => print_json(&result),
        Format::Text => {
            print_text_output(&result);
            Ok(())
        }
    }
}

/// Collects the inspection result.
pub fn inspect(path: &Path, show_collections: bool) -> CliResult<InspectResult> {
    let dir = open_dir(path)?;
    let manifest = dir
        .load_manifest()?
        .ok_or("data directory has no manifest")?;

    let wal = dir.open_wal()?;
    let wal_size = wal.size()?;
    let bytes = wal.read_all()?;
    let mut wal_entries = 0;
    let mut wal_pending = 0;
    for item in WalIterator::new(&bytes) {
        let (_, entry) = item?;
        wal_entries += 1;
        if matches!(entry.record, WalRecord::Document(_)) && entry.sequence > manifest.collected_seq {
            wal_pending += 1;
        }
    }

    let mut databases = Vec::new();
    for db in manifest.databases.values() {
        let collections = if show_collections {
            let mut list = Vec::new();
            for meta in db.collections.values() {
                list.push(collection_info(&dir, db.id, meta)?);
            }
            Some(list)
        } else {
            None
        };
        databases.push(DatabaseInfo {
            id: db.id.as_u64(),
            name: db.name.clone(),
            dropped: db.dropped,
            collections,
        });
    }

    Ok(InspectResult {
        path: path.display().to_string(),
        server_id: manifest.server_id.to_string(),
        clean_shutdown: manifest.clean_shutdown,
        collected_seq: manifest.collected_seq.as_u64(),
        max_revision: manifest.max_revision.as_u64(),
        wal_size,
        wal_entries,
        wal_pending,
        databases,
    })
}

fn collection_info(
    dir: &DataDir,
    database: vellum_core::DatabaseId,
    meta: &vellum_core::manifest::CollectionMeta,
) -> CliResult<CollectionInfo> {
    let stats = if meta.dropped {
        Default::default()
    } else {
        dir.open_datafile(database, meta.id)?.stats()
    };
    Ok(CollectionInfo {
        id: meta.id.as_u64(),
        name: meta.name.clone(),
        dropped: meta.dropped,
        count: meta.count,
        indexes: meta.indexes.len(),
        live: stats.live,
        records: stats.records,
        size: stats.size,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Vellum Data Directory");
    println!("=====================");
    println!();
    println!("Path:           {}", result.path);
    println!("Server id:      {}", result.server_id);
    println!("Clean shutdown: {}", result.clean_shutdown);
    println!("Collected seq:  {}", result.collected_seq);
    println!("Max revision:   {}", result.max_revision);
    println!();
    println!("WAL:");
    println!("  Size:    {}", format_size(result.wal_size));
    println!("  Entries: {}", result.wal_entries);
    println!("  Pending: {}", result.wal_pending);
    println!();
    println!("Databases:");
    for db in &result.databases {
        let marker = if db.dropped { " (dropped)" } else { "" };
        println!("  [{}] {}{marker}", db.id, db.name);
        for col in db.collections.iter().flatten() {
            let marker = if col.dropped { " (dropped)" } else { "" };
            println!(
                "      [{}] {}{marker}: {} documents, {} records, {}, {} indexes",
                col.id,
                col.name,
                col.count,
                col.records,
                format_size(col.size),
                col.indexes
            );
        }
    }
}
