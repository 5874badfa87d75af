//! Verify command implementation.

use super::{open_dir, print_json, CliResult, Format};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use vellum_core::dir::DataDir;
use vellum_core::manifest::Manifest;
use vellum_core::wal::{WalIterator, WalRecord};
use vellum_core::CollectionId;
use vellum_storage::StorageBackend;

/// Verification result.
#[derive(Debug, Default, Serialize)]
pub struct VerifyResult {
    /// WAL entries checked.
    pub wal_entries: usize,
    /// Bytes after the last complete WAL entry.
    pub wal_torn_bytes: u64,
    /// Datafiles opened.
    pub datafiles: usize,
    /// Datafile records checked.
    pub datafile_records: u64,
    /// Problems that make the directory unusable.
    pub errors: Vec<String>,
    /// Oddities recovery will repair.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    /// Returns true if no errors were found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, check_wal: bool, check_datafiles: bool, format: Format) -> CliResult<()> {
    let result = verify(path, check_wal, check_datafiles)?;
    match format {
        Format::Json => print_json(&result)?,
        Format::Text => print_text_output(path, &result),
    }
    if result.is_ok() {
        Ok(())
    } else {
        Err("verification failed".into())
    }
}

/// Checks the manifest, then the WAL and every live datafile.
pub fn verify(path: &Path, check_wal: bool, check_datafiles: bool) -> CliResult<VerifyResult> {
    let dir = open_dir(path)?;
    let mut result = VerifyResult::default();

    let manifest = match dir.load_manifest() {
        Ok(Some(manifest)) => manifest,
        Ok(None) => {
            result.errors.push("manifest missing".into());
            return Ok(result);
        }
        Err(err) => {
            result.errors.push(format!("manifest: {err}"));
            return Ok(result);
        }
    };

    let mut pending = BTreeMap::new();
    if check_wal {
        pending = verify_wal(&dir, &manifest, &mut result)?;
    }
    if check_datafiles {
        verify_datafiles(&dir, &manifest, &pending, &mut result);
    }
    Ok(result)
}

/// Scans the WAL. Returns uncollected document entries per collection.
fn verify_wal(
    dir: &DataDir,
    manifest: &Manifest,
    result: &mut VerifyResult,
) -> CliResult<BTreeMap<CollectionId, usize>> {
    let bytes = dir.open_wal()?.read_all()?;
    let mut pending: BTreeMap<CollectionId, usize> = BTreeMap::new();
    let mut iter = WalIterator::new(&bytes);
    for item in iter.by_ref() {
        match item {
            Ok((_, entry)) => {
                result.wal_entries += 1;
                if let WalRecord::Document(change) = &entry.record {
                    if entry.sequence > manifest.collected_seq {
                        *pending.entry(change.collection).or_default() += 1;
                    }
                    if manifest.collection(change.collection).is_none() {
                        result.warnings.push(format!(
                            "wal entry {} targets unknown collection {}",
                            entry.sequence, change.collection
                        ));
                    }
                }
            }
            Err(err) => {
                result.errors.push(format!("wal: {err}"));
                return Ok(pending);
            }
        }
    }
    result.wal_torn_bytes = bytes.len() as u64 - iter.valid_len();
    if result.wal_torn_bytes > 0 {
        result.warnings.push(format!(
            "wal has a torn tail of {} bytes",
            result.wal_torn_bytes
        ));
    }
    Ok(pending)
}

fn verify_datafiles(
    dir: &DataDir,
    manifest: &Manifest,
    pending: &BTreeMap<CollectionId, usize>,
    result: &mut VerifyResult,
) {
    for db in manifest.databases.values().filter(|db| !db.dropped) {
        for meta in db.live_collections() {
            let datafile = match dir.open_datafile(db.id, meta.id) {
                Ok(datafile) => datafile,
                Err(err) => {
                    result
                        .errors
                        .push(format!("{}/{}: {err}", db.name, meta.name));
                    continue;
                }
            };
            let stats = datafile.stats();
            result.datafiles += 1;
            result.datafile_records += stats.records;
            if stats.torn_bytes > 0 {
                result.warnings.push(format!(
                    "{}/{}: torn tail of {} bytes",
                    db.name, meta.name, stats.torn_bytes
                ));
            }
            if stats.applied_seq > manifest.collected_seq {
                result.warnings.push(format!(
                    "{}/{}: datafile is ahead of the manifest ({} > {})",
                    db.name, meta.name, stats.applied_seq, manifest.collected_seq
                ));
            }
            if stats.live != meta.count && !pending.contains_key(&meta.id) {
                result.warnings.push(format!(
                    "{}/{}: manifest count {} but {} live documents",
                    db.name, meta.name, meta.count, stats.live
                ));
            }
        }
    }
}

fn print_text_output(path: &Path, result: &VerifyResult) {
    println!("Verifying data directory at {}", path.display());
    println!();
    println!("WAL entries:      {}", result.wal_entries);
    println!("Datafiles:        {}", result.datafiles);
    println!("Datafile records: {}", result.datafile_records);
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
    for error in &result.errors {
        println!("  error: {error}");
    }
    println!();
    if result.is_ok() {
        println!("Verification passed");
    } else {
        println!("Verification failed");
    }
}
