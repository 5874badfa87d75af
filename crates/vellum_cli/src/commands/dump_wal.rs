//! Dump WAL command implementation.

use super::{open_dir, print_json, CliResult, Format};
use serde::Serialize;
use std::path::Path;
use vellum_core::wal::{WalIterator, WalRecord};
use vellum_storage::StorageBackend;

/// One WAL entry for output.
#[derive(Debug, Serialize)]
pub struct WalEntryInfo {
    /// Byte offset in the WAL file.
    pub offset: u64,
    /// Sequence number.
    pub sequence: u64,
    /// Entry kind.
    pub kind: &'static str,
    /// Transaction id (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<u64>,
    /// Collection id (document entries).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<u64>,
    /// Document key (document entries).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Revision (document entries).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<u64>,
    /// Body size in bytes (document entries).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_size: Option<usize>,
    /// Collected watermark (checkpoints).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collected: Option<u64>,
}

/// Runs the dump-wal command.
pub fn run(path: &Path, limit: Option<usize>, skip: usize, format: Format) -> CliResult<()> {
    let (entries, error) = read_entries(path, limit, skip)?;
    match format {
        Format::Json => print_json(&entries)?,
        Format::Text => print_text_output(&entries),
    }
    match error {
        Some(err) => Err(format!("stopped at damaged entry: {err}").into()),
        None => Ok(()),
    }
}

/// Reads up to `limit` entries after skipping `skip`. Entries before a
/// damaged one are returned along with the error message.
pub fn read_entries(
    path: &Path,
    limit: Option<usize>,
    skip: usize,
) -> CliResult<(Vec<WalEntryInfo>, Option<String>)> {
    let dir = open_dir(path)?;
    let bytes = dir.open_wal()?.read_all()?;
    let mut entries = Vec::new();
    let limit = limit.unwrap_or(usize::MAX);

    for item in WalIterator::new(&bytes).skip(skip) {
        if entries.len() >= limit {
            break;
        }
        let (offset, entry) = match item {
            Ok(item) => item,
            Err(err) => return Ok((entries, Some(err.to_string()))),
        };
        let mut info = WalEntryInfo {
            offset,
            sequence: entry.sequence.as_u64(),
            kind: entry.record.kind().name(),
            txid: entry.record.txid().map(|id| id.as_u64()),
            collection: None,
            key: None,
            rev: None,
            body_size: None,
            collected: None,
        };
        match entry.record {
            WalRecord::Document(change) => {
                info.collection = Some(change.collection.as_u64());
                info.rev = Some(change.rev.as_u64());
                info.body_size = Some(change.body.len());
                info.key = Some(change.key);
            }
            WalRecord::Checkpoint { collected } => info.collected = Some(collected.as_u64()),
            _ => {}
        }
        entries.push(info);
    }
    Ok((entries, None))
}

fn print_text_output(entries: &[WalEntryInfo]) {
    println!(
        "{:>10}  {:>8}  {:<20}  {:>8}  DETAILS",
        "OFFSET", "SEQ", "KIND", "TXID"
    );
    for entry in entries {
        let txid = entry.txid.map(|t| t.to_string()).unwrap_or_default();
        let details = match (&entry.key, entry.collection, entry.rev, entry.collected) {
            (Some(key), Some(collection), Some(rev), _) => format!(
                "col:{collection} key={key} rev={rev} body={}",
                entry.body_size.unwrap_or(0)
            ),
            (_, _, _, Some(collected)) => format!("collected=seq:{collected}"),
            _ => String::new(),
        };
        println!(
            "{:>10}  {:>8}  {:<20}  {:>8}  {details}",
            entry.offset, entry.sequence, entry.kind, txid
        );
    }
    println!();
    println!("{} entries", entries.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vellum_core::{CatalogService, CollectionOptions, Config};

    #[test]
    fn dumps_documents_and_markers() {
        let dir = tempfile::tempdir().unwrap();
        {
            let config = Config::default().background_collector(false);
            let service = CatalogService::open(dir.path(), config).unwrap();
            let c = service
                .system()
                .unwrap()
                .create_collection("c", CollectionOptions::default())
                .unwrap();
            c.insert(json!({"_key": "a", "v": 1})).unwrap();
            c.remove("a", None).unwrap();
            drop(c);
            service.crash();
        }

        let (entries, error) = read_entries(dir.path(), None, 0).unwrap();
        assert!(error.is_none());
        assert!(entries.iter().any(|e| e.kind == "insert" && e.key.as_deref() == Some("a")));
        assert!(entries.iter().any(|e| e.kind == "remove"));
        assert!(entries.iter().any(|e| e.kind == "commit"));
        assert!(entries.windows(2).all(|w| w[0].sequence < w[1].sequence));

        let (limited, _) = read_entries(dir.path(), Some(1), 1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].sequence, entries[1].sequence);
    }
}
