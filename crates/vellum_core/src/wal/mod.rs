//! Write-ahead log.
//!
//! Every mutation and every transaction marker is appended here before the
//! change becomes visible. The collector later moves committed entries into
//! collection datafiles; recovery replays whatever it had not yet moved.
//!
//! ## Entry Format
//!
//! ```text
//! | magic "VWAL" (4) | version (1) | kind (1) | sequence (8) | length (4) | header crc32 (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The header CRC covers the fields before it. The trailing CRC covers
//! header and payload.
//!
//! ## Recovery Policy
//!
//! Tolerated (clean end of log, the tail is cut off on open):
//!
//! - **Truncated header**: fewer than 22 bytes left
//! - **Truncated payload**: a checksummed length points past the end
//!
//! Fatal (opening fails):
//!
//! - **Header CRC mismatch**, so a damaged length never reads as a torn tail
//! - **CRC mismatch** on a complete entry
//! - **Invalid magic**, **unsupported version**, **unknown kind**
//! - **Sequence gap or repeat** between neighbouring entries
//!
//! ## Invariants
//!
//! - entries are immutable once written
//! - sequence numbers are strictly increasing and gap-free inside one log
//! - a transaction batch is contiguous and ends with its marker
//! - after a full collection the log is emptied; numbering continues

mod iterator;
mod record;
mod writer;

pub use iterator::{scan, WalIterator, WalScan};
pub use record::{
    encode_entry, DocumentChange, DocumentOp, WalEntry, WalEntryKind, WalRecord, WAL_MAGIC,
    WAL_VERSION,
};
pub use writer::WalWriter;
