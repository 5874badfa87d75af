//! # Vellum Core
//!
//! Crash-safe document store engine.
//!
//! This crate provides:
//! - A write-ahead log (WAL) with commit markers and torn-tail detection
//! - A background collector moving committed entries into per-collection
//!   datafiles
//! - Crash recovery that replays only committed entries, exactly once
//! - A catalog of databases, collections and indexes with crash-safe
//!   creation and deferred reclamation
//! - Multi-collection transactions with intermediate commits
//! - Fault injection hooks for crash and failure testing
//!
//! ## Durability model
//!
//! Every write goes to the WAL first. A transaction counts as committed once
//! its marker is in the WAL; recovery throws away everything else. The
//! collector applies committed entries to datafiles and records how far it
//! got in the manifest, so a replay after a crash never applies an entry
//! twice and never loses one.
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//! use vellum_core::{CatalogService, CollectionOptions, Config};
//!
//! let service = CatalogService::open_in_memory(Config::default()).unwrap();
//! let db = service.system().unwrap();
//! let users = db.create_collection("users", CollectionOptions::default()).unwrap();
//!
//! let meta = users.insert(json!({"name": "ada"})).unwrap();
//! let doc = users.get(&meta.key).unwrap().unwrap();
//! assert_eq!(doc.field("name"), Some(json!("ada")));
//! assert_eq!(users.count(), 1);
//! service.close().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod catalog;
mod clock;
mod collection;
mod collector;
mod config;
mod control;
mod document;
mod engine;
mod error;
mod query;
mod transaction;
mod types;

pub mod datafile;
pub mod dir;
pub mod index;
pub mod manifest;
pub mod recovery;
pub mod wal;

pub use catalog::{Collection, CollectionProperties, Database};
pub use clock::HybridLogicalClock;
pub use collector::CollectStats;
pub use config::{CollectionOptions, Config, DatabaseOptions, Sharding, TransactionOptions};
pub use control::{
    classify, decode_request, decode_response, encode_request, encode_response, error_num,
    ControlPlane, ControlRequest, ControlResponse,
};
pub use document::{
    body_hash, merge_patch, split_body, validate_collection_name, validate_database_name,
    validate_key, Body, Document, DocumentMeta,
};
pub use engine::CatalogService;
pub use error::{CoreError, CoreResult};
pub use index::{IndexDefinition, IndexKind, IndexSpec};
pub use query::{compare_values, Query};
pub use recovery::{RecoveryReport, RecoveryState};
pub use transaction::{Transaction, TransactionStatus};
pub use types::{
    AccessMode, CollectionId, DatabaseId, IndexId, Revision, SequenceNumber, TransactionId,
};

pub use vellum_storage::{FailMode, FailPoints, FaultController, NoFaults};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the database every engine has and nobody can drop.
pub const SYSTEM_DATABASE: &str = "_system";
