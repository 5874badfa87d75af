//! # Vellum Replication
//!
//! Follower-side replication of single collections for Vellum.
//!
//! This crate provides:
//! - A wire protocol with two comparison formats: key chunks ("old") and
//!   revision buckets ("new"), CBOR-encoded
//! - A leader service answering those requests from a local engine
//! - A sync engine that makes a follower collection identical to the
//!   leader's, with internal retries and backoff
//! - A fault-injecting "malarkey" transport for convergence testing
//! - A tokio task for periodic syncing
//!
//! ## Guarantees
//!
//! - Every request is a read, so resending after a lost answer is harmless
//! - A sync ends with the follower holding exactly the leader's
//!   `(key, revision, body)` set, or with an error
//! - The only errors are a permanently unreachable leader, a same-key
//!   same-revision body conflict, and local failures no retry can fix
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//! use std::sync::Arc;
//! use vellum_core::{CatalogService, CollectionOptions, Config};
//! use vellum_replication::{
//!     LeaderService, LoopbackTransport, ReplicationEngine, SyncConfig,
//! };
//!
//! let leader = CatalogService::open_in_memory(Config::default()).unwrap();
//! let users = leader
//!     .system()
//!     .unwrap()
//!     .create_collection("users", CollectionOptions::default())
//!     .unwrap();
//! users.insert(json!({"_key": "ada"})).unwrap();
//!
//! let follower = CatalogService::open_in_memory(Config::default()).unwrap();
//! let db = follower.system().unwrap();
//! db.create_collection("users", CollectionOptions::default()).unwrap();
//!
//! let transport = LoopbackTransport::new(Arc::new(LeaderService::new(leader)));
//! let engine = ReplicationEngine::new(SyncConfig::default(), transport);
//! let report = engine.sync(&db, "users").unwrap();
//! assert!(report.converged);
//! assert!(db.collection("users").unwrap().get("ada").unwrap().is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod leader;
mod malarkey;
mod state;
mod task;
mod transport;

pub mod protocol;

pub use config::{MalarkeyConfig, RetryConfig, SyncConfig, SyncMode};
pub use engine::ReplicationEngine;
pub use error::{ReplicationError, ReplicationResult};
pub use leader::LeaderService;
pub use malarkey::{MalarkeyStats, MalarkeyTransport};
pub use protocol::{CborDecode, CborEncode, ReplicationRequest, ReplicationResponse};
pub use state::{Difference, SyncReport, SyncState, SyncStats};
pub use task::{ReplicationTask, SyncOutcome};
pub use transport::{LoopbackTransport, ReplicationTransport};
