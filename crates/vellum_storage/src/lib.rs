//! # Vellum Storage
//!
//! The lowest layer of Vellum: opaque byte stores, named volumes and the
//! fault-injection hooks every higher layer consults.
//!
//! Nothing in this crate understands WAL entries, datafiles or documents.
//! Backends store bytes; volumes map names to backends and provide the few
//! directory operations the catalog needs (create, rename, remove, atomic
//! whole-file writes).
//!
//! ## Backends
//!
//! - [`InMemoryBackend`] keeps bytes in memory. Clones share the same bytes,
//!   and [`InMemoryBackend::simulate_crash`] drops everything appended after
//!   the last flush, which is how tests model a killed process.
//! - [`FileBackend`] uses OS files.
//!
//! ## Volumes
//!
//! - [`FsVolume`] maps names to paths below a root directory.
//! - [`MemoryVolume`] is a shared in-memory tree that survives a simulated
//!   crash, so an engine can be "restarted" on the same bytes.
//!
//! ## Fault injection
//!
//! [`FaultController`] is checked by production code at named points. The
//! default [`NoFaults`] never fires; [`FailPoints`] is the switchboard tests
//! use (`set_fail_at`, `clear_fail_at`, `clear_all`).
//!
//! ```rust
//! use vellum_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello").unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
pub mod fault;
mod file;
mod memory;
mod volume;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use fault::{FailMode, FailPoints, FaultController, NoFaults};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use volume::{FsVolume, MemoryVolume, Volume};
