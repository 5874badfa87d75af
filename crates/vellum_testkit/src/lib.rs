//! # Vellum Testkit
//!
//! Test utilities for Vellum.
//!
//! This crate provides:
//! - Engines on shared in-memory volumes that survive simulated crashes
//! - Property-based test generators using proptest
//! - A reference model of a collection to check engine results against
//! - A crash harness that kills the engine at chosen points and verifies
//!   recovery
//!
//! ## Usage
//!
//! ```rust
//! use vellum_testkit::prelude::*;
//!
//! with_temp_engine(|engine| {
//!     let collection = engine.collection("test");
//!     collection.insert(serde_json::json!({"_key": "a"})).unwrap();
//!     assert_eq!(collection.count(), 1);
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod model;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::{CrashHarness, CrashPoint, CrashRecoveryResult};
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::model::{Op, ReferenceModel};
}

pub use crash::{CrashHarness, CrashPoint, CrashRecoveryResult};
pub use fixtures::*;
pub use generators::*;
pub use model::{Op, ReferenceModel};
