//! Identifier and ordering types.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Wraps a raw value.
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw value.
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Internal database id. Never reused.
    DatabaseId,
    "db"
);

id_type!(
    /// Internal collection id. Never reused, even after a drop.
    CollectionId,
    "col"
);

id_type!(
    /// Index id, unique within a data directory. Id 0 is the primary index.
    IndexId,
    "idx"
);

id_type!(
    /// Transaction id. Monotonic within a process lifetime.
    TransactionId,
    "txn"
);

id_type!(
    /// Position in the WAL. Strictly increasing and gap-free inside one log.
    SequenceNumber,
    "seq"
);

impl SequenceNumber {
    /// Returns the following sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// A document revision issued by the hybrid logical clock.
///
/// Rendered as a decimal string in `_rev`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    /// Wraps a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Parses the decimal `_rev` form.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        text.parse().ok().map(Self)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a transaction uses a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Reads only. Shared lock.
    Read,
    /// Reads and writes. Shared lock.
    Write,
    /// Reads and writes with no concurrent writers. Exclusive lock.
    Exclusive,
}

impl AccessMode {
    /// Returns true if the mode permits writes.
    #[must_use]
    pub const fn can_write(self) -> bool {
        matches!(self, Self::Write | Self::Exclusive)
    }

    /// Returns true if the mode takes the exclusive collection lock.
    #[must_use]
    pub const fn is_exclusive(self) -> bool {
        matches!(self, Self::Exclusive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_number_next() {
        assert_eq!(SequenceNumber::new(5).next().as_u64(), 6);
    }

    #[test]
    fn id_display_prefixes() {
        assert_eq!(CollectionId::new(42).to_string(), "col:42");
        assert_eq!(DatabaseId::new(1).to_string(), "db:1");
        assert_eq!(TransactionId::new(9).to_string(), "txn:9");
    }

    #[test]
    fn revision_renders_and_parses_decimal() {
        let rev = Revision::new(1_700_000_000_123);
        assert_eq!(rev.to_string(), "1700000000123");
        assert_eq!(Revision::parse("1700000000123"), Some(rev));
        assert_eq!(Revision::parse("abc"), None);
    }

    #[test]
    fn access_mode_locking() {
        assert!(!AccessMode::Read.can_write());
        assert!(AccessMode::Write.can_write());
        assert!(!AccessMode::Write.is_exclusive());
        assert!(AccessMode::Exclusive.is_exclusive());
    }
}
