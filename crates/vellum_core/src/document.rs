//! Documents, keys and name rules.
//!
//! A document is `{_key, _rev, body}`. The body is a JSON object; the
//! attributes `_key`, `_rev` and `_id` belong to the store and are stripped
//! from incoming bodies and added back when a document is rendered.

use crate::error::{CoreError, CoreResult};
use crate::types::Revision;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// A document body: a JSON object without system attributes.
pub type Body = Map<String, Value>;

/// Longest accepted document key, in bytes.
pub const MAX_KEY_LEN: usize = 254;

/// Longest accepted collection name.
pub const MAX_COLLECTION_NAME_LEN: usize = 256;

/// Longest accepted database name.
pub const MAX_DATABASE_NAME_LEN: usize = 64;

const KEY_PUNCTUATION: &[u8] = b"_-:.@()+,=;$!*'%";

const SYSTEM_ATTRIBUTES: [&str; 3] = ["_key", "_rev", "_id"];

/// Checks a document key.
///
/// # Errors
///
/// Returns [`CoreError::Validation`] unless the key is 1 to 254 bytes from
/// `[A-Za-z0-9_\-:.@()+,=;$!*'%]`.
pub fn validate_key(key: &str) -> CoreResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(CoreError::validation(format!(
            "document key must be 1 to {MAX_KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    if let Some(bad) = key
        .bytes()
        .find(|b| !b.is_ascii_alphanumeric() && !KEY_PUNCTUATION.contains(b))
    {
        return Err(CoreError::validation(format!(
            "illegal character {:?} in document key",
            char::from(bad)
        )));
    }
    Ok(())
}

fn validate_name(kind: &str, name: &str, max_len: usize, allow_system: bool) -> CoreResult<()> {
    if name.is_empty() || name.len() > max_len {
        return Err(CoreError::validation(format!(
            "{kind} name must be 1 to {max_len} characters"
        )));
    }
    let bytes = name.as_bytes();
    let leading_ok = bytes[0].is_ascii_alphabetic() || (allow_system && bytes[0] == b'_');
    if !leading_ok {
        return Err(CoreError::validation(format!("illegal {kind} name '{name}'")));
    }
    if !bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-')
    {
        return Err(CoreError::validation(format!("illegal {kind} name '{name}'")));
    }
    Ok(())
}

/// Checks a collection name. Names starting with `_` need `is_system`.
///
/// # Errors
///
/// Returns [`CoreError::Validation`] for empty, overlong or illegal names.
pub fn validate_collection_name(name: &str, is_system: bool) -> CoreResult<()> {
    validate_name("collection", name, MAX_COLLECTION_NAME_LEN, is_system)
}

/// Checks a database name. Only `_system` may start with `_`.
///
/// # Errors
///
/// Returns [`CoreError::Validation`] for empty, overlong or illegal names.
pub fn validate_database_name(name: &str) -> CoreResult<()> {
    validate_name(
        "database",
        name,
        MAX_DATABASE_NAME_LEN,
        name == crate::SYSTEM_DATABASE,
    )
}

/// Splits an incoming JSON value into an optional `_key` and a clean body.
///
/// # Errors
///
/// Returns [`CoreError::Validation`] if the value is not an object, or if
/// `_key` is present but not a valid key string.
pub fn split_body(value: Value) -> CoreResult<(Option<String>, Body)> {
    let Value::Object(mut body) = value else {
        return Err(CoreError::validation("document body must be a JSON object"));
    };
    let key = match body.remove("_key") {
        None => None,
        Some(Value::String(key)) => {
            validate_key(&key)?;
            Some(key)
        }
        Some(other) => {
            return Err(CoreError::validation(format!(
                "_key must be a string, got {other}"
            )))
        }
    };
    for attribute in &SYSTEM_ATTRIBUTES[1..] {
        body.remove(*attribute);
    }
    Ok((key, body))
}

/// Applies `patch` to `target`: nested objects merge, everything else
/// replaces, explicit nulls are kept.
pub fn merge_patch(target: &mut Body, patch: Body) {
    for (name, value) in patch {
        match (target.get_mut(&name), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => {
                merge_patch(existing, nested);
            }
            (_, value) => {
                target.insert(name, value);
            }
        }
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// The `_key`.
    pub key: String,
    /// The `_rev`.
    pub rev: Revision,
    /// User attributes.
    pub body: Body,
}

impl Document {
    /// Creates a document.
    #[must_use]
    pub fn new(key: impl Into<String>, rev: Revision, body: Body) -> Self {
        Self {
            key: key.into(),
            rev,
            body,
        }
    }

    /// Decodes a document from its stored body bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] if the bytes are not a JSON object.
    pub fn from_body_bytes(key: impl Into<String>, rev: Revision, bytes: &[u8]) -> CoreResult<Self> {
        let body: Body = serde_json::from_slice(bytes)?;
        Ok(Self::new(key, rev, body))
    }

    /// Encodes the body for the WAL and datafiles.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] if serialization fails.
    pub fn body_bytes(&self) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.body)?)
    }

    /// Looks up a possibly dotted attribute path (`"address.city"`).
    ///
    /// `_key` and `_rev` resolve to the system attributes.
    #[must_use]
    pub fn field(&self, path: &str) -> Option<Value> {
        match path {
            "_key" => return Some(Value::String(self.key.clone())),
            "_rev" => return Some(Value::String(self.rev.to_string())),
            _ => {}
        }
        let mut parts = path.split('.');
        let mut current = self.body.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current.clone())
    }

    /// SHA-256 of the canonical body encoding.
    #[must_use]
    pub fn body_hash(&self) -> [u8; 32] {
        body_hash(&self.body)
    }

    /// Renders the document with `_key`, `_rev` and `_id`.
    #[must_use]
    pub fn to_json(&self, collection: &str) -> Value {
        let mut object = self.body.clone();
        object.insert("_key".into(), Value::String(self.key.clone()));
        object.insert("_rev".into(), Value::String(self.rev.to_string()));
        object.insert(
            "_id".into(),
            Value::String(format!("{collection}/{}", self.key)),
        );
        Value::Object(object)
    }
}

/// SHA-256 of a body's canonical encoding. Object members are sorted, so
/// equal bodies hash equally.
#[must_use]
pub fn body_hash(body: &Body) -> [u8; 32] {
    let mut hasher = Sha256::new();
    // Map serialization into a Vec cannot fail.
    if let Ok(bytes) = serde_json::to_vec(body) {
        hasher.update(&bytes);
    }
    hasher.finalize().into()
}

/// What a write returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// `collection/key`.
    #[serde(rename = "_id")]
    pub id: String,
    /// The document key.
    #[serde(rename = "_key")]
    pub key: String,
    /// The new revision (the removed one for removes).
    #[serde(rename = "_rev")]
    pub rev: Revision,
    /// The revision that was replaced, if any.
    #[serde(rename = "_oldRev", skip_serializing_if = "Option::is_none")]
    pub old_rev: Option<Revision>,
}
