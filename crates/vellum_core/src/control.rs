//! Administrative requests.
//!
//! The engine has no listener of its own. A server front end decodes each
//! call into a [`ControlRequest`], hands it to [`ControlPlane::handle`] and
//! sends the [`ControlResponse`] back; errors come out as HTTP status codes
//! plus stable error numbers.

use crate::config::{CollectionOptions, DatabaseOptions};
use crate::engine::CatalogService;
use crate::error::{CoreError, CoreResult};
use crate::index::IndexSpec;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// An administrative request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ControlRequest {
    /// `POST /_api/database`
    CreateDatabase {
        /// Database name.
        name: String,
        /// Options; defaults when omitted.
        #[serde(default)]
        options: DatabaseOptions,
    },
    /// `DELETE /_api/database/{name}`
    DropDatabase {
        /// Database name.
        name: String,
    },
    /// `POST /_api/collection`
    CreateCollection {
        /// Owning database.
        database: String,
        /// Collection name.
        name: String,
        /// Options; defaults when omitted.
        #[serde(default)]
        options: CollectionOptions,
    },
    /// `DELETE /_api/collection/{name}`
    DropCollection {
        /// Owning database.
        database: String,
        /// Collection name.
        name: String,
    },
    /// `PUT /_api/collection/{name}/recalculateCount`
    RecalculateCount {
        /// Owning database.
        database: String,
        /// Collection name.
        collection: String,
    },
    /// `POST /_api/index`
    EnsureIndex {
        /// Owning database.
        database: String,
        /// Collection name.
        collection: String,
        /// Index definition.
        spec: IndexSpec,
    },
    /// `DELETE /_api/index/{collection}/{name}`
    DropIndex {
        /// Owning database.
        database: String,
        /// Collection name.
        collection: String,
        /// Index name or id.
        name: String,
    },
    /// `PUT /_admin/wal/flush`
    FlushWal {
        /// Run the collector pass before answering.
        #[serde(default)]
        wait_for_collector: bool,
    },
}

/// Answer to a [`ControlRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    /// HTTP-style status code.
    pub status: u16,
    /// True for status codes of 400 and above.
    pub error: bool,
    /// Stable error number; 0 on success.
    pub error_num: u32,
    /// Error message; empty on success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Result payload.
    #[serde(default)]
    pub body: Value,
}

/// Stable error numbers.
pub mod error_num {
    /// Unclassified internal or I/O failure.
    pub const INTERNAL: u32 = 4;
    /// Bad parameter.
    pub const BAD_PARAMETER: u32 = 10;
    /// Forbidden operation.
    pub const FORBIDDEN: u32 = 11;
    /// Injected fault.
    pub const DEBUG: u32 = 22;
    /// Engine shutting down.
    pub const SHUTTING_DOWN: u32 = 30;
    /// Resource limit reached.
    pub const RESOURCE_LIMIT: u32 = 32;
    /// Revision conflict.
    pub const CONFLICT: u32 = 1200;
    /// Document not found.
    pub const DOCUMENT_NOT_FOUND: u32 = 1202;
    /// Collection not found.
    pub const COLLECTION_NOT_FOUND: u32 = 1203;
    /// Duplicate name.
    pub const DUPLICATE_NAME: u32 = 1207;
    /// Unique constraint violated.
    pub const UNIQUE_CONSTRAINT_VIOLATED: u32 = 1210;
    /// Index not found.
    pub const INDEX_NOT_FOUND: u32 = 1212;
    /// Database not found.
    pub const DATABASE_NOT_FOUND: u32 = 1228;
    /// Transaction aborted.
    pub const TRANSACTION_ABORTED: u32 = 1654;
}

impl ControlResponse {
    fn ok(status: u16, body: Value) -> Self {
        Self {
            status,
            error: false,
            error_num: 0,
            message: String::new(),
            body,
        }
    }

    /// Builds the response for a failed request.
    #[must_use]
    pub fn from_error(err: &CoreError) -> Self {
        let (status, error_num) = classify(err);
        Self {
            status,
            error: true,
            error_num,
            message: err.to_string(),
            body: Value::Null,
        }
    }

    /// Returns true for a successful answer.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.error
    }
}

/// Maps an error to its status code and error number.
#[must_use]
pub fn classify(err: &CoreError) -> (u16, u32) {
    use error_num::*;
    match err {
        CoreError::DuplicateName { .. } => (409, DUPLICATE_NAME),
        CoreError::UniqueConstraintViolated { .. } => (409, UNIQUE_CONSTRAINT_VIOLATED),
        CoreError::RevisionConflict { .. } => (409, CONFLICT),
        CoreError::TransactionAborted { .. } => (409, TRANSACTION_ABORTED),
        CoreError::Validation { .. } | CoreError::InvalidArgument { .. } => (400, BAD_PARAMETER),
        CoreError::InvalidOperation { .. } => (403, FORBIDDEN),
        CoreError::CollectionNotFound { .. } => (404, COLLECTION_NOT_FOUND),
        CoreError::DatabaseNotFound { .. } => (404, DATABASE_NOT_FOUND),
        CoreError::DocumentNotFound { .. } => (404, DOCUMENT_NOT_FOUND),
        CoreError::IndexNotFound { .. } => (404, INDEX_NOT_FOUND),
        CoreError::ResourceLimit { .. } => (403, RESOURCE_LIMIT),
        CoreError::Closed => (503, SHUTTING_DOWN),
        err if err.is_injected() => (500, DEBUG),
        _ => (500, INTERNAL),
    }
}

/// Executes control requests against a [`CatalogService`].
#[derive(Debug, Clone)]
pub struct ControlPlane {
    service: CatalogService,
}

impl ControlPlane {
    /// Wraps `service`.
    #[must_use]
    pub fn new(service: CatalogService) -> Self {
        Self { service }
    }

    /// Handles one request. Never fails: errors become error responses.
    pub fn handle(&self, request: ControlRequest) -> ControlResponse {
        match self.execute(request) {
            Ok((status, body)) => ControlResponse::ok(status, body),
            Err(err) => {
                tracing::debug!(error = %err, "control request failed");
                ControlResponse::from_error(&err)
            }
        }
    }

    /// Decodes a CBOR request, handles it and encodes the response.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] if either side cannot be (de)coded.
    pub fn handle_bytes(&self, request: &[u8]) -> CoreResult<Vec<u8>> {
        let response = match decode_request(request) {
            Ok(request) => self.handle(request),
            Err(err) => ControlResponse::from_error(&CoreError::invalid_argument(err.to_string())),
        };
        encode_response(&response)
    }

    fn execute(&self, request: ControlRequest) -> CoreResult<(u16, Value)> {
        match request {
            ControlRequest::CreateDatabase { name, options } => {
                let db = self.service.create_database(&name, options)?;
                Ok((201, json!({ "name": db.name(), "id": db.id().as_u64() })))
            }
            ControlRequest::DropDatabase { name } => {
                self.service.drop_database(&name)?;
                Ok((200, json!(true)))
            }
            ControlRequest::CreateCollection {
                database,
                name,
                options,
            } => {
                let collection = self.service.database(&database)?.create_collection(&name, options)?;
                Ok((200, serde_json::to_value(collection.properties()).unwrap_or(Value::Null)))
            }
            ControlRequest::DropCollection { database, name } => {
                let db = self.service.database(&database)?;
                let id = db.collection(&name)?.id();
                db.drop_collection(&name)?;
                Ok((200, json!({ "id": id.as_u64() })))
            }
            ControlRequest::RecalculateCount {
                database,
                collection,
            } => {
                let count = self
                    .service
                    .database(&database)?
                    .collection(&collection)?
                    .recalculate_count()?;
                Ok((200, json!({ "result": true, "count": count })))
            }
            ControlRequest::EnsureIndex {
                database,
                collection,
                spec,
            } => {
                let (definition, created) = self
                    .service
                    .database(&database)?
                    .collection(&collection)?
                    .ensure_index(&spec)?;
                let mut body = serde_json::to_value(&definition).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut body {
                    map.insert("isNewlyCreated".into(), json!(created));
                }
                Ok((if created { 201 } else { 200 }, body))
            }
            ControlRequest::DropIndex {
                database,
                collection,
                name,
            } => {
                self.service
                    .database(&database)?
                    .collection(&collection)?
                    .drop_index(&name)?;
                Ok((200, json!({ "id": name })))
            }
            ControlRequest::FlushWal { wait_for_collector } => {
                let stats = self.service.flush_wal(wait_for_collector)?;
                Ok((
                    200,
                    json!({
                        "collected": stats.map(|s| s.collected.as_u64()),
                        "applied": stats.map(|s| s.applied),
                    }),
                ))
            }
        }
    }
}

/// Encodes a request as CBOR.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] on failure.
pub fn encode_request(request: &ControlRequest) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(request, &mut out).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(out)
}

/// Decodes a CBOR request.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] for malformed input.
pub fn decode_request(data: &[u8]) -> CoreResult<ControlRequest> {
    ciborium::from_reader(data).map_err(|e| CoreError::codec(e.to_string()))
}

/// Encodes a response as CBOR.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] on failure.
pub fn encode_response(response: &ControlResponse) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(response, &mut out).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(out)
}

/// Decodes a CBOR response.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] for malformed input.
pub fn decode_response(data: &[u8]) -> CoreResult<ControlResponse> {
    ciborium::from_reader(data).map_err(|e| CoreError::codec(e.to_string()))
}
