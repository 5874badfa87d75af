//! The leader side: answers replication requests from a local engine.

use crate::error::ReplicationResult;
use crate::protocol::{
    bucket_of, key_chunks, revision_buckets, CborDecode, CborEncode, Entry, ReplicationRequest,
    ReplicationResponse, WireDocument,
};
use std::sync::atomic::{AtomicU64, Ordering};
use vellum_core::{classify, CatalogService, Collection, CoreError, Document};

/// Serves replication requests against a [`CatalogService`].
pub struct LeaderService {
    service: CatalogService,
    revision_tree: bool,
    handled: AtomicU64,
}

impl LeaderService {
    /// Creates a leader speaking both comparison formats.
    pub fn new(service: CatalogService) -> Self {
        Self {
            service,
            revision_tree: true,
            handled: AtomicU64::new(0),
        }
    }

    /// Turns the "new" revisions format on or off. A leader without it
    /// answers revision requests with `NotImplemented`.
    pub fn with_revision_tree(mut self, enabled: bool) -> Self {
        self.revision_tree = enabled;
        self
    }

    /// The engine behind this leader.
    pub fn catalog(&self) -> &CatalogService {
        &self.service
    }

    /// Requests handled so far.
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Answers a request. Failures become `Error` answers.
    pub fn handle(&self, request: &ReplicationRequest) -> ReplicationResponse {
        self.handled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(request = request.name(), "leader request");
        match self.answer(request) {
            Ok(response) => response,
            Err(err) => {
                let (status, _) = classify(&err);
                ReplicationResponse::Error {
                    status,
                    message: err.to_string(),
                }
            }
        }
    }

    /// Answers a CBOR-encoded request with a CBOR-encoded response.
    ///
    /// # Errors
    ///
    /// Fails only if the response cannot be encoded.
    pub fn handle_bytes(&self, body: &[u8]) -> ReplicationResult<Vec<u8>> {
        let response = match ReplicationRequest::decode_cbor(body) {
            Ok(request) => self.handle(&request),
            Err(err) => ReplicationResponse::Error {
                status: 400,
                message: err.to_string(),
            },
        };
        response.encode_cbor()
    }

    fn answer(&self, request: &ReplicationRequest) -> Result<ReplicationResponse, CoreError> {
        let is_revision_request = matches!(
            request,
            ReplicationRequest::RevisionTree { .. } | ReplicationRequest::RevisionsInBuckets { .. }
        );
        if is_revision_request && !self.revision_tree {
            return Ok(ReplicationResponse::NotImplemented {
                request: request.name().to_string(),
            });
        }

        let (database, collection) = request.target();
        let collection = self.service.database(database)?.collection(collection)?;

        let response = match request {
            ReplicationRequest::Inventory { .. } => {
                let revisions = collection.key_revisions()?;
                ReplicationResponse::Inventory {
                    count: revisions.len() as u64,
                    max_rev: revisions
                        .iter()
                        .map(|(_, rev)| rev.as_u64())
                        .max()
                        .unwrap_or(0),
                }
            }
            ReplicationRequest::KeyChunks { chunk_size, .. } => ReplicationResponse::KeyChunks {
                chunks: key_chunks(&entries(&collection)?, *chunk_size),
            },
            ReplicationRequest::KeysInRange { low, high, .. } => ReplicationResponse::Entries {
                entries: entries(&collection)?
                    .into_iter()
                    .filter(|e| e.key.as_str() >= low.as_str() && e.key.as_str() <= high.as_str())
                    .collect(),
            },
            ReplicationRequest::RevisionTree { bucket_count, .. } => {
                ReplicationResponse::RevisionTree {
                    buckets: revision_buckets(&entries(&collection)?, *bucket_count),
                }
            }
            ReplicationRequest::RevisionsInBuckets {
                bucket_count,
                buckets,
                ..
            } => ReplicationResponse::Entries {
                entries: entries(&collection)?
                    .into_iter()
                    .filter(|e| buckets.contains(&bucket_of(e.rev, *bucket_count)))
                    .collect(),
            },
            ReplicationRequest::Documents { keys, .. } => ReplicationResponse::Documents {
                documents: wire(&collection.documents(keys)?)?,
            },
            ReplicationRequest::Dump { after, limit, .. } => {
                let docs = sorted(&collection)?;
                let start = match after {
                    Some(after) => docs.partition_point(|d| d.key.as_str() <= after.as_str()),
                    None => 0,
                };
                let limit = usize::try_from(*limit).unwrap_or(usize::MAX).max(1);
                let end = start.saturating_add(limit).min(docs.len());
                ReplicationResponse::Dump {
                    documents: wire(&docs[start..end])?,
                    has_more: end < docs.len(),
                }
            }
        };
        Ok(response)
    }
}

impl std::fmt::Debug for LeaderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderService")
            .field("revision_tree", &self.revision_tree)
            .field("handled", &self.handled())
            .finish()
    }
}

fn sorted(collection: &Collection) -> Result<Vec<Document>, CoreError> {
    let mut docs = collection.all()?;
    docs.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(docs)
}

fn entries(collection: &Collection) -> Result<Vec<Entry>, CoreError> {
    Ok(sorted(collection)?.iter().map(Entry::of).collect())
}

fn wire(docs: &[Document]) -> Result<Vec<WireDocument>, CoreError> {
    docs.iter()
        .map(|doc| {
            Ok(WireDocument {
                key: doc.key.clone(),
                rev: doc.rev.as_u64(),
                body: doc.body_bytes()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vellum_core::{CollectionOptions, Config};

    fn leader_with(n: usize) -> LeaderService {
        let service = CatalogService::open_in_memory(Config::default().background_collector(false))
            .unwrap();
        let c = service
            .system()
            .unwrap()
            .create_collection("c", CollectionOptions::default())
            .unwrap();
        for i in 0..n {
            c.insert(json!({"_key": format!("k{i:03}"), "n": i})).unwrap();
        }
        LeaderService::new(service)
    }

    fn dump(after: Option<&str>, limit: u64) -> ReplicationRequest {
        ReplicationRequest::Dump {
            database: "_system".into(),
            collection: "c".into(),
            after: after.map(String::from),
            limit,
        }
    }

    #[test]
    fn inventory_reports_count_and_highest_revision() {
        let leader = leader_with(5);
        let response = leader.handle(&ReplicationRequest::Inventory {
            database: "_system".into(),
            collection: "c".into(),
        });
        let ReplicationResponse::Inventory { count, max_rev } = response else {
            panic!("unexpected {response:?}");
        };
        assert_eq!(count, 5);
        assert!(max_rev > 0);
    }

    #[test]
    fn dump_pages_in_key_order() {
        let leader = leader_with(5);
        let ReplicationResponse::Dump {
            documents,
            has_more,
        } = leader.handle(&dump(None, 3))
        else {
            panic!("expected a dump page");
        };
        assert!(has_more);
        let keys: Vec<_> = documents.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, ["k000", "k001", "k002"]);

        let ReplicationResponse::Dump {
            documents,
            has_more,
        } = leader.handle(&dump(Some("k002"), 3))
        else {
            panic!("expected a dump page");
        };
        assert!(!has_more);
        assert_eq!(documents.len(), 2);
    }

    #[test]
    fn old_leader_refuses_revision_requests() {
        let leader = leader_with(1).with_revision_tree(false);
        let response = leader.handle(&ReplicationRequest::RevisionTree {
            database: "_system".into(),
            collection: "c".into(),
            bucket_count: 4,
        });
        assert!(matches!(response, ReplicationResponse::NotImplemented { .. }));
    }

    #[test]
    fn unknown_collection_is_a_404() {
        let leader = leader_with(0);
        let response = leader.handle(&ReplicationRequest::Inventory {
            database: "_system".into(),
            collection: "missing".into(),
        });
        assert!(matches!(
            response,
            ReplicationResponse::Error { status: 404, .. }
        ));
    }

    #[test]
    fn undecodable_bytes_get_a_400() {
        let leader = leader_with(0);
        let bytes = leader.handle_bytes(&[0xff, 0x00, 0x13]).unwrap();
        let response = ReplicationResponse::decode_cbor(&bytes).unwrap();
        assert!(matches!(
            response,
            ReplicationResponse::Error { status: 400, .. }
        ));
    }
}
