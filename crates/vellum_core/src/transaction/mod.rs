//! Transactions.
//!
//! A transaction declares the collections it reads, writes or uses
//! exclusively and locks them up front. Writes are staged in memory and
//! become visible together on commit:
//!
//! - **Atomicity**: a commit writes all staged operations and the commit
//!   marker to the WAL in one contiguous batch.
//! - **Isolation**: readers only see committed state; a transaction sees its
//!   own staged writes.
//! - **Durability**: with `wait_for_sync` (transaction, collection or
//!   engine-wide) the WAL is synced before commit returns.
//!
//! With `intermediate_commit_count = n` every `n` staged operations are
//! committed as a durable sub-unit. A later abort or crash keeps them.

mod commit;
mod lock;

pub use lock::{CollectionLock, CollectionLockGuard};

use crate::collection::CollectionState;
use crate::config::TransactionOptions;
use crate::document::{merge_patch, split_body, validate_key, Document, DocumentMeta};
use crate::engine::Engine;
use crate::error::{CoreError, CoreResult};
use crate::types::{AccessMode, CollectionId, Revision, TransactionId};
use crate::wal::{DocumentOp, WalRecord};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;
use vellum_storage::fault::points;

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Accepting operations.
    Running,
    /// Committed.
    Committed,
    /// Aborted; nothing staged since the last intermediate commit is kept.
    Aborted,
}

/// What a staged operation expects to find when it commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    /// No live document with this key.
    Absent,
    /// A live document with exactly this revision.
    Rev(Revision),
    /// Anything.
    Any,
}

/// A staged write.
#[derive(Debug, Clone)]
pub(crate) struct PendingOp {
    pub(crate) collection: Arc<CollectionState>,
    pub(crate) op: DocumentOp,
    pub(crate) key: String,
    pub(crate) rev: Revision,
    /// The document after the write; `None` for removes.
    pub(crate) doc: Option<Document>,
    pub(crate) body: Vec<u8>,
    pub(crate) expect: Expect,
}

/// A running transaction. Dropping it without committing aborts it.
pub struct Transaction {
    engine: Arc<Engine>,
    id: TransactionId,
    collections: BTreeMap<String, (Arc<CollectionState>, AccessMode)>,
    guards: Vec<CollectionLockGuard>,
    pending: Vec<PendingOp>,
    intermediate_commit_count: Option<u64>,
    wait_for_sync: bool,
    status: TransactionStatus,
    logged: bool,
}

impl Transaction {
    /// Locks `collections` (in id order) and starts a transaction.
    pub(crate) fn begin(
        engine: Arc<Engine>,
        collections: Vec<(Arc<CollectionState>, AccessMode)>,
        options: &TransactionOptions,
    ) -> CoreResult<Self> {
        engine.ensure_open()?;
        let mut by_id: BTreeMap<CollectionId, (Arc<CollectionState>, AccessMode)> = BTreeMap::new();
        for (state, mode) in collections {
            let entry = by_id.entry(state.id).or_insert((state, mode));
            entry.1 = entry.1.max(mode);
        }

        let timeout = options.lock_timeout.unwrap_or(engine.config.lock_timeout);
        let mut guards = Vec::with_capacity(by_id.len());
        for (state, mode) in by_id.values() {
            match state.lock.acquire(*mode, timeout) {
                Some(guard) => guards.push(guard),
                None => {
                    return Err(CoreError::transaction_aborted(format!(
                        "timeout waiting for {mode:?} lock on collection '{}'",
                        state.name
                    )))
                }
            }
        }

        let id = TransactionId::new(engine.next_txid.fetch_add(1, Ordering::AcqRel));
        tracing::trace!(%id, collections = by_id.len(), "transaction started");
        Ok(Self {
            engine,
            id,
            collections: by_id
                .into_values()
                .map(|(state, mode)| (state.name.clone(), (state, mode)))
                .collect(),
            guards,
            pending: Vec::new(),
            intermediate_commit_count: options.intermediate_commit_count.filter(|n| *n > 0),
            wait_for_sync: options.wait_for_sync,
            status: TransactionStatus::Running,
            logged: false,
        })
    }

    /// Returns the transaction id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Number of operations staged since the last (intermediate) commit.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn ensure_running(&self) -> CoreResult<()> {
        if self.status == TransactionStatus::Running {
            Ok(())
        } else {
            Err(CoreError::transaction_aborted(format!(
                "transaction {} is {:?}",
                self.id, self.status
            )))
        }
    }

    fn readable(&self, collection: &str) -> CoreResult<Arc<CollectionState>> {
        if let Some((state, _)) = self.collections.get(collection) {
            return Ok(Arc::clone(state));
        }
        let database = self
            .collections
            .values()
            .next()
            .map(|(state, _)| state.database)
            .ok_or_else(|| CoreError::collection_not_found(collection))?;
        self.engine.live_collection(database, collection)
    }

    /// Checks that a write to `collection` may go ahead. Failing checks
    /// abort the transaction.
    fn writable(&mut self, collection: &str) -> CoreResult<Arc<CollectionState>> {
        self.ensure_running()?;
        self.engine.ensure_open()?;
        if let Err(err) = self.engine.faults.check(points::TRANSACTION_WRITE_DOCUMENT) {
            self.abort_inner();
            return Err(err.into());
        }
        match self.collections.get(collection) {
            Some((state, mode)) if mode.can_write() => {
                if state.is_dropped() {
                    return Err(CoreError::collection_not_found(collection));
                }
                Ok(Arc::clone(state))
            }
            _ => {
                self.abort_inner();
                Err(CoreError::transaction_aborted(format!(
                    "collection '{collection}' was not declared for writing"
                )))
            }
        }
    }

    fn current(&self, state: &CollectionState, key: &str) -> CoreResult<Option<Document>> {
        let staged = self
            .pending
            .iter()
            .rev()
            .find(|op| op.collection.id == state.id && op.key == key);
        match staged {
            Some(op) => Ok(op.doc.clone()),
            None => state.read(key),
        }
    }

    fn stage(&mut self, op: PendingOp) -> CoreResult<()> {
        self.pending.push(op);
        if let Some(n) = self.intermediate_commit_count {
            if self.pending.len() as u64 >= n {
                self.flush_pending(WalRecord::IntermediateCommit { txid: self.id })?;
            }
        }
        Ok(())
    }

    fn needs_sync(&self) -> bool {
        self.wait_for_sync
            || self.engine.config.sync_on_commit
            || self.pending.iter().any(|op| op.collection.options.wait_for_sync)
    }

    fn flush_pending(&mut self, marker: WalRecord) -> CoreResult<()> {
        let sync = self.needs_sync();
        let ops = std::mem::take(&mut self.pending);
        match self.engine.commit_batch(self.id, &ops, marker, sync) {
            Ok(()) => {
                self.logged = true;
                Ok(())
            }
            Err(err) => {
                // The batch may have reached the WAL without its marker.
                self.logged = true;
                self.abort_inner();
                Err(err)
            }
        }
    }

    fn meta(state: &CollectionState, key: &str, rev: Revision, old_rev: Option<Revision>) -> DocumentMeta {
        DocumentMeta {
            id: format!("{}/{key}", state.name),
            key: key.to_string(),
            rev,
            old_rev,
        }
    }

    /// Inserts a document. A `_key` in `body` is used, otherwise a key is
    /// generated.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UniqueConstraintViolated`] if the key is taken,
    /// [`CoreError::Validation`] for a bad body, and
    /// [`CoreError::TransactionAborted`] if the collection was not declared
    /// for writing.
    pub fn insert(&mut self, collection: &str, body: Value) -> CoreResult<DocumentMeta> {
        let state = self.writable(collection)?;
        let (key, body) = split_body(body)?;
        let key = key.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        if self.current(&state, &key)?.is_some() {
            return Err(CoreError::unique_violated(
                collection,
                format!("unique constraint violated - in index primary of type primary over '_key'; conflicting key: {key}"),
            ));
        }
        let rev = self.engine.clock.next();
        let doc = Document::new(key.clone(), rev, body);
        let body = doc.body_bytes()?;
        let meta = Self::meta(&state, &key, rev, None);
        self.stage(PendingOp {
            collection: state,
            op: DocumentOp::Insert,
            key,
            rev,
            doc: Some(doc),
            body,
            expect: Expect::Absent,
        })?;
        Ok(meta)
    }

    /// Reads a document, including this transaction's staged writes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`] for an unknown collection.
    pub fn get(&self, collection: &str, key: &str) -> CoreResult<Option<Document>> {
        self.ensure_running()?;
        let state = self.readable(collection)?;
        self.current(&state, key)
    }

    fn existing(
        &self,
        state: &CollectionState,
        key: &str,
        if_match: Option<Revision>,
    ) -> CoreResult<Document> {
        validate_key(key)?;
        let doc = self
            .current(state, key)?
            .ok_or_else(|| CoreError::document_not_found(&state.name, key))?;
        if let Some(expected) = if_match {
            if expected != doc.rev {
                return Err(CoreError::RevisionConflict {
                    key: key.to_string(),
                    expected,
                    actual: doc.rev,
                });
            }
        }
        Ok(doc)
    }

    fn write_new_version(
        &mut self,
        state: Arc<CollectionState>,
        old: Document,
        body: crate::document::Body,
    ) -> CoreResult<DocumentMeta> {
        let rev = self.engine.clock.next();
        let doc = Document::new(old.key.clone(), rev, body);
        let bytes = doc.body_bytes()?;
        let meta = Self::meta(&state, &old.key, rev, Some(old.rev));
        self.stage(PendingOp {
            collection: state,
            op: DocumentOp::Update,
            key: old.key,
            rev,
            doc: Some(doc),
            body: bytes,
            expect: Expect::Rev(old.rev),
        })?;
        Ok(meta)
    }

    /// Merges `patch` into a document.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DocumentNotFound`] or, when `if_match` differs
    /// from the current revision, [`CoreError::RevisionConflict`].
    pub fn update(
        &mut self,
        collection: &str,
        key: &str,
        patch: Value,
        if_match: Option<Revision>,
    ) -> CoreResult<DocumentMeta> {
        let state = self.writable(collection)?;
        let old = self.existing(&state, key, if_match)?;
        let (_, patch) = split_body(patch)?;
        let mut body = old.body.clone();
        merge_patch(&mut body, patch);
        self.write_new_version(state, old, body)
    }

    /// Replaces a document's body.
    ///
    /// # Errors
    ///
    /// Same as [`Transaction::update`].
    pub fn replace(
        &mut self,
        collection: &str,
        key: &str,
        body: Value,
        if_match: Option<Revision>,
    ) -> CoreResult<DocumentMeta> {
        let state = self.writable(collection)?;
        let old = self.existing(&state, key, if_match)?;
        let (_, body) = split_body(body)?;
        self.write_new_version(state, old, body)
    }

    /// Removes a document.
    ///
    /// # Errors
    ///
    /// Same as [`Transaction::update`].
    pub fn remove(
        &mut self,
        collection: &str,
        key: &str,
        if_match: Option<Revision>,
    ) -> CoreResult<DocumentMeta> {
        let state = self.writable(collection)?;
        let old = self.existing(&state, key, if_match)?;
        let meta = Self::meta(&state, key, old.rev, None);
        self.stage(PendingOp {
            collection: state,
            op: DocumentOp::Remove,
            key: old.key,
            rev: old.rev,
            doc: None,
            body: Vec::new(),
            expect: Expect::Rev(old.rev),
        })?;
        Ok(meta)
    }

    /// Stores a document exactly as given, revision included. Used to apply
    /// changes received from a replication leader.
    ///
    /// # Errors
    ///
    /// Fails like any other write.
    pub fn put_replica(&mut self, collection: &str, doc: Document) -> CoreResult<()> {
        let state = self.writable(collection)?;
        validate_key(&doc.key)?;
        let exists = self.current(&state, &doc.key)?.is_some();
        self.engine.clock.observe(doc.rev);
        let body = doc.body_bytes()?;
        self.stage(PendingOp {
            collection: state,
            op: if exists {
                DocumentOp::Update
            } else {
                DocumentOp::Insert
            },
            key: doc.key.clone(),
            rev: doc.rev,
            doc: Some(doc),
            body,
            expect: Expect::Any,
        })
    }

    /// Removes a document whatever its revision. Returns false if it did
    /// not exist.
    ///
    /// # Errors
    ///
    /// Fails like any other write.
    pub fn remove_replica(&mut self, collection: &str, key: &str) -> CoreResult<bool> {
        let state = self.writable(collection)?;
        let Some(old) = self.current(&state, key)? else {
            return Ok(false);
        };
        self.stage(PendingOp {
            collection: state,
            op: DocumentOp::Remove,
            key: old.key,
            rev: old.rev,
            doc: None,
            body: Vec::new(),
            expect: Expect::Any,
        })?;
        Ok(true)
    }

    /// Commits every staged operation.
    ///
    /// # Errors
    ///
    /// On any failure the transaction is aborted and the error returned;
    /// intermediate commits stay.
    pub fn commit(mut self) -> CoreResult<()> {
        self.ensure_running()?;
        if !self.pending.is_empty() {
            self.flush_pending(WalRecord::Commit { txid: self.id })?;
        }
        self.status = TransactionStatus::Committed;
        self.guards.clear();
        Ok(())
    }

    /// Aborts, discarding everything staged since the last intermediate
    /// commit.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionAborted`] if the transaction already
    /// finished.
    pub fn abort(mut self) -> CoreResult<()> {
        self.ensure_running()?;
        self.abort_inner();
        Ok(())
    }

    fn abort_inner(&mut self) {
        if self.status != TransactionStatus::Running {
            return;
        }
        self.status = TransactionStatus::Aborted;
        self.pending.clear();
        self.guards.clear();
        if self.logged && !self.engine.is_closed() {
            if let Err(err) = self.engine.wal.append(&WalRecord::Abort { txid: self.id }) {
                tracing::warn!(id = %self.id, error = %err, "could not log abort marker");
            }
        }
        tracing::debug!(id = %self.id, "transaction aborted");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.abort_inner();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}
