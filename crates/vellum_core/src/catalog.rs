//! Databases and collections.
//!
//! Creating an object writes its directory or datafile under a temporary
//! name, renames it into place and only then records it in the manifest.
//! Until the manifest write the object does not exist; a failure at any
//! step leaves the catalog unchanged.
//!
//! Dropping an object marks it dropped in the manifest and it disappears
//! from every lookup at once. A collection name is free again right away.
//! A database keeps its name and its slot until cleanup (explicit or from
//! the collector) removes its files.

use crate::collection::CollectionState;
use crate::config::{CollectionOptions, DatabaseOptions, TransactionOptions};
use crate::document::{validate_collection_name, validate_database_name, validate_key, Document, DocumentMeta};
use crate::engine::{DatabaseState, Engine};
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexDefinition, IndexKind, IndexSet, IndexSpec};
use crate::manifest::{CollectionMeta, DatabaseMeta};
use crate::query::Query;
use crate::transaction::Transaction;
use crate::types::{AccessMode, CollectionId, DatabaseId, Revision};
use crate::SYSTEM_DATABASE;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

impl Engine {
    pub(crate) fn live_database(&self, name: &str) -> CoreResult<Arc<DatabaseState>> {
        self.catalog
            .read()
            .databases
            .values()
            .find(|db| !db.is_dropped() && db.name == name)
            .cloned()
            .ok_or_else(|| CoreError::database_not_found(name))
    }

    pub(crate) fn live_collection(
        &self,
        database: DatabaseId,
        name: &str,
    ) -> CoreResult<Arc<CollectionState>> {
        self.catalog
            .read()
            .collections
            .values()
            .find(|c| c.database == database && !c.is_dropped() && c.name == name)
            .cloned()
            .ok_or_else(|| CoreError::collection_not_found(name))
    }

    pub(crate) fn create_database(
        &self,
        name: &str,
        options: DatabaseOptions,
    ) -> CoreResult<Arc<DatabaseState>> {
        self.ensure_open()?;
        validate_database_name(name)?;
        options.validate()?;

        let mut manifest = self.manifest.lock();
        if manifest.database_by_name(name).is_some() {
            return Err(CoreError::duplicate_name("database", name));
        }
        let limit = self.config.max_databases;
        if manifest.database_slots() >= limit {
            return Err(CoreError::ResourceLimit {
                resource: "databases",
                limit: limit as u64,
            });
        }

        let mut next = manifest.clone();
        let id = next.allocate_database_id();
        self.dir.create_database_dir(id)?;
        next.databases.insert(
            id,
            DatabaseMeta {
                id,
                name: name.to_string(),
                options,
                dropped: false,
                collections: BTreeMap::new(),
            },
        );
        if let Err(err) = self.dir.save_manifest(&next) {
            let _ = self.dir.remove_database_dir(id);
            return Err(err);
        }
        *manifest = next;

        let state = manifest
            .databases
            .get(&id)
            .map(|meta| Arc::new(DatabaseState::from_meta(meta)))
            .ok_or_else(|| CoreError::database_not_found(name))?;
        self.catalog
            .write()
            .databases
            .insert(id, Arc::clone(&state));
        tracing::info!(%id, name, "database created");
        Ok(state)
    }

    pub(crate) fn drop_database(&self, name: &str) -> CoreResult<()> {
        self.ensure_open()?;
        if name == SYSTEM_DATABASE {
            return Err(CoreError::invalid_operation("cannot drop _system"));
        }
        let state = self.live_database(name)?;

        let mut manifest = self.manifest.lock();
        let mut next = manifest.clone();
        let meta = next
            .databases
            .get_mut(&state.id)
            .ok_or_else(|| CoreError::database_not_found(name))?;
        meta.dropped = true;
        self.dir.save_manifest(&next)?;
        *manifest = next;
        drop(manifest);

        state.dropped.store(true, Ordering::Release);
        for collection in self.catalog.read().collections.values() {
            if collection.database == state.id {
                collection.dropped.store(true, Ordering::Release);
            }
        }
        tracing::info!(id = %state.id, name, "database dropped");
        Ok(())
    }

    pub(crate) fn create_collection(
        &self,
        database: &DatabaseState,
        name: &str,
        options: CollectionOptions,
    ) -> CoreResult<Arc<CollectionState>> {
        self.ensure_open()?;
        validate_collection_name(name, options.is_system)?;

        let mut manifest = self.manifest.lock();
        let live = manifest
            .databases
            .get(&database.id)
            .filter(|db| !db.dropped)
            .ok_or_else(|| CoreError::database_not_found(&database.name))?;
        if live.live_collection(name).is_some() {
            return Err(CoreError::duplicate_name("collection", name));
        }

        let mut next = manifest.clone();
        let id = next.allocate_collection_id();
        self.dir.create_collection_file(database.id, id)?;
        let datafile = match self.dir.open_datafile(database.id, id) {
            Ok(datafile) => datafile,
            Err(err) => {
                let _ = self.dir.remove_collection_file(database.id, id);
                return Err(err);
            }
        };

        let meta = CollectionMeta {
            id,
            name: name.to_string(),
            globally_unique_id: Uuid::new_v4(),
            options,
            count: 0,
            dropped: false,
            indexes: Vec::new(),
        };
        if let Some(db) = next.databases.get_mut(&database.id) {
            db.collections.insert(id, meta.clone());
        }
        if let Err(err) = self.dir.save_manifest(&next) {
            let _ = self.dir.remove_collection_file(database.id, id);
            return Err(err);
        }
        *manifest = next;
        drop(manifest);

        let state = Arc::new(CollectionState::new(
            id,
            database.id,
            meta.name,
            meta.globally_unique_id,
            meta.options,
            datafile,
            0,
        ));
        self.catalog
            .write()
            .collections
            .insert(id, Arc::clone(&state));
        tracing::info!(%id, database = %database.name, name, "collection created");
        Ok(state)
    }

    pub(crate) fn drop_collection(&self, database: &DatabaseState, name: &str) -> CoreResult<()> {
        self.ensure_open()?;
        let state = self.live_collection(database.id, name)?;

        let mut manifest = self.manifest.lock();
        let mut next = manifest.clone();
        let meta = next
            .collection_mut(state.id)
            .ok_or_else(|| CoreError::collection_not_found(name))?;
        meta.dropped = true;
        self.dir.save_manifest(&next)?;
        *manifest = next;
        drop(manifest);

        state.dropped.store(true, Ordering::Release);
        tracing::info!(id = %state.id, name, "collection dropped");
        Ok(())
    }

    /// Removes the files and manifest entries of dropped objects. The
    /// caller holds the collect lock.
    pub(crate) fn cleanup_locked(&self) -> CoreResult<usize> {
        let mut manifest = self.manifest.lock();
        let mut databases = Vec::new();
        let mut collections = Vec::new();
        for db in manifest.databases.values() {
            if db.dropped {
                databases.push(db.id);
                continue;
            }
            collections.extend(
                db.collections
                    .values()
                    .filter(|c| c.dropped)
                    .map(|c| (db.id, c.id)),
            );
        }
        if databases.is_empty() && collections.is_empty() {
            return Ok(0);
        }

        let mut next = manifest.clone();
        for (db, collection) in &collections {
            self.dir.remove_collection_file(*db, *collection)?;
            if let Some(meta) = next.databases.get_mut(db) {
                meta.collections.remove(collection);
            }
        }
        for db in &databases {
            self.dir.remove_database_dir(*db)?;
            next.databases.remove(db);
        }
        self.dir.save_manifest(&next)?;
        *manifest = next;
        drop(manifest);

        let mut catalog = self.catalog.write();
        catalog.collections.retain(|id, state| {
            !databases.contains(&state.database) && !collections.iter().any(|(_, c)| c == id)
        });
        catalog.databases.retain(|id, _| !databases.contains(id));
        drop(catalog);

        let reclaimed = databases.len() + collections.len();
        tracing::info!(
            databases = databases.len(),
            collections = collections.len(),
            "reclaimed dropped objects"
        );
        Ok(reclaimed)
    }

    pub(crate) fn recalculate_count(&self, state: &CollectionState) -> CoreResult<u64> {
        self.ensure_open()?;
        if let Err(err) = self.flush(true) {
            tracing::warn!(error = %err, "collector pass before recount failed");
        }
        let _collect = self.collect_lock.lock();
        let _commit = self.commit_lock.lock();
        let data = state.data.read();
        let datafile = state.datafile.lock();
        let count = CollectionState::count_locked(&data, &datafile);
        let collected = datafile.live_count();
        drop(datafile);
        drop(data);

        let mut manifest = self.manifest.lock();
        let mut next = manifest.clone();
        if let Some(meta) = next.collection_mut(state.id) {
            meta.count = collected;
        }
        self.dir.save_manifest(&next)?;
        *manifest = next;
        drop(manifest);

        let before = state.count.swap(count, Ordering::AcqRel);
        state.collected_count.store(collected, Ordering::Release);
        if before != count {
            tracing::info!(collection = %state.name, before, after = count, "count corrected");
        }
        Ok(count)
    }

    pub(crate) fn ensure_index(
        &self,
        state: &CollectionState,
        spec: &IndexSpec,
    ) -> CoreResult<(IndexDefinition, bool)> {
        self.ensure_open()?;
        spec.validate()?;
        let _commit = self.commit_lock.lock();
        let mut data = state.data.write();
        let existing = data.indexes.definitions();
        if let Some(found) = existing.iter().find(|d| d.matches(spec)) {
            return Ok((found.clone(), false));
        }
        if let Some(name) = &spec.name {
            if existing.iter().any(|d| &d.name == name) {
                return Err(CoreError::duplicate_name("index", name));
            }
        }

        let docs = {
            let datafile = state.datafile.lock();
            CollectionState::scan_locked(&data, &datafile)?
        };
        let mut manifest = self.manifest.lock();
        let mut next = manifest.clone();
        let definition = IndexDefinition::from_spec(next.allocate_index_id(), spec);
        let index = IndexSet::build(definition.clone(), &docs)
            .map_err(|detail| CoreError::unique_violated(&state.name, detail))?;
        next.collection_mut(state.id)
            .ok_or_else(|| CoreError::collection_not_found(&state.name))?
            .indexes
            .push(definition.clone());
        self.dir.save_manifest(&next)?;
        *manifest = next;
        drop(manifest);

        data.indexes.add(index);
        tracing::info!(collection = %state.name, index = %definition.name, kind = definition.kind.name(), "index created");
        Ok((definition, true))
    }

    pub(crate) fn drop_index(&self, state: &CollectionState, name: &str) -> CoreResult<()> {
        self.ensure_open()?;
        if name == "primary" || name == "0" {
            return Err(CoreError::invalid_operation("cannot drop the primary index"));
        }
        let _commit = self.commit_lock.lock();
        let mut data = state.data.write();
        let mut manifest = self.manifest.lock();
        let mut next = manifest.clone();
        let meta = next
            .collection_mut(state.id)
            .ok_or_else(|| CoreError::collection_not_found(&state.name))?;
        let before = meta.indexes.len();
        meta.indexes
            .retain(|d| d.name != name && d.id.as_u64().to_string() != name);
        if meta.indexes.len() == before {
            return Err(CoreError::index_not_found(name));
        }
        self.dir.save_manifest(&next)?;
        *manifest = next;
        data.indexes.remove(name);
        Ok(())
    }
}

/// Handle on a live database.
#[derive(Clone)]
pub struct Database {
    engine: Arc<Engine>,
    state: Arc<DatabaseState>,
}

impl Database {
    pub(crate) fn new(engine: Arc<Engine>, state: Arc<DatabaseState>) -> Self {
        Self { engine, state }
    }

    fn ensure_live(&self) -> CoreResult<()> {
        self.engine.ensure_open()?;
        if self.state.is_dropped() {
            return Err(CoreError::database_not_found(&self.state.name));
        }
        Ok(())
    }

    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Internal id.
    #[must_use]
    pub fn id(&self) -> DatabaseId {
        self.state.id
    }

    /// Creation options.
    #[must_use]
    pub fn options(&self) -> &DatabaseOptions {
        &self.state.options
    }

    /// Creates a collection.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`] if a live collection has the
    /// name, [`CoreError::Validation`] for a bad name, or an I/O error from
    /// datafile creation.
    pub fn create_collection(&self, name: &str, options: CollectionOptions) -> CoreResult<Collection> {
        self.ensure_live()?;
        let state = self.engine.create_collection(&self.state, name, options)?;
        Ok(Collection::new(Arc::clone(&self.engine), state))
    }

    /// Returns a live collection.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`].
    pub fn collection(&self, name: &str) -> CoreResult<Collection> {
        self.ensure_live()?;
        let state = self.engine.live_collection(self.state.id, name)?;
        Ok(Collection::new(Arc::clone(&self.engine), state))
    }

    /// Names of live collections, sorted.
    #[must_use]
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .engine
            .catalog
            .read()
            .collections
            .values()
            .filter(|c| c.database == self.state.id && !c.is_dropped())
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Drops a collection. The name can be reused immediately.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`].
    pub fn drop_collection(&self, name: &str) -> CoreResult<()> {
        self.ensure_live()?;
        self.engine.drop_collection(&self.state, name)
    }

    /// Starts a transaction over the collections named in `options`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`] for an unknown name and
    /// [`CoreError::TransactionAborted`] if a lock is not granted in time.
    pub fn begin(&self, options: TransactionOptions) -> CoreResult<Transaction> {
        self.ensure_live()?;
        let mut collections = Vec::new();
        for (names, mode) in [
            (&options.read, AccessMode::Read),
            (&options.write, AccessMode::Write),
            (&options.exclusive, AccessMode::Exclusive),
        ] {
            for name in names {
                collections.push((self.engine.live_collection(self.state.id, name)?, mode));
            }
        }
        Transaction::begin(Arc::clone(&self.engine), collections, &options)
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.state.id)
            .field("name", &self.state.name)
            .finish()
    }
}

/// Collection properties as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionProperties {
    /// Internal id.
    pub id: CollectionId,
    /// Name.
    pub name: String,
    /// Globally unique id.
    pub globally_unique_id: Uuid,
    /// Sync the WAL on every commit touching this collection.
    pub wait_for_sync: bool,
    /// System collection.
    pub is_system: bool,
    /// Live documents.
    pub count: u64,
}

/// Handle on a live collection.
#[derive(Clone)]
pub struct Collection {
    engine: Arc<Engine>,
    state: Arc<CollectionState>,
}

impl Collection {
    pub(crate) fn new(engine: Arc<Engine>, state: Arc<CollectionState>) -> Self {
        Self { engine, state }
    }

    pub(crate) fn state(&self) -> &Arc<CollectionState> {
        &self.state
    }

    pub(crate) fn ensure_live(&self) -> CoreResult<()> {
        self.engine.ensure_open()?;
        if self.state.is_dropped() {
            return Err(CoreError::collection_not_found(&self.state.name));
        }
        Ok(())
    }

    fn single<T>(&self, op: impl FnOnce(&mut Transaction) -> CoreResult<T>) -> CoreResult<T> {
        self.ensure_live()?;
        let mut txn = Transaction::begin(
            Arc::clone(&self.engine),
            vec![(Arc::clone(&self.state), AccessMode::Write)],
            &TransactionOptions::default(),
        )?;
        let result = op(&mut txn)?;
        txn.commit()?;
        Ok(result)
    }

    /// Name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Internal id.
    #[must_use]
    pub fn id(&self) -> CollectionId {
        self.state.id
    }

    /// Globally unique id.
    #[must_use]
    pub fn globally_unique_id(&self) -> Uuid {
        self.state.globally_unique_id
    }

    /// Live document count as maintained by commits.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.state.count()
    }

    /// Properties.
    #[must_use]
    pub fn properties(&self) -> CollectionProperties {
        CollectionProperties {
            id: self.state.id,
            name: self.state.name.clone(),
            globally_unique_id: self.state.globally_unique_id,
            wait_for_sync: self.state.options.wait_for_sync,
            is_system: self.state.options.is_system,
            count: self.count(),
        }
    }

    /// Inserts a document.
    ///
    /// # Errors
    ///
    /// See [`Transaction::insert`].
    pub fn insert(&self, body: Value) -> CoreResult<DocumentMeta> {
        let name = self.state.name.clone();
        self.single(|txn| txn.insert(&name, body))
    }

    /// Reads a committed document.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] for a malformed key.
    pub fn get(&self, key: &str) -> CoreResult<Option<Document>> {
        self.ensure_live()?;
        validate_key(key)?;
        self.state.read(key)
    }

    /// Merges `patch` into a document.
    ///
    /// # Errors
    ///
    /// See [`Transaction::update`].
    pub fn update(&self, key: &str, patch: Value, if_match: Option<Revision>) -> CoreResult<DocumentMeta> {
        let name = self.state.name.clone();
        self.single(|txn| txn.update(&name, key, patch, if_match))
    }

    /// Replaces a document's body.
    ///
    /// # Errors
    ///
    /// See [`Transaction::replace`].
    pub fn replace(&self, key: &str, body: Value, if_match: Option<Revision>) -> CoreResult<DocumentMeta> {
        let name = self.state.name.clone();
        self.single(|txn| txn.replace(&name, key, body, if_match))
    }

    /// Removes a document.
    ///
    /// # Errors
    ///
    /// See [`Transaction::remove`].
    pub fn remove(&self, key: &str, if_match: Option<Revision>) -> CoreResult<DocumentMeta> {
        let name = self.state.name.clone();
        self.single(|txn| txn.remove(&name, key, if_match))
    }

    /// All committed documents, sorted by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the datafile cannot be read.
    pub fn all(&self) -> CoreResult<Vec<Document>> {
        self.ensure_live()?;
        self.state.scan()
    }

    /// All committed `(key, revision)` pairs, sorted by key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] or [`CoreError::CollectionNotFound`].
    pub fn key_revisions(&self) -> CoreResult<Vec<(String, Revision)>> {
        self.ensure_live()?;
        Ok(self.state.key_revisions())
    }

    /// The committed documents among `keys`, in the order given; missing
    /// keys are left out.
    ///
    /// # Errors
    ///
    /// Returns an error if the datafile cannot be read.
    pub fn documents(&self, keys: &[String]) -> CoreResult<Vec<Document>> {
        self.ensure_live()?;
        let mut docs = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(doc) = self.state.read(key)? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// Recounts the documents and stores the exact figure. Document content
    /// is not touched.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be written.
    pub fn recalculate_count(&self) -> CoreResult<u64> {
        self.ensure_live()?;
        self.engine.recalculate_count(&self.state)
    }

    /// Creates an index unless an identical one exists. Returns the
    /// definition and whether it was created.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] for a bad definition and
    /// [`CoreError::UniqueConstraintViolated`] if existing documents break
    /// a unique index.
    pub fn ensure_index(&self, spec: &IndexSpec) -> CoreResult<(IndexDefinition, bool)> {
        self.ensure_live()?;
        self.engine.ensure_index(&self.state, spec)
    }

    /// Drops an index by name or id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexNotFound`].
    pub fn drop_index(&self, name: &str) -> CoreResult<()> {
        self.ensure_live()?;
        self.engine.drop_index(&self.state, name)
    }

    /// All index definitions, primary first.
    #[must_use]
    pub fn indexes(&self) -> Vec<IndexDefinition> {
        self.state.data.read().indexes.definitions()
    }

    /// Returns true if a maintained index of `kind` covers exactly `fields`.
    #[must_use]
    pub fn has_index(&self, kind: IndexKind, fields: &[&str]) -> bool {
        self.indexes()
            .iter()
            .any(|d| d.kind == kind && d.fields.iter().map(String::as_str).eq(fields.iter().copied()))
    }

    /// Starts a query over committed documents.
    #[must_use]
    pub fn query(&self) -> Query {
        Query::new(self.clone())
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.state.id)
            .field("name", &self.state.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::CatalogService;
    use serde_json::json;

    fn service() -> CatalogService {
        CatalogService::open_in_memory(Config::default().background_collector(false)).unwrap()
    }

    #[test]
    fn duplicate_collection_names_are_rejected() {
        let db = service().system().unwrap();
        db.create_collection("c", CollectionOptions::default()).unwrap();
        assert!(matches!(
            db.create_collection("c", CollectionOptions::default()),
            Err(CoreError::DuplicateName { .. })
        ));
    }

    #[test]
    fn drop_then_recreate_gets_a_fresh_id() {
        let service = service();
        let db = service.system().unwrap();
        let first = db.create_collection("c", CollectionOptions::default()).unwrap();
        first.insert(json!({"_key": "a"})).unwrap();
        db.drop_collection("c").unwrap();
        assert!(matches!(first.get("a"), Err(CoreError::CollectionNotFound { .. })));

        let second = db.create_collection("c", CollectionOptions::default()).unwrap();
        assert!(second.id() > first.id());
        assert_eq!(second.count(), 0);
        assert!(second.get("a").unwrap().is_none());
        assert_eq!(service.run_cleanup().unwrap(), 1);
        assert_eq!(db.collections(), vec!["c".to_string()]);
    }

    #[test]
    fn dropped_database_name_waits_for_reclamation() {
        let service = service();
        service.create_database("shop", DatabaseOptions::default()).unwrap();
        service.drop_database("shop").unwrap();
        assert!(service.database("shop").is_err());
        assert!(matches!(
            service.create_database("shop", DatabaseOptions::default()),
            Err(CoreError::DuplicateName { .. })
        ));
        service.run_cleanup().unwrap();
        service.create_database("shop", DatabaseOptions::default()).unwrap();
    }

    #[test]
    fn system_database_cannot_be_dropped() {
        assert!(service().drop_database(SYSTEM_DATABASE).is_err());
    }

    #[test]
    fn document_crud_with_revisions() {
        let c = service()
            .system()
            .unwrap()
            .create_collection("c", CollectionOptions::default())
            .unwrap();
        let created = c.insert(json!({"_key": "k", "a": {"x": 1}})).unwrap();
        let updated = c.update("k", json!({"a": {"y": 2}}), Some(created.rev)).unwrap();
        assert_eq!(updated.old_rev, Some(created.rev));
        assert!(updated.rev > created.rev);

        let doc = c.get("k").unwrap().unwrap();
        assert_eq!(doc.field("a.x"), Some(json!(1)));
        assert_eq!(doc.field("a.y"), Some(json!(2)));

        assert!(matches!(
            c.replace("k", json!({"b": 1}), Some(created.rev)),
            Err(CoreError::RevisionConflict { .. })
        ));
        c.replace("k", json!({"b": 1}), None).unwrap();
        assert_eq!(c.get("k").unwrap().unwrap().field("a"), None);

        c.remove("k", None).unwrap();
        assert!(c.get("k").unwrap().is_none());
        assert!(matches!(
            c.remove("k", None),
            Err(CoreError::DocumentNotFound { .. })
        ));
        assert_eq!(c.count(), 0);
    }

    #[test]
    fn generated_keys_are_unique() {
        let c = service()
            .system()
            .unwrap()
            .create_collection("c", CollectionOptions::default())
            .unwrap();
        let a = c.insert(json!({})).unwrap();
        let b = c.insert(json!({})).unwrap();
        assert_ne!(a.key, b.key);
        assert!(matches!(
            c.insert(json!({"_key": a.key})),
            Err(CoreError::UniqueConstraintViolated { .. })
        ));
    }

    #[test]
    fn unique_index_is_enforced_on_commit() {
        let c = service()
            .system()
            .unwrap()
            .create_collection("c", CollectionOptions::default())
            .unwrap();
        let (definition, created) = c
            .ensure_index(&IndexSpec::persistent(["email"]).unique(true))
            .unwrap();
        assert!(created);
        let (again, created) = c
            .ensure_index(&IndexSpec::persistent(["email"]).unique(true))
            .unwrap();
        assert!(!created);
        assert_eq!(again.id, definition.id);

        c.insert(json!({"email": "a@b"})).unwrap();
        assert!(matches!(
            c.insert(json!({"email": "a@b"})),
            Err(CoreError::UniqueConstraintViolated { .. })
        ));
        assert_eq!(c.count(), 1);
        assert!(c.has_index(IndexKind::Persistent, &["email"]));
        c.drop_index(&definition.name).unwrap();
        c.insert(json!({"email": "a@b"})).unwrap();
    }

    #[test]
    fn undeclared_write_aborts_the_transaction() {
        let db = service().system().unwrap();
        db.create_collection("a", CollectionOptions::default()).unwrap();
        db.create_collection("b", CollectionOptions::default()).unwrap();
        let mut txn = db.begin(TransactionOptions::new().write(["a"])).unwrap();
        txn.insert("a", json!({"_key": "x"})).unwrap();
        assert!(matches!(
            txn.insert("b", json!({})),
            Err(CoreError::TransactionAborted { .. })
        ));
        assert!(txn.commit().is_err());
        assert!(db.collection("a").unwrap().get("x").unwrap().is_none());
    }

    #[test]
    fn exclusive_lock_times_out_other_writers() {
        let db = service().system().unwrap();
        db.create_collection("c", CollectionOptions::default()).unwrap();
        let _holder = db.begin(TransactionOptions::new().exclusive(["c"])).unwrap();
        let result = db.begin(
            TransactionOptions::new()
                .write(["c"])
                .lock_timeout(std::time::Duration::from_millis(20)),
        );
        assert!(matches!(result, Err(CoreError::TransactionAborted { .. })));
    }

    #[test]
    fn transaction_reads_its_own_writes() {
        let db = service().system().unwrap();
        let c = db.create_collection("c", CollectionOptions::default()).unwrap();
        let mut txn = db.begin(TransactionOptions::new().write(["c"])).unwrap();
        txn.insert("c", json!({"_key": "k", "n": 1})).unwrap();
        assert!(txn.get("c", "k").unwrap().is_some());
        assert!(c.get("k").unwrap().is_none());
        txn.remove("c", "k", None).unwrap();
        assert!(txn.get("c", "k").unwrap().is_none());
        drop(txn);
        assert_eq!(c.count(), 0);
    }
}
