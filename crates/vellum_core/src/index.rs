//! Index definitions and in-memory secondary indexes.
//!
//! Every collection has an implicit primary index on `_key`. Persistent,
//! hash and skiplist indexes are maintained in memory and answer equality
//! lookups; they honour `unique` and `sparse`. TTL, geo, fulltext and
//! multi-dimensional (`mdi`, `zkd`) definitions are validated and stored
//! with the collection but not maintained.
//!
//! ## Validation rules
//!
//! | Rule | Applies to |
//! |------|------------|
//! | at least one field, no duplicates, no empty names | all |
//! | `sparse` together with `fieldValueTypes` is rejected | all |
//! | `fieldValueTypes` must be `"double"` and is required | mdi, zkd |
//! | `fieldValueTypes` is rejected | everything else |
//! | exactly one field, `expireAfter` required, not unique | ttl |
//! | one or two fields | geo |
//! | exactly one field | fulltext |
//! | cannot be created | primary |

use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::types::IndexId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Index type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// The implicit `_key` index.
    Primary,
    /// Sorted persistent index.
    Persistent,
    /// Hash index (alias of persistent).
    Hash,
    /// Skiplist index (alias of persistent).
    Skiplist,
    /// Time-to-live index.
    Ttl,
    /// Geo index.
    Geo,
    /// Fulltext index.
    Fulltext,
    /// Multi-dimensional index.
    Mdi,
    /// Legacy name of the multi-dimensional index.
    Zkd,
}

impl IndexKind {
    /// Returns the lowercase type name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Persistent => "persistent",
            Self::Hash => "hash",
            Self::Skiplist => "skiplist",
            Self::Ttl => "ttl",
            Self::Geo => "geo",
            Self::Fulltext => "fulltext",
            Self::Mdi => "mdi",
            Self::Zkd => "zkd",
        }
    }

    /// Parses a type name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "primary" => Self::Primary,
            "persistent" => Self::Persistent,
            "hash" => Self::Hash,
            "skiplist" => Self::Skiplist,
            "ttl" => Self::Ttl,
            "geo" | "geo1" | "geo2" => Self::Geo,
            "fulltext" => Self::Fulltext,
            "mdi" => Self::Mdi,
            "zkd" => Self::Zkd,
            _ => return None,
        })
    }

    /// Returns true for kinds kept up to date on every write.
    #[must_use]
    pub const fn is_maintained(self) -> bool {
        matches!(self, Self::Persistent | Self::Hash | Self::Skiplist)
    }

    const fn is_multi_dimensional(self) -> bool {
        matches!(self, Self::Mdi | Self::Zkd)
    }
}

/// A request to create an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    /// Index type.
    #[serde(rename = "type")]
    pub kind: IndexKind,
    /// Indexed attribute paths.
    pub fields: Vec<String>,
    /// Reject two documents with equal indexed values.
    #[serde(default)]
    pub unique: bool,
    /// Skip documents where an indexed attribute is missing or null.
    #[serde(default)]
    pub sparse: bool,
    /// Value type of multi-dimensional indexes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_value_types: Option<String>,
    /// Optional index name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// TTL expiry in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after: Option<u64>,
}

impl IndexSpec {
    /// Creates a spec of `kind` over `fields`.
    #[must_use]
    pub fn new<I, S>(kind: IndexKind, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
            sparse: false,
            field_value_types: None,
            name: None,
            expire_after: None,
        }
    }

    /// Creates a persistent index spec.
    #[must_use]
    pub fn persistent<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(IndexKind::Persistent, fields)
    }

    /// Sets `unique`.
    #[must_use]
    pub fn unique(mut self, value: bool) -> Self {
        self.unique = value;
        self
    }

    /// Sets `sparse`.
    #[must_use]
    pub fn sparse(mut self, value: bool) -> Self {
        self.sparse = value;
        self
    }

    /// Sets `fieldValueTypes`.
    #[must_use]
    pub fn field_value_types(mut self, value: impl Into<String>) -> Self {
        self.field_value_types = Some(value.into());
        self
    }

    /// Sets the index name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = Some(value.into());
        self
    }

    /// Sets `expireAfter`.
    #[must_use]
    pub fn expire_after(mut self, seconds: u64) -> Self {
        self.expire_after = Some(seconds);
        self
    }

    /// Checks the definition against the rules in the module docs.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] describing the first broken rule.
    pub fn validate(&self) -> CoreResult<()> {
        let kind = self.kind.name();
        if self.kind == IndexKind::Primary {
            return Err(CoreError::validation("cannot create another primary index"));
        }
        if self.fields.is_empty() {
            return Err(CoreError::validation(format!(
                "{kind} index needs at least one field"
            )));
        }
        if self.fields.iter().any(String::is_empty) {
            return Err(CoreError::validation("index field names must not be empty"));
        }
        let distinct: HashSet<&String> = self.fields.iter().collect();
        if distinct.len() != self.fields.len() {
            return Err(CoreError::validation("duplicate attribute name in index fields"));
        }
        if self.sparse && self.field_value_types.is_some() {
            return Err(CoreError::validation(
                "sparse indexes do not support fieldValueTypes",
            ));
        }

        if self.kind.is_multi_dimensional() {
            match self.field_value_types.as_deref() {
                Some("double") => {}
                Some(other) => {
                    return Err(CoreError::validation(format!(
                        "{kind} index only supports fieldValueTypes \"double\", got \"{other}\""
                    )))
                }
                None => {
                    return Err(CoreError::validation(format!(
                        "{kind} index requires fieldValueTypes \"double\""
                    )))
                }
            }
        } else if self.field_value_types.is_some() {
            return Err(CoreError::validation(format!(
                "fieldValueTypes is not supported by {kind} indexes"
            )));
        }

        match self.kind {
            IndexKind::Ttl => {
                if self.fields.len() != 1 {
                    return Err(CoreError::validation("ttl index takes exactly one field"));
                }
                if self.unique {
                    return Err(CoreError::validation("ttl index cannot be unique"));
                }
                if self.expire_after.is_none() {
                    return Err(CoreError::validation("ttl index requires expireAfter"));
                }
            }
            IndexKind::Geo if self.fields.len() > 2 => {
                return Err(CoreError::validation("geo index takes one or two fields"));
            }
            IndexKind::Fulltext if self.fields.len() != 1 => {
                return Err(CoreError::validation(
                    "fulltext index takes exactly one field",
                ));
            }
            _ => {}
        }
        if self.expire_after.is_some() && self.kind != IndexKind::Ttl {
            return Err(CoreError::validation(
                "expireAfter is only supported by ttl indexes",
            ));
        }
        Ok(())
    }
}

/// A stored index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    /// Index id.
    pub id: IndexId,
    /// Index name.
    pub name: String,
    /// Index type.
    #[serde(rename = "type")]
    pub kind: IndexKind,
    /// Indexed attribute paths.
    pub fields: Vec<String>,
    /// Uniqueness.
    pub unique: bool,
    /// Sparseness.
    pub sparse: bool,
    /// Value type of multi-dimensional indexes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_value_types: Option<String>,
    /// TTL expiry in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after: Option<u64>,
}

impl IndexDefinition {
    /// The implicit primary index.
    #[must_use]
    pub fn primary() -> Self {
        Self {
            id: IndexId::new(0),
            name: "primary".into(),
            kind: IndexKind::Primary,
            fields: vec!["_key".into()],
            unique: true,
            sparse: false,
            field_value_types: None,
            expire_after: None,
        }
    }

    /// Builds a definition from a validated spec.
    #[must_use]
    pub fn from_spec(id: IndexId, spec: &IndexSpec) -> Self {
        Self {
            id,
            name: spec
                .name
                .clone()
                .unwrap_or_else(|| format!("idx_{}", id.as_u64())),
            kind: spec.kind,
            fields: spec.fields.clone(),
            unique: spec.unique,
            sparse: spec.sparse,
            field_value_types: spec.field_value_types.clone(),
            expire_after: spec.expire_after,
        }
    }

    /// Returns true if `spec` describes this index (ignoring the name).
    #[must_use]
    pub fn matches(&self, spec: &IndexSpec) -> bool {
        self.kind == spec.kind
            && self.fields == spec.fields
            && self.unique == spec.unique
            && self.sparse == spec.sparse
            && self.field_value_types == spec.field_value_types
            && self.expire_after == spec.expire_after
    }
}

/// One maintained secondary index.
#[derive(Debug, Clone)]
pub struct SecondaryIndex {
    definition: IndexDefinition,
    entries: BTreeMap<Vec<String>, BTreeSet<String>>,
}

fn canonical(value: &Value) -> String {
    value.to_string()
}

impl SecondaryIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(definition: IndexDefinition) -> Self {
        Self {
            definition,
            entries: BTreeMap::new(),
        }
    }

    /// Returns the definition.
    #[must_use]
    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    fn index_key(&self, doc: &Document) -> Option<Vec<String>> {
        let mut key = Vec::with_capacity(self.definition.fields.len());
        for field in &self.definition.fields {
            let value = doc.field(field).unwrap_or(Value::Null);
            if self.definition.sparse && value.is_null() {
                return None;
            }
            key.push(canonical(&value));
        }
        Some(key)
    }

    fn insert(&mut self, key: &str, doc: &Document) -> Result<(), String> {
        let Some(index_key) = self.index_key(doc) else {
            return Ok(());
        };
        let holders = self.entries.entry(index_key).or_default();
        if self.definition.unique && holders.iter().any(|holder| holder != key) {
            return Err(format!(
                "unique index '{}' already holds this value",
                self.definition.name
            ));
        }
        holders.insert(key.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str, doc: &Document) {
        let Some(index_key) = self.index_key(doc) else {
            return;
        };
        if let Some(holders) = self.entries.get_mut(&index_key) {
            holders.remove(key);
            if holders.is_empty() {
                self.entries.remove(&index_key);
            }
        }
    }

    /// Returns the keys of documents whose indexed values equal `values`.
    #[must_use]
    pub fn lookup(&self, values: &[Value]) -> Vec<String> {
        let index_key: Vec<String> = values.iter().map(canonical).collect();
        self.entries
            .get(&index_key)
            .map(|holders| holders.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of indexed documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    /// Returns true if nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The secondary indexes of one collection.
#[derive(Debug, Clone, Default)]
pub struct IndexSet {
    indexes: Vec<SecondaryIndex>,
    /// Definitions that are stored but not maintained.
    passive: Vec<IndexDefinition>,
}

impl IndexSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an index. Maintained kinds must be filled by the caller.
    pub fn add(&mut self, index: SecondaryIndex) {
        if index.definition.kind.is_maintained() {
            self.indexes.push(index);
        } else {
            self.passive.push(index.definition);
        }
    }

    /// Builds a maintained index over `docs`.
    ///
    /// # Errors
    ///
    /// Returns the conflict detail if a unique index finds duplicates.
    pub fn build<'a>(
        definition: IndexDefinition,
        docs: impl IntoIterator<Item = &'a Document>,
    ) -> Result<SecondaryIndex, String> {
        let mut index = SecondaryIndex::new(definition);
        if index.definition.kind.is_maintained() {
            for doc in docs {
                index.insert(&doc.key, doc)?;
            }
        }
        Ok(index)
    }

    /// Returns all definitions, primary first.
    #[must_use]
    pub fn definitions(&self) -> Vec<IndexDefinition> {
        let mut all = vec![IndexDefinition::primary()];
        all.extend(self.indexes.iter().map(|i| i.definition.clone()));
        all.extend(self.passive.iter().cloned());
        all.sort_by_key(|d| d.id);
        all
    }

    /// Removes the index called `name` (or with that numeric id).
    pub fn remove(&mut self, name: &str) -> Option<IndexDefinition> {
        let matches = |d: &IndexDefinition| d.name == name || d.id.as_u64().to_string() == name;
        if let Some(pos) = self.indexes.iter().position(|i| matches(&i.definition)) {
            return Some(self.indexes.remove(pos).definition);
        }
        let pos = self.passive.iter().position(matches)?;
        Some(self.passive.remove(pos))
    }

    /// Finds a maintained index by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&SecondaryIndex> {
        self.indexes.iter().find(|i| i.definition.name == name)
    }

    /// Finds a maintained index whose fields are all in `fields`.
    #[must_use]
    pub fn covering(&self, fields: &[&str]) -> Option<&SecondaryIndex> {
        self.indexes
            .iter()
            .filter(|i| {
                !i.definition.sparse
                    && i.definition
                        .fields
                        .iter()
                        .all(|f| fields.contains(&f.as_str()))
            })
            .max_by_key(|i| i.definition.fields.len())
    }

    /// Moves a document from `old` to `new` in every index. On a unique
    /// conflict nothing changes.
    ///
    /// # Errors
    ///
    /// Returns the conflict detail.
    pub fn update(
        &mut self,
        key: &str,
        old: Option<&Document>,
        new: Option<&Document>,
    ) -> Result<(), String> {
        for i in 0..self.indexes.len() {
            let index = &mut self.indexes[i];
            if let Some(old) = old {
                index.remove(key, old);
            }
            if let Some(new) = new {
                if let Err(detail) = index.insert(key, new) {
                    if let Some(old) = old {
                        let _ = index.insert(key, old);
                    }
                    for done in &mut self.indexes[..i] {
                        done.remove(key, new);
                        if let Some(old) = old {
                            let _ = done.insert(key, old);
                        }
                    }
                    return Err(detail);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::split_body;
    use crate::types::Revision;
    use serde_json::json;

    fn doc(key: &str, value: Value) -> Document {
        let (_, body) = split_body(value).unwrap();
        Document::new(key, Revision::new(1), body)
    }

    fn definition(spec: &IndexSpec) -> IndexDefinition {
        IndexDefinition::from_spec(IndexId::new(5), spec)
    }

    #[test]
    fn sparse_with_field_value_types_is_always_rejected() {
        for kind in [
            IndexKind::Mdi,
            IndexKind::Zkd,
            IndexKind::Persistent,
            IndexKind::Hash,
        ] {
            let spec = IndexSpec::new(kind, ["x", "y"])
                .sparse(true)
                .field_value_types("double");
            assert!(
                matches!(spec.validate(), Err(CoreError::Validation { .. })),
                "{kind:?}"
            );
        }
    }

    #[test]
    fn multi_dimensional_requires_double() {
        assert!(IndexSpec::new(IndexKind::Mdi, ["x", "y"])
            .field_value_types("double")
            .validate()
            .is_ok());
        assert!(IndexSpec::new(IndexKind::Zkd, ["x", "y"])
            .validate()
            .is_err());
        assert!(IndexSpec::new(IndexKind::Mdi, ["x"])
            .field_value_types("string")
            .validate()
            .is_err());
        assert!(IndexSpec::persistent(["x"])
            .field_value_types("double")
            .validate()
            .is_err());
    }

    #[test]
    fn shape_rules() {
        assert!(IndexSpec::persistent(Vec::<String>::new()).validate().is_err());
        assert!(IndexSpec::persistent(["a", "a"]).validate().is_err());
        assert!(IndexSpec::new(IndexKind::Ttl, ["at"]).validate().is_err());
        assert!(IndexSpec::new(IndexKind::Ttl, ["at"])
            .expire_after(60)
            .validate()
            .is_ok());
        assert!(IndexSpec::new(IndexKind::Ttl, ["a", "b"])
            .expire_after(60)
            .validate()
            .is_err());
        assert!(IndexSpec::new(IndexKind::Geo, ["a", "b", "c"])
            .validate()
            .is_err());
        assert!(IndexSpec::new(IndexKind::Fulltext, ["a", "b"])
            .validate()
            .is_err());
        assert!(IndexSpec::new(IndexKind::Primary, ["_key"])
            .validate()
            .is_err());
    }

    #[test]
    fn kind_names_parse_back() {
        for kind in [
            IndexKind::Persistent,
            IndexKind::Hash,
            IndexKind::Skiplist,
            IndexKind::Ttl,
            IndexKind::Geo,
            IndexKind::Fulltext,
            IndexKind::Mdi,
            IndexKind::Zkd,
        ] {
            assert_eq!(IndexKind::parse(kind.name()), Some(kind));
        }
        assert_eq!(IndexKind::parse("inverted"), None);
    }

    #[test]
    fn unique_index_rejects_duplicates_and_rolls_back() {
        let spec = IndexSpec::persistent(["email"]).unique(true);
        let mut set = IndexSet::new();
        set.add(SecondaryIndex::new(definition(&spec)));

        let a = doc("a", json!({"email": "x@y"}));
        let b = doc("b", json!({"email": "x@y"}));
        set.update("a", None, Some(&a)).unwrap();
        assert!(set.update("b", None, Some(&b)).is_err());

        let index = set.find("idx_5").unwrap();
        assert_eq!(index.lookup(&[json!("x@y")]), vec!["a".to_string()]);

        set.update("a", Some(&a), None).unwrap();
        set.update("b", None, Some(&b)).unwrap();
        assert_eq!(
            set.find("idx_5").unwrap().lookup(&[json!("x@y")]),
            vec!["b".to_string()]
        );
    }

    #[test]
    fn failed_update_restores_earlier_indexes() {
        let mut set = IndexSet::new();
        set.add(SecondaryIndex::new(IndexDefinition::from_spec(
            IndexId::new(1),
            &IndexSpec::persistent(["group"]),
        )));
        set.add(SecondaryIndex::new(IndexDefinition::from_spec(
            IndexId::new(2),
            &IndexSpec::persistent(["email"]).unique(true),
        )));

        let a = doc("a", json!({"group": 1, "email": "x@y"}));
        let b = doc("b", json!({"group": 1, "email": "z@y"}));
        set.update("a", None, Some(&a)).unwrap();
        set.update("b", None, Some(&b)).unwrap();

        let moved = doc("b", json!({"group": 2, "email": "x@y"}));
        assert!(set.update("b", Some(&b), Some(&moved)).is_err());

        let groups = set.find("idx_1").unwrap();
        assert_eq!(
            groups.lookup(&[json!(1)]),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(groups.lookup(&[json!(2)]).is_empty());
        let emails = set.find("idx_2").unwrap();
        assert_eq!(emails.lookup(&[json!("z@y")]), vec!["b".to_string()]);
        assert_eq!(emails.lookup(&[json!("x@y")]), vec!["a".to_string()]);
    }

    #[test]
    fn sparse_index_skips_missing_values() {
        let spec = IndexSpec::persistent(["tag"]).unique(true).sparse(true);
        let mut set = IndexSet::new();
        set.add(SecondaryIndex::new(definition(&spec)));
        set.update("a", None, Some(&doc("a", json!({})))).unwrap();
        set.update("b", None, Some(&doc("b", json!({"tag": null}))))
            .unwrap();
        assert!(set.find("idx_5").unwrap().is_empty());
    }

    #[test]
    fn non_sparse_index_holds_nulls() {
        let spec = IndexSpec::persistent(["tag"]);
        let mut set = IndexSet::new();
        set.add(SecondaryIndex::new(definition(&spec)));
        set.update("a", None, Some(&doc("a", json!({})))).unwrap();
        let index = set.find("idx_5").unwrap();
        assert_eq!(index.lookup(&[Value::Null]), vec!["a".to_string()]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn build_detects_existing_duplicates() {
        let docs = vec![doc("a", json!({"n": 1})), doc("b", json!({"n": 1}))];
        let spec = IndexSpec::persistent(["n"]).unique(true);
        assert!(IndexSet::build(definition(&spec), &docs).is_err());
        let spec = IndexSpec::persistent(["n"]);
        let index = IndexSet::build(definition(&spec), &docs).unwrap();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn passive_definitions_are_listed() {
        let spec = IndexSpec::new(IndexKind::Geo, ["loc"]);
        let mut set = IndexSet::new();
        set.add(SecondaryIndex::new(definition(&spec)));
        let kinds: Vec<IndexKind> = set.definitions().iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![IndexKind::Primary, IndexKind::Geo]);
        assert!(set.remove("idx_5").is_some());
        assert_eq!(set.definitions().len(), 1);
    }
}
