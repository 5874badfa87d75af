//! A reference model of one collection.
//!
//! The model is a sorted map from key to body. Running a workload against
//! both the model and a real collection and comparing the results checks
//! the engine's document semantics; comparing after a crash checks that
//! recovery restored exactly the committed state.

use serde_json::Value;
use std::collections::BTreeMap;
use vellum_core::{merge_patch, Body, CatalogService, Collection, CoreError};

/// One step of a workload.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Insert with an explicit key.
    Insert {
        /// Key.
        key: String,
        /// Body.
        body: Body,
    },
    /// Merge a patch into an existing document.
    Update {
        /// Key.
        key: String,
        /// Patch.
        patch: Body,
    },
    /// Replace an existing document's body.
    Replace {
        /// Key.
        key: String,
        /// New body.
        body: Body,
    },
    /// Remove an existing document.
    Remove {
        /// Key.
        key: String,
    },
    /// Run a collector pass.
    Collect,
}

impl Op {
    /// The key touched, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Op::Insert { key, .. }
            | Op::Update { key, .. }
            | Op::Replace { key, .. }
            | Op::Remove { key } => Some(key),
            Op::Collect => None,
        }
    }
}

/// Expected committed state of a collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceModel {
    docs: BTreeMap<String, Body>,
}

impl ReferenceModel {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Returns true if the model holds no documents.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Body stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Body> {
        self.docs.get(key)
    }

    /// Applies `op` to the model. Returns whether the engine should accept
    /// it: inserts need a free key, the other writes an existing one.
    pub fn apply(&mut self, op: &Op) -> bool {
        match op {
            Op::Insert { key, body } => {
                if self.docs.contains_key(key) {
                    return false;
                }
                self.docs.insert(key.clone(), body.clone());
                true
            }
            Op::Update { key, patch } => match self.docs.get_mut(key) {
                Some(body) => {
                    merge_patch(body, patch.clone());
                    true
                }
                None => false,
            },
            Op::Replace { key, body } => match self.docs.get_mut(key) {
                Some(existing) => {
                    *existing = body.clone();
                    true
                }
                None => false,
            },
            Op::Remove { key } => self.docs.remove(key).is_some(),
            Op::Collect => true,
        }
    }

    /// Runs `op` against the engine and the model.
    ///
    /// # Errors
    ///
    /// Describes the mismatch if the engine accepted what the model
    /// rejected, or the other way round, or failed with an unexpected
    /// error.
    pub fn execute(
        &mut self,
        op: &Op,
        service: &CatalogService,
        collection: &Collection,
    ) -> Result<(), String> {
        let expected = self.apply(op);
        let outcome = match op {
            Op::Insert { key, body } => {
                let mut object = body.clone();
                object.insert("_key".into(), Value::String(key.clone()));
                collection.insert(Value::Object(object)).map(drop)
            }
            Op::Update { key, patch } => collection
                .update(key, Value::Object(patch.clone()), None)
                .map(drop),
            Op::Replace { key, body } => collection
                .replace(key, Value::Object(body.clone()), None)
                .map(drop),
            Op::Remove { key } => collection.remove(key, None).map(drop),
            Op::Collect => service.flush_wal(true).map(drop),
        };

        match (expected, outcome) {
            (true, Ok(())) => Ok(()),
            (false, Err(CoreError::UniqueConstraintViolated { .. }))
            | (false, Err(CoreError::DocumentNotFound { .. })) => Ok(()),
            (true, Err(err)) => Err(format!("{op:?} failed: {err}")),
            (false, Ok(())) => Err(format!("{op:?} succeeded but should have failed")),
            (false, Err(err)) => Err(format!("{op:?} failed with the wrong error: {err}")),
        }
    }

    /// Compares the model with the collection's committed documents and
    /// its count.
    ///
    /// # Errors
    ///
    /// Describes the first difference found.
    pub fn verify(&self, collection: &Collection) -> Result<(), String> {
        let docs = collection.all().map_err(|e| e.to_string())?;
        let stored: BTreeMap<String, Body> =
            docs.into_iter().map(|doc| (doc.key, doc.body)).collect();

        if stored.len() != self.docs.len() {
            return Err(format!(
                "expected {} documents, found {}",
                self.docs.len(),
                stored.len()
            ));
        }
        for (key, body) in &self.docs {
            match stored.get(key) {
                None => return Err(format!("document {key} is missing")),
                Some(found) if found != body => {
                    return Err(format!("document {key}: expected {body:?}, found {found:?}"))
                }
                Some(_) => {}
            }
        }
        let count = collection.count();
        if count != self.docs.len() as u64 {
            return Err(format!(
                "count() is {count}, expected {}",
                self.docs.len()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestEngine;
    use serde_json::json;

    fn body(value: Value) -> Body {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn model_rejects_what_the_engine_rejects() {
        let mut model = ReferenceModel::new();
        assert!(model.apply(&Op::Insert {
            key: "a".into(),
            body: body(json!({"x": 1}))
        }));
        assert!(!model.apply(&Op::Insert {
            key: "a".into(),
            body: body(json!({}))
        }));
        assert!(!model.apply(&Op::Remove { key: "b".into() }));
        assert!(model.apply(&Op::Update {
            key: "a".into(),
            patch: body(json!({"y": {"z": 2}}))
        }));
        assert_eq!(model.get("a"), Some(&body(json!({"x": 1, "y": {"z": 2}}))));
    }

    #[test]
    fn engine_matches_model_on_a_fixed_workload() {
        let engine = TestEngine::memory();
        let c = engine.collection("c");
        let mut model = ReferenceModel::new();
        let ops = vec![
            Op::Insert {
                key: "a".into(),
                body: body(json!({"n": 1})),
            },
            Op::Insert {
                key: "a".into(),
                body: body(json!({"n": 2})),
            },
            Op::Update {
                key: "a".into(),
                patch: body(json!({"m": true})),
            },
            Op::Collect,
            Op::Replace {
                key: "b".into(),
                body: body(json!({})),
            },
            Op::Insert {
                key: "b".into(),
                body: body(json!({"s": "x"})),
            },
            Op::Remove { key: "a".into() },
        ];
        for op in &ops {
            model.execute(op, &engine.service, &c).unwrap();
        }
        model.verify(&c).unwrap();
        assert_eq!(model.len(), 1);
        assert_eq!(ops[0].key(), Some("a"));
        assert_eq!(Op::Collect.key(), None);
    }

    #[test]
    fn verify_reports_a_missing_document() {
        let engine = TestEngine::memory();
        let c = engine.collection("c");
        let mut model = ReferenceModel::new();
        model.apply(&Op::Insert {
            key: "ghost".into(),
            body: Body::new(),
        });
        let err = model.verify(&c).unwrap_err();
        assert!(err.contains("expected 1 documents"), "{err}");
    }
}
