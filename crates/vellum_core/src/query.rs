//! Equality queries over committed documents.
//!
//! ```rust,ignore
//! let cheap = products
//!     .query()
//!     .filter_eq("category", json!("tools"))
//!     .sort_by("price", true)
//!     .limit(10)
//!     .execute()?;
//! ```
//!
//! When a maintained, non-sparse index covers some of the filtered fields
//! the candidates come from that index; the remaining filters are checked
//! on each candidate.

use crate::catalog::Collection;
use crate::collection::CollectionState;
use crate::document::Document;
use crate::error::CoreResult;
use serde_json::Value;
use std::cmp::Ordering;

/// A query under construction.
#[derive(Debug, Clone)]
pub struct Query {
    collection: Collection,
    filters: Vec<(String, Value)>,
    sort: Option<(String, bool)>,
    skip: usize,
    limit: Option<usize>,
}

impl Query {
    pub(crate) fn new(collection: Collection) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            sort: None,
            skip: 0,
            limit: None,
        }
    }

    /// Keeps documents whose `field` (a dotted path) equals `value`. A
    /// missing field equals `null`.
    #[must_use]
    pub fn filter_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push((field.into(), value));
        self
    }

    /// Orders by `field`. Without a sort, results come in key order.
    #[must_use]
    pub fn sort_by(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.sort = Some((field.into(), ascending));
        self
    }

    /// Skips the first `n` results.
    #[must_use]
    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Returns at most `n` results.
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    fn matches(&self, doc: &Document) -> bool {
        self.filters
            .iter()
            .all(|(field, value)| doc.field(field).unwrap_or(Value::Null) == *value)
    }

    fn candidates(&self, state: &CollectionState) -> CoreResult<Vec<Document>> {
        let data = state.data.read();
        let datafile = state.datafile.lock();
        let fields: Vec<&str> = self.filters.iter().map(|(f, _)| f.as_str()).collect();
        let Some(index) = data.indexes.covering(&fields) else {
            return CollectionState::scan_locked(&data, &datafile);
        };

        let values: Vec<Value> = index
            .definition()
            .fields
            .iter()
            .filter_map(|field| {
                self.filters
                    .iter()
                    .find(|(f, _)| f == field)
                    .map(|(_, v)| v.clone())
            })
            .collect();
        tracing::trace!(index = %index.definition().name, "query uses index");
        let mut docs = Vec::new();
        for key in index.lookup(&values) {
            if let Some(doc) = CollectionState::lookup(&data, &datafile, &key)? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// Runs the query.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::CollectionNotFound`] if the collection
    /// was dropped, or an error reading the datafile.
    pub fn execute(&self) -> CoreResult<Vec<Document>> {
        self.collection.ensure_live()?;
        let mut docs: Vec<Document> = self
            .candidates(self.collection.state())?
            .into_iter()
            .filter(|doc| self.matches(doc))
            .collect();
        if let Some((field, ascending)) = &self.sort {
            docs.sort_by(|a, b| {
                let ord = compare_values(
                    &a.field(field).unwrap_or(Value::Null),
                    &b.field(field).unwrap_or(Value::Null),
                )
                .then_with(|| a.key.cmp(&b.key));
                if *ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        } else {
            docs.sort_by(|a, b| a.key.cmp(&b.key));
        }
        let docs = docs.into_iter().skip(self.skip);
        Ok(match self.limit {
            Some(limit) => docs.take(limit).collect(),
            None => docs.collect(),
        })
    }

    /// Number of matching documents, ignoring skip and limit.
    ///
    /// # Errors
    ///
    /// Same as [`Query::execute`].
    pub fn count(&self) -> CoreResult<usize> {
        let mut all = self.clone();
        all.skip = 0;
        all.limit = None;
        all.sort = None;
        Ok(all.execute()?.len())
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: null < bool < number < string < array <
/// object, then by value within a type.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            let mut left: Vec<_> = x.iter().collect();
            let mut right: Vec<_> = y.iter().collect();
            left.sort_by(|l, r| l.0.cmp(r.0));
            right.sort_by(|l, r| l.0.cmp(r.0));
            for ((lk, lv), (rk, rv)) in left.iter().zip(&right) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            left.len().cmp(&right.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CollectionOptions, Config};
    use crate::engine::CatalogService;
    use crate::index::IndexSpec;
    use serde_json::json;

    fn products() -> (CatalogService, Collection) {
        let service =
            CatalogService::open_in_memory(Config::default().background_collector(false)).unwrap();
        let c = service
            .system()
            .unwrap()
            .create_collection("products", CollectionOptions::default())
            .unwrap();
        for (key, category, price) in [
            ("a", "tools", 30),
            ("b", "garden", 5),
            ("c", "tools", 10),
            ("d", "tools", 20),
        ] {
            c.insert(json!({"_key": key, "category": category, "price": price}))
                .unwrap();
        }
        (service, c)
    }

    fn keys(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(|d| d.key.as_str()).collect()
    }

    #[test]
    fn filter_sort_and_page() {
        let (_service, c) = products();
        let q = c
            .query()
            .filter_eq("category", json!("tools"))
            .sort_by("price", true);
        assert_eq!(keys(&q.execute().unwrap()), vec!["c", "d", "a"]);
        assert_eq!(keys(&q.clone().skip(1).limit(1).execute().unwrap()), vec!["d"]);
        assert_eq!(q.clone().limit(1).count().unwrap(), 3);
    }

    #[test]
    fn indexed_and_scanned_results_agree() {
        let (service, c) = products();
        let scanned = c.query().filter_eq("category", json!("tools")).execute().unwrap();
        c.ensure_index(&IndexSpec::persistent(["category"])).unwrap();
        service.flush_wal(true).unwrap();
        let indexed = c.query().filter_eq("category", json!("tools")).execute().unwrap();
        assert_eq!(keys(&scanned), keys(&indexed));
        c.remove("a", None).unwrap();
        assert_eq!(
            keys(&c.query().filter_eq("category", json!("tools")).execute().unwrap()),
            vec!["c", "d"]
        );
    }

    #[test]
    fn values_order_by_type_first() {
        let ordered = [
            json!(null),
            json!(false),
            json!(true),
            json!(-1.5),
            json!(2),
            json!(""),
            json!("a"),
            json!([]),
            json!([1]),
            json!({}),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(compare_values(&pair[0], &pair[1]), Ordering::Less, "{pair:?}");
        }
    }
}
