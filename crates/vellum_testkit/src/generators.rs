//! Property-based test generators using proptest.
//!
//! Provides strategies for names, keys, bodies and whole workloads that
//! the engine accepts.

use crate::model::Op;
use proptest::prelude::*;
use serde_json::{Map, Value};
use vellum_core::Body;

/// Strategy for valid collection names.
pub fn collection_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9_-]{0,31}").expect("valid regex")
}

/// Strategy for valid database names other than `_system`.
pub fn database_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,15}").expect("valid regex")
}

/// Strategy for document keys from a small space, so workloads hit the
/// same keys often.
pub fn key_strategy() -> impl Strategy<Value = String> {
    (0u8..24).prop_map(|n| format!("k{n}"))
}

/// Strategy for arbitrary valid keys.
pub fn any_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z0-9_:.@()+,=;$!*'%-]{1,64}").expect("valid regex")
}

fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(Value::from),
        "[a-z ]{0,12}".prop_map(Value::String),
    ]
}

fn value_strategy() -> impl Strategy<Value = Value> {
    scalar_strategy().prop_recursive(2, 12, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-d]", inner, 0..3)
                .prop_map(|m| Value::Object(m.into_iter().collect::<Map<String, Value>>())),
        ]
    })
}

/// Strategy for document bodies: up to five attributes from `a`..`e`.
pub fn body_strategy() -> impl Strategy<Value = Body> {
    prop::collection::btree_map("[a-e]", value_strategy(), 0..5)
        .prop_map(|m| m.into_iter().collect())
}

/// Strategy for one workload step. Collection passes are rare.
pub fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (key_strategy(), body_strategy()).prop_map(|(key, body)| Op::Insert { key, body }),
        2 => (key_strategy(), body_strategy()).prop_map(|(key, patch)| Op::Update { key, patch }),
        2 => (key_strategy(), body_strategy()).prop_map(|(key, body)| Op::Replace { key, body }),
        2 => key_strategy().prop_map(|key| Op::Remove { key }),
        1 => Just(Op::Collect),
    ]
}

/// Strategy for a workload of up to `max_len` steps.
pub fn workload_strategy(max_len: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 1..max_len.max(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;
    use vellum_core::{validate_collection_name, validate_database_name, validate_key};

    proptest! {
        #[test]
        fn generated_names_are_accepted(
            collection in collection_name_strategy(),
            database in database_name_strategy(),
            key in any_key_strategy(),
        ) {
            prop_assert!(validate_collection_name(&collection, false).is_ok());
            prop_assert!(validate_database_name(&database).is_ok());
            prop_assert!(validate_key(&key).is_ok());
        }

        #[test]
        fn bodies_have_no_system_attributes(body in body_strategy()) {
            prop_assert!(body.keys().all(|k| !k.starts_with('_')));
        }
    }

    #[test]
    fn workloads_are_never_empty() {
        let mut runner = TestRunner::default();
        for _ in 0..20 {
            let ops = workload_strategy(10)
                .new_tree(&mut runner)
                .unwrap()
                .current();
            assert!(!ops.is_empty());
            assert!(ops.len() < 10);
        }
    }
}
