//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random documents, names and
//! operation sequences that respect the engine's input rules.

use proptest::prelude::*;
use sealdb_codec::{Document, Value};

/// Strategy for valid group names.
pub fn group_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9_.-]{0,31}").expect("valid regex")
}

/// Strategy for top-level field names. Never produces `_id`.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,11}").expect("valid regex")
}

/// Strategy for scalar values, floats excluding NaN.
pub fn scalar_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        any::<f64>()
            .prop_filter("NaN never equals itself in a model", |f| !f.is_nan())
            .prop_map(Value::Float),
        ".{0,24}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
    ]
}

/// Strategy for arbitrary values, nested up to three levels.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    scalar_value_strategy().prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::vec((field_name_strategy(), inner), 0..6)
                .prop_map(|fields| Value::Map(document_of(fields))),
        ]
    })
}

/// Strategy for documents without an `_id`.
pub fn document_strategy() -> impl Strategy<Value = Document> {
    prop::collection::vec((field_name_strategy(), value_strategy()), 0..8).prop_map(document_of)
}

/// Strategy for documents whose `key` field is drawn from a small pool,
/// so that index collisions are common.
pub fn keyed_document_strategy() -> impl Strategy<Value = Document> {
    (0i64..8, any::<bool>(), value_strategy()).prop_map(|(key, with_key, extra)| {
        let mut doc = Document::new();
        if with_key {
            doc.insert("key", key);
        }
        doc.insert("extra", extra);
        doc
    })
}

/// One step of a randomized workload against a single group.
#[derive(Debug, Clone)]
pub enum GroupOperation {
    /// Insert a new document.
    Insert(Document),
    /// Replace the fields of the `n`-th live document (modulo the count).
    Update(usize, Document),
    /// Delete the `n`-th live document (modulo the count).
    Delete(usize),
    /// Checkpoint the database.
    Checkpoint,
}

/// Strategy for a single workload step, weighted towards writes.
pub fn group_operation_strategy() -> impl Strategy<Value = GroupOperation> {
    prop_oneof![
        4 => keyed_document_strategy().prop_map(GroupOperation::Insert),
        2 => (any::<usize>(), keyed_document_strategy())
            .prop_map(|(n, doc)| GroupOperation::Update(n, doc)),
        2 => any::<usize>().prop_map(GroupOperation::Delete),
        1 => Just(GroupOperation::Checkpoint),
    ]
}

/// Strategy for a workload of up to `max_len` steps.
pub fn group_operations_strategy(max_len: usize) -> impl Strategy<Value = Vec<GroupOperation>> {
    prop::collection::vec(group_operation_strategy(), 1..=max_len)
}

fn document_of(fields: Vec<(String, Value)>) -> Document {
    let mut doc = Document::with_capacity(fields.len());
    for (key, value) in fields {
        doc.insert(key, value);
    }
    doc
}
