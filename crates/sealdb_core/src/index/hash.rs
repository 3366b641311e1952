//! Hash index over one field path.

use crate::id::DocumentId;
use sealdb_codec::{to_bytes, Document, Value};
use std::collections::{HashMap, HashSet};

/// Returns the index key for `field` of `doc`, or `None` when the field is
/// missing or null. Such documents are not indexed and never conflict.
#[must_use]
pub fn index_key(doc: &Document, field: &str) -> Option<Vec<u8>> {
    doc.get_path(field).and_then(value_key)
}

/// Returns the index key of a single value, or `None` for null.
#[must_use]
pub fn value_key(value: &Value) -> Option<Vec<u8>> {
    (!value.is_null()).then(|| to_bytes(value))
}

/// Hash-based index for O(1) equality lookups.
///
/// Keys are the canonical encoding of the field value, so values compare
/// the way the codec writes them: `1` and `1.0` are different keys.
/// A reverse map from document to key makes removal independent of the
/// document's old contents.
#[derive(Debug, Clone)]
pub struct HashIndex {
    field: String,
    unique: bool,
    entries: HashMap<Vec<u8>, HashSet<DocumentId>>,
    by_doc: HashMap<DocumentId, Vec<u8>>,
}

impl HashIndex {
    /// Creates an empty index on `field`.
    pub fn new(field: impl Into<String>, unique: bool) -> Self {
        Self {
            field: field.into(),
            unique,
            entries: HashMap::new(),
            by_doc: HashMap::new(),
        }
    }

    /// The indexed field path.
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Whether the index enforces uniqueness.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Returns a document other than `id` already holding `key`.
    #[must_use]
    pub fn holder_other_than(&self, key: &[u8], id: &DocumentId) -> Option<DocumentId> {
        self.entries
            .get(key)
            .and_then(|set| set.iter().find(|holder| *holder != id).copied())
    }

    /// Indexes `doc` under `id`, replacing whatever `id` was indexed under.
    ///
    /// Uniqueness is the caller's responsibility.
    pub fn insert(&mut self, id: DocumentId, doc: &Document) {
        self.remove(&id);
        if let Some(key) = index_key(doc, &self.field) {
            self.entries.entry(key.clone()).or_default().insert(id);
            self.by_doc.insert(id, key);
        }
    }

    /// Removes `id` from the index. Returns `true` if it was indexed.
    pub fn remove(&mut self, id: &DocumentId) -> bool {
        let Some(key) = self.by_doc.remove(id) else {
            return false;
        };
        if let Some(set) = self.entries.get_mut(&key) {
            set.remove(id);
            if set.is_empty() {
                self.entries.remove(&key);
            }
        }
        true
    }

    /// Documents whose field equals `value`.
    #[must_use]
    pub fn lookup(&self, value: &Value) -> Option<&HashSet<DocumentId>> {
        self.lookup_key(&value_key(value)?)
    }

    /// Documents whose field encodes to `key`.
    #[must_use]
    pub fn lookup_key(&self, key: &[u8]) -> Option<&HashSet<DocumentId>> {
        self.entries.get(key)
    }

    /// Number of indexed documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_doc.len()
    }

    /// Returns `true` if nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_doc.is_empty()
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealdb_codec::doc;

    #[test]
    fn insert_and_lookup() {
        let mut index = HashIndex::new("name", false);
        let id = DocumentId::new();
        index.insert(id, &doc! { "name" => "alice" });

        let found = index.lookup(&Value::from("alice")).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains(&id));
        assert!(index.lookup(&Value::from("bob")).is_none());
    }

    #[test]
    fn reinsert_moves_the_document() {
        let mut index = HashIndex::new("role", false);
        let id = DocumentId::new();
        index.insert(id, &doc! { "role" => "dev" });
        index.insert(id, &doc! { "role" => "admin" });

        assert!(index.lookup(&Value::from("dev")).is_none());
        assert!(index.lookup(&Value::from("admin")).unwrap().contains(&id));
        assert_eq!(index.len(), 1);
        assert_eq!(index.key_count(), 1);
    }

    #[test]
    fn missing_and_null_are_not_indexed() {
        let mut index = HashIndex::new("email", true);
        index.insert(DocumentId::new(), &doc! { "name" => "a" });
        index.insert(DocumentId::new(), &doc! { "email" => Value::Null });
        assert!(index.is_empty());
        assert!(index.lookup(&Value::Null).is_none());
    }

    #[test]
    fn nested_paths_are_indexed() {
        let mut index = HashIndex::new("address.city", false);
        let id = DocumentId::new();
        index.insert(id, &doc! { "address" => doc! { "city" => "Oslo" } });
        assert!(index.lookup(&Value::from("Oslo")).unwrap().contains(&id));
    }

    #[test]
    fn integer_and_float_keys_differ() {
        let mut index = HashIndex::new("n", false);
        index.insert(DocumentId::new(), &doc! { "n" => 1 });
        assert!(index.lookup(&Value::Float(1.0)).is_none());
        assert!(index.lookup(&Value::Integer(1)).is_some());
    }

    #[test]
    fn remove_one_of_many() {
        let mut index = HashIndex::new("k", false);
        let (a, b) = (DocumentId::new(), DocumentId::new());
        index.insert(a, &doc! { "k" => "v" });
        index.insert(b, &doc! { "k" => "v" });

        assert!(index.remove(&a));
        assert!(!index.remove(&a));
        let found = index.lookup(&Value::from("v")).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains(&b));
    }

    #[test]
    fn holder_other_than_ignores_self() {
        let mut index = HashIndex::new("email", true);
        let id = DocumentId::new();
        index.insert(id, &doc! { "email" => "a@x" });
        let key = index_key(&doc! { "email" => "a@x" }, "email").unwrap();
        assert_eq!(index.holder_other_than(&key, &id), None);
        assert_eq!(index.holder_other_than(&key, &DocumentId::new()), Some(id));
    }
}
