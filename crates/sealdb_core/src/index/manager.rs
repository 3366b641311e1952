//! Per-group index manager.

use crate::error::{CoreError, CoreResult};
use crate::id::DocumentId;
use crate::index::hash::{index_key, HashIndex};
use sealdb_codec::{Document, Value};
use std::collections::{BTreeMap, HashSet};

/// Description of one index, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    /// Indexed field path.
    pub field: String,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
    /// Number of indexed documents.
    pub entries: usize,
}

/// All indexes of one group, keyed by field path.
///
/// Kept consistent with the group's committed documents: every commit runs
/// its changes through [`IndexManager::on_commit`] in batch order before the
/// new state is published.
#[derive(Debug, Clone, Default)]
pub struct IndexManager {
    indexes: BTreeMap<String, HashIndex>,
}

impl IndexManager {
    /// Creates a manager with no indexes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index on `field` from `docs`.
    ///
    /// Returns `Ok(false)` if an identical index already exists.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConstraintViolation`] if `unique` is set and two
    /// documents share a value, or [`CoreError::InvalidOperation`] if the
    /// field is already indexed with the other uniqueness.
    pub fn create_index<'a, I>(&mut self, group: &str, field: &str, unique: bool, docs: I) -> CoreResult<bool>
    where
        I: IntoIterator<Item = (DocumentId, &'a Document)>,
    {
        if let Some(existing) = self.indexes.get(field) {
            if existing.is_unique() == unique {
                return Ok(false);
            }
            return Err(CoreError::invalid_operation(format!(
                "{group}.{field} is already indexed with unique = {}",
                existing.is_unique()
            )));
        }

        let mut index = HashIndex::new(field, unique);
        for (id, doc) in docs {
            if unique {
                if let Some(key) = index_key(doc, field) {
                    if index.holder_other_than(&key, &id).is_some() {
                        return Err(CoreError::constraint(group, field));
                    }
                }
            }
            index.insert(id, doc);
        }
        self.indexes.insert(field.to_string(), index);
        Ok(true)
    }

    /// Registers an empty index, to be filled by [`IndexManager::on_commit`].
    pub fn define(&mut self, field: &str, unique: bool) {
        self.indexes
            .entry(field.to_string())
            .or_insert_with(|| HashIndex::new(field, unique));
    }

    /// Drops the index on `field`. Returns `true` if it existed.
    pub fn drop_index(&mut self, field: &str) -> bool {
        self.indexes.remove(field).is_some()
    }

    /// Returns the index on `field`.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&HashIndex> {
        self.indexes.get(field)
    }

    /// Returns `true` if no index is defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Describes every index.
    #[must_use]
    pub fn infos(&self) -> Vec<IndexInfo> {
        self.indexes
            .values()
            .map(|index| IndexInfo {
                field: index.field().to_string(),
                unique: index.is_unique(),
                entries: index.len(),
            })
            .collect()
    }

    /// Iterates over `(field, unique)` definitions.
    pub fn definitions(&self) -> impl Iterator<Item = (&str, bool)> {
        self.indexes.values().map(|i| (i.field(), i.is_unique()))
    }

    /// Documents whose `field` equals `value`. `None` if `field` is not
    /// indexed; an empty set if nothing matches.
    #[must_use]
    pub fn lookup(&self, field: &str, value: &Value) -> Option<HashSet<DocumentId>> {
        let index = self.indexes.get(field)?;
        Some(index.lookup(value).cloned().unwrap_or_default())
    }

    /// Applies one committed change: `Some(doc)` for insert or update,
    /// `None` for delete.
    pub fn on_commit(&mut self, id: DocumentId, doc: Option<&Document>) {
        for index in self.indexes.values_mut() {
            match doc {
                Some(doc) => index.insert(id, doc),
                None => {
                    index.remove(&id);
                }
            }
        }
    }

    /// Finds a unique index that `doc` stored under `id` would violate.
    ///
    /// Holders for which `superseded` returns `true` are ignored; the
    /// caller checks their new values separately.
    pub fn unique_conflict<F>(&self, id: &DocumentId, doc: &Document, superseded: F) -> Option<&str>
    where
        F: Fn(&DocumentId) -> bool,
    {
        self.indexes
            .values()
            .filter(|index| index.is_unique())
            .find(|index| {
                index_key(doc, index.field()).is_some_and(|key| {
                    index
                        .lookup_key(&key)
                        .is_some_and(|holders| holders.iter().any(|h| h != id && !superseded(h)))
                })
            })
            .map(HashIndex::field)
    }
}

/// Intersects candidate sets, smallest first.
///
/// The smallest set is walked once and checked for membership in every
/// other set, so the cost is bounded by the smallest set times the number
/// of sets.
#[must_use]
pub fn intersect(mut sets: Vec<HashSet<DocumentId>>) -> Vec<DocumentId> {
    sets.sort_by_key(HashSet::len);
    let mut sets = sets.into_iter();
    let Some(smallest) = sets.next() else {
        return Vec::new();
    };
    let rest: Vec<_> = sets.collect();
    smallest
        .into_iter()
        .filter(|id| rest.iter().all(|set| set.contains(id)))
        .collect()
}
