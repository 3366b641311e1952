//! Query planning and the lazy result cursor.

use crate::error::CoreResult;
use crate::id::DocumentId;
use crate::index::intersect;
use crate::query::predicate::{Clause, Condition, Query};
use crate::snapshot::{GroupState, Snapshot};
use crate::stats::DatabaseStats;
use sealdb_codec::Document;
use std::sync::Arc;

/// How a query will be answered.
#[derive(Debug)]
pub(crate) struct Plan {
    /// Candidate ids, in no particular order.
    pub candidates: Vec<DocumentId>,
    /// Clauses still to check on each fetched document.
    pub residual: Vec<Clause>,
}

impl Plan {
    /// Splits `query` into indexed equality clauses and residual clauses,
    /// and intersects the candidate sets of the indexed ones.
    pub fn new(group: &GroupState, query: &Query, stats: &DatabaseStats) -> Self {
        let mut sets = Vec::new();
        let mut residual = Vec::new();

        for clause in query.clauses() {
            let hit = match &clause.condition {
                Condition::Eq(value) if !value.is_null() => group.indexes.lookup(&clause.path, value),
                _ => None,
            };
            match hit {
                Some(set) => {
                    stats.record_index_lookup();
                    sets.push(set);
                }
                None => residual.push(clause.clone()),
            }
        }

        if sets.is_empty() {
            stats.record_scan();
            return Self {
                candidates: group.docs.keys().copied().collect(),
                residual,
            };
        }
        Self {
            candidates: intersect(sets),
            residual,
        }
    }
}

/// Lazy, finite, non-restartable sequence of query results.
///
/// The cursor pins the snapshot it was created from, so it keeps returning
/// the state as of that commit even while writers proceed. Documents are
/// fetched and decrypted one at a time as the cursor advances. A record
/// that fails authentication yields one `Err` item; iteration then
/// continues with the next candidate.
pub struct Cursor {
    snapshot: Arc<Snapshot>,
    group: Option<Arc<GroupState>>,
    candidates: std::vec::IntoIter<DocumentId>,
    residual: Vec<Clause>,
    stats: Arc<DatabaseStats>,
}

impl Cursor {
    pub(crate) fn new(snapshot: Arc<Snapshot>, group: &str, query: &Query, stats: Arc<DatabaseStats>) -> Self {
        let group = snapshot.group(group).cloned();
        let (candidates, residual) = match &group {
            Some(state) => {
                let plan = Plan::new(state, query, &stats);
                (plan.candidates, plan.residual)
            }
            None => (Vec::new(), Vec::new()),
        };
        Self {
            snapshot,
            group,
            candidates: candidates.into_iter(),
            residual,
            stats,
        }
    }

    /// Upper bound on the number of items still to come.
    #[must_use]
    pub fn remaining_candidates(&self) -> usize {
        self.candidates.len()
    }
}

impl Iterator for Cursor {
    type Item = CoreResult<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        let group = self.group.as_ref()?;
        for id in self.candidates.by_ref() {
            let Some(location) = group.docs.get(&id) else {
                continue;
            };
            self.stats.record_read();
            match self.snapshot.store.read_document(*location) {
                Ok(doc) => {
                    if self.residual.iter().all(|c| c.matches(&doc)) {
                        return Some(Ok(doc));
                    }
                }
                Err(e) => {
                    self.stats.record_corrupt();
                    tracing::warn!(id = %id, error = %e, "skipping unreadable document");
                    return Some(Err(e));
                }
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.candidates.len()))
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("sequence", &self.snapshot.sequence)
            .field("remaining", &self.candidates.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, KdfParams};
    use crate::crypto::EncryptionKey;
    use crate::pipeline::Pipeline;
    use crate::store::{FileParams, RecordStore, BLOCK_HEADER_SIZE, FILE_FORMAT};
    use crate::types::{GroupId, SequenceNumber};
    use sealdb_codec::{doc, Value};
    use sealdb_storage::InMemoryBackend;

    struct Fixture {
        snapshot: Arc<Snapshot>,
        backend: InMemoryBackend,
        ids: Vec<DocumentId>,
    }

    fn fixture(docs: Vec<Document>, indexes: &[&str]) -> Fixture {
        let backend = InMemoryBackend::new();
        let pipeline = Pipeline::new(&EncryptionKey::from_bytes([8; 32]), &Config::default());
        let params = FileParams {
            format: FILE_FORMAT,
            salt: [0; 16],
            kdf: KdfParams::low_cost(),
            created_at_ms: 0,
        };
        let store = Arc::new(RecordStore::create(Box::new(backend.clone()), &params, Arc::new(pipeline)).unwrap());

        let mut state = GroupState::new(GroupId::new(1));
        for field in indexes {
            state.indexes.define(field, false);
        }
        let mut ids = Vec::new();
        for doc in &docs {
            let id = DocumentId::new();
            let loc = store.put(state.id, id, SequenceNumber::new(1), doc).unwrap();
            state.docs.insert(id, loc);
            state.indexes.on_commit(id, Some(doc));
            ids.push(id);
        }

        let mut snapshot = Snapshot::new(store);
        snapshot.groups.insert("people".into(), Arc::new(state));
        Fixture {
            snapshot: Arc::new(snapshot),
            backend,
            ids,
        }
    }

    fn people() -> Vec<Document> {
        vec![
            doc! { "name" => "Alice", "role" => "admin", "age" => 34 },
            doc! { "name" => "Bob", "role" => "dev", "age" => 28 },
            doc! { "name" => "Carol", "role" => "dev", "age" => 41 },
        ]
    }

    fn names(cursor: Cursor) -> Vec<String> {
        let mut names: Vec<String> = cursor
            .map(|r| r.unwrap().get("name").and_then(Value::as_text).unwrap().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn indexed_equality_narrows_candidates() {
        let f = fixture(people(), &["role"]);
        let stats = DatabaseStats::new();
        let group = f.snapshot.group("people").unwrap();
        let plan = Plan::new(group, &Query::new().eq("role", "dev").gt("age", 30), &stats);
        assert_eq!(plan.candidates.len(), 2);
        assert_eq!(plan.residual.len(), 1);
        assert_eq!(stats.snapshot().index_lookups, 1);
        assert_eq!(stats.snapshot().scans, 0);
    }

    #[test]
    fn unindexed_query_scans_the_group() {
        let f = fixture(people(), &[]);
        let stats = DatabaseStats::new();
        let plan = Plan::new(f.snapshot.group("people").unwrap(), &Query::new().eq("role", "dev"), &stats);
        assert_eq!(plan.candidates.len(), 3);
        assert_eq!(stats.snapshot().scans, 1);
    }

    #[test]
    fn two_indexes_intersect() {
        let f = fixture(people(), &["role", "age"]);
        let cursor = Cursor::new(
            Arc::clone(&f.snapshot),
            "people",
            &Query::new().eq("role", "dev").eq("age", 41),
            Arc::new(DatabaseStats::new()),
        );
        assert_eq!(cursor.remaining_candidates(), 1);
        assert_eq!(names(cursor), vec!["Carol"]);
    }

    #[test]
    fn residual_clauses_filter() {
        let f = fixture(people(), &[]);
        let query = Query::new().gte("age", 30);
        let cursor = Cursor::new(Arc::clone(&f.snapshot), "people", &query, Arc::new(DatabaseStats::new()));
        assert_eq!(names(cursor), vec!["Alice", "Carol"]);
    }

    #[test]
    fn unknown_group_is_empty() {
        let f = fixture(people(), &[]);
        let mut cursor = Cursor::new(Arc::clone(&f.snapshot), "nobody", &Query::all(), Arc::new(DatabaseStats::new()));
        assert!(cursor.next().is_none());
    }

    #[test]
    fn corrupt_record_yields_error_and_continues() {
        let f = fixture(people(), &[]);
        let group = f.snapshot.group("people").unwrap();
        let bad = group.docs[&f.ids[1]];
        f.backend.flip_byte(bad.offset as usize + BLOCK_HEADER_SIZE + 16, 0x04);

        let stats = Arc::new(DatabaseStats::new());
        let results: Vec<_> = Cursor::new(Arc::clone(&f.snapshot), "people", &Query::all(), Arc::clone(&stats)).collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
        let err = results.into_iter().find_map(Result::err).unwrap();
        assert!(err.is_tamper());
        assert_eq!(stats.snapshot().corrupt_records, 1);
    }
}
