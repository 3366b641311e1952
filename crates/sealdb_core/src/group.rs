//! Group handles.

use crate::database::Engine;
use crate::error::{CoreError, CoreResult};
use crate::id::{DocumentId, ID_FIELD};
use crate::index::IndexInfo;
use crate::query::{Cursor, Query};
use crate::snapshot::Snapshot;
use sealdb_codec::{Document, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// A named collection of documents.
///
/// Every write method runs as its own transaction. Use
/// [`crate::Database::begin`] to combine writes across documents or
/// groups.
#[derive(Clone)]
pub struct Group {
    engine: Arc<Engine>,
    name: String,
}

impl Group {
    pub(crate) fn new(engine: Arc<Engine>, name: &str) -> Self {
        Self {
            engine,
            name: name.to_string(),
        }
    }

    /// Returns the group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inserts a document and returns it as stored, with `_id` first.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ConstraintViolation`] on a duplicate `_id` or unique
    ///   index value
    /// - [`CoreError::WalWrite`] if the commit is not durable
    pub fn insert(&self, document: Document) -> CoreResult<Document> {
        let mut txn = self.engine.begin()?;
        let id = txn.insert(&self.name, document)?;
        let stored = txn
            .get(&self.name, &id)?
            .ok_or_else(|| CoreError::not_found(format!("document {id} in {}", self.name)))?;
        txn.commit()?;
        Ok(stored)
    }

    /// Inserts all documents atomically and returns their ids in order.
    ///
    /// # Errors
    ///
    /// Fails as [`Group::insert`]; nothing is inserted on error.
    pub fn insert_many<I>(&self, documents: I) -> CoreResult<Vec<DocumentId>>
    where
        I: IntoIterator<Item = Document>,
    {
        let mut txn = self.engine.begin()?;
        let ids = documents
            .into_iter()
            .map(|doc| txn.insert(&self.name, doc))
            .collect::<CoreResult<Vec<_>>>()?;
        txn.commit()?;
        Ok(ids)
    }

    /// Reads one document by id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TamperOrCorruption`] if the record fails
    /// authentication.
    pub fn get(&self, id: &DocumentId) -> CoreResult<Option<Document>> {
        self.engine.ensure_open()?;
        let found = self.engine.read_snapshot().read(&self.name, id)?;
        self.engine.stats.record_read();
        Ok(found)
    }

    /// Merges `patch` into every matching document. Returns the number of
    /// documents matched.
    ///
    /// Unreadable documents are skipped.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidDocument`] if `patch` would change an `_id`
    /// - [`CoreError::ConstraintViolation`] on a unique index conflict;
    ///   nothing is updated
    pub fn update(&self, query: impl Into<Query>, patch: &Document) -> CoreResult<usize> {
        let query = query.into();
        let mut txn = self.engine.begin()?;
        let cursor = self.cursor_for(txn.base(), &query);

        let mut matched = 0;
        for result in cursor {
            let Some(doc) = skip_corrupt(result)? else {
                continue;
            };
            if let Some(new_id) = patch.get(ID_FIELD) {
                if doc.get(ID_FIELD) != Some(new_id) {
                    return Err(CoreError::invalid_document("_id cannot be changed"));
                }
            }
            let mut merged = doc.clone();
            merged.merge(patch);
            if merged != doc {
                txn.update(&self.name, merged)?;
            }
            matched += 1;
        }
        txn.commit()?;
        Ok(matched)
    }

    /// Deletes every matching document and returns how many were deleted.
    ///
    /// Unreadable documents are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    pub fn delete(&self, query: impl Into<Query>) -> CoreResult<usize> {
        let query = query.into();
        let mut txn = self.engine.begin()?;
        let cursor = self.cursor_for(txn.base(), &query);

        let mut deleted = 0;
        for result in cursor {
            let Some(doc) = skip_corrupt(result)? else {
                continue;
            };
            txn.delete(&self.name, &DocumentId::of(&doc)?)?;
            deleted += 1;
        }
        txn.commit()?;
        Ok(deleted)
    }

    /// Deletes one document by id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if it does not exist.
    pub fn delete_by_id(&self, id: &DocumentId) -> CoreResult<()> {
        let mut txn = self.engine.begin()?;
        txn.delete(&self.name, id)?;
        txn.commit()?;
        Ok(())
    }

    /// Runs a query. The cursor sees the state as of this call.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseClosed`] after close.
    pub fn find(&self, query: impl Into<Query>) -> CoreResult<Cursor> {
        self.engine.ensure_open()?;
        Ok(self.cursor_for(&self.engine.read_snapshot(), &query.into()))
    }

    /// Returns the first match. Which match is first is unspecified.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if nothing matches.
    pub fn find_one(&self, query: impl Into<Query>) -> CoreResult<Document> {
        for result in self.find(query)? {
            if let Some(doc) = skip_corrupt(result)? {
                return Ok(doc);
            }
        }
        Err(CoreError::not_found(format!("no matching document in {}", self.name)))
    }

    /// Counts matching documents, skipping unreadable ones.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseClosed`] after close.
    pub fn count(&self, query: impl Into<Query>) -> CoreResult<usize> {
        let mut count = 0;
        for result in self.find(query)? {
            if skip_corrupt(result)?.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Number of documents in the group.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseClosed`] after close.
    pub fn len(&self) -> CoreResult<usize> {
        self.engine.ensure_open()?;
        Ok(self
            .engine
            .read_snapshot()
            .group(&self.name)
            .map_or(0, |state| state.docs.len()))
    }

    /// Returns `true` if the group holds no documents.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseClosed`] after close.
    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Indexes `field` (a dotted path) over all current and future
    /// documents.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ConstraintViolation`] if `unique` and two documents
    ///   already share a value
    /// - [`CoreError::InvalidOperation`] if the field is already indexed
    ///   with the other uniqueness
    /// - [`CoreError::TamperOrCorruption`] if a document cannot be read
    pub fn create_index(&self, field: &str, unique: bool) -> CoreResult<()> {
        self.engine.create_index(&self.name, field, unique)
    }

    /// Drops the index on `field`. Returns `false` if there was none.
    ///
    /// # Errors
    ///
    /// Returns an error if the change cannot be persisted.
    pub fn drop_index(&self, field: &str) -> CoreResult<bool> {
        self.engine.drop_index(&self.name, field)
    }

    /// Describes the group's indexes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseClosed`] after close.
    pub fn indexes(&self) -> CoreResult<Vec<IndexInfo>> {
        self.engine.ensure_open()?;
        Ok(self
            .engine
            .read_snapshot()
            .group(&self.name)
            .map(|state| state.indexes.infos())
            .unwrap_or_default())
    }

    /// Ids of the documents whose indexed `field` equals `value`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if `field` is not indexed.
    pub fn lookup(&self, field: &str, value: &Value) -> CoreResult<HashSet<DocumentId>> {
        self.engine.ensure_open()?;
        let snapshot = self.engine.read_snapshot();
        let ids = snapshot
            .group(&self.name)
            .and_then(|state| state.indexes.lookup(field, value))
            .ok_or_else(|| {
                CoreError::invalid_operation(format!("{}.{field} is not indexed", self.name))
            })?;
        self.engine.stats.record_index_lookup();
        Ok(ids)
    }

    fn cursor_for(&self, snapshot: &Arc<Snapshot>, query: &Query) -> Cursor {
        Cursor::new(
            Arc::clone(snapshot),
            &self.name,
            query,
            Arc::clone(&self.engine.stats),
        )
    }
}

/// Passes readable documents through and drops corrupt ones, which the
/// cursor has already logged and counted.
fn skip_corrupt(result: CoreResult<Document>) -> CoreResult<Option<Document>> {
    match result {
        Ok(doc) => Ok(Some(doc)),
        Err(e) if e.is_tamper() => Ok(None),
        Err(e) => Err(e),
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, KdfParams};
    use crate::database::Database;
    use sealdb_codec::doc;

    fn db() -> Database {
        Database::open_in_memory(b"pw", Config::default().kdf(KdfParams::low_cost())).unwrap()
    }

    #[test]
    fn alice_and_bob() {
        let db = db();
        let users = db.group("users").unwrap();
        users.insert(doc! { "name" => "Alice", "role" => "admin" }).unwrap();
        users.insert(doc! { "name" => "Bob", "role" => "dev" }).unwrap();
        users.create_index("email", true).unwrap();

        let admins: Vec<_> = users
            .find(doc! { "role" => "admin" })
            .unwrap()
            .collect::<CoreResult<_>>()
            .unwrap();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].get("name"), Some(&Value::from("Alice")));
    }

    #[test]
    fn unique_index_rejects_second_value() {
        let db = db();
        let users = db.group("users").unwrap();
        users.create_index("email", true).unwrap();
        users.insert(doc! { "email" => "a@x" }).unwrap();

        let err = users.insert(doc! { "email" => "a@x" }).unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(users.len().unwrap(), 1);
    }

    #[test]
    fn unique_index_creation_fails_on_duplicates() {
        let db = db();
        let users = db.group("users").unwrap();
        users.insert(doc! { "email" => "a@x" }).unwrap();
        users.insert(doc! { "email" => "a@x" }).unwrap();
        assert!(users.create_index("email", true).unwrap_err().is_constraint_violation());
        assert!(users.indexes().unwrap().is_empty());

        users.create_index("email", false).unwrap();
        users.create_index("email", false).unwrap();
        assert!(matches!(
            users.create_index("email", true),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn missing_and_null_values_never_conflict() {
        let db = db();
        let g = db.group("g").unwrap();
        g.create_index("k", true).unwrap();
        g.insert(doc! {}).unwrap();
        g.insert(doc! {}).unwrap();
        g.insert(doc! { "k" => Value::Null }).unwrap();
        g.insert(doc! { "k" => Value::Null }).unwrap();
        assert_eq!(g.len().unwrap(), 4);
    }

    #[test]
    fn update_merges_and_keeps_indexes_current() {
        let db = db();
        let g = db.group("g").unwrap();
        g.create_index("role", false).unwrap();
        g.insert_many(vec![
            doc! { "name" => "a", "role" => "dev" },
            doc! { "name" => "b", "role" => "dev" },
            doc! { "name" => "c", "role" => "ops" },
        ])
        .unwrap();

        let matched = g.update(doc! { "role" => "dev" }, &doc! { "role" => "admin" }).unwrap();
        assert_eq!(matched, 2);
        assert!(g.lookup("role", &Value::from("dev")).unwrap().is_empty());
        assert_eq!(g.lookup("role", &Value::from("admin")).unwrap().len(), 2);
        assert_eq!(g.count(doc! { "role" => "admin" }).unwrap(), 2);
    }

    #[test]
    fn update_cannot_change_id() {
        let db = db();
        let g = db.group("g").unwrap();
        g.insert(doc! { "v" => 1 }).unwrap();
        let patch = doc! { "_id" => DocumentId::new().to_string() };
        assert!(matches!(
            g.update(Query::new(), &patch),
            Err(CoreError::InvalidDocument { .. })
        ));
    }

    #[test]
    fn delete_by_query_and_id() {
        let db = db();
        let g = db.group("g").unwrap();
        let ids = g
            .insert_many((0..10).map(|i| doc! { "n" => i }))
            .unwrap();
        assert_eq!(g.delete(Query::new().gte("n", 5)).unwrap(), 5);
        g.delete_by_id(&ids[0]).unwrap();
        assert!(g.delete_by_id(&ids[0]).unwrap_err().is_not_found());
        assert_eq!(g.len().unwrap(), 4);
    }

    #[test]
    fn find_one_reports_not_found() {
        let db = db();
        let g = db.group("g").unwrap();
        g.insert(doc! { "n" => 1 }).unwrap();
        assert_eq!(
            g.find_one(Query::new().eq("n", 1)).unwrap().get("n"),
            Some(&Value::from(1))
        );
        assert!(g.find_one(Query::new().eq("n", 2)).unwrap_err().is_not_found());
    }

    #[test]
    fn lookup_requires_an_index() {
        let db = db();
        let g = db.group("g").unwrap();
        assert!(matches!(
            g.lookup("x", &Value::from(1)),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn composite_query_uses_indexes_and_residuals() {
        let db = db();
        let g = db.group("people").unwrap();
        g.create_index("city", false).unwrap();
        g.create_index("role", false).unwrap();
        for i in 0..40 {
            let city = if i % 2 == 0 { "Oslo" } else { "Bergen" };
            let role = if i % 4 == 0 { "admin" } else { "dev" };
            g.insert(doc! { "city" => city, "role" => role, "age" => i }).unwrap();
        }

        let query = Query::new().eq("city", "Oslo").eq("role", "admin").gte("age", 20);
        let cursor = g.find(&query).unwrap();
        assert_eq!(cursor.remaining_candidates(), 10);
        let ages: Vec<i64> = cursor
            .map(|r| r.unwrap().get("age").and_then(Value::as_integer).unwrap())
            .collect();
        assert_eq!(ages.len(), 5);
        assert!(ages.iter().all(|&age| age >= 20 && age % 4 == 0));
    }

    #[test]
    fn invalid_group_names_are_rejected() {
        let db = db();
        assert!(matches!(db.group("a/b"), Err(CoreError::InvalidGroupName { .. })));
        assert!(matches!(db.group(""), Err(CoreError::InvalidGroupName { .. })));
    }
}
