//! Transaction handle and staging.

use crate::database::Engine;
use crate::error::{CoreError, CoreResult};
use crate::id::{DocumentId, ID_FIELD};
use crate::index::index_key;
use crate::snapshot::Snapshot;
use crate::transaction::commit::{Batch, Change, ChangeKind};
use crate::types::{SequenceNumber, TransactionId};
use sealdb_codec::{Document, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Field holding the insert time when timestamps are recorded.
pub const CREATED_AT_FIELD: &str = "_created_at";
/// Field holding the last write time when timestamps are recorded.
pub const UPDATED_AT_FIELD: &str = "_updated_at";

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Mutations may be staged.
    Open,
    /// The commit is in flight.
    Committing,
    /// All staged mutations are durable and visible.
    Committed,
    /// Staged mutations were discarded.
    Aborted,
}

impl TransactionState {
    /// Lower-case name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }
}

/// One staged document with its net effect.
#[derive(Debug)]
struct Staged {
    kind: ChangeKind,
    document: Option<Document>,
    /// Staging order of the first touch, kept across re-staging.
    position: u64,
}

type UniqueKey = (String, Vec<u8>);

/// A unit of atomic work against one database.
///
/// Reads see the state committed when the transaction began plus its own
/// staged writes. Writes are buffered in memory until [`Transaction::commit`]
/// hands them to the commit leader in one batch. Unique indexes are checked
/// as each write is staged and again at commit.
///
/// Dropping an open transaction rolls it back.
pub struct Transaction {
    id: TransactionId,
    engine: Arc<Engine>,
    base: Arc<Snapshot>,
    state: TransactionState,
    staged: BTreeMap<String, HashMap<DocumentId, Staged>>,
    /// Unique keys held by staged documents, per group.
    unique_keys: BTreeMap<String, HashMap<UniqueKey, DocumentId>>,
    /// Keys registered for each staged document, for removal on re-staging.
    doc_keys: BTreeMap<String, HashMap<DocumentId, Vec<UniqueKey>>>,
    next_position: u64,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, engine: Arc<Engine>, base: Arc<Snapshot>) -> Self {
        Self {
            id,
            engine,
            base,
            state: TransactionState::Open,
            staged: BTreeMap::new(),
            unique_keys: BTreeMap::new(),
            doc_keys: BTreeMap::new(),
            next_position: 0,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the sequence number of the state this transaction reads.
    #[must_use]
    pub fn snapshot_seq(&self) -> SequenceNumber {
        self.base.sequence
    }

    pub(crate) fn base(&self) -> &Arc<Snapshot> {
        &self.base
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns `true` while mutations may be staged.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == TransactionState::Open
    }

    /// Number of documents with a staged change.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.staged.values().map(HashMap::len).sum()
    }

    /// Stages an insert and returns the document's id.
    ///
    /// A missing `_id` is assigned a fresh one; a provided `_id` must be
    /// UUID text. `_id` always becomes the first field.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidDocument`] if `_id` is malformed
    /// - [`CoreError::ConstraintViolation`] if the id is taken or a unique
    ///   index would hold a duplicate; the transaction stays open
    pub fn insert(&mut self, group: &str, document: Document) -> CoreResult<DocumentId> {
        self.ensure_open()?;
        validate_group_name(group)?;

        let id = match document.get(ID_FIELD) {
            Some(_) => DocumentId::of(&document)?,
            None => DocumentId::new(),
        };
        let mut stamped = Document::with_capacity(document.len() + 1);
        stamped.insert(ID_FIELD, id.to_value());
        for (key, value) in document {
            if key != ID_FIELD {
                stamped.insert(key, value);
            }
        }
        if self.engine.config.record_timestamps {
            let now = now_millis();
            if !stamped.contains_key(CREATED_AT_FIELD) {
                stamped.insert(CREATED_AT_FIELD, now.clone());
            }
            stamped.insert(UPDATED_AT_FIELD, now);
        }

        if self.exists(group, &id) {
            return Err(CoreError::constraint(group, ID_FIELD));
        }
        self.check_unique(group, &id, &stamped)?;

        let kind = match self.staged_entry(group, &id) {
            // Re-inserting a committed document deleted earlier in this
            // transaction replaces it.
            Some(_) => ChangeKind::Update,
            None => ChangeKind::Insert,
        };
        self.stage(group, id, kind, Some(stamped));
        Ok(id)
    }

    /// Stages a full replacement of the document named by `document._id`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidDocument`] if `_id` is missing or malformed
    /// - [`CoreError::NotFound`] if no such document exists
    /// - [`CoreError::ConstraintViolation`] on a unique index conflict
    pub fn update(&mut self, group: &str, document: Document) -> CoreResult<()> {
        self.ensure_open()?;
        let id = DocumentId::of(&document)?;
        if !self.exists(group, &id) {
            return Err(CoreError::not_found(format!("document {id} in {group}")));
        }

        let mut document = document;
        if self.engine.config.record_timestamps {
            if !document.contains_key(CREATED_AT_FIELD) {
                let created = self
                    .get(group, &id)?
                    .and_then(|previous| previous.get(CREATED_AT_FIELD).cloned());
                if let Some(created) = created {
                    document.insert(CREATED_AT_FIELD, created);
                }
            }
            document.insert(UPDATED_AT_FIELD, now_millis());
        }
        self.check_unique(group, &id, &document)?;

        let kind = match self.staged_entry(group, &id) {
            Some(staged) if staged.kind == ChangeKind::Insert => ChangeKind::Insert,
            _ => ChangeKind::Update,
        };
        self.stage(group, id, kind, Some(document));
        Ok(())
    }

    /// Stages a deletion.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if no such document exists.
    pub fn delete(&mut self, group: &str, id: &DocumentId) -> CoreResult<()> {
        self.ensure_open()?;
        if !self.exists(group, id) {
            return Err(CoreError::not_found(format!("document {id} in {group}")));
        }

        self.forget_keys(group, id);
        let inserted_here = self
            .staged_entry(group, id)
            .is_some_and(|staged| staged.kind == ChangeKind::Insert);
        if inserted_here {
            if let Some(docs) = self.staged.get_mut(group) {
                docs.remove(id);
            }
        } else {
            self.stage(group, *id, ChangeKind::Delete, None);
        }
        Ok(())
    }

    /// Reads a document, seeing this transaction's own staged writes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TamperOrCorruption`] if the stored record fails
    /// authentication.
    pub fn get(&self, group: &str, id: &DocumentId) -> CoreResult<Option<Document>> {
        self.ensure_open()?;
        if let Some(staged) = self.staged_entry(group, id) {
            return Ok(staged.document.clone());
        }
        let found = self.base.read(group, id)?;
        self.engine.stats.record_read();
        Ok(found)
    }

    /// Commits all staged changes and returns the commit sequence number.
    ///
    /// Blocks until the changes are durable. A transaction with nothing
    /// staged commits without touching the log.
    ///
    /// # Errors
    ///
    /// - [`CoreError::WalWrite`] if the log could not be made durable
    /// - [`CoreError::ConstraintViolation`] or [`CoreError::NotFound`] if a
    ///   transaction committed since staging conflicts with this one
    ///
    /// The transaction is aborted on any error.
    pub fn commit(&mut self) -> CoreResult<SequenceNumber> {
        self.ensure_open()?;
        if let Err(e) = self.engine.ensure_open() {
            self.abort();
            return Err(e);
        }
        self.state = TransactionState::Committing;

        let batch = self.take_batch();
        if batch.changes.is_empty() {
            self.state = TransactionState::Committed;
            self.engine.stats.record_transaction_commit();
            return Ok(self.engine.committed_seq());
        }

        match self.engine.commit(batch) {
            Ok(seq) => {
                self.state = TransactionState::Committed;
                self.engine.stats.record_transaction_commit();
                tracing::trace!(txid = %self.id, seq = %seq, "transaction committed");
                Ok(seq)
            }
            Err(e) => {
                self.state = TransactionState::Aborted;
                self.engine.stats.record_transaction_abort();
                tracing::debug!(txid = %self.id, error = %e, "transaction aborted at commit");
                Err(e)
            }
        }
    }

    /// Discards all staged changes. Safe to call in any state.
    pub fn rollback(&mut self) {
        if self.state == TransactionState::Open {
            self.abort();
        }
    }

    fn abort(&mut self) {
        self.staged.clear();
        self.unique_keys.clear();
        self.doc_keys.clear();
        self.state = TransactionState::Aborted;
        self.engine.stats.record_transaction_abort();
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.state == TransactionState::Open {
            Ok(())
        } else {
            Err(CoreError::TransactionNotActive {
                state: self.state.as_str(),
            })
        }
    }

    fn staged_entry(&self, group: &str, id: &DocumentId) -> Option<&Staged> {
        self.staged.get(group).and_then(|docs| docs.get(id))
    }

    fn exists(&self, group: &str, id: &DocumentId) -> bool {
        match self.staged_entry(group, id) {
            Some(staged) => staged.document.is_some(),
            None => self.base.contains(group, id),
        }
    }

    /// Checks every unique index of `group` against the committed state
    /// and this transaction's staged documents.
    fn check_unique(&self, group: &str, id: &DocumentId, doc: &Document) -> CoreResult<()> {
        let Some(state) = self.base.group(group) else {
            return Ok(());
        };
        let staged = self.staged.get(group);
        let touched = |holder: &DocumentId| staged.is_some_and(|docs| docs.contains_key(holder));
        if let Some(field) = state.indexes.unique_conflict(id, doc, touched) {
            return Err(CoreError::constraint(group, field));
        }

        if let Some(keys) = self.unique_keys.get(group) {
            for (field, unique) in state.indexes.definitions() {
                if !unique {
                    continue;
                }
                let Some(key) = index_key(doc, field) else {
                    continue;
                };
                if keys
                    .get(&(field.to_string(), key))
                    .is_some_and(|holder| holder != id)
                {
                    return Err(CoreError::constraint(group, field));
                }
            }
        }
        Ok(())
    }

    fn stage(&mut self, group: &str, id: DocumentId, kind: ChangeKind, document: Option<Document>) {
        self.forget_keys(group, &id);
        if let (Some(doc), Some(state)) = (&document, self.base.group(group)) {
            let keys: Vec<UniqueKey> = state
                .indexes
                .definitions()
                .filter(|(_, unique)| *unique)
                .filter_map(|(field, _)| index_key(doc, field).map(|key| (field.to_string(), key)))
                .collect();
            if !keys.is_empty() {
                let held = self.unique_keys.entry(group.to_string()).or_default();
                for key in &keys {
                    held.insert(key.clone(), id);
                }
                self.doc_keys
                    .entry(group.to_string())
                    .or_default()
                    .insert(id, keys);
            }
        }

        let docs = self.staged.entry(group.to_string()).or_default();
        let position = match docs.get(&id) {
            Some(previous) => previous.position,
            None => {
                self.next_position += 1;
                self.next_position
            }
        };
        docs.insert(
            id,
            Staged {
                kind,
                document,
                position,
            },
        );
    }

    fn forget_keys(&mut self, group: &str, id: &DocumentId) {
        let Some(keys) = self.doc_keys.get_mut(group).and_then(|docs| docs.remove(id)) else {
            return;
        };
        if let Some(held) = self.unique_keys.get_mut(group) {
            for key in keys {
                if held.get(&key) == Some(id) {
                    held.remove(&key);
                }
            }
        }
    }

    fn take_batch(&mut self) -> Batch {
        let mut changes: Vec<(u64, Change)> = std::mem::take(&mut self.staged)
            .into_iter()
            .flat_map(|(group, docs)| {
                docs.into_iter().map(move |(id, staged)| {
                    (
                        staged.position,
                        Change {
                            group: group.clone(),
                            id,
                            kind: staged.kind,
                            document: staged.document,
                        },
                    )
                })
            })
            .collect();
        changes.sort_by_key(|(position, _)| *position);
        self.unique_keys.clear();
        self.doc_keys.clear();

        Batch {
            txid: self.id,
            changes: changes.into_iter().map(|(_, change)| change).collect(),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Open {
            if self.pending_count() > 0 {
                tracing::debug!(txid = %self.id, "rolling back dropped transaction");
            }
            self.abort();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("snapshot_seq", &self.base.sequence)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

/// Rejects empty group names and names that cannot be a file name.
pub(crate) fn validate_group_name(name: &str) -> CoreResult<()> {
    const FORBIDDEN: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];
    if name.is_empty() || name.contains(FORBIDDEN) || name.chars().any(char::is_control) {
        return Err(CoreError::InvalidGroupName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn now_millis() -> Value {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis());
    Value::Integer(i64::try_from(millis).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, KdfParams};
    use crate::database::Database;
    use sealdb_codec::doc;

    fn open() -> Database {
        Database::open_in_memory(b"pw", Config::default().kdf(KdfParams::low_cost())).unwrap()
    }

    #[test]
    fn reads_own_writes() {
        let db = open();
        let mut txn = db.begin().unwrap();
        let id = txn.insert("users", doc! { "name" => "Alice" }).unwrap();

        let seen = txn.get("users", &id).unwrap().unwrap();
        assert_eq!(seen.get("name"), Some(&Value::from("Alice")));
        assert_eq!(seen.keys().next(), Some(ID_FIELD));
        assert_eq!(db.group("users").unwrap().get(&id).unwrap(), None);

        txn.commit().unwrap();
        assert!(db.group("users").unwrap().get(&id).unwrap().is_some());
    }

    #[test]
    fn provided_id_is_kept() {
        let db = open();
        let id = DocumentId::new();
        let mut txn = db.begin().unwrap();
        let got = txn
            .insert("g", doc! { "v" => 1, "_id" => id.to_string() })
            .unwrap();
        assert_eq!(got, id);

        let bad = txn.insert("g", doc! { "_id" => "not-a-uuid" });
        assert!(matches!(bad, Err(CoreError::InvalidDocument { .. })));
        assert!(txn.is_open());
    }

    #[test]
    fn duplicate_id_is_a_constraint_violation() {
        let db = open();
        let mut txn = db.begin().unwrap();
        let id = txn.insert("g", doc! {}).unwrap();
        let again = txn.insert("g", doc! { "_id" => id.to_string() });
        assert!(again.unwrap_err().is_constraint_violation());
    }

    #[test]
    fn update_and_delete_need_existing_documents() {
        let db = open();
        let mut txn = db.begin().unwrap();
        let missing = DocumentId::new();
        assert!(txn
            .update("g", doc! { "_id" => missing.to_string() })
            .unwrap_err()
            .is_not_found());
        assert!(txn.delete("g", &missing).unwrap_err().is_not_found());
    }

    #[test]
    fn delete_of_staged_insert_cancels_it() {
        let db = open();
        let mut txn = db.begin().unwrap();
        let id = txn.insert("g", doc! { "v" => 1 }).unwrap();
        txn.delete("g", &id).unwrap();
        assert_eq!(txn.pending_count(), 0);
        assert_eq!(txn.get("g", &id).unwrap(), None);
    }

    #[test]
    fn staged_unique_keys_conflict_within_transaction() {
        let db = open();
        db.group("users").unwrap().create_index("email", true).unwrap();

        let mut txn = db.begin().unwrap();
        let first = txn.insert("users", doc! { "email" => "a@x" }).unwrap();
        let err = txn.insert("users", doc! { "email" => "a@x" }).unwrap_err();
        assert!(err.is_constraint_violation());
        assert!(txn.is_open());

        // Moving the first document off the key frees it.
        txn.update("users", doc! { "_id" => first.to_string(), "email" => "b@x" })
            .unwrap();
        txn.insert("users", doc! { "email" => "a@x" }).unwrap();
        txn.commit().unwrap();
        assert_eq!(db.group("users").unwrap().len().unwrap(), 2);
    }

    #[test]
    fn committed_unique_key_conflicts_at_staging() {
        let db = open();
        let users = db.group("users").unwrap();
        users.create_index("email", true).unwrap();
        let alice = users.insert(doc! { "email" => "a@x" }).unwrap();
        let alice_id = DocumentId::of(&alice).unwrap();

        let mut txn = db.begin().unwrap();
        assert!(txn
            .insert("users", doc! { "email" => "a@x" })
            .unwrap_err()
            .is_constraint_violation());

        // Deleting the holder in the same transaction releases the key.
        txn.delete("users", &alice_id).unwrap();
        txn.insert("users", doc! { "email" => "a@x" }).unwrap();
        txn.commit().unwrap();
        assert_eq!(users.len().unwrap(), 1);
    }

    #[test]
    fn rollback_is_idempotent() {
        let db = open();
        let mut txn = db.begin().unwrap();
        txn.insert("g", doc! { "v" => 1 }).unwrap();
        txn.rollback();
        txn.rollback();
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(matches!(
            txn.insert("g", doc! {}),
            Err(CoreError::TransactionNotActive { state: "aborted" })
        ));
        assert!(db.group("g").unwrap().is_empty().unwrap());
    }

    #[test]
    fn commit_twice_is_rejected() {
        let db = open();
        let mut txn = db.begin().unwrap();
        txn.insert("g", doc! {}).unwrap();
        txn.commit().unwrap();
        txn.rollback();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(matches!(
            txn.commit(),
            Err(CoreError::TransactionNotActive { state: "committed" })
        ));
    }

    #[test]
    fn empty_commit_returns_current_sequence() {
        let db = open();
        db.group("g").unwrap().insert(doc! {}).unwrap();
        let seq = db.committed_seq();
        let mut txn = db.begin().unwrap();
        assert_eq!(txn.commit().unwrap(), seq);
    }

    #[test]
    fn timestamps_are_recorded_when_enabled() {
        let db = Database::open_in_memory(
            b"pw",
            Config::default()
                .kdf(KdfParams::low_cost())
                .record_timestamps(true),
        )
        .unwrap();
        let mut txn = db.begin().unwrap();
        let id = txn.insert("g", doc! { "v" => 1 }).unwrap();
        txn.commit().unwrap();

        let stored = db.group("g").unwrap().get(&id).unwrap().unwrap();
        let created = stored.get(CREATED_AT_FIELD).cloned().unwrap();
        assert!(stored.contains_key(UPDATED_AT_FIELD));

        let mut txn = db.begin().unwrap();
        txn.update("g", doc! { "_id" => id.to_string(), "v" => 2 }).unwrap();
        txn.commit().unwrap();
        let stored = db.group("g").unwrap().get(&id).unwrap().unwrap();
        assert_eq!(stored.get(CREATED_AT_FIELD), Some(&created));
    }

    #[test]
    fn group_names_are_validated() {
        assert!(validate_group_name("users").is_ok());
        for bad in ["", "a/b", "a\\b", "c:", "x*", "q?", "\"", "<", ">", "|", "tab\t"] {
            assert!(
                matches!(validate_group_name(bad), Err(CoreError::InvalidGroupName { .. })),
                "{bad:?}"
            );
        }
    }
}
