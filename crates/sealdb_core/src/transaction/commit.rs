//! Group commit.
//!
//! Committers enqueue their batch and then contend for the writer lock.
//! Whoever gets it first becomes the leader: it drains the queue, validates
//! and logs every batch, makes them durable with one flush, applies them to
//! the record store and indexes in log order, publishes one new snapshot
//! and fills every follower's result slot. A follower that later acquires
//! the writer lock finds its slot filled and returns at once.

use crate::database::{Engine, Writer};
use crate::error::{CoreError, CoreResult};
use crate::id::{DocumentId, ID_FIELD};
use crate::snapshot::{GroupState, Snapshot};
use crate::types::{GroupId, SequenceNumber, TransactionId};
use crate::wal::{WalRecord, WriteAheadLog};
use parking_lot::Mutex;
use sealdb_codec::Document;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Net effect of a transaction on one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug)]
pub(crate) struct Change {
    pub group: String,
    pub id: DocumentId,
    pub kind: ChangeKind,
    /// New version, `None` for deletes.
    pub document: Option<Document>,
}

/// Everything one transaction commits, in staging order.
#[derive(Debug)]
pub(crate) struct Batch {
    pub txid: TransactionId,
    pub changes: Vec<Change>,
}

/// Where the leader leaves a follower's outcome.
#[derive(Debug, Default)]
pub(crate) struct CommitSlot {
    result: Mutex<Option<CoreResult<SequenceNumber>>>,
}

impl CommitSlot {
    fn fill(&self, result: CoreResult<SequenceNumber>) {
        *self.result.lock() = Some(result);
    }

    fn take(&self) -> Option<CoreResult<SequenceNumber>> {
        self.result.lock().take()
    }
}

#[derive(Debug)]
pub(crate) struct CommitRequest {
    batch: Batch,
    slot: Arc<CommitSlot>,
}

struct Accepted {
    batch: Batch,
    slot: Arc<CommitSlot>,
    sequence: SequenceNumber,
}

impl Engine {
    /// Commits `batch`, possibly together with other queued batches, and
    /// returns its commit sequence number once it is durable and visible.
    pub(crate) fn commit(&self, batch: Batch) -> CoreResult<SequenceNumber> {
        let slot = Arc::new(CommitSlot::default());
        self.queue.lock().push(CommitRequest {
            batch,
            slot: Arc::clone(&slot),
        });

        let mut writer = self.writer.lock();
        if let Some(result) = slot.take() {
            return result;
        }

        let window = self.config.group_commit_window;
        if !window.is_zero() {
            std::thread::sleep(window);
        }
        let requests = std::mem::take(&mut *self.queue.lock());
        self.lead(&mut writer, requests);

        slot.take()
            .unwrap_or_else(|| Err(CoreError::invalid_operation("commit request was lost")))
    }

    fn lead(&self, writer: &mut Writer, requests: Vec<CommitRequest>) {
        if self.check_writable().is_err() {
            for request in requests {
                request.slot.fill(self.check_writable().map(|()| SequenceNumber::default()));
            }
            return;
        }

        let mut work = Snapshot::clone(&self.read_snapshot());
        let mut present: HashMap<String, HashMap<DocumentId, bool>> = HashMap::new();
        let mut next_group_id = writer.next_group_id;
        let mut new_groups = Vec::new();
        let mut accepted = Vec::with_capacity(requests.len());

        for CommitRequest { batch, slot } in requests {
            if let Err(e) = validate(&work, &present, &batch) {
                tracing::debug!(txid = %batch.txid, error = %e, "rejecting batch at commit");
                slot.fill(Err(e));
                continue;
            }
            let sequence = match log_batch(&mut writer.wal, &batch) {
                Ok(sequence) => sequence,
                Err(e) => {
                    slot.fill(Err(e));
                    continue;
                }
            };

            for change in &batch.changes {
                if work.group(&change.group).is_none() {
                    let id = GroupId::new(next_group_id);
                    next_group_id += 1;
                    work.groups
                        .insert(change.group.clone(), Arc::new(GroupState::new(id)));
                    new_groups.push(change.group.clone());
                }
                if let Some(state) = work.group_mut(&change.group) {
                    state.indexes.on_commit(change.id, change.document.as_ref());
                }
                present
                    .entry(change.group.clone())
                    .or_default()
                    .insert(change.id, change.document.is_some());
            }
            accepted.push(Accepted {
                batch,
                slot,
                sequence,
            });
        }

        if accepted.is_empty() {
            writer.wal.discard_pending();
            return;
        }

        if let Err(e) = writer.wal.flush() {
            let message = match e {
                CoreError::WalWrite { message } => message,
                other => other.to_string(),
            };
            tracing::warn!(transactions = accepted.len(), error = %message, "commit batch failed");
            for entry in accepted {
                entry.slot.fill(Err(CoreError::wal_write(message.clone())));
            }
            return;
        }
        writer.next_group_id = next_group_id;

        if let Err(e) = self.apply(&mut work, &new_groups, &accepted) {
            self.poison();
            tracing::error!(error = %e, "durable commit could not be applied to the record store");
            for entry in accepted {
                entry.slot.fill(Err(CoreError::invalid_operation(format!(
                    "commit {} is durable but could not be applied ({e}); reopen the database",
                    entry.sequence
                ))));
            }
            return;
        }

        work.sequence = writer.wal.last_durable_sequence();
        let sequence = work.sequence;
        self.publish(work);
        self.stats.record_commit_batch();
        tracing::debug!(transactions = accepted.len(), seq = %sequence, "commit batch durable");

        for entry in accepted {
            entry.slot.fill(Ok(entry.sequence));
        }

        if writer.wal.size() > self.config.checkpoint_wal_bytes {
            if let Err(e) = self.checkpoint_locked(writer) {
                tracing::warn!(error = %e, "automatic checkpoint failed");
            }
        }
    }

    /// Writes the accepted batches to the record store, in log order.
    fn apply(&self, work: &mut Snapshot, new_groups: &[String], accepted: &[Accepted]) -> CoreResult<()> {
        let store = Arc::clone(&work.store);
        let first = accepted
            .first()
            .map_or(work.sequence, |entry| entry.sequence);
        for name in new_groups {
            if let Some(state) = work.group(name) {
                store.define_group(state.id, name, first)?;
            }
        }

        for entry in accepted {
            for change in &entry.batch.changes {
                let state = work.group_mut(&change.group).ok_or_else(|| {
                    CoreError::invalid_operation(format!("group {} vanished during commit", change.group))
                })?;
                match &change.document {
                    Some(doc) => {
                        let location = store.put(state.id, change.id, entry.sequence, doc)?;
                        state.docs.insert(change.id, location);
                        self.stats.record_write();
                    }
                    None => {
                        store.tombstone(state.id, change.id, entry.sequence)?;
                        state.docs.remove(&change.id);
                        self.stats.record_delete();
                    }
                }
            }
        }
        Ok(())
    }
}

/// Re-checks a batch against everything committed before it, including
/// earlier batches of the same group commit.
fn validate(
    work: &Snapshot,
    present: &HashMap<String, HashMap<DocumentId, bool>>,
    batch: &Batch,
) -> CoreResult<()> {
    let touched: HashSet<(&str, DocumentId)> = batch
        .changes
        .iter()
        .map(|change| (change.group.as_str(), change.id))
        .collect();

    for change in &batch.changes {
        let group = change.group.as_str();
        let exists = present
            .get(group)
            .and_then(|docs| docs.get(&change.id))
            .copied()
            .unwrap_or_else(|| work.contains(group, &change.id));
        match change.kind {
            ChangeKind::Insert if exists => return Err(CoreError::constraint(group, ID_FIELD)),
            ChangeKind::Update | ChangeKind::Delete if !exists => {
                return Err(CoreError::not_found(format!("document {} in {group}", change.id)));
            }
            _ => {}
        }

        if let (Some(doc), Some(state)) = (&change.document, work.group(group)) {
            let superseded = |holder: &DocumentId| touched.contains(&(group, *holder));
            if let Some(field) = state.indexes.unique_conflict(&change.id, doc, superseded) {
                return Err(CoreError::constraint(group, field));
            }
        }
    }
    Ok(())
}

/// Buffers the batch's log records and returns its commit sequence.
fn log_batch(wal: &mut WriteAheadLog, batch: &Batch) -> CoreResult<SequenceNumber> {
    let txid = batch.txid;
    wal.append(&WalRecord::Begin { txid })?;
    for change in &batch.changes {
        let record = match &change.document {
            Some(document) => WalRecord::Put {
                txid,
                group: change.group.clone(),
                id: change.id,
                document: document.clone(),
            },
            None => WalRecord::Delete {
                txid,
                group: change.group.clone(),
                id: change.id,
            },
        };
        wal.append(&record)?;
    }
    wal.mark_committed(txid)
}
