//! Rewriting the data file without superseded blocks.

use crate::error::CoreResult;
use crate::snapshot::GroupState;
use crate::store::RecordStore;
use crate::types::SequenceNumber;
use sealdb_storage::StorageBackend;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Outcome of a compaction.
#[derive(Debug)]
pub(crate) struct Compacted {
    pub store: RecordStore,
    pub groups: BTreeMap<String, Arc<GroupState>>,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Copies the live state of `groups` from `source` into `target`.
///
/// Document blocks are copied verbatim: their authentication binds group,
/// document and sequence but not the file offset, so they stay valid at a
/// new position. Catalog blocks are written fresh and the result ends in a
/// checkpoint at `sequence`, synced before returning.
pub(crate) fn compact(
    source: &RecordStore,
    target: Box<dyn StorageBackend>,
    groups: &BTreeMap<String, Arc<GroupState>>,
    sequence: SequenceNumber,
) -> CoreResult<Compacted> {
    let bytes_before = source.size()?;
    let store = source.fork(target)?;
    let mut relocated = BTreeMap::new();

    for (name, state) in groups {
        store.define_group(state.id, name, sequence)?;
        for (field, unique) in state.indexes.definitions() {
            store.define_index(state.id, field, unique, sequence)?;
        }

        let mut moved = GroupState::clone(state);
        for location in moved.docs.values_mut() {
            let raw = source.read_raw(*location)?;
            *location = store.append_raw(&raw)?;
        }
        relocated.insert(name.clone(), Arc::new(moved));
    }

    store.checkpoint(sequence)?;
    store.sync()?;
    let bytes_after = store.size()?;
    Ok(Compacted {
        store,
        groups: relocated,
        bytes_before,
        bytes_after,
    })
}
