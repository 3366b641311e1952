//! Immutable committed state shared with readers.

use crate::error::CoreResult;
use crate::id::DocumentId;
use crate::index::IndexManager;
use crate::store::{BlockLocation, RecordStore};
use crate::types::{GroupId, SequenceNumber};
use sealdb_codec::Document;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One group's committed documents and indexes.
#[derive(Debug, Clone)]
pub(crate) struct GroupState {
    pub id: GroupId,
    pub docs: HashMap<DocumentId, BlockLocation>,
    pub indexes: IndexManager,
}

impl GroupState {
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            docs: HashMap::new(),
            indexes: IndexManager::new(),
        }
    }
}

/// The database as of one commit.
///
/// Readers clone the `Arc` and never see a later commit. The commit leader
/// clones the snapshot, edits groups through `Arc::make_mut`, and publishes
/// the result in one pointer swap.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub sequence: SequenceNumber,
    pub store: Arc<RecordStore>,
    pub groups: BTreeMap<String, Arc<GroupState>>,
}

impl Snapshot {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self {
            sequence: SequenceNumber::default(),
            store,
            groups: BTreeMap::new(),
        }
    }

    pub fn group(&self, name: &str) -> Option<&Arc<GroupState>> {
        self.groups.get(name)
    }

    pub fn contains(&self, group: &str, id: &DocumentId) -> bool {
        self.group(group).is_some_and(|g| g.docs.contains_key(id))
    }

    /// Reads a committed document.
    pub fn read(&self, group: &str, id: &DocumentId) -> CoreResult<Option<Document>> {
        match self.group(group).and_then(|g| g.docs.get(id)) {
            Some(location) => self.store.read_document(*location).map(Some),
            None => Ok(None),
        }
    }

    /// Mutable access to a group, creating nothing.
    pub fn group_mut(&mut self, name: &str) -> Option<&mut GroupState> {
        self.groups.get_mut(name).map(Arc::make_mut)
    }
}
