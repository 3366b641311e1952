//! The append-only record store.

use crate::error::{CoreError, CoreResult};
use crate::id::DocumentId;
use crate::pipeline::Pipeline;
use crate::store::block::{BlockHeader, BlockKind, BlockLocation, BLOCK_HEADER_SIZE, BLOCK_MAGIC};
use crate::store::header::{FileHeader, FileParams};
use crate::types::{GroupId, SequenceNumber};
use parking_lot::RwLock;
use sealdb_codec::{doc, Document, Value};
use sealdb_storage::StorageBackend;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const NO_DOCUMENT: DocumentId = DocumentId::from_bytes([0; 16]);
const NO_GROUP: GroupId = GroupId::new(0);

/// A group as recorded in the data file.
#[derive(Debug, Clone, Default)]
pub struct CatalogGroup {
    /// Group name.
    pub name: String,
    /// Latest block of every live document.
    pub docs: HashMap<DocumentId, BlockLocation>,
    /// Index definitions: field path to uniqueness.
    pub indexes: BTreeMap<String, bool>,
}

/// Result of scanning the data file on open.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Live groups by id.
    pub groups: BTreeMap<GroupId, CatalogGroup>,
    /// Sequence of the last checkpoint block.
    pub checkpoint: SequenceNumber,
    /// Highest group id ever defined.
    pub max_group_id: u32,
    /// End of the last checkpoint block. Everything after it is redone
    /// from the WAL.
    pub valid_end: u64,
    /// Damaged blocks before the last checkpoint.
    pub damaged_blocks: usize,
}

/// Document and catalog blocks, sealed with the record subkey.
///
/// Appends go to the end of the backend and are made durable by
/// [`RecordStore::sync`]. Reads authenticate the block they touch and
/// nothing else, so a damaged document never hides its neighbours.
pub struct RecordStore {
    backend: RwLock<Box<dyn StorageBackend>>,
    pipeline: Arc<Pipeline>,
    data_start: u64,
}

impl RecordStore {
    /// Writes a new header to an empty backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is not empty or the write fails.
    pub fn create(
        mut backend: Box<dyn StorageBackend>,
        params: &FileParams,
        pipeline: Arc<Pipeline>,
    ) -> CoreResult<Self> {
        if backend.size()? != 0 {
            return Err(CoreError::invalid_operation(
                "refusing to overwrite a non-empty data file",
            ));
        }
        let header = FileHeader::encode(params, &pipeline)?;
        backend.append(&header)?;
        backend.sync()?;
        Ok(Self {
            backend: RwLock::new(backend),
            pipeline,
            data_start: header.len() as u64,
        })
    }

    /// Opens a backend whose header has already been read and verified.
    #[must_use]
    pub fn open(backend: Box<dyn StorageBackend>, header: &FileHeader, pipeline: Arc<Pipeline>) -> Self {
        Self {
            backend: RwLock::new(backend),
            pipeline,
            data_start: header.data_start,
        }
    }

    /// Creates an empty store on `backend` with the same header and key.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be copied.
    pub fn fork(&self, mut backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let header = self.backend.read().read_at(0, self.data_start as usize)?;
        backend.truncate(0)?;
        backend.append(&header)?;
        Ok(Self {
            backend: RwLock::new(backend),
            pipeline: Arc::clone(&self.pipeline),
            data_start: self.data_start,
        })
    }

    fn append(&self, mut header: BlockHeader, body: &[u8]) -> CoreResult<BlockLocation> {
        let sealed = self.pipeline.seal(body, &header.context())?;
        header.body_len = u32::try_from(sealed.len())
            .map_err(|_| CoreError::invalid_document("document too large for one block"))?;

        let mut block = header.encode();
        block.extend_from_slice(&sealed);
        let offset = self.backend.write().append(&block)?;
        Ok(BlockLocation {
            offset,
            len: block.len() as u64,
        })
    }

    /// Appends a document version.
    ///
    /// # Errors
    ///
    /// Returns an error if sealing or the write fails.
    pub fn put(
        &self,
        group: GroupId,
        id: DocumentId,
        sequence: SequenceNumber,
        doc: &Document,
    ) -> CoreResult<BlockLocation> {
        let header = BlockHeader::new(BlockKind::Put, group, id, sequence);
        self.append(header, &sealdb_codec::encode_document(doc))
    }

    /// Appends a deletion marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn tombstone(&self, group: GroupId, id: DocumentId, sequence: SequenceNumber) -> CoreResult<()> {
        self.append(BlockHeader::new(BlockKind::Tombstone, group, id, sequence), &[])?;
        Ok(())
    }

    /// Records that `name` is stored under `group`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn define_group(&self, group: GroupId, name: &str, sequence: SequenceNumber) -> CoreResult<()> {
        let header = BlockHeader::new(BlockKind::Group, group, NO_DOCUMENT, sequence);
        self.append(header, name.as_bytes())?;
        Ok(())
    }

    /// Records that `group` and its documents are gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn drop_group(&self, group: GroupId, sequence: SequenceNumber) -> CoreResult<()> {
        self.append(BlockHeader::new(BlockKind::DropGroup, group, NO_DOCUMENT, sequence), &[])?;
        Ok(())
    }

    /// Records an index definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn define_index(
        &self,
        group: GroupId,
        field: &str,
        unique: bool,
        sequence: SequenceNumber,
    ) -> CoreResult<()> {
        let body = sealdb_codec::encode_document(&doc! { "field" => field, "unique" => unique });
        self.append(BlockHeader::new(BlockKind::Index, group, NO_DOCUMENT, sequence), &body)?;
        Ok(())
    }

    /// Records that an index was dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn drop_index(&self, group: GroupId, field: &str, sequence: SequenceNumber) -> CoreResult<()> {
        let header = BlockHeader::new(BlockKind::DropIndex, group, NO_DOCUMENT, sequence);
        self.append(header, field.as_bytes())?;
        Ok(())
    }

    /// Appends a checkpoint marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn checkpoint(&self, sequence: SequenceNumber) -> CoreResult<()> {
        self.append(BlockHeader::new(BlockKind::Checkpoint, NO_GROUP, NO_DOCUMENT, sequence), &[])?;
        Ok(())
    }

    /// Reads and authenticates one document block.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TamperOrCorruption`] if the block header or
    /// body fails verification.
    pub fn read_document(&self, location: BlockLocation) -> CoreResult<Document> {
        let raw = self.read_raw(location)?;
        let header = BlockHeader::decode(&raw)?;
        if header.kind != BlockKind::Put || header.block_len() != location.len {
            return Err(CoreError::tamper(format!(
                "block at offset {} changed shape",
                location.offset
            )));
        }
        self.pipeline
            .decode(&raw[BLOCK_HEADER_SIZE..], &header.context())
            .map_err(|e| match e {
                CoreError::TamperOrCorruption { context } => {
                    CoreError::tamper(format!("document {}: {context}", header.id))
                }
                other => other,
            })
    }

    /// Reads the raw bytes of one block.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is outside the file.
    pub fn read_raw(&self, location: BlockLocation) -> CoreResult<Vec<u8>> {
        let len = usize::try_from(location.len)
            .map_err(|_| CoreError::tamper("block length overflows memory"))?;
        Ok(self.backend.read().read_at(location.offset, len)?)
    }

    /// Appends a block copied verbatim from another store with the same key.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn append_raw(&self, raw: &[u8]) -> CoreResult<BlockLocation> {
        let offset = self.backend.write().append(raw)?;
        Ok(BlockLocation {
            offset,
            len: raw.len() as u64,
        })
    }

    /// Makes every appended block durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.backend.write().sync()?;
        Ok(())
    }

    /// Current file size.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.read().size()?)
    }

    /// Cuts the file back to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is inside the header or the truncate fails.
    pub fn truncate(&self, len: u64) -> CoreResult<()> {
        if len < self.data_start {
            return Err(CoreError::invalid_operation("cannot truncate into the header"));
        }
        let mut backend = self.backend.write();
        backend.truncate(len)?;
        backend.sync()?;
        Ok(())
    }

    /// Scans the file and rebuilds the catalog as of the last checkpoint.
    ///
    /// The first pass reads headers. A header that fails its checksum is
    /// kept if its body still authenticates under the parsed fields;
    /// otherwise the scan searches forward for the next valid header. The
    /// second pass authenticates and interprets every block up to the last
    /// checkpoint. A document block that fails is pinned as the current,
    /// unreadable version of the document it belongs to, so reads of that
    /// document fail instead of returning an older version.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TamperOrCorruption`] if a catalog or checkpoint
    /// block fails authentication, or if a block before the last checkpoint
    /// is too damaged to tell which document it belonged to.
    pub fn scan(&self) -> CoreResult<ScanReport> {
        let bytes = self.backend.read().read_all()?;
        let start = self.data_start as usize;

        let mut blocks = Vec::new();
        let mut damaged = Vec::new();
        let mut offset = start;
        while offset < bytes.len() {
            let found = header_at(&bytes, offset)
                .map(|header| (header, true))
                .or_else(|| self.recover_header(&bytes, offset).map(|header| (header, false)));
            match found {
                Some((header, intact)) => {
                    blocks.push(ScannedBlock {
                        offset,
                        header,
                        intact,
                    });
                    offset += header.block_len() as usize;
                }
                None => {
                    damaged.push(offset);
                    match resync(&bytes, offset + 1) {
                        Some(next) => offset = next,
                        None => break,
                    }
                }
            }
        }

        let last_checkpoint = blocks
            .iter()
            .rposition(|b| b.header.kind == BlockKind::Checkpoint);
        let valid_end = last_checkpoint.map_or(start, |i| blocks[i].end());

        if let Some(offset) = damaged.iter().find(|&&o| o < valid_end) {
            return Err(CoreError::tamper(format!(
                "block at offset {offset} is damaged beyond attribution"
            )));
        }
        // A torn append never leaves a whole block behind, and the WAL
        // entries a lost checkpoint covered are already gone.
        if let Some(offset) = damaged.iter().find(|&&o| lost_checkpoint_at(&bytes, o)) {
            return Err(CoreError::tamper(format!(
                "checkpoint block at offset {offset} failed verification"
            )));
        }

        let mut report = ScanReport {
            valid_end: valid_end as u64,
            ..ScanReport::default()
        };
        if bytes.len() > valid_end {
            tracing::debug!(
                bytes = bytes.len() - valid_end,
                "data written after the last checkpoint will be redone from the WAL"
            );
        }

        if let Some(last) = last_checkpoint {
            for block in &blocks[..=last] {
                let body = &bytes[block.offset + BLOCK_HEADER_SIZE..block.end()];
                self.apply_block(&mut report, block, body)?;
            }
        }
        if report.damaged_blocks > 0 {
            tracing::warn!(
                count = report.damaged_blocks,
                "data file holds damaged blocks; affected documents are unreadable"
            );
        }
        Ok(report)
    }

    /// Reads a block whose header checksum failed, provided its body
    /// authenticates under the header as written.
    fn recover_header(&self, bytes: &[u8], offset: usize) -> Option<BlockHeader> {
        let header = BlockHeader::decode_unverified(bytes.get(offset..)?).ok()?;
        let end = offset.checked_add(usize::try_from(header.block_len()).ok()?)?;
        let body = bytes.get(offset + BLOCK_HEADER_SIZE..end)?;
        self.pipeline.open(body, &header.context()).ok()?;
        Some(header)
    }

    fn apply_block(&self, report: &mut ScanReport, block: &ScannedBlock, body: &[u8]) -> CoreResult<()> {
        let header = block.header;
        let location = block.location();
        if !block.intact {
            report.damaged_blocks += 1;
        }

        if matches!(header.kind, BlockKind::Put | BlockKind::Tombstone) {
            let Some(group) = report.groups.get_mut(&header.group) else {
                tracing::warn!(group = %header.group, "document block for an unknown group");
                return Ok(());
            };
            let authentic = self.pipeline.open(body, &header.context()).is_ok();
            if !authentic {
                report.damaged_blocks += 1;
                let owner = self.attribute(&header, body, group.docs.keys().copied());
                group.docs.insert(owner.unwrap_or(header.id), location);
            } else if !block.intact {
                group.docs.insert(header.id, location);
            } else if header.kind == BlockKind::Put {
                group.docs.insert(header.id, location);
            } else {
                group.docs.remove(&header.id);
            }
            return Ok(());
        }

        let plain = self.pipeline.open(body, &header.context()).map_err(|_| {
            CoreError::tamper(format!(
                "{:?} block for {} failed authentication",
                header.kind, header.group
            ))
        })?;
        match header.kind {
            BlockKind::Group => {
                let name = String::from_utf8(plain)
                    .map_err(|_| CoreError::tamper("group name is not UTF-8"))?;
                report.max_group_id = report.max_group_id.max(header.group.as_u32());
                report.groups.insert(
                    header.group,
                    CatalogGroup {
                        name,
                        ..CatalogGroup::default()
                    },
                );
            }
            BlockKind::DropGroup => {
                report.groups.remove(&header.group);
            }
            BlockKind::Index => {
                let def = sealdb_codec::decode_document(&plain)
                    .map_err(|e| CoreError::tamper(format!("index definition: {e}")))?;
                let field = def.get("field").and_then(Value::as_text);
                let unique = def.get("unique").and_then(Value::as_bool);
                let (Some(field), Some(unique)) = (field, unique) else {
                    return Err(CoreError::tamper("index definition is missing fields"));
                };
                if let Some(group) = report.groups.get_mut(&header.group) {
                    group.indexes.insert(field.to_string(), unique);
                }
            }
            BlockKind::DropIndex => {
                let field = String::from_utf8(plain)
                    .map_err(|_| CoreError::tamper("index field is not UTF-8"))?;
                if let Some(group) = report.groups.get_mut(&header.group) {
                    group.indexes.remove(&field);
                }
            }
            BlockKind::Checkpoint => report.checkpoint = header.sequence,
            BlockKind::Put | BlockKind::Tombstone => {}
        }
        Ok(())
    }

    /// Finds the document a document block really belongs to when its
    /// header was rewritten to name another one.
    fn attribute(
        &self,
        header: &BlockHeader,
        body: &[u8],
        candidates: impl Iterator<Item = DocumentId>,
    ) -> Option<DocumentId> {
        candidates
            .filter(|id| *id != header.id)
            .find(|id| {
                [BlockKind::Put, BlockKind::Tombstone].into_iter().any(|kind| {
                    let claimed = BlockHeader { kind, id: *id, ..*header };
                    self.pipeline.open(body, &claimed.context()).is_ok()
                })
            })
    }

    /// Authenticates every block in the file, live or superseded.
    ///
    /// # Errors
    ///
    /// Returns an error only if the backend cannot be read.
    pub fn verify(&self) -> CoreResult<BlockAudit> {
        let bytes = self.backend.read().read_all()?;
        let mut audit = BlockAudit::default();
        let mut offset = self.data_start as usize;
        while offset < bytes.len() {
            match header_at(&bytes, offset) {
                Some(header) => {
                    let end = offset + header.block_len() as usize;
                    let body = &bytes[offset + BLOCK_HEADER_SIZE..end];
                    audit.blocks += 1;
                    if self.pipeline.open(body, &header.context()).is_err() {
                        audit.damaged += 1;
                    }
                    offset = end;
                }
                None => match resync(&bytes, offset + 1) {
                    Some(next) => {
                        audit.damaged += 1;
                        offset = next;
                    }
                    None => {
                        audit.unreadable_tail = (bytes.len() - offset) as u64;
                        break;
                    }
                },
            }
        }
        Ok(audit)
    }
}

/// Block counts found by [`RecordStore::verify`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockAudit {
    /// Blocks with a valid header.
    pub blocks: usize,
    /// Blocks whose header or body failed verification.
    pub damaged: usize,
    /// Bytes after the last recognizable block.
    pub unreadable_tail: u64,
}

#[derive(Debug, Clone, Copy)]
struct ScannedBlock {
    offset: usize,
    header: BlockHeader,
    /// `false` if the header checksum failed but the body authenticated.
    intact: bool,
}

impl ScannedBlock {
    fn end(&self) -> usize {
        self.offset + self.header.block_len() as usize
    }

    fn location(&self) -> BlockLocation {
        BlockLocation {
            offset: self.offset as u64,
            len: self.header.block_len(),
        }
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("data_start", &self.data_start)
            .finish_non_exhaustive()
    }
}

fn header_at(bytes: &[u8], offset: usize) -> Option<BlockHeader> {
    let header = BlockHeader::decode(bytes.get(offset..)?).ok()?;
    let end = offset.checked_add(usize::try_from(header.block_len()).ok()?)?;
    (end <= bytes.len()).then_some(header)
}

fn lost_checkpoint_at(bytes: &[u8], offset: usize) -> bool {
    let Some(header) = bytes
        .get(offset..)
        .and_then(|rest| BlockHeader::decode_unverified(rest).ok())
    else {
        return false;
    };
    let complete = usize::try_from(header.block_len())
        .ok()
        .and_then(|len| offset.checked_add(len))
        .is_some_and(|end| end <= bytes.len());
    header.kind == BlockKind::Checkpoint && complete
}

fn resync(bytes: &[u8], from: usize) -> Option<usize> {
    let magic = BLOCK_MAGIC.to_le_bytes();
    (from..bytes.len().saturating_sub(BLOCK_HEADER_SIZE - 1))
        .filter(|&o| bytes[o..o + 2] == magic)
        .find(|&o| header_at(bytes, o).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, KdfParams};
    use crate::crypto::EncryptionKey;
    use crate::store::header::FILE_FORMAT;
    use sealdb_storage::InMemoryBackend;

    fn store() -> (RecordStore, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        let pipeline = Pipeline::new(&EncryptionKey::from_bytes([5; 32]), &Config::default());
        let params = FileParams {
            format: FILE_FORMAT,
            salt: [0; 16],
            kdf: KdfParams::low_cost(),
            created_at_ms: 0,
        };
        let store = RecordStore::create(Box::new(backend.clone()), &params, Arc::new(pipeline)).unwrap();
        (store, backend)
    }

    fn seq(n: u64) -> SequenceNumber {
        SequenceNumber::new(n)
    }

    #[test]
    fn documents_read_back_by_location() {
        let (store, _) = store();
        let group = GroupId::new(1);
        store.define_group(group, "users", seq(1)).unwrap();
        let doc = doc! { "name" => "alice" };
        let loc = store.put(group, DocumentId::new(), seq(1), &doc).unwrap();
        assert_eq!(store.read_document(loc).unwrap(), doc);
    }

    #[test]
    fn scan_rebuilds_catalog_up_to_checkpoint() {
        let (store, _) = store();
        let group = GroupId::new(1);
        let (a, b) = (DocumentId::new(), DocumentId::new());
        store.define_group(group, "users", seq(1)).unwrap();
        store.define_index(group, "email", true, seq(1)).unwrap();
        store.put(group, a, seq(1), &doc! { "n" => 1 }).unwrap();
        let b_loc = store.put(group, b, seq(2), &doc! { "n" => 2 }).unwrap();
        store.tombstone(group, a, seq(3)).unwrap();
        store.checkpoint(seq(3)).unwrap();
        let end = store.size().unwrap();
        store.put(group, DocumentId::new(), seq(4), &doc! { "n" => 3 }).unwrap();

        let report = store.scan().unwrap();
        assert_eq!(report.checkpoint, seq(3));
        assert_eq!(report.valid_end, end);
        assert_eq!(report.max_group_id, 1);
        let users = &report.groups[&group];
        assert_eq!(users.name, "users");
        assert_eq!(users.indexes.get("email"), Some(&true));
        assert_eq!(users.docs.len(), 1);
        assert_eq!(users.docs[&b], b_loc);
    }

    #[test]
    fn dropped_groups_and_indexes_disappear() {
        let (store, _) = store();
        store.define_group(GroupId::new(1), "a", seq(1)).unwrap();
        store.define_group(GroupId::new(2), "b", seq(1)).unwrap();
        store.define_index(GroupId::new(2), "x", false, seq(1)).unwrap();
        store.drop_index(GroupId::new(2), "x", seq(1)).unwrap();
        store.drop_group(GroupId::new(1), seq(1)).unwrap();
        store.checkpoint(seq(1)).unwrap();

        let report = store.scan().unwrap();
        assert_eq!(report.groups.len(), 1);
        assert!(report.groups[&GroupId::new(2)].indexes.is_empty());
        assert_eq!(report.max_group_id, 2);
    }

    #[test]
    fn damaged_body_is_detected_on_read_only() {
        let (store, backend) = store();
        let group = GroupId::new(1);
        store.define_group(group, "g", seq(1)).unwrap();
        let good = store.put(group, DocumentId::new(), seq(1), &doc! { "v" => "good" }).unwrap();
        let bad = store.put(group, DocumentId::new(), seq(1), &doc! { "v" => "bad" }).unwrap();
        store.checkpoint(seq(1)).unwrap();

        backend.flip_byte(bad.offset as usize + BLOCK_HEADER_SIZE + 20, 0x80);

        let report = store.scan().unwrap();
        assert_eq!(report.groups[&group].docs.len(), 2);
        assert!(store.read_document(bad).unwrap_err().is_tamper());
        assert_eq!(store.read_document(good).unwrap(), doc! { "v" => "good" });
    }

    /// Rewrites a block header in place with a matching checksum.
    fn rewrite_header(backend: &InMemoryBackend, offset: u64, edit: impl FnOnce(&mut BlockHeader)) {
        let data = backend.data();
        let at = offset as usize;
        let old = &data[at..at + BLOCK_HEADER_SIZE];
        let mut header = BlockHeader::decode(old).unwrap();
        edit(&mut header);
        for (i, (a, b)) in old.iter().zip(header.encode()).enumerate() {
            if *a != b {
                backend.flip_byte(at + i, a ^ b);
            }
        }
    }

    #[test]
    fn header_damaged_beyond_attribution_is_fatal() {
        let (store, backend) = store();
        let group = GroupId::new(1);
        let id = DocumentId::new();
        store.define_group(group, "g", seq(1)).unwrap();
        store.put(group, id, seq(1), &doc! { "v" => 1 }).unwrap();
        let update = store.put(group, id, seq(2), &doc! { "v" => 2 }).unwrap();
        store.checkpoint(seq(2)).unwrap();

        // Kind byte: the older version must not come back as current.
        backend.flip_byte(update.offset as usize + 2, 0xFF);

        assert!(store.scan().unwrap_err().is_tamper());
    }

    #[test]
    fn damaged_checksum_pins_the_document_as_unreadable() {
        let (store, backend) = store();
        let group = GroupId::new(1);
        let id = DocumentId::new();
        store.define_group(group, "g", seq(1)).unwrap();
        store.put(group, id, seq(1), &doc! { "v" => 1 }).unwrap();
        let update = store.put(group, id, seq(2), &doc! { "v" => 2 }).unwrap();
        store.checkpoint(seq(2)).unwrap();

        backend.flip_byte(update.offset as usize + BLOCK_HEADER_SIZE - 1, 0x01);

        let report = store.scan().unwrap();
        assert_eq!(report.damaged_blocks, 1);
        assert_eq!(report.checkpoint, seq(2));
        let pinned = report.groups[&group].docs[&id];
        assert_eq!(pinned, update);
        assert!(store.read_document(pinned).unwrap_err().is_tamper());
    }

    #[test]
    fn rewritten_tombstone_blames_its_real_document() {
        let (store, backend) = store();
        let group = GroupId::new(1);
        let (a, b) = (DocumentId::new(), DocumentId::new());
        store.define_group(group, "g", seq(1)).unwrap();
        store.put(group, a, seq(1), &doc! { "v" => "a" }).unwrap();
        let b_loc = store.put(group, b, seq(2), &doc! { "v" => "b" }).unwrap();
        let tombstone_at = store.size().unwrap();
        store.tombstone(group, a, seq(3)).unwrap();
        store.checkpoint(seq(3)).unwrap();

        rewrite_header(&backend, tombstone_at, |h| h.id = b);

        let report = store.scan().unwrap();
        assert_eq!(report.damaged_blocks, 1);
        let docs = &report.groups[&group].docs;
        assert_eq!(docs[&b], b_loc);
        assert!(store.read_document(docs[&a]).unwrap_err().is_tamper());
    }

    #[test]
    fn rewritten_checkpoint_sequence_is_fatal() {
        let (store, backend) = store();
        store.define_group(GroupId::new(1), "g", seq(1)).unwrap();
        let checkpoint_at = store.size().unwrap();
        store.checkpoint(seq(4)).unwrap();

        rewrite_header(&backend, checkpoint_at, |h| h.sequence = seq(400));

        assert!(store.scan().unwrap_err().is_tamper());
    }

    #[test]
    fn rewritten_drop_group_is_fatal() {
        let (store, backend) = store();
        store.define_group(GroupId::new(1), "a", seq(1)).unwrap();
        store.define_group(GroupId::new(2), "b", seq(1)).unwrap();
        let drop_at = store.size().unwrap();
        store.drop_group(GroupId::new(1), seq(2)).unwrap();
        store.checkpoint(seq(2)).unwrap();

        rewrite_header(&backend, drop_at, |h| h.group = GroupId::new(2));

        assert!(store.scan().unwrap_err().is_tamper());
    }

    #[test]
    fn damaged_last_checkpoint_is_fatal() {
        let (store, backend) = store();
        let group = GroupId::new(1);
        store.define_group(group, "g", seq(1)).unwrap();
        store.checkpoint(seq(1)).unwrap();
        store.put(group, DocumentId::new(), seq(2), &doc! { "v" => 1 }).unwrap();
        let checkpoint_at = store.size().unwrap() as usize;
        store.checkpoint(seq(2)).unwrap();

        // Sequence field: neither the checksum nor the tag matches.
        backend.flip_byte(checkpoint_at + 30, 0x01);
        assert!(store.scan().unwrap_err().is_tamper());
    }

    #[test]
    fn torn_checkpoint_is_cut() {
        let (store, backend) = store();
        let group = GroupId::new(1);
        store.define_group(group, "g", seq(1)).unwrap();
        store.checkpoint(seq(1)).unwrap();
        let valid_end = store.size().unwrap();
        store.put(group, DocumentId::new(), seq(2), &doc! { "v" => 1 }).unwrap();
        store.checkpoint(seq(2)).unwrap();
        backend.chop(3);

        let report = store.scan().unwrap();
        assert_eq!(report.valid_end, valid_end);
        assert_eq!(report.checkpoint, seq(1));
    }

    #[test]
    fn verify_counts_every_damaged_block() {
        let (store, backend) = store();
        let group = GroupId::new(1);
        store.define_group(group, "g", seq(1)).unwrap();
        let old = store.put(group, DocumentId::new(), seq(1), &doc! { "v" => 1 }).unwrap();
        store.put(group, DocumentId::new(), seq(2), &doc! { "v" => 2 }).unwrap();
        store.checkpoint(seq(2)).unwrap();
        assert_eq!(
            store.verify().unwrap(),
            BlockAudit {
                blocks: 4,
                damaged: 0,
                unreadable_tail: 0
            }
        );

        backend.flip_byte(old.offset as usize + BLOCK_HEADER_SIZE + 3, 0x04);
        backend.clone().append(b"torn").unwrap();
        let audit = store.verify().unwrap();
        assert_eq!(audit.damaged, 1);
        assert_eq!(audit.unreadable_tail, 4);
    }

    #[test]
    fn damaged_group_definition_is_fatal() {
        let (store, backend) = store();
        store.define_group(GroupId::new(1), "users", seq(1)).unwrap();
        store.checkpoint(seq(1)).unwrap();
        let size = backend.data().len();
        // Last body byte of the group block sits just before the checkpoint block.
        let checkpoint_len = BLOCK_HEADER_SIZE + crate::pipeline::FRAME_OVERHEAD;
        backend.flip_byte(size - checkpoint_len - 1, 0x01);
        assert!(store.scan().unwrap_err().is_tamper());
    }

    #[test]
    fn no_checkpoint_means_nothing_is_trusted() {
        let (store, _) = store();
        store.define_group(GroupId::new(1), "g", seq(1)).unwrap();
        let report = store.scan().unwrap();
        assert!(report.groups.is_empty());
        assert_eq!(report.checkpoint, SequenceNumber::default());
    }

    #[test]
    fn fork_copies_header_only() {
        let (store, _) = store();
        store.define_group(GroupId::new(1), "g", seq(1)).unwrap();
        let target = InMemoryBackend::new();
        let fork = store.fork(Box::new(target.clone())).unwrap();
        assert_eq!(target.data().len() as u64, store.data_start);
        fork.checkpoint(seq(1)).unwrap();
        assert!(fork.scan().unwrap().groups.is_empty());
    }
}
