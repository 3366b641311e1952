//! The write-ahead log file: header, buffered appends, group flush, replay.

use crate::crypto::SALT_SIZE;
use crate::error::{CoreError, CoreResult};
use crate::pipeline::Pipeline;
use crate::types::{SequenceNumber, TransactionId};
use crate::wal::record::{compute_crc32, WalRecord};
use bytes::{Buf, BufMut};
use sealdb_storage::StorageBackend;
use std::collections::HashMap;

/// Magic bytes at the start of the WAL file.
pub const WAL_MAGIC: [u8; 4] = *b"SWAL";

/// Current WAL format version.
pub const WAL_VERSION: u16 = 1;

/// magic (4) + version (2) + reserved (2) + salt (16) + crc (4)
pub const WAL_HEADER_SIZE: usize = 4 + 2 + 2 + SALT_SIZE + 4;

/// length (4) + crc (4)
const ENTRY_PREFIX_SIZE: usize = 8;

/// Entries larger than this are treated as a corrupt length field.
const MAX_ENTRY_SIZE: usize = 1 << 30;

/// Associated-data context for WAL frames.
const WAL_CONTEXT: &[u8] = b"sealdb/wal";

/// A transaction whose commit marker made it into the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTransaction {
    /// Transaction ID.
    pub txid: TransactionId,
    /// Sequence number of the commit marker.
    pub sequence: SequenceNumber,
    /// `Put` and `Delete` records in log order.
    pub records: Vec<WalRecord>,
}

/// Result of scanning the log.
#[derive(Debug, Default)]
pub struct Replay {
    /// Committed transactions newer than the requested sequence, in commit order.
    pub transactions: Vec<CommittedTransaction>,
    /// Highest sequence number seen in any intact entry.
    pub last_sequence: SequenceNumber,
    /// Highest transaction id seen in any intact entry.
    pub max_txid: TransactionId,
    /// Length of the intact prefix of the file.
    pub valid_len: u64,
    /// Number of intact entries.
    pub entries: usize,
    /// Whether the scan stopped before the end of the file.
    pub torn: bool,
}

/// Append-only, sealed write-ahead log.
///
/// Appends are buffered in memory and reach the backend in one write on
/// [`WriteAheadLog::flush`], so a whole commit group costs one sync.
pub struct WriteAheadLog {
    backend: Box<dyn StorageBackend>,
    pipeline: Pipeline,
    sync_on_commit: bool,
    pending: Vec<u8>,
    durable_len: u64,
    next_seq: SequenceNumber,
    last_durable_seq: SequenceNumber,
    last_pending_seq: SequenceNumber,
    needs_repair: bool,
}

impl WriteAheadLog {
    /// Writes a fresh header to an empty backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is not empty or cannot be written.
    pub fn create(
        mut backend: Box<dyn StorageBackend>,
        pipeline: Pipeline,
        salt: &[u8; SALT_SIZE],
        sync_on_commit: bool,
    ) -> CoreResult<Self> {
        if backend.size()? != 0 {
            return Err(CoreError::wal_header("refusing to overwrite a non-empty WAL"));
        }
        backend.append(&encode_header(salt))?;
        backend.sync()?;
        Ok(Self::with_backend(backend, pipeline, sync_on_commit))
    }

    /// Opens an existing log, checking that it belongs to the database
    /// with `salt`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WalHeader`] if the header is damaged, has an
    /// unknown version, or carries a different salt.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        pipeline: Pipeline,
        salt: &[u8; SALT_SIZE],
        sync_on_commit: bool,
    ) -> CoreResult<Self> {
        if backend.size()? < WAL_HEADER_SIZE as u64 {
            return Err(CoreError::wal_header("file shorter than the WAL header"));
        }
        let header = backend.read_at(0, WAL_HEADER_SIZE)?;
        let found = decode_header(&header)?;
        if &found != salt {
            return Err(CoreError::wal_header("WAL belongs to a different database"));
        }
        let mut wal = Self::with_backend(backend, pipeline, sync_on_commit);
        wal.durable_len = wal.backend.size()?;
        Ok(wal)
    }

    fn with_backend(
        backend: Box<dyn StorageBackend>,
        pipeline: Pipeline,
        sync_on_commit: bool,
    ) -> Self {
        Self {
            backend,
            pipeline,
            sync_on_commit,
            pending: Vec::new(),
            durable_len: WAL_HEADER_SIZE as u64,
            next_seq: SequenceNumber::new(1),
            last_durable_seq: SequenceNumber::default(),
            last_pending_seq: SequenceNumber::default(),
            needs_repair: false,
        }
    }

    /// Sets the sequence number the next appended record receives.
    pub fn set_next_sequence(&mut self, next: SequenceNumber) {
        self.next_seq = next;
    }

    /// Returns the sequence number of the last durable record.
    #[must_use]
    pub fn last_durable_sequence(&self) -> SequenceNumber {
        self.last_durable_seq
    }

    /// Buffers `record` and returns its sequence number.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or sealed.
    pub fn append(&mut self, record: &WalRecord) -> CoreResult<SequenceNumber> {
        let seq = self.next_seq;
        let frame = self.pipeline.seal(&record.encode(seq)?, WAL_CONTEXT)?;
        let len = u32::try_from(frame.len())
            .map_err(|_| CoreError::invalid_operation("WAL entry too large"))?;

        self.pending.reserve(ENTRY_PREFIX_SIZE + frame.len());
        self.pending.put_u32_le(len);
        self.pending.put_u32_le(compute_crc32(&frame));
        self.pending.put_slice(&frame);

        self.next_seq = seq.next();
        self.last_pending_seq = seq;
        Ok(seq)
    }

    /// Buffers the commit marker of `txid`. It is durable after the next
    /// successful [`WriteAheadLog::flush`].
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be sealed.
    pub fn mark_committed(&mut self, txid: TransactionId) -> CoreResult<SequenceNumber> {
        self.append(&WalRecord::Commit { txid })
    }

    /// Buffers the commit marker of `txid` and makes everything buffered
    /// durable.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WalWrite`] if the write or sync fails.
    pub fn commit(&mut self, txid: TransactionId) -> CoreResult<SequenceNumber> {
        let seq = self.mark_committed(txid)?;
        self.flush()?;
        Ok(seq)
    }

    /// Writes all buffered entries with a single append and sync.
    ///
    /// On failure the buffered entries are discarded and the file is cut
    /// back to its last durable length, so a failed group leaves no trace.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WalWrite`] if the write or sync fails.
    pub fn flush(&mut self) -> CoreResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if self.needs_repair {
            self.repair()?;
        }

        let pending = std::mem::take(&mut self.pending);
        let result = self.backend.append(&pending).and_then(|_| {
            if self.sync_on_commit {
                self.backend.sync()
            } else {
                self.backend.flush()
            }
        });

        match result {
            Ok(()) => {
                self.durable_len += pending.len() as u64;
                self.last_durable_seq = self.last_pending_seq;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, bytes = pending.len(), "WAL flush failed");
                if let Err(repair) = self.repair() {
                    tracing::warn!(error = %repair, "could not cut back WAL, retrying before next write");
                }
                Err(CoreError::wal_write(e.to_string()))
            }
        }
    }

    /// Drops buffered entries that have not been flushed.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.last_pending_seq = self.last_durable_seq;
    }

    fn repair(&mut self) -> CoreResult<()> {
        self.needs_repair = true;
        if self.backend.size()? > self.durable_len {
            self.backend
                .truncate(self.durable_len)
                .map_err(|e| CoreError::wal_write(format!("cut back failed: {e}")))?;
        }
        self.needs_repair = false;
        Ok(())
    }

    /// Bytes in the log, including buffered entries.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.durable_len + self.pending.len() as u64
    }

    /// Returns `true` if the log holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == WAL_HEADER_SIZE as u64
    }

    /// Scans the log and returns the committed transactions with a commit
    /// sequence greater than `after`.
    ///
    /// A short entry, a checksum mismatch or a frame that fails
    /// authentication ends the log: everything from there on is treated as
    /// a torn write and ignored. Transactions without a commit marker are
    /// never returned.
    ///
    /// # Errors
    ///
    /// Returns an error only if the backend cannot be read.
    pub fn replay(&self, after: SequenceNumber) -> CoreResult<Replay> {
        let bytes = self.backend.read_all()?;
        let mut replay = Replay {
            valid_len: WAL_HEADER_SIZE as u64,
            ..Replay::default()
        };
        let mut open: HashMap<TransactionId, Vec<WalRecord>> = HashMap::new();
        let mut rest = bytes.get(WAL_HEADER_SIZE..).unwrap_or_default();

        while !rest.is_empty() {
            let (seq, record) = match next_entry(&mut rest, &self.pipeline) {
                Ok(entry) => entry,
                Err(reason) => {
                    tracing::warn!(
                        offset = replay.valid_len,
                        reason,
                        "WAL ends in a damaged entry, ignoring the tail"
                    );
                    replay.torn = true;
                    break;
                }
            };
            replay.valid_len = (bytes.len() - rest.len()) as u64;
            replay.entries += 1;
            replay.last_sequence = replay.last_sequence.max(seq);
            replay.max_txid = replay.max_txid.max(record.txid());

            match record {
                WalRecord::Begin { txid } => {
                    open.insert(txid, Vec::new());
                }
                WalRecord::Commit { txid } => {
                    let records = open.remove(&txid).unwrap_or_default();
                    if seq > after {
                        replay.transactions.push(CommittedTransaction {
                            txid,
                            sequence: seq,
                            records,
                        });
                    }
                }
                data => open.entry(data.txid()).or_default().push(data),
            }
        }

        if !open.is_empty() {
            tracing::debug!(count = open.len(), "discarding uncommitted WAL transactions");
        }
        Ok(replay)
    }

    /// Cuts off a damaged tail found by [`WriteAheadLog::replay`].
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be truncated.
    pub fn cut_tail(&mut self, valid_len: u64, last_sequence: SequenceNumber) -> CoreResult<()> {
        if self.backend.size()? > valid_len {
            self.backend.truncate(valid_len)?;
            self.backend.sync()?;
        }
        self.durable_len = valid_len;
        self.last_durable_seq = last_sequence;
        self.last_pending_seq = last_sequence;
        Ok(())
    }

    /// Drops every entry up to and including `through` after a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if entries are still
    /// buffered or the log holds entries newer than `through`.
    pub fn truncate(&mut self, through: SequenceNumber) -> CoreResult<()> {
        if !self.pending.is_empty() {
            return Err(CoreError::invalid_operation(
                "cannot truncate the WAL with buffered entries",
            ));
        }
        if self.last_durable_seq > through {
            return Err(CoreError::invalid_operation(format!(
                "WAL holds {} which is newer than {through}",
                self.last_durable_seq
            )));
        }
        self.backend.truncate(WAL_HEADER_SIZE as u64)?;
        self.backend.sync()?;
        self.durable_len = WAL_HEADER_SIZE as u64;
        self.needs_repair = false;
        Ok(())
    }
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("durable_len", &self.durable_len)
            .field("pending", &self.pending.len())
            .field("next_seq", &self.next_seq)
            .finish_non_exhaustive()
    }
}

fn next_entry(
    rest: &mut &[u8],
    pipeline: &Pipeline,
) -> Result<(SequenceNumber, WalRecord), &'static str> {
    if rest.len() < ENTRY_PREFIX_SIZE {
        return Err("truncated entry prefix");
    }
    let mut prefix = &rest[..ENTRY_PREFIX_SIZE];
    let len = prefix.get_u32_le() as usize;
    let crc = prefix.get_u32_le();
    if len > MAX_ENTRY_SIZE {
        return Err("implausible entry length");
    }
    let Some(frame) = rest.get(ENTRY_PREFIX_SIZE..ENTRY_PREFIX_SIZE + len) else {
        return Err("truncated entry");
    };
    if compute_crc32(frame) != crc {
        return Err("checksum mismatch");
    }
    let plain = pipeline
        .open(frame, WAL_CONTEXT)
        .map_err(|_| "entry failed authentication")?;
    let entry = WalRecord::decode(&plain).map_err(|_| "undecodable record")?;
    *rest = &rest[ENTRY_PREFIX_SIZE + len..];
    Ok(entry)
}

fn encode_header(salt: &[u8; SALT_SIZE]) -> Vec<u8> {
    let mut header = Vec::with_capacity(WAL_HEADER_SIZE);
    header.put_slice(&WAL_MAGIC);
    header.put_u16_le(WAL_VERSION);
    header.put_u16_le(0);
    header.put_slice(salt);
    let crc = compute_crc32(&header);
    header.put_u32_le(crc);
    header
}

fn decode_header(bytes: &[u8]) -> CoreResult<[u8; SALT_SIZE]> {
    let (body, mut crc) = bytes.split_at(WAL_HEADER_SIZE - 4);
    if compute_crc32(body) != crc.get_u32_le() {
        return Err(CoreError::wal_header("header checksum mismatch"));
    }
    let mut body = body;
    let mut magic = [0u8; 4];
    body.copy_to_slice(&mut magic);
    if magic != WAL_MAGIC {
        return Err(CoreError::wal_header("bad magic"));
    }
    let version = body.get_u16_le();
    if version != WAL_VERSION {
        return Err(CoreError::wal_header(format!(
            "unsupported version {version}"
        )));
    }
    body.advance(2);
    let mut salt = [0u8; SALT_SIZE];
    body.copy_to_slice(&mut salt);
    Ok(salt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crypto::EncryptionKey;
    use crate::id::DocumentId;
    use sealdb_codec::doc;
    use sealdb_storage::{FaultyBackend, InMemoryBackend};

    const SALT: [u8; SALT_SIZE] = [7; SALT_SIZE];

    fn pipeline() -> Pipeline {
        Pipeline::new(&EncryptionKey::from_bytes([3; 32]), &Config::default())
    }

    fn fresh() -> (WriteAheadLog, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        let wal = WriteAheadLog::create(Box::new(backend.clone()), pipeline(), &SALT, true).unwrap();
        (wal, backend)
    }

    fn put(txid: u64, group: &str) -> WalRecord {
        WalRecord::Put {
            txid: TransactionId::new(txid),
            group: group.into(),
            id: DocumentId::new(),
            document: doc! { "n" => txid as i64 },
        }
    }

    fn write_txn(wal: &mut WriteAheadLog, txid: u64) -> SequenceNumber {
        let txid_value = TransactionId::new(txid);
        wal.append(&WalRecord::Begin { txid: txid_value }).unwrap();
        wal.append(&put(txid, "items")).unwrap();
        wal.commit(txid_value).unwrap()
    }

    #[test]
    fn committed_transactions_replay_in_order() {
        let (mut wal, _) = fresh();
        let first = write_txn(&mut wal, 1);
        let second = write_txn(&mut wal, 2);

        let replay = wal.replay(SequenceNumber::default()).unwrap();
        assert_eq!(replay.transactions.len(), 2);
        assert_eq!(replay.transactions[0].sequence, first);
        assert_eq!(replay.transactions[1].sequence, second);
        assert_eq!(replay.transactions[1].records.len(), 1);
        assert_eq!(replay.last_sequence, second);
        assert_eq!(replay.max_txid, TransactionId::new(2));
        assert_eq!(replay.entries, 6);
        assert!(!replay.torn);
    }

    #[test]
    fn replay_skips_already_applied() {
        let (mut wal, _) = fresh();
        let first = write_txn(&mut wal, 1);
        write_txn(&mut wal, 2);

        let replay = wal.replay(first).unwrap();
        assert_eq!(replay.transactions.len(), 1);
        assert_eq!(replay.transactions[0].txid, TransactionId::new(2));
    }

    #[test]
    fn uncommitted_records_are_ignored() {
        let (mut wal, _) = fresh();
        write_txn(&mut wal, 1);
        wal.append(&WalRecord::Begin {
            txid: TransactionId::new(2),
        })
        .unwrap();
        wal.append(&put(2, "items")).unwrap();
        wal.flush().unwrap();

        let replay = wal.replay(SequenceNumber::default()).unwrap();
        assert_eq!(replay.transactions.len(), 1);
    }

    #[test]
    fn torn_tail_ends_the_log() {
        let (mut wal, backend) = fresh();
        write_txn(&mut wal, 1);
        let intact = backend.data().len();
        write_txn(&mut wal, 2);
        backend.chop(5);

        let replay = wal.replay(SequenceNumber::default()).unwrap();
        assert_eq!(replay.transactions.len(), 1);
        assert!(replay.torn);
        // Begin and put of the second transaction are intact; only its
        // commit marker is cut.
        assert_eq!(replay.entries, 5);
        assert!(replay.valid_len > intact as u64);
        assert!(replay.valid_len < backend.data().len() as u64);
    }

    #[test]
    fn flipped_bit_ends_the_log() {
        let (mut wal, backend) = fresh();
        write_txn(&mut wal, 1);
        let boundary = backend.data().len();
        write_txn(&mut wal, 2);
        assert!(backend.flip_byte(boundary + 20, 0x01));

        let replay = wal.replay(SequenceNumber::default()).unwrap();
        assert_eq!(replay.transactions.len(), 1);
        assert!(replay.torn);
    }

    #[test]
    fn reopen_checks_salt() {
        let (mut wal, backend) = fresh();
        write_txn(&mut wal, 1);

        let reopened = WriteAheadLog::open(Box::new(backend.clone()), pipeline(), &SALT, true);
        assert!(reopened.is_ok());

        let other = WriteAheadLog::open(Box::new(backend), pipeline(), &[9; SALT_SIZE], true);
        assert!(matches!(other, Err(CoreError::WalHeader { .. })));
    }

    #[test]
    fn damaged_header_is_fatal() {
        let (_, backend) = fresh();
        backend.flip_byte(0, 0xFF);
        let result = WriteAheadLog::open(Box::new(backend), pipeline(), &SALT, true);
        assert!(matches!(result, Err(CoreError::WalHeader { .. })));
    }

    #[test]
    fn group_flush_is_one_sync() {
        let (backend, handle) = FaultyBackend::new(InMemoryBackend::new());
        let mut wal = WriteAheadLog::create(Box::new(backend), pipeline(), &SALT, true).unwrap();
        let before = handle.sync_count();

        for txid in 1..=5 {
            let txid = TransactionId::new(txid);
            wal.append(&WalRecord::Begin { txid }).unwrap();
            wal.mark_committed(txid).unwrap();
        }
        wal.flush().unwrap();

        assert_eq!(handle.sync_count(), before + 1);
        assert_eq!(wal.replay(SequenceNumber::default()).unwrap().transactions.len(), 5);
    }

    #[test]
    fn failed_flush_leaves_no_trace() {
        let memory = InMemoryBackend::new();
        let (backend, handle) = FaultyBackend::new(memory.clone());
        let mut wal = WriteAheadLog::create(Box::new(backend), pipeline(), &SALT, true).unwrap();
        write_txn(&mut wal, 1);
        let size = memory.data().len();

        handle.fail_syncs(true);
        let txid = TransactionId::new(2);
        wal.append(&WalRecord::Begin { txid }).unwrap();
        let err = wal.commit(txid).unwrap_err();
        assert!(matches!(err, CoreError::WalWrite { .. }));
        assert_eq!(memory.data().len(), size);

        handle.heal();
        write_txn(&mut wal, 3);
        let replay = wal.replay(SequenceNumber::default()).unwrap();
        let txids: Vec<_> = replay.transactions.iter().map(|t| t.txid.as_u64()).collect();
        assert_eq!(txids, vec![1, 3]);
    }

    #[test]
    fn truncate_resets_to_header() {
        let (mut wal, backend) = fresh();
        let seq = write_txn(&mut wal, 1);
        wal.truncate(seq).unwrap();
        assert!(wal.is_empty());
        assert_eq!(backend.data().len(), WAL_HEADER_SIZE);
        assert!(wal.replay(SequenceNumber::default()).unwrap().transactions.is_empty());
    }

    #[test]
    fn truncate_refuses_newer_entries() {
        let (mut wal, _) = fresh();
        let first = write_txn(&mut wal, 1);
        write_txn(&mut wal, 2);
        assert!(matches!(
            wal.truncate(first),
            Err(CoreError::InvalidOperation { .. })
        ));
    }
}
