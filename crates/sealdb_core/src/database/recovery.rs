//! Opening a database: key check, catalog scan, WAL replay, index rebuild.

use super::engine::{ensure_group, write_checkpoint, Engine, Layout, Writer};
use crate::config::Config;
use crate::crypto::generate_salt;
use crate::error::{CoreError, CoreResult};
use crate::pipeline::Keyring;
use crate::snapshot::{GroupState, Snapshot};
use crate::stats::DatabaseStats;
use crate::store::{FileHeader, FileParams, RecordStore, FILE_FORMAT};
use crate::wal::{CommittedTransaction, WalRecord, WriteAheadLog};
use sealdb_storage::StorageBackend;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

struct Recovered {
    snapshot: Snapshot,
    writer: Writer,
    next_txid: u64,
}

/// Opens or creates the database held by `data` and `wal`.
///
/// The write lock is held for the whole recovery, since the data file may
/// be truncated and the log emptied.
pub(crate) fn open_engine(
    config: Config,
    passphrase: &[u8],
    layout: Layout,
    data: Box<dyn StorageBackend>,
    wal: Box<dyn StorageBackend>,
) -> CoreResult<Engine> {
    let stats = Arc::new(DatabaseStats::new());
    let recovered = {
        let _guard = layout.write_lock()?;
        recover(&config, passphrase, data, wal, &stats)?
    };
    tracing::info!(
        path = ?layout.path(),
        seq = %recovered.snapshot.sequence,
        groups = recovered.snapshot.groups.len(),
        "database opened"
    );
    Ok(Engine::new(
        config,
        recovered.snapshot,
        recovered.writer,
        recovered.next_txid,
        stats,
        layout,
    ))
}

fn recover(
    config: &Config,
    passphrase: &[u8],
    data: Box<dyn StorageBackend>,
    wal: Box<dyn StorageBackend>,
    stats: &DatabaseStats,
) -> CoreResult<Recovered> {
    let (store, wal_pipeline, salt) = match FileHeader::read(data.as_ref())? {
        Some(header) => {
            let keyring =
                Keyring::derive(passphrase, &header.params.salt, &header.params.kdf, config)?;
            header.verify_key(&keyring.records)?;
            let store = RecordStore::open(data, &header, Arc::new(keyring.records));
            (store, keyring.wal, header.params.salt)
        }
        None if !config.create_if_missing => {
            return Err(CoreError::not_found(
                "database (create_if_missing is false)",
            ));
        }
        None => {
            let params = FileParams {
                format: FILE_FORMAT,
                salt: generate_salt(),
                kdf: config.kdf,
                created_at_ms: now_millis(),
            };
            let keyring = Keyring::derive(passphrase, &params.salt, &params.kdf, config)?;
            let store = RecordStore::create(data, &params, Arc::new(keyring.records))?;
            tracing::info!("created new database");
            (store, keyring.wal, params.salt)
        }
    };

    let wal = if wal.is_empty()? {
        WriteAheadLog::create(wal, wal_pipeline, &salt, config.sync_on_commit)?
    } else {
        WriteAheadLog::open(wal, wal_pipeline, &salt, config.sync_on_commit)?
    };

    let report = store.scan()?;
    let replay = wal.replay(report.checkpoint)?;
    let cut_data_tail = store.size()? > report.valid_end;
    if cut_data_tail {
        store.truncate(report.valid_end)?;
    }
    for _ in 0..report.damaged_blocks {
        stats.record_corrupt();
    }

    let mut snapshot = Snapshot::new(Arc::new(store));
    snapshot.sequence = report.checkpoint;
    for (id, catalog) in report.groups {
        let mut state = GroupState::new(id);
        state.docs = catalog.docs;
        for (field, unique) in &catalog.indexes {
            state.indexes.define(field, *unique);
        }
        snapshot.groups.insert(catalog.name, Arc::new(state));
    }

    let mut writer = Writer {
        wal,
        next_group_id: report.max_group_id + 1,
    };
    redo(&mut snapshot, &mut writer, &replay.transactions)?;
    if replay.torn {
        writer
            .wal
            .cut_tail(replay.valid_len, replay.last_sequence)?;
    }

    rebuild_indexes(&mut snapshot, stats);

    let sequence = report.checkpoint.max(replay.last_sequence);
    snapshot.sequence = sequence;
    writer.wal.set_next_sequence(sequence.next());

    if cut_data_tail || !writer.wal.is_empty() {
        write_checkpoint(&mut writer, &snapshot.store, sequence)?;
        stats.record_checkpoint();
    }
    if !replay.transactions.is_empty() {
        tracing::info!(
            transactions = replay.transactions.len(),
            seq = %sequence,
            "replayed committed transactions from the WAL"
        );
    }

    Ok(Recovered {
        snapshot,
        writer,
        next_txid: replay.max_txid.as_u64() + 1,
    })
}

/// Rewrites the blocks of every replayed transaction at its commit
/// sequence.
fn redo(
    snapshot: &mut Snapshot,
    writer: &mut Writer,
    transactions: &[CommittedTransaction],
) -> CoreResult<()> {
    let store = Arc::clone(&snapshot.store);
    for txn in transactions {
        for record in &txn.records {
            match record {
                WalRecord::Put {
                    group, id, document, ..
                } => {
                    let state = ensure_group(snapshot, writer, group, txn.sequence)?;
                    let location = store.put(state.id, *id, txn.sequence, document)?;
                    state.docs.insert(*id, location);
                }
                WalRecord::Delete { group, id, .. } => {
                    if let Some(state) = snapshot.group_mut(group) {
                        if state.docs.remove(id).is_some() {
                            store.tombstone(state.id, *id, txn.sequence)?;
                        }
                    }
                }
                WalRecord::Begin { .. } | WalRecord::Commit { .. } => {}
            }
        }
        tracing::debug!(txid = %txn.txid, seq = %txn.sequence, records = txn.records.len(), "redo");
    }
    Ok(())
}

/// Fills the defined indexes from the stored documents. Unreadable
/// documents are left out and counted.
fn rebuild_indexes(snapshot: &mut Snapshot, stats: &DatabaseStats) {
    let store = Arc::clone(&snapshot.store);
    for (name, state) in &mut snapshot.groups {
        if state.indexes.is_empty() {
            continue;
        }
        let state = Arc::make_mut(state);
        for (id, location) in &state.docs {
            match store.read_document(*location) {
                Ok(doc) => state.indexes.on_commit(*id, Some(&doc)),
                Err(e) => {
                    tracing::warn!(group = %name, id = %id, error = %e, "document left out of indexes");
                    stats.record_corrupt();
                }
            }
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}
