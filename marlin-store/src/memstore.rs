//! In-memory store engine with first-committer-wins optimistic concurrency.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use marlin_common::error::{MarlinError, MarlinResult};
use marlin_common::ids::{StoreId, TXNID_UNINITED, TxnId};

use crate::binlog::{ReplLogEntry, ReplOp};
use crate::engine::{KvEngine, Transaction, WriteOp};
use crate::record::{RecordKey, RecordValue};
use crate::snapshot;

/// Committed record slot. Tombstones keep their version so conflict detection
/// covers deleted keys.
#[derive(Debug, Clone)]
struct RecordSlot {
    value: Option<RecordValue>,
    version: u64,
}

#[derive(Debug, Default)]
struct EngineState {
    running: bool,
    commit_seq: u64,
    records: HashMap<RecordKey, RecordSlot>,
    binlog: BTreeMap<TxnId, Vec<ReplLogEntry>>,
}

/// In-memory [`KvEngine`] implementation.
///
/// Commit applies buffered writes under one lock, assigns a monotonic transaction id,
/// and captures `with_log` writes as binlog transaction groups.
#[derive(Debug)]
pub struct MemEngine {
    store_id: StoreId,
    backup_dir: PathBuf,
    state: Mutex<EngineState>,
    open_txns: Arc<AtomicUsize>,
}

impl MemEngine {
    /// Creates a running engine whose backups live under `backup_dir`.
    #[must_use]
    pub fn new(store_id: StoreId, backup_dir: PathBuf) -> Self {
        Self {
            store_id,
            backup_dir,
            state: Mutex::new(EngineState {
                running: true,
                ..EngineState::default()
            }),
            open_txns: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Writes the current record set as a snapshot under [`KvEngine::backup_dir`].
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Io` on filesystem failure.
    pub fn save_backup(&self) -> MarlinResult<()> {
        let (entries, resume) = {
            let state = self.lock_state();
            let entries = state
                .records
                .iter()
                .filter_map(|(key, slot)| {
                    slot.value
                        .as_ref()
                        .map(|value| (key.clone(), value.clone()))
                })
                .collect::<Vec<_>>();
            (entries, state.commit_seq)
        };
        snapshot::save_backup(&self.backup_dir, &entries, resume)
    }

    /// Returns all captured binlog entries in transaction order.
    #[must_use]
    pub fn binlog_entries(&self) -> Vec<ReplLogEntry> {
        let state = self.lock_state();
        state.binlog.values().flatten().cloned().collect()
    }

    /// Number of live (non-tombstone) records.
    #[must_use]
    pub fn live_record_count(&self) -> usize {
        let state = self.lock_state();
        state
            .records
            .values()
            .filter(|slot| slot.value.is_some())
            .count()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KvEngine for MemEngine {
    fn store_id(&self) -> StoreId {
        self.store_id
    }

    fn create_transaction(&self) -> MarlinResult<Transaction> {
        let state = self.lock_state();
        if !state.running {
            return Err(MarlinError::InvalidState("store is not running"));
        }
        Ok(Transaction::new(state.commit_seq, Arc::clone(&self.open_txns)))
    }

    fn get_kv(&self, key: &RecordKey, txn: &mut Transaction) -> MarlinResult<RecordValue> {
        if let Some(op) = txn.buffered(key) {
            return match op {
                WriteOp::Set { value, .. } => Ok(value.clone()),
                WriteOp::Del { .. } => Err(not_found(key)),
            };
        }

        let state = self.lock_state();
        if !state.running {
            return Err(MarlinError::InvalidState("store is not running"));
        }
        state
            .records
            .get(key)
            .and_then(|slot| slot.value.clone())
            .ok_or_else(|| not_found(key))
    }

    fn set_kv(
        &self,
        key: &RecordKey,
        value: &RecordValue,
        txn: &mut Transaction,
        with_log: bool,
    ) -> MarlinResult<()> {
        txn.ops.push(WriteOp::Set {
            key: key.clone(),
            value: value.clone(),
            with_log,
        });
        Ok(())
    }

    fn del_kv(&self, key: &RecordKey, txn: &mut Transaction, with_log: bool) -> MarlinResult<()> {
        txn.ops.push(WriteOp::Del {
            key: key.clone(),
            with_log,
        });
        Ok(())
    }

    fn commit(&self, txn: Transaction) -> MarlinResult<TxnId> {
        let mut state = self.lock_state();
        if !state.running {
            return Err(MarlinError::InvalidState("store is not running"));
        }

        for op in &txn.ops {
            if let Some(slot) = state.records.get(op.key())
                && slot.version > txn.start_seq
            {
                return Err(MarlinError::CommitRetry);
            }
        }

        let txn_id = state.commit_seq + 1;

        // encode the binlog group first so no failure can leave a half-applied commit
        let mut log_group = Vec::new();
        for op in &txn.ops {
            match op {
                WriteOp::Set {
                    key,
                    value,
                    with_log: true,
                } => log_group.push(ReplLogEntry {
                    txn_id,
                    op: ReplOp::Set,
                    op_key: key.encode()?,
                    op_value: value.encode()?,
                }),
                WriteOp::Del {
                    key,
                    with_log: true,
                } => log_group.push(ReplLogEntry {
                    txn_id,
                    op: ReplOp::Del,
                    op_key: key.encode()?,
                    op_value: Vec::new(),
                }),
                WriteOp::Set { .. } | WriteOp::Del { .. } => {}
            }
        }

        for op in &txn.ops {
            let (key, value) = match op {
                WriteOp::Set { key, value, .. } => (key, Some(value.clone())),
                WriteOp::Del { key, .. } => (key, None),
            };
            let _ = state.records.insert(
                key.clone(),
                RecordSlot {
                    value,
                    version: txn_id,
                },
            );
        }

        if !log_group.is_empty() {
            let _ = state.binlog.insert(txn_id, log_group);
        }
        state.commit_seq = txn_id;
        Ok(txn_id)
    }

    fn stop(&self) -> MarlinResult<()> {
        let mut state = self.lock_state();
        if self.open_txns.load(Ordering::SeqCst) > 0 {
            return Err(MarlinError::InvalidState(
                "store has uncommitted transactions bound to it",
            ));
        }
        state.running = false;
        Ok(())
    }

    fn clear(&self) -> MarlinResult<()> {
        let mut state = self.lock_state();
        if state.running {
            return Err(MarlinError::InvalidState("store is still running"));
        }
        state.records.clear();
        state.binlog.clear();
        state.commit_seq = 0;
        if self.backup_dir.exists() {
            fs::remove_dir_all(&self.backup_dir)?;
        }
        Ok(())
    }

    fn restart(&self, load_backup: bool) -> MarlinResult<TxnId> {
        let mut state = self.lock_state();
        if state.running {
            return Err(MarlinError::InvalidState("store is already running"));
        }

        if !load_backup {
            state.running = true;
            return Ok(if state.commit_seq == 0 {
                TXNID_UNINITED
            } else {
                state.commit_seq
            });
        }

        let (entries, resume_txn_id) = snapshot::load_backup(&self.backup_dir)?;
        state.records.clear();
        state.binlog.clear();
        for (key, value) in entries {
            let _ = state.records.insert(
                key,
                RecordSlot {
                    value: Some(value),
                    version: 0,
                },
            );
        }
        state.commit_seq = resume_txn_id;
        state.running = true;
        fs::remove_dir_all(&self.backup_dir)?;
        Ok(resume_txn_id)
    }

    fn backup_dir(&self) -> PathBuf {
        self.backup_dir.clone()
    }

    fn is_running(&self) -> bool {
        self.lock_state().running
    }
}

fn not_found(key: &RecordKey) -> MarlinError {
    MarlinError::NotFound(String::from_utf8_lossy(&key.primary_key).into_owned())
}
