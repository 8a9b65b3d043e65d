//! Transactional store abstraction with optimistic concurrency.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use marlin_common::error::MarlinResult;
use marlin_common::ids::{StoreId, TxnId};

use crate::record::{RecordKey, RecordValue};

/// One buffered write inside a transaction.
#[derive(Debug, Clone)]
pub(crate) enum WriteOp {
    Set {
        key: RecordKey,
        value: RecordValue,
        with_log: bool,
    },
    Del {
        key: RecordKey,
        with_log: bool,
    },
}

impl WriteOp {
    pub(crate) fn key(&self) -> &RecordKey {
        match self {
            Self::Set { key, .. } | Self::Del { key, .. } => key,
        }
    }
}

/// Buffered-write transaction handle tied to one store instance.
///
/// Writes accumulate in order and become visible only at [`KvEngine::commit`]. The
/// engine snapshots its commit sequence at creation time; commit fails with
/// `MarlinError::CommitRetry` when another transaction committed a write to any key in
/// this transaction's write set after that snapshot (first committer wins).
#[derive(Debug)]
pub struct Transaction {
    pub(crate) start_seq: u64,
    pub(crate) ops: Vec<WriteOp>,
    open_tickets: Arc<AtomicUsize>,
}

impl Transaction {
    pub(crate) fn new(start_seq: u64, open_tickets: Arc<AtomicUsize>) -> Self {
        let _ = open_tickets.fetch_add(1, Ordering::SeqCst);
        Self {
            start_seq,
            ops: Vec::new(),
            open_tickets,
        }
    }

    /// Looks up the latest buffered write for `key`, if any.
    pub(crate) fn buffered(&self, key: &RecordKey) -> Option<&WriteOp> {
        self.ops.iter().rev().find(|op| op.key() == key)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let _ = self.open_tickets.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-shard transactional key-value store.
///
/// The command layer and the replication apply path talk to storage exclusively
/// through this seam. `with_log` controls whether a committed write produces a binlog
/// record; the replica apply path always passes `false` so applied binlog never spawns
/// further binlog.
pub trait KvEngine: Send + Sync {
    /// Store instance id.
    fn store_id(&self) -> StoreId;

    /// Opens a new transaction.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::InvalidState` when the store is stopped.
    fn create_transaction(&self) -> MarlinResult<Transaction>;

    /// Reads one record under the given transaction.
    ///
    /// A buffered write inside `txn` shadows the committed state.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::NotFound` for absent or deleted records. TTL is not
    /// interpreted here; expiry is the command layer's concern.
    fn get_kv(&self, key: &RecordKey, txn: &mut Transaction) -> MarlinResult<RecordValue>;

    /// Buffers one write under the given transaction.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Decode` when the record cannot be represented.
    fn set_kv(
        &self,
        key: &RecordKey,
        value: &RecordValue,
        txn: &mut Transaction,
        with_log: bool,
    ) -> MarlinResult<()>;

    /// Buffers one deletion under the given transaction.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Decode` when the record key cannot be represented.
    fn del_kv(&self, key: &RecordKey, txn: &mut Transaction, with_log: bool) -> MarlinResult<()>;

    /// Atomically applies the transaction and assigns its transaction id.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::CommitRetry` on a write-write conflict — the only
    /// recoverable commit error — and `MarlinError::InvalidState` when the store is
    /// stopped.
    fn commit(&self, txn: Transaction) -> MarlinResult<TxnId>;

    /// Stops the store, refusing new transactions.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::InvalidState` when open transactions are still bound to
    /// the store.
    fn stop(&self) -> MarlinResult<()>;

    /// Removes all content from a stopped store.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::InvalidState` when the store is still running.
    fn clear(&self) -> MarlinResult<()>;

    /// Brings a stopped store back up.
    ///
    /// With `load_backup` the content is loaded from the snapshot under
    /// [`Self::backup_dir`], the backup directory is consumed, and the snapshot's
    /// resume transaction id is returned. Without it the last committed transaction id
    /// is returned (`TXNID_UNINITED` when nothing was ever committed).
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Io`/`MarlinError::Decode` when the backup is missing or
    /// malformed, `MarlinError::InvalidState` when the store is already running.
    fn restart(&self, load_backup: bool) -> MarlinResult<TxnId>;

    /// Directory a primary-produced snapshot is transferred into.
    fn backup_dir(&self) -> PathBuf;

    /// Whether the store currently accepts transactions.
    fn is_running(&self) -> bool;
}
