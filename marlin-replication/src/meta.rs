//! Replication metadata per replicated store.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use marlin_common::error::{MarlinError, MarlinResult};
use marlin_common::ids::{MAX_VALID_TXNID, SESSION_NONE, SessionId, StoreId, TxnId};
use serde::{Deserialize, Serialize};

/// Replica-side replication states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplState {
    /// No primary configured.
    None,
    /// Waiting to run a full snapshot transfer.
    Connect,
    /// Snapshot transfer in progress.
    Transfer,
    /// Steady incremental sync.
    Connected,
}

/// Persistent replication metadata for one store.
///
/// Copy-on-write: every state update builds a new snapshot and swaps it into the
/// manager's live table under the manager mutex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    /// Store id this metadata belongs to.
    pub id: StoreId,
    /// Primary host, empty when no primary is configured.
    pub sync_from_host: String,
    /// Primary replication port.
    pub sync_from_port: u16,
    /// The primary's store id this replica follows.
    pub sync_from_id: StoreId,
    /// Next expected binlog transaction id.
    pub binlog_id: TxnId,
    /// Current replication state.
    pub repl_state: ReplState,
}

impl StoreMeta {
    /// Metadata for a store with no primary configured.
    #[must_use]
    pub fn new(id: StoreId) -> Self {
        Self {
            id,
            sync_from_host: String::new(),
            sync_from_port: 0,
            sync_from_id: 0,
            binlog_id: MAX_VALID_TXNID + 1,
            repl_state: ReplState::None,
        }
    }
}

/// Mutable runtime sync state for one store, guarded by the manager mutex.
#[derive(Debug)]
pub struct SyncStatus {
    /// Session the incremental stream is bound to, [`SESSION_NONE`] when unbound.
    pub session_id: SessionId,
    /// Last successful sync activity.
    pub last_sync_time: Instant,
    /// Whether the sync routine or a binlog apply currently owns this store.
    pub is_running: bool,
    /// Earliest next scheduler entry.
    pub next_sched_time: Instant,
}

impl SyncStatus {
    /// Fresh status with no session bound and an immediate schedule slot.
    #[must_use]
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            session_id: SESSION_NONE,
            last_sync_time: now,
            is_running: false,
            next_sched_time: now,
        }
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::new()
    }
}

fn meta_path(dir: &Path, store_id: StoreId) -> PathBuf {
    dir.join(format!("store-{store_id}.meta.json"))
}

/// Writes one store's metadata under `dir`, creating the directory.
///
/// # Errors
///
/// Returns `MarlinError::Io` on filesystem failure.
pub fn persist_meta(dir: &Path, meta: &StoreMeta) -> MarlinResult<()> {
    fs::create_dir_all(dir)?;
    let payload = serde_json::to_vec_pretty(meta)
        .map_err(|error| MarlinError::Internal(format!("meta serialization failed: {error}")))?;
    fs::write(meta_path(dir, meta.id), payload)?;
    Ok(())
}

/// Loads one store's metadata from `dir`, `None` when never persisted.
///
/// # Errors
///
/// Returns `MarlinError::Io` on filesystem failure and `MarlinError::Decode` when the
/// file content is malformed.
pub fn load_meta(dir: &Path, store_id: StoreId) -> MarlinResult<Option<StoreMeta>> {
    let path = meta_path(dir, store_id);
    if !path.exists() {
        return Ok(None);
    }
    let payload = fs::read(path)?;
    let meta = serde_json::from_slice(&payload)
        .map_err(|error| MarlinError::Decode(format!("meta file malformed: {error}")))?;
    Ok(Some(meta))
}
