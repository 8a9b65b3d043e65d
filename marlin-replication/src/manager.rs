//! Replica-side replication manager.
//!
//! One manager drives every replicated store through `Connect -> Transfer ->
//! Connected`. A single mutex guards the metadata table and the per-store sync
//! status; the condition variable serializes the sync routine against binlog apply
//! through the `is_running` flag. No network I/O happens under the mutex.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use marlin_common::config::ReplTimingConfig;
use marlin_common::error::{MarlinError, MarlinResult};
use marlin_common::guard::ScopeGuard;
use marlin_common::ids::{MAX_VALID_TXNID, SESSION_NONE, SessionId, StoreId, TXNID_UNINITED, TxnId};
use marlin_store::binlog::{ReplLogEntry, ReplOp};
use marlin_store::{RecordKey, RecordValue, SegmentRouter};
use tracing::{error, info, warn};

use crate::client::BlockingTcpClient;
use crate::meta::{self, ReplState, StoreMeta, SyncStatus};
use crate::worker::WorkerPool;

/// Hands a connected replication client to the network layer, promoting it to a
/// registered session that feeds [`ReplManager::apply_binlogs`].
pub trait SessionPromoter: Send + Sync {
    /// Registers the client and returns its session id.
    ///
    /// # Errors
    ///
    /// Returns an error when the session layer refuses the connection.
    fn promote(&self, client: BlockingTcpClient, store_id: StoreId) -> MarlinResult<SessionId>;
}

#[derive(Debug)]
struct ManagerState {
    sync_meta: HashMap<StoreId, Arc<StoreMeta>>,
    sync_status: HashMap<StoreId, SyncStatus>,
}

/// Replication manager for every replicated store in this process.
pub struct ReplManager {
    router: Arc<SegmentRouter>,
    meta_dir: PathBuf,
    timing: ReplTimingConfig,
    promoter: Arc<dyn SessionPromoter>,
    state: Mutex<ManagerState>,
    cv: Condvar,
    scheduler_running: Arc<AtomicBool>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReplManager {
    /// Builds a manager over every store behind the router, loading persisted
    /// metadata where present.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Io`/`MarlinError::Decode` when persisted metadata cannot
    /// be read.
    pub fn new(
        router: Arc<SegmentRouter>,
        meta_dir: PathBuf,
        timing: ReplTimingConfig,
        promoter: Arc<dyn SessionPromoter>,
    ) -> MarlinResult<Self> {
        let mut sync_meta = HashMap::new();
        let mut sync_status = HashMap::new();
        for store in router.stores() {
            let store_id = store.store_id();
            let loaded =
                meta::load_meta(&meta_dir, store_id)?.unwrap_or_else(|| StoreMeta::new(store_id));
            let _ = sync_meta.insert(store_id, Arc::new(loaded));
            let _ = sync_status.insert(store_id, SyncStatus::new());
        }

        Ok(Self {
            router,
            meta_dir,
            timing,
            promoter,
            state: Mutex::new(ManagerState {
                sync_meta,
                sync_status,
            }),
            cv: Condvar::new(),
            scheduler_running: Arc::new(AtomicBool::new(false)),
            scheduler_handle: Mutex::new(None),
        })
    }

    /// Points one store at a primary and arms a fresh full sync.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::NotFound` for unknown stores and `MarlinError::Io` when
    /// the new metadata cannot be persisted.
    pub fn set_primary(
        &self,
        store_id: StoreId,
        host: &str,
        port: u16,
        sync_from_id: StoreId,
    ) -> MarlinResult<()> {
        let mut state = self.lock_state();
        let mut next = state
            .sync_meta
            .get(&store_id)
            .ok_or_else(|| MarlinError::NotFound(format!("store {store_id} not registered")))?
            .as_ref()
            .clone();
        next.sync_from_host = host.to_owned();
        next.sync_from_port = port;
        next.sync_from_id = sync_from_id;
        next.repl_state = ReplState::Connect;
        next.binlog_id = MAX_VALID_TXNID + 1;
        self.change_repl_state_in_lock(&mut state, next, true)
    }

    /// Current metadata snapshot for one store.
    #[must_use]
    pub fn meta_snapshot(&self, store_id: StoreId) -> Option<Arc<StoreMeta>> {
        let state = self.lock_state();
        state.sync_meta.get(&store_id).cloned()
    }

    /// Session the incremental stream of one store is bound to.
    #[must_use]
    pub fn bound_session(&self, store_id: StoreId) -> Option<SessionId> {
        let state = self.lock_state();
        state
            .sync_status
            .get(&store_id)
            .map(|status| status.session_id)
    }

    /// Starts the background scheduler over a worker pool.
    pub fn start(self: &Arc<Self>, worker_threads: usize) {
        self.scheduler_running.store(true, Ordering::SeqCst);
        let manager = Arc::clone(self);
        let running = Arc::clone(&self.scheduler_running);
        let handle = std::thread::spawn(move || {
            let pool = WorkerPool::new(worker_threads);
            while running.load(Ordering::SeqCst) {
                for store_id in manager.claim_due_stores() {
                    let routine_owner = Arc::clone(&manager);
                    pool.execute(move || routine_owner.slave_sync_routine(store_id));
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        });
        *self
            .scheduler_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    /// Stops the background scheduler and waits for in-flight routines.
    pub fn stop(&self) {
        self.scheduler_running.store(false, Ordering::SeqCst);
        let handle = self
            .scheduler_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Runs one store's sync routine synchronously, waiting for the running flag.
    ///
    /// The scheduler drives the same body; this entry keeps tests deterministic.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::NotFound` for unknown stores.
    pub fn run_store_routine(&self, store_id: StoreId) -> MarlinResult<()> {
        {
            let mut state = self.lock_state();
            if !state.sync_status.contains_key(&store_id) {
                return Err(MarlinError::NotFound(format!(
                    "store {store_id} not registered"
                )));
            }
            while state.sync_status[&store_id].is_running {
                state = self
                    .cv
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            state
                .sync_status
                .get_mut(&store_id)
                .expect("existence checked above")
                .is_running = true;
        }
        self.slave_sync_routine(store_id);
        Ok(())
    }

    /// Marks every due store as running and returns their ids for dispatch.
    fn claim_due_stores(&self) -> Vec<StoreId> {
        let now = Instant::now();
        let mut state = self.lock_state();
        let mut due = Vec::new();
        for (store_id, status) in &mut state.sync_status {
            if !status.is_running && status.next_sched_time <= now {
                status.is_running = true;
                due.push(*store_id);
            }
        }
        due
    }

    /// One scheduler entry for one store. The caller has already set `is_running`.
    fn slave_sync_routine(&self, store_id: StoreId) {
        let started = Instant::now();
        let next_delay = Cell::new(self.timing.no_primary_resched);
        let _guard = ScopeGuard::new(|| {
            let mut state = self.lock_state();
            let status = state
                .sync_status
                .get_mut(&store_id)
                .expect("routine runs only for registered stores");
            assert!(status.is_running, "sync routine must own the running flag");
            status.is_running = false;
            status.next_sched_time = started + next_delay.get();
            self.cv.notify_all();
        });

        let Some(meta_snapshot) = self.meta_snapshot(store_id) else {
            return;
        };

        if meta_snapshot.sync_from_host.is_empty() {
            // no primary yet, look again shortly
            next_delay.set(self.timing.no_primary_resched);
            return;
        }

        match meta_snapshot.repl_state {
            ReplState::Connect => {
                self.slave_start_fullsync(&meta_snapshot);
                next_delay.set(self.timing.fullsync_resched);
            }
            ReplState::Connected => {
                self.slave_chk_sync_status(&meta_snapshot);
                next_delay.set(self.timing.connected_resched);
            }
            other => {
                error!(store = store_id, state = ?other, "sync routine entered with invalid state");
                panic!("store {store_id}: sync routine entered with invalid state {other:?}");
            }
        }
    }

    /// Full snapshot transfer from the primary.
    fn slave_start_fullsync(&self, meta_snapshot: &StoreMeta) {
        let store_id = meta_snapshot.id;
        info!(store = store_id, "fullsync start");

        let Some(store) = self.router.store_by_id(store_id) else {
            panic!("store {store_id} is registered for replication but unknown to the router");
        };

        if let Err(stop_error) = store.stop() {
            // uncanceled transactions may still bind the store, retry next tick
            warn!(store = store_id, error = %stop_error, "fullsync stop failed");
            return;
        }
        assert!(!store.is_running(), "stopped store must not accept work");
        if let Err(clear_error) = store.clear() {
            error!(store = store_id, error = %clear_error, "fullsync clear failed");
            panic!("store {store_id}: clear failed during fullsync: {clear_error}");
        }

        let Ok(mut client) = self.create_client(meta_snapshot) else {
            warn!(
                store = store_id,
                host = %meta_snapshot.sync_from_host,
                port = meta_snapshot.sync_from_port,
                "fullsync connect failed"
            );
            return;
        };

        // any early exit below resets the store to Connect with an unknown resume point
        let rollback_meta = meta_snapshot.clone();
        let mut rollback_guard = ScopeGuard::new(|| {
            let mut rolled = rollback_meta.clone();
            rolled.repl_state = ReplState::Connect;
            rolled.binlog_id = MAX_VALID_TXNID + 1;
            let mut state = self.lock_state();
            if let Err(rollback_error) = self.change_repl_state_in_lock(&mut state, rolled, false) {
                warn!(store = rollback_meta.id, error = %rollback_error, "fullsync rollback failed");
            }
        });

        if let Err(write_error) = client.write_line(
            &format!("FULLSYNC {}", meta_snapshot.sync_from_id),
            self.timing.line_timeout,
        ) {
            warn!(store = store_id, error = %write_error, "fullsync request failed");
            return;
        }
        let manifest_line = match client.read_line(self.timing.handshake_read_timeout) {
            Ok(line) => line,
            Err(read_error) => {
                warn!(store = store_id, error = %read_error, "fullsync reply missing");
                return;
            }
        };
        if manifest_line.is_empty() || manifest_line.starts_with('-') {
            info!(store = store_id, reply = %manifest_line, "fullsync refused by primary");
            return;
        }

        let mut transfer_meta = meta_snapshot.clone();
        transfer_meta.repl_state = ReplState::Transfer;
        transfer_meta.binlog_id = MAX_VALID_TXNID + 1;
        if let Err(change_error) = self.change_repl_state(transfer_meta, true) {
            warn!(store = store_id, error = %change_error, "fullsync transfer state change failed");
            return;
        }

        let manifest: HashMap<String, u64> = match serde_json::from_str(&manifest_line) {
            Ok(manifest) => manifest,
            Err(parse_error) => {
                warn!(store = store_id, error = %parse_error, "fullsync manifest malformed");
                return;
            }
        };

        let backup_dir = store.backup_dir();
        if backup_dir.exists() {
            error!(store = store_id, dir = %backup_dir.display(), "backup dir already exists");
            panic!("store {store_id}: backup dir exists before fullsync transfer");
        }

        let mut finished = HashSet::new();
        while finished.len() < manifest.len() {
            let file_name = match client.read_line(self.timing.line_timeout) {
                Ok(line) => line,
                Err(read_error) => {
                    warn!(store = store_id, error = %read_error, "fullsync file header missing");
                    return;
                }
            };
            if finished.contains(&file_name) {
                panic!("store {store_id}: fullsync file {file_name} retransferred");
            }
            let Some(&size) = manifest.get(&file_name) else {
                panic!("store {store_id}: fullsync file {file_name} not in manifest");
            };

            let path = backup_dir.join(&file_name);
            if let Some(parent) = path.parent()
                && let Err(mkdir_error) = fs::create_dir_all(parent)
            {
                error!(store = store_id, error = %mkdir_error, "fullsync mkdir failed");
                return;
            }
            let mut file = match File::create(&path) {
                Ok(file) => file,
                Err(open_error) => {
                    error!(store = store_id, file = %path.display(), error = %open_error, "fullsync open failed");
                    return;
                }
            };

            let mut remain = size;
            while remain > 0 {
                let batch = remain.min(self.timing.transfer_chunk_bytes as u64);
                let data = match client
                    .read_exact_bytes(batch as usize, self.timing.line_timeout)
                {
                    Ok(data) => data,
                    Err(read_error) => {
                        error!(store = store_id, error = %read_error, "fullsync bulk read failed");
                        return;
                    }
                };
                if let Err(write_error) = file.write_all(&data) {
                    error!(store = store_id, file = %path.display(), error = %write_error, "fullsync write failed");
                    return;
                }
                remain -= batch;
            }
            info!(store = store_id, file = %path.display(), "fullsync file transfer done");
            let _ = finished.insert(file_name);
        }

        if let Err(ack_error) = client.write_line("+OK", self.timing.line_timeout) {
            warn!(store = store_id, error = %ack_error, "fullsync ack failed");
        }

        let binlog_id = match store.restart(true) {
            Ok(binlog_id) => binlog_id,
            Err(restart_error) => {
                error!(store = store_id, error = %restart_error, "fullsync restart failed");
                panic!("store {store_id}: restart from backup failed: {restart_error}");
            }
        };

        let mut connected_meta = meta_snapshot.clone();
        connected_meta.repl_state = ReplState::Connected;
        connected_meta.binlog_id = binlog_id;
        // the primary writes a startup binlog, so the resume point is always known
        assert_ne!(binlog_id, TXNID_UNINITED, "restart returned an uninitialized resume point");
        if let Err(change_error) = self.change_repl_state(connected_meta, true) {
            warn!(store = store_id, error = %change_error, "fullsync connected state change failed");
            return;
        }

        rollback_guard.dismiss();
        info!(
            store = store_id,
            files = finished.len(),
            binlog_id,
            "fullsync done"
        );
    }

    /// Steady-state check: rebind the incremental stream when the session is gone
    /// or has been silent for too long.
    fn slave_chk_sync_status(&self, meta_snapshot: &StoreMeta) {
        let store_id = meta_snapshot.id;
        let reconnect = {
            let state = self.lock_state();
            let status = &state.sync_status[&store_id];
            status.session_id == SESSION_NONE
                || status.last_sync_time + self.timing.reconnect_threshold <= Instant::now()
        };
        if !reconnect {
            return;
        }

        info!(
            store = store_id,
            host = %meta_snapshot.sync_from_host,
            port = meta_snapshot.sync_from_port,
            from = meta_snapshot.sync_from_id,
            "incremental sync reconnect"
        );

        let Ok(mut client) = self.create_client(meta_snapshot) else {
            warn!(store = store_id, "incremental reconnect failed");
            return;
        };

        let request = format!(
            "INCRSYNC {} {} {}",
            meta_snapshot.sync_from_id, store_id, meta_snapshot.binlog_id
        );
        if let Err(write_error) = client.write_line(&request, self.timing.line_timeout) {
            warn!(store = store_id, error = %write_error, "incrsync request failed");
            return;
        }
        let reply = match client.read_line(self.timing.handshake_read_timeout) {
            Ok(line) => line,
            Err(read_error) => {
                warn!(store = store_id, error = %read_error, "incrsync reply missing");
                return;
            }
        };
        if reply.is_empty() || !reply.starts_with('+') {
            warn!(store = store_id, reply = %reply, "incrsync refused by primary");
            return;
        }
        if let Err(pong_error) = client.write_line("+PONG", self.timing.line_timeout) {
            warn!(store = store_id, error = %pong_error, "incrsync pong failed");
            return;
        }

        // the handoff is safe: no reader is attached to the client yet, and the
        // primary does not send until it has read +PONG, so no sticky bytes
        match self.promoter.promote(client, store_id) {
            Ok(session_id) => {
                let mut state = self.lock_state();
                let status = state
                    .sync_status
                    .get_mut(&store_id)
                    .expect("routine runs only for registered stores");
                status.session_id = session_id;
                status.last_sync_time = Instant::now();
                info!(store = store_id, session = session_id, "incremental sync bound");
            }
            Err(promote_error) => {
                warn!(store = store_id, error = %promote_error, "session promotion failed");
            }
        }
    }

    /// Applies ordered binlog transaction groups delivered over `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::NotFound` when the session has been re-bound (the caller
    /// is stale) or the store is unknown; apply errors surface after earlier groups
    /// have committed.
    pub fn apply_binlogs(
        &self,
        store_id: StoreId,
        session_id: SessionId,
        binlogs: &BTreeMap<TxnId, Vec<ReplLogEntry>>,
    ) -> MarlinResult<()> {
        {
            let mut state = self.lock_state();
            if !state.sync_status.contains_key(&store_id) {
                return Err(MarlinError::NotFound(format!(
                    "store {store_id} not registered"
                )));
            }
            while state.sync_status[&store_id].is_running {
                state = self
                    .cv
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            state
                .sync_status
                .get_mut(&store_id)
                .expect("existence checked above")
                .is_running = true;
        }

        let _guard = ScopeGuard::new(|| {
            let mut state = self.lock_state();
            let status = state
                .sync_status
                .get_mut(&store_id)
                .expect("existence checked above");
            assert!(status.is_running, "binlog apply must own the running flag");
            status.is_running = false;
            status.last_sync_time = Instant::now();
            self.cv.notify_all();
        });

        let session_matches = {
            let state = self.lock_state();
            state.sync_status[&store_id].session_id == session_id
        };
        if !session_matches {
            return Err(MarlinError::NotFound("sessionId not match".to_owned()));
        }

        for (txn_id, ops) in binlogs {
            self.apply_single_txn(store_id, *txn_id, ops)?;
        }

        if let Some((&last_txn_id, _)) = binlogs.last_key_value() {
            let mut state = self.lock_state();
            let mut next = state
                .sync_meta
                .get(&store_id)
                .expect("existence checked above")
                .as_ref()
                .clone();
            assert_eq!(
                next.repl_state,
                ReplState::Connected,
                "binlog apply outside steady sync"
            );
            next.binlog_id = last_txn_id;
            self.change_repl_state_in_lock(&mut state, next, true)?;
        }
        Ok(())
    }

    /// Applies one transaction group atomically.
    fn apply_single_txn(
        &self,
        store_id: StoreId,
        txn_id: TxnId,
        ops: &[ReplLogEntry],
    ) -> MarlinResult<()> {
        let store = self.router.store_by_id(store_id).ok_or_else(|| {
            MarlinError::Internal(format!("store {store_id} unknown to the router"))
        })?;
        let mut txn = store.create_transaction()?;

        for (entry_index, entry) in ops.iter().enumerate() {
            if entry.txn_id != txn_id {
                return Err(MarlinError::Decode(format!(
                    "binlog entry carries txn {} inside group {txn_id}",
                    entry.txn_id
                )));
            }
            let record_key = RecordKey::decode(&entry.op_key)?;

            // the binlog row itself is written without logging, so applied binlog
            // never spawns further binlog
            let index = u32::try_from(entry_index)
                .map_err(|_| MarlinError::Decode("transaction group too large".to_owned()))?;
            let (log_key, log_value) = entry.record_pair(index)?;
            store.set_kv(&log_key, &log_value, &mut txn, false)?;

            match entry.op {
                ReplOp::Set => {
                    let record_value = RecordValue::decode(&entry.op_value)?;
                    store.set_kv(&record_key, &record_value, &mut txn, false)?;
                }
                ReplOp::Del => {
                    store.del_kv(&record_key, &mut txn, false)?;
                }
            }
        }

        let _ = store.commit(txn)?;
        Ok(())
    }

    fn create_client(&self, meta_snapshot: &StoreMeta) -> MarlinResult<BlockingTcpClient> {
        BlockingTcpClient::connect(
            &meta_snapshot.sync_from_host,
            meta_snapshot.sync_from_port,
            self.timing.line_timeout,
        )
    }

    fn change_repl_state(&self, next: StoreMeta, persist: bool) -> MarlinResult<()> {
        let mut state = self.lock_state();
        self.change_repl_state_in_lock(&mut state, next, persist)
    }

    fn change_repl_state_in_lock(
        &self,
        state: &mut ManagerState,
        next: StoreMeta,
        persist: bool,
    ) -> MarlinResult<()> {
        if persist {
            meta::persist_meta(&self.meta_dir, &next)?;
        }
        let _ = state.sync_meta.insert(next.id, Arc::new(next));
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ReplManager {
    fn drop(&mut self) {
        self.stop();
    }
}
