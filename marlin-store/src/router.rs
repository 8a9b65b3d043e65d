//! Segment routing and per-key locking.
//!
//! The router resolves a user key to its owning store instance plus a chunk id, and
//! owns the process-wide key lock table. Every mutating command takes an exclusive
//! lock on its primary key before opening a transaction; the lock is released by the
//! guard on every exit path.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Condvar, Mutex};

use hashbrown::HashMap;
use marlin_common::error::{MarlinError, MarlinResult};
use marlin_common::ids::{ChunkId, StoreId};

use crate::engine::KvEngine;

/// Default chunk space the key hash is folded into.
pub const DEFAULT_CHUNK_COUNT: u32 = 0x4000;

/// Requested lock strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared lock, compatible with other shared holders.
    Shared,
    /// Exclusive lock, mutually excludes all other holders.
    Exclusive,
}

/// Resolution result for one user key.
#[derive(Clone)]
pub struct SegmentView {
    /// Owning store instance.
    pub store: Arc<dyn KvEngine>,
    /// Owning store id.
    pub store_id: StoreId,
    /// Hash bucket the key falls into, part of the stored key tuple.
    pub chunk_id: ChunkId,
}

/// Maps user keys onto store instances and hands out per-key locks.
pub struct SegmentRouter {
    stores: Vec<Arc<dyn KvEngine>>,
    chunk_count: u32,
    locks: KeyLockManager,
}

impl SegmentRouter {
    /// Builds a router over the given store instances with the default chunk space.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::InvalidState` when no stores are provided.
    pub fn new(stores: Vec<Arc<dyn KvEngine>>) -> MarlinResult<Self> {
        Self::with_chunk_count(stores, DEFAULT_CHUNK_COUNT)
    }

    /// Builds a router with an explicit chunk space size.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::InvalidState` when no stores are provided or the chunk
    /// space is empty.
    pub fn with_chunk_count(
        stores: Vec<Arc<dyn KvEngine>>,
        chunk_count: u32,
    ) -> MarlinResult<Self> {
        if stores.is_empty() {
            return Err(MarlinError::InvalidState(
                "segment router requires at least one store",
            ));
        }
        if chunk_count == 0 {
            return Err(MarlinError::InvalidState(
                "segment router requires a non-empty chunk space",
            ));
        }
        Ok(Self {
            stores,
            chunk_count,
            locks: KeyLockManager::default(),
        })
    }

    /// Resolves a user key to its owning store and chunk id.
    #[must_use]
    pub fn resolve(&self, key: &[u8]) -> SegmentView {
        let chunk_id = self.chunk_for_key(key);
        let index = usize::try_from(chunk_id).unwrap_or(0) % self.stores.len();
        SegmentView {
            store: Arc::clone(&self.stores[index]),
            store_id: self.stores[index].store_id(),
            chunk_id,
        }
    }

    /// Returns the store instance registered under `store_id`.
    #[must_use]
    pub fn store_by_id(&self, store_id: StoreId) -> Option<Arc<dyn KvEngine>> {
        self.stores
            .iter()
            .find(|store| store.store_id() == store_id)
            .cloned()
    }

    /// All registered store instances.
    #[must_use]
    pub fn stores(&self) -> &[Arc<dyn KvEngine>] {
        &self.stores
    }

    /// Blocks until the requested lock on `(store_id, key)` is available and returns
    /// its guard.
    #[must_use]
    pub fn lock_key(&self, store_id: StoreId, key: &[u8], mode: LockMode) -> KeyLockGuard<'_> {
        self.locks.acquire(store_id, key.to_vec(), mode)
    }

    fn chunk_for_key(&self, key: &[u8]) -> ChunkId {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let chunk = hasher.finish() % u64::from(self.chunk_count);
        match ChunkId::try_from(chunk) {
            Ok(chunk_id) => chunk_id,
            Err(_) => unreachable!("modulo chunk_count ensures chunk id fits into u32"),
        }
    }
}

type KeyId = (StoreId, Vec<u8>);

#[derive(Debug, Default)]
struct LockSlot {
    readers: usize,
    writer: bool,
}

impl LockSlot {
    fn admits(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !self.writer,
            LockMode::Exclusive => !self.writer && self.readers == 0,
        }
    }

    fn acquire(&mut self, mode: LockMode) {
        match mode {
            LockMode::Shared => self.readers += 1,
            LockMode::Exclusive => self.writer = true,
        }
    }

    fn release(&mut self, mode: LockMode) {
        match mode {
            LockMode::Shared => self.readers = self.readers.saturating_sub(1),
            LockMode::Exclusive => self.writer = false,
        }
    }

    fn is_free(&self) -> bool {
        !self.writer && self.readers == 0
    }
}

#[derive(Debug, Default)]
struct KeyLockManager {
    table: Mutex<HashMap<KeyId, LockSlot>>,
    available: Condvar,
}

impl KeyLockManager {
    fn acquire(&self, store_id: StoreId, key: Vec<u8>, mode: LockMode) -> KeyLockGuard<'_> {
        let key_id = (store_id, key);
        let mut table = self
            .table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            let slot = table.entry(key_id.clone()).or_default();
            if slot.admits(mode) {
                slot.acquire(mode);
                return KeyLockGuard {
                    manager: self,
                    key_id,
                    mode,
                };
            }
            table = self
                .available
                .wait(table)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn release(&self, key_id: &KeyId, mode: LockMode) {
        let mut table = self
            .table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut remove = false;
        if let Some(slot) = table.get_mut(key_id) {
            slot.release(mode);
            remove = slot.is_free();
        }
        if remove {
            let _ = table.remove(key_id);
        }
        self.available.notify_all();
    }
}

/// Scoped key lock: releases on drop, on every exit path of the owning scope.
pub struct KeyLockGuard<'a> {
    manager: &'a KeyLockManager,
    key_id: KeyId,
    mode: LockMode,
}

impl Drop for KeyLockGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.key_id, self.mode);
    }
}
