use marlin_common::error::{MarlinError, MarlinResult};
use marlin_common::time::ms_since_epoch;
use marlin_store::engine::Transaction;
use marlin_store::{KvEngine, RecordKey, RecordValue};

use crate::command::CommandReply;

pub(super) type SetFlags = u8;

pub(super) const SET_NO_FLAGS: SetFlags = 0;

/// Set only if the key does not exist.
pub(super) const SET_NX: SetFlags = 1 << 0;

/// Set only if the key exists.
pub(super) const SET_XX: SetFlags = 1 << 1;

/// NX semantics with a TTL attached by the caller.
pub(super) const SET_NXEX: SetFlags = 1 << 2;

/// The generic conditional write every mutating command bottoms out in.
///
/// Existence is TTL-aware: a record whose TTL has elapsed counts as absent, and an
/// early return on a failed condition still deletes the stale record in this
/// transaction. The transaction is committed here; `CommitRetry` propagates unchanged
/// because the caller owns transaction construction and therefore the retry loop.
pub(super) fn set_generic(
    store: &dyn KvEngine,
    mut txn: Transaction,
    flags: SetFlags,
    key: &RecordKey,
    value: &RecordValue,
    ok_reply: Option<CommandReply>,
    abort_reply: Option<CommandReply>,
) -> MarlinResult<CommandReply> {
    if flags & (SET_NX | SET_XX | SET_NXEX) != 0 {
        let current = match store.get_kv(key, &mut txn) {
            Ok(current) => Some(current),
            Err(MarlinError::NotFound(_)) => None,
            Err(error) => return Err(error),
        };

        let need_expire = current
            .as_ref()
            .is_some_and(|current| current.is_expired_at(ms_since_epoch()));
        let exists = current.is_some() && !need_expire;

        if (flags & SET_NX != 0 && exists)
            || (flags & SET_XX != 0 && !exists)
            || (flags & SET_NXEX != 0 && exists)
        {
            // the early return must still drop the stale record
            if need_expire {
                store.del_kv(key, &mut txn, true)?;
                let _ = store.commit(txn)?;
            }
            return Ok(abort_reply.unwrap_or(CommandReply::Null));
        }
    }

    // no expiry check here: the write overwrites any prior value and TTL
    store.set_kv(key, value, &mut txn, true)?;
    let _ = store.commit(txn)?;
    Ok(ok_reply.unwrap_or_else(CommandReply::ok))
}

/// Bounded retry wrapper around [`set_generic`].
///
/// A fresh transaction is opened for every attempt, including the last one;
/// `CommitRetry` is the only error that re-enters the loop.
pub(super) fn set_generic_with_retry(
    store: &dyn KvEngine,
    flags: SetFlags,
    key: &RecordKey,
    value: &RecordValue,
    ok_reply: Option<CommandReply>,
    abort_reply: Option<CommandReply>,
    retry_count: u32,
) -> MarlinResult<CommandReply> {
    let mut attempt = 0_u32;
    loop {
        let txn = store.create_transaction()?;
        match set_generic(
            store,
            txn,
            flags,
            key,
            value,
            ok_reply.clone(),
            abort_reply.clone(),
        ) {
            Err(error) if error.is_commit_retry() && attempt + 1 < retry_count => {
                attempt += 1;
            }
            result => return result,
        }
    }
}
