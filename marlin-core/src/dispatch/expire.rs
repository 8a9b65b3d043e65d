use marlin_common::error::{MarlinError, MarlinResult};
use marlin_common::time::ms_since_epoch;
use marlin_store::{LockMode, RecordKey, RecordType, RecordValue};

use super::DispatchContext;
use crate::command::Session;

/// Expire-aware read prelude shared by every read command.
///
/// Returns the live value, `MarlinError::NotFound` when the key was never present,
/// and `MarlinError::Expired` after deleting a record whose TTL has elapsed. Read
/// commands map `NotFound` and `Expired` to the same empty reply.
pub(super) fn expire_key_if_needed(
    session: &Session,
    ctx: &DispatchContext,
    key: &[u8],
    record_type: RecordType,
) -> MarlinResult<RecordValue> {
    let view = ctx.router.resolve(key);
    let _guard = ctx.router.lock_key(view.store_id, key, LockMode::Exclusive);
    let record_key = RecordKey::new(view.chunk_id, session.db_id(), record_type, key, Vec::new());

    let mut attempt = 0_u32;
    loop {
        let mut txn = view.store.create_transaction()?;
        let value = view.store.get_kv(&record_key, &mut txn)?;
        if !value.is_expired_at(ms_since_epoch()) {
            return Ok(value);
        }

        view.store.del_kv(&record_key, &mut txn, true)?;
        match view.store.commit(txn) {
            Ok(_) => return Err(MarlinError::Expired),
            Err(error) if error.is_commit_retry() && attempt + 1 < ctx.retry_count => {
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Expire-aware delete used by commands that must drop a key instead of writing it.
///
/// Missing and just-expired keys count as already deleted.
pub(super) fn del_key_chk_expire(
    session: &Session,
    ctx: &DispatchContext,
    key: &[u8],
    record_type: RecordType,
) -> MarlinResult<()> {
    match expire_key_if_needed(session, ctx, key, record_type) {
        Ok(_) => {}
        Err(MarlinError::NotFound(_) | MarlinError::Expired) => return Ok(()),
        Err(error) => return Err(error),
    }

    let view = ctx.router.resolve(key);
    let _guard = ctx.router.lock_key(view.store_id, key, LockMode::Exclusive);
    let record_key = RecordKey::new(view.chunk_id, session.db_id(), record_type, key, Vec::new());

    let mut attempt = 0_u32;
    loop {
        let mut txn = view.store.create_transaction()?;
        view.store.del_kv(&record_key, &mut txn, true)?;
        match view.store.commit(txn) {
            Ok(_) => return Ok(()),
            Err(error) if error.is_commit_retry() && attempt + 1 < ctx.retry_count => {
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
