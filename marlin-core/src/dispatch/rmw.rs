use marlin_common::error::{MarlinError, MarlinResult};
use marlin_store::{LockMode, RecordKey, RecordType, RecordValue};

use super::DispatchContext;
use super::expire::expire_key_if_needed;
use super::set_generic::{SET_NO_FLAGS, set_generic};
use crate::command::Session;

/// The read-modify-write engine shared by `APPEND`, `SETRANGE`, `SETBIT`, `GETSET`,
/// `CAS`, and the counter commands.
///
/// Acquires the exclusive key lock, runs the expire prelude (tolerating absent and
/// just-expired keys), then loops up to the retry bound: open a transaction, load the
/// current value, run the pure `transform`, and write through [`set_generic`] with no
/// flags. `reply_new` selects whether the computed or the previous value is returned;
/// an absent previous value is returned as an empty record.
pub(super) fn run_read_modify_write<F>(
    session: &Session,
    ctx: &DispatchContext,
    key: &[u8],
    reply_new: bool,
    transform: F,
) -> MarlinResult<RecordValue>
where
    F: Fn(Option<&RecordValue>) -> MarlinResult<RecordValue>,
{
    match expire_key_if_needed(session, ctx, key, RecordType::Kv) {
        Ok(_) | Err(MarlinError::Expired | MarlinError::NotFound(_)) => {}
        Err(error) => return Err(error),
    }

    let view = ctx.router.resolve(key);
    let _guard = ctx.router.lock_key(view.store_id, key, LockMode::Exclusive);
    let record_key = RecordKey::new(
        view.chunk_id,
        session.db_id(),
        RecordType::Kv,
        key,
        Vec::new(),
    );

    let mut attempt = 0_u32;
    loop {
        let mut txn = view.store.create_transaction()?;
        let old_value = match view.store.get_kv(&record_key, &mut txn) {
            Ok(value) => Some(value),
            Err(MarlinError::NotFound(_)) => None,
            Err(error) => return Err(error),
        };

        let new_value = transform(old_value.as_ref())?;
        match set_generic(
            view.store.as_ref(),
            txn,
            SET_NO_FLAGS,
            &record_key,
            &new_value,
            None,
            None,
        ) {
            Ok(_) => {
                return Ok(if reply_new {
                    new_value
                } else {
                    old_value.unwrap_or_else(|| RecordValue::new(Vec::new(), 0))
                });
            }
            Err(error) if error.is_commit_retry() && attempt + 1 < ctx.retry_count => {
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// TTL carried over from the previous value, `0` when there was none.
pub(super) fn preserved_ttl(old_value: Option<&RecordValue>) -> u64 {
    old_value.map_or(0, RecordValue::ttl)
}
