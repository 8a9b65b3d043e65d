use marlin_common::error::{MarlinError, MarlinResult};
use marlin_common::time::ms_since_epoch;
use marlin_store::{LockMode, RecordKey, RecordType, RecordValue};

use super::DispatchContext;
use super::expire::expire_key_if_needed;
use super::parse_numbers::{normalize_range, parse_i64, parse_u64};
use super::rmw::{preserved_ttl, run_read_modify_write};
use super::set_generic::{
    SET_NO_FLAGS, SET_NX, SET_NXEX, SET_XX, SetFlags, set_generic_with_retry,
};
use crate::command::{CommandReply, Session};

/// Hard cap on stored string length shared with `SETRANGE`/`SETBIT`.
pub(super) const MAX_STRING_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Default)]
struct SetParams {
    flags: SetFlags,
    expire_ms: u64,
}

fn parse_set_params(args: &[Vec<u8>]) -> MarlinResult<SetParams> {
    let mut params = SetParams::default();
    let mut index = 3_usize;
    while index < args.len() {
        let option = &args[index];
        if option.eq_ignore_ascii_case(b"NX") {
            params.flags |= SET_NX;
        } else if option.eq_ignore_ascii_case(b"XX") {
            params.flags |= SET_XX;
        } else if option.eq_ignore_ascii_case(b"EX") && index + 1 < args.len() {
            params.expire_ms = parse_u64(&args[index + 1])?.saturating_mul(1000);
            index += 1;
        } else if option.eq_ignore_ascii_case(b"PX") && index + 1 < args.len() {
            params.expire_ms = parse_u64(&args[index + 1])?;
            index += 1;
        } else {
            return Err(MarlinError::ParsePkt("syntax error".to_owned()));
        }
        index += 1;
    }
    if params.flags & SET_NX != 0 && params.flags & SET_XX != 0 {
        return Err(MarlinError::ParsePkt("syntax error".to_owned()));
    }
    // NX together with a TTL carries the NXEX contract
    if params.flags & SET_NX != 0 && params.expire_ms != 0 {
        params.flags = SET_NXEX;
    }
    Ok(params)
}

pub(super) fn handle_set(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let args = session.args();
    let key = &args[1];
    let params = parse_set_params(args)?;

    // no expire prelude on a plain SET: the write overwrites whatever is there
    let view = ctx.router.resolve(key);
    let _guard = ctx.router.lock_key(view.store_id, key, LockMode::Exclusive);
    let record_key = RecordKey::new(
        view.chunk_id,
        session.db_id(),
        RecordType::Kv,
        key.clone(),
        Vec::new(),
    );
    let ttl_ms = if params.expire_ms == 0 {
        0
    } else {
        ms_since_epoch().saturating_add(params.expire_ms)
    };
    let value = RecordValue::new(args[2].clone(), ttl_ms);

    set_generic_with_retry(
        view.store.as_ref(),
        params.flags,
        &record_key,
        &value,
        None,
        None,
        ctx.retry_count,
    )
}

fn setex_general(
    session: &Session,
    ctx: &DispatchContext,
    key: &[u8],
    value: &[u8],
    ttl_ms: u64,
) -> MarlinResult<CommandReply> {
    let view = ctx.router.resolve(key);
    let _guard = ctx.router.lock_key(view.store_id, key, LockMode::Exclusive);
    let record_key = RecordKey::new(
        view.chunk_id,
        session.db_id(),
        RecordType::Kv,
        key,
        Vec::new(),
    );
    let value = RecordValue::new(value.to_vec(), ttl_ms);
    set_generic_with_retry(
        view.store.as_ref(),
        SET_NO_FLAGS,
        &record_key,
        &value,
        None,
        None,
        ctx.retry_count,
    )
}

pub(super) fn handle_setex(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let args = session.args();
    let seconds = parse_u64(&args[2])?;
    setex_general(
        session,
        ctx,
        &args[1],
        &args[3],
        ms_since_epoch().saturating_add(seconds.saturating_mul(1000)),
    )
}

pub(super) fn handle_psetex(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let args = session.args();
    let millis = parse_u64(&args[2])?;
    setex_general(
        session,
        ctx,
        &args[1],
        &args[3],
        ms_since_epoch().saturating_add(millis),
    )
}

pub(super) fn handle_setnx(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let args = session.args();
    let key = &args[1];
    let view = ctx.router.resolve(key);
    let _guard = ctx.router.lock_key(view.store_id, key, LockMode::Exclusive);
    let record_key = RecordKey::new(
        view.chunk_id,
        session.db_id(),
        RecordType::Kv,
        key.clone(),
        Vec::new(),
    );
    let value = RecordValue::new(args[2].clone(), 0);
    set_generic_with_retry(
        view.store.as_ref(),
        SET_NX,
        &record_key,
        &value,
        Some(CommandReply::one()),
        Some(CommandReply::zero()),
        ctx.retry_count,
    )
}

/// Expire-aware load returning the value bytes, empty for missing/expired keys.
fn get_general(session: &Session, ctx: &DispatchContext, key: &[u8]) -> MarlinResult<Vec<u8>> {
    match expire_key_if_needed(session, ctx, key, RecordType::Kv) {
        Ok(value) => Ok(value.into_value()),
        Err(MarlinError::Expired | MarlinError::NotFound(_)) => Ok(Vec::new()),
        Err(error) => Err(error),
    }
}

pub(super) fn handle_get(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let value = get_general(session, ctx, &session.args()[1])?;
    if value.is_empty() {
        return Ok(CommandReply::Null);
    }
    Ok(CommandReply::BulkString(value))
}

pub(super) fn handle_getvsn(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    match expire_key_if_needed(session, ctx, &session.args()[1], RecordType::Kv) {
        Ok(value) => {
            let cas = i64::try_from(value.cas()).unwrap_or(i64::MAX);
            let payload = if value.value().is_empty() {
                CommandReply::Null
            } else {
                CommandReply::BulkString(value.into_value())
            };
            Ok(CommandReply::Array(vec![CommandReply::Integer(cas), payload]))
        }
        Err(MarlinError::Expired | MarlinError::NotFound(_)) => Ok(CommandReply::Array(vec![
            CommandReply::Integer(-1),
            CommandReply::Null,
        ])),
        Err(error) => Err(error),
    }
}

pub(super) fn handle_getrange(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let args = session.args();
    let start = parse_i64(&args[2])?;
    let end = parse_i64(&args[3])?;
    let value = get_general(session, ctx, &args[1])?;

    let Some((start_index, end_index)) = normalize_range(start, end, value.len()) else {
        return Ok(CommandReply::BulkString(Vec::new()));
    };
    Ok(CommandReply::BulkString(
        value[start_index..=end_index].to_vec(),
    ))
}

pub(super) fn handle_strlen(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    match expire_key_if_needed(session, ctx, &session.args()[1], RecordType::Kv) {
        Ok(value) => Ok(CommandReply::Integer(
            i64::try_from(value.value().len()).unwrap_or(i64::MAX),
        )),
        Err(MarlinError::Expired | MarlinError::NotFound(_)) => Ok(CommandReply::zero()),
        Err(error) => Err(error),
    }
}

pub(super) fn handle_append(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let args = session.args();
    let suffix = args[2].clone();
    let new_value = run_read_modify_write(session, ctx, &args[1], true, move |old_value| {
        let mut payload = old_value.map_or_else(Vec::new, |old| old.value().to_vec());
        payload.extend_from_slice(&suffix);
        Ok(RecordValue::new(payload, preserved_ttl(old_value)))
    })?;
    Ok(CommandReply::Integer(
        i64::try_from(new_value.value().len()).unwrap_or(i64::MAX),
    ))
}

pub(super) fn handle_setrange(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let args = session.args();
    let offset = parse_i64(&args[2])?;
    let overlay = args[3].clone();
    let new_value = run_read_modify_write(session, ctx, &args[1], true, move |old_value| {
        if offset < 0 {
            return Err(MarlinError::ParseOpt("offset is out of range".to_owned()));
        }
        let offset = u64::try_from(offset).unwrap_or(u64::MAX);
        if offset + overlay.len() as u64 > MAX_STRING_BYTES {
            return Err(MarlinError::ParseOpt(
                "string exceeds maximum allowed size (512MB)".to_owned(),
            ));
        }

        let offset = usize::try_from(offset)
            .map_err(|_| MarlinError::ParseOpt("offset is out of range".to_owned()))?;
        let mut payload = old_value.map_or_else(Vec::new, |old| old.value().to_vec());
        let needed = offset + overlay.len();
        if needed > payload.len() {
            payload.resize(needed, 0);
        }
        payload[offset..needed].copy_from_slice(&overlay);
        Ok(RecordValue::new(payload, preserved_ttl(old_value)))
    })?;
    Ok(CommandReply::Integer(
        i64::try_from(new_value.value().len()).unwrap_or(i64::MAX),
    ))
}

pub(super) fn handle_getset(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let args = session.args();
    let next = args[2].clone();
    // GETSET overwrites the TTL
    let old_value = run_read_modify_write(session, ctx, &args[1], false, move |_| {
        Ok(RecordValue::new(next.clone(), 0))
    })?;
    if old_value.value().is_empty() {
        return Ok(CommandReply::Null);
    }
    Ok(CommandReply::BulkString(old_value.into_value()))
}

pub(super) fn handle_cas(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let args = session.args();
    let expected_cas = parse_u64(&args[2])?;
    let next = args[3].clone();
    let _ = run_read_modify_write(session, ctx, &args[1], true, move |old_value| {
        let mut value = RecordValue::new(next.clone(), 0);
        let Some(old_value) = old_value else {
            value.set_cas(expected_cas);
            return Ok(value);
        };

        if expected_cas != old_value.cas() {
            return Err(MarlinError::Cas("cas unmatch".to_owned()));
        }
        value.set_cas(expected_cas + 1);
        value.set_ttl(old_value.ttl());
        Ok(value)
    })?;
    Ok(CommandReply::ok())
}

pub(super) fn handle_mget(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let args = session.args();
    let mut replies = Vec::with_capacity(args.len() - 1);
    for key in &args[1..] {
        match expire_key_if_needed(session, ctx, key, RecordType::Kv) {
            Ok(value) => replies.push(CommandReply::BulkString(value.into_value())),
            Err(MarlinError::Expired | MarlinError::NotFound(_)) => {
                replies.push(CommandReply::Null);
            }
            Err(error) => return Err(error),
        }
    }
    Ok(CommandReply::Array(replies))
}

// MSET is deliberately not atomic across keys: each pair takes its own lock and
// transaction, so an error mid-sequence leaves a committed prefix behind.
pub(super) fn handle_mset(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let args = session.args();
    if args.len() % 2 != 1 {
        return Err(MarlinError::ParsePkt(
            "wrong number of arguments for 'mset' command".to_owned(),
        ));
    }

    for pair in args[1..].chunks_exact(2) {
        let key = &pair[0];
        let view = ctx.router.resolve(key);
        let _guard = ctx.router.lock_key(view.store_id, key, LockMode::Exclusive);
        let record_key = RecordKey::new(
            view.chunk_id,
            session.db_id(),
            RecordType::Kv,
            key.clone(),
            Vec::new(),
        );
        let value = RecordValue::new(pair[1].clone(), 0);
        let _ = set_generic_with_retry(
            view.store.as_ref(),
            SET_NO_FLAGS,
            &record_key,
            &value,
            None,
            None,
            ctx.retry_count,
        )?;
    }
    Ok(CommandReply::ok())
}

pub(super) fn handle_not_supported(
    _session: &Session,
    _ctx: &DispatchContext,
) -> MarlinResult<CommandReply> {
    Err(MarlinError::Internal("not support".to_owned()))
}
