use marlin_common::error::{MarlinError, MarlinResult};
use marlin_store::RecordValue;

use super::DispatchContext;
use super::parse_numbers::{checked_sum, format_float, parse_f64, parse_i64};
use super::rmw::{preserved_ttl, run_read_modify_write};
use crate::command::{CommandReply, Session};

pub(super) fn handle_incr(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    incr_decr_general(session, ctx, 1)
}

pub(super) fn handle_decr(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    incr_decr_general(session, ctx, -1)
}

pub(super) fn handle_incrby(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let delta = parse_i64(&session.args()[2])?;
    incr_decr_general(session, ctx, delta)
}

pub(super) fn handle_decrby(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let amount = parse_i64(&session.args()[2])?;
    let delta = amount.checked_neg().ok_or_else(|| {
        MarlinError::ParsePkt("value is not an integer or out of range".to_owned())
    })?;
    incr_decr_general(session, ctx, delta)
}

/// Applies one signed integer delta with strict parsing and overflow detection.
///
/// Missing keys count as zero and are created; the previous TTL is preserved.
fn incr_decr_general(
    session: &Session,
    ctx: &DispatchContext,
    delta: i64,
) -> MarlinResult<CommandReply> {
    let new_value = run_read_modify_write(session, ctx, &session.args()[1], true, move |old_value| {
        let sum = old_value.map_or(Ok(0), |old| {
            parse_i64(old.value()).map_err(|_| {
                MarlinError::Decode("value is not an integer or out of range".to_owned())
            })
        })?;
        let next = checked_sum(sum, delta)?;
        Ok(RecordValue::new(
            next.to_string().into_bytes(),
            preserved_ttl(old_value),
        ))
    })?;

    let reply = parse_i64(new_value.value())?;
    Ok(CommandReply::Integer(reply))
}

pub(super) fn handle_incrbyfloat(
    session: &Session,
    ctx: &DispatchContext,
) -> MarlinResult<CommandReply> {
    let delta = parse_f64(&session.args()[2])?;
    let new_value = run_read_modify_write(session, ctx, &session.args()[1], true, move |old_value| {
        let sum = old_value.map_or(Ok(0.0), |old| {
            parse_f64(old.value())
                .map_err(|_| MarlinError::Decode("value is not double".to_owned()))
        })?;
        let next = sum + delta;
        if !next.is_finite() {
            return Err(MarlinError::Overflow(
                "increment would produce NaN or Infinity".to_owned(),
            ));
        }
        Ok(RecordValue::new(
            format_float(next).into_bytes(),
            preserved_ttl(old_value),
        ))
    })?;
    Ok(CommandReply::BulkString(new_value.into_value()))
}
