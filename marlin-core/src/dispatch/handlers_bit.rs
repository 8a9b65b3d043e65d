use marlin_common::error::{MarlinError, MarlinResult};
use marlin_store::{LockMode, RecordKey, RecordType, RecordValue};

use super::DispatchContext;
use super::expire::{del_key_chk_expire, expire_key_if_needed};
use super::handlers_string::MAX_STRING_BYTES;
use super::parse_numbers::{normalize_range, parse_i64, parse_u64};
use super::rmw::{preserved_ttl, run_read_modify_write};
use super::set_generic::{SET_NO_FLAGS, set_generic_with_retry};
use crate::command::{CommandReply, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitOp {
    And,
    Or,
    Xor,
    Not,
}

/// Number of set bits in `bytes`.
fn pop_count(bytes: &[u8]) -> i64 {
    bytes
        .iter()
        .map(|byte| i64::from(byte.count_ones()))
        .sum()
}

/// First position of `bit` in `bytes`, as an absolute bit offset into the slice.
///
/// Searching for a clear bit in an all-ones slice returns the position one past the
/// end (the caller decides whether that is reportable); searching for a set bit in an
/// all-zeros slice returns `-1`.
fn bit_pos(bytes: &[u8], bit: u8) -> i64 {
    let skip: u8 = if bit == 0 { 0xFF } else { 0x00 };
    let mut pos = 0_i64;
    let mut index = 0_usize;
    while index < bytes.len() && bytes[index] == skip {
        index += 1;
        pos += 8;
    }
    if index == bytes.len() {
        return if bit == 1 { -1 } else { pos };
    }

    let byte = bytes[index];
    for offset in 0..8 {
        if (byte >> (7 - offset)) & 1 == bit {
            return pos + i64::from(offset);
        }
    }
    unreachable!("byte differs from the skip pattern, one bit must match");
}

pub(super) fn handle_setbit(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let args = session.args();
    let pos = parse_u64(&args[2])?;
    let bit_arg = args[3].clone();

    let old_value = run_read_modify_write(session, ctx, &args[1], false, move |old_value| {
        if (pos >> 3) >= MAX_STRING_BYTES {
            return Err(MarlinError::ParseOpt(
                "bit offset is not an integer or out of range".to_owned(),
            ));
        }
        let on: u8 = if bit_arg == b"1" {
            1
        } else if bit_arg == b"0" {
            0
        } else {
            return Err(MarlinError::ParseOpt(
                "bit is not an integer or out of range".to_owned(),
            ));
        };

        let byte = usize::try_from(pos >> 3)
            .map_err(|_| MarlinError::ParseOpt("bit offset is not an integer or out of range".to_owned()))?;
        let mut payload = old_value.map_or_else(Vec::new, |old| old.value().to_vec());
        if payload.len() < byte + 1 {
            payload.resize(byte + 1, 0);
        }
        let bit = 7 - (pos & 0x7) as u8;
        payload[byte] &= !(1_u8 << bit);
        payload[byte] |= on << bit;
        Ok(RecordValue::new(payload, preserved_ttl(old_value)))
    })?;

    // the reply is the bit as it was before the write
    let byte = usize::try_from(pos >> 3).unwrap_or(usize::MAX);
    let bit = 7 - (pos & 0x7) as u8;
    let previous = old_value
        .value()
        .get(byte)
        .is_some_and(|stored| stored & (1_u8 << bit) != 0);
    Ok(if previous {
        CommandReply::one()
    } else {
        CommandReply::zero()
    })
}

pub(super) fn handle_bitcount(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let args = session.args();
    let value = match expire_key_if_needed(session, ctx, &args[1], RecordType::Kv) {
        Ok(value) => value.into_value(),
        Err(MarlinError::Expired | MarlinError::NotFound(_)) => {
            return Ok(CommandReply::zero());
        }
        Err(error) => return Err(error),
    };

    let (start, end) = match args.len() {
        2 => (0, i64::try_from(value.len()).unwrap_or(i64::MAX) - 1),
        4 => (parse_i64(&args[2])?, parse_i64(&args[3])?),
        _ => return Err(MarlinError::ParseOpt("syntax error".to_owned())),
    };

    let Some((start_index, end_index)) = normalize_range(start, end, value.len()) else {
        return Ok(CommandReply::zero());
    };
    Ok(CommandReply::Integer(pop_count(
        &value[start_index..=end_index],
    )))
}

pub(super) fn handle_bitpos(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let args = session.args();
    let bit: u8 = if args[2] == b"0" {
        0
    } else if args[2] == b"1" {
        1
    } else {
        return Err(MarlinError::ParseOpt(
            "The bit argument must be 1 or 0.".to_owned(),
        ));
    };

    let value = match expire_key_if_needed(session, ctx, &args[1], RecordType::Kv) {
        Ok(value) => value.into_value(),
        Err(MarlinError::Expired | MarlinError::NotFound(_)) => {
            return Ok(CommandReply::Integer(-1));
        }
        Err(error) => return Err(error),
    };

    let (start, end, end_given) = match args.len() {
        3 => (0, i64::try_from(value.len()).unwrap_or(i64::MAX) - 1, false),
        4 => (
            parse_i64(&args[3])?,
            i64::try_from(value.len()).unwrap_or(i64::MAX) - 1,
            false,
        ),
        5 => (parse_i64(&args[3])?, parse_i64(&args[4])?, true),
        _ => return Err(MarlinError::ParseOpt("syntax error".to_owned())),
    };

    let Some((start_index, end_index)) = normalize_range(start, end, value.len()) else {
        return Ok(CommandReply::Integer(-1));
    };

    let range_bits = i64::try_from((end_index - start_index + 1) * 8).unwrap_or(i64::MAX);
    let mut result = bit_pos(&value[start_index..=end_index], bit);
    if end_given && bit == 0 && result == range_bits {
        // a fully set explicit range has no clear bit to report
        return Ok(CommandReply::Integer(-1));
    }
    if result != -1 {
        result += i64::try_from(start_index * 8).unwrap_or(i64::MAX);
    }
    Ok(CommandReply::Integer(result))
}

pub(super) fn handle_bitop(session: &Session, ctx: &DispatchContext) -> MarlinResult<CommandReply> {
    let args = session.args();
    let op = if args[1].eq_ignore_ascii_case(b"AND") {
        BitOp::And
    } else if args[1].eq_ignore_ascii_case(b"OR") {
        BitOp::Or
    } else if args[1].eq_ignore_ascii_case(b"XOR") {
        BitOp::Xor
    } else if args[1].eq_ignore_ascii_case(b"NOT") {
        BitOp::Not
    } else {
        return Err(MarlinError::ParsePkt("syntax error".to_owned()));
    };
    if op == BitOp::Not && args.len() != 4 {
        return Err(MarlinError::ParsePkt(
            "BITOP NOT must be called with a single source key.".to_owned(),
        ));
    }

    let dest_key = &args[2];
    let mut sources = Vec::with_capacity(args.len() - 3);
    let mut max_len = 0_usize;
    for key in &args[3..] {
        // missing and expired sources fold in as empty strings
        let value = match expire_key_if_needed(session, ctx, key, RecordType::Kv) {
            Ok(value) => value.into_value(),
            Err(MarlinError::Expired | MarlinError::NotFound(_)) => Vec::new(),
            Err(error) => return Err(error),
        };
        max_len = max_len.max(value.len());
        sources.push(value);
    }

    if max_len == 0 {
        del_key_chk_expire(session, ctx, dest_key, RecordType::Kv)?;
        return Ok(CommandReply::zero());
    }

    let mut result = vec![0_u8; max_len];
    for (index, slot) in result.iter_mut().enumerate() {
        let mut output = sources[0].get(index).copied().unwrap_or(0);
        if op == BitOp::Not {
            output = !output;
        }
        for source in &sources[1..] {
            let byte = source.get(index).copied().unwrap_or(0);
            match op {
                BitOp::And => output &= byte,
                BitOp::Or => output |= byte,
                BitOp::Xor => output ^= byte,
                BitOp::Not => unreachable!("NOT takes a single source"),
            }
        }
        *slot = output;
    }

    let view = ctx.router.resolve(dest_key);
    let _guard = ctx
        .router
        .lock_key(view.store_id, dest_key, LockMode::Exclusive);
    let record_key = RecordKey::new(
        view.chunk_id,
        session.db_id(),
        RecordType::Kv,
        dest_key.clone(),
        Vec::new(),
    );
    let value = RecordValue::new(result, 0);
    let _ = set_generic_with_retry(
        view.store.as_ref(),
        SET_NO_FLAGS,
        &record_key,
        &value,
        None,
        None,
        ctx.retry_count,
    )?;
    Ok(CommandReply::Integer(
        i64::try_from(max_len).unwrap_or(i64::MAX),
    ))
}
