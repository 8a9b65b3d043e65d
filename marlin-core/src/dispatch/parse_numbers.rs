use std::str;

use marlin_common::error::{MarlinError, MarlinResult};

pub(super) fn parse_i64(payload: &[u8]) -> MarlinResult<i64> {
    str::from_utf8(payload)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| {
            MarlinError::ParsePkt("value is not an integer or out of range".to_owned())
        })
}

pub(super) fn parse_u64(payload: &[u8]) -> MarlinResult<u64> {
    str::from_utf8(payload)
        .ok()
        .and_then(|text| text.parse::<u64>().ok())
        .ok_or_else(|| {
            MarlinError::ParsePkt("value is not an integer or out of range".to_owned())
        })
}

pub(super) fn parse_f64(payload: &[u8]) -> MarlinResult<f64> {
    str::from_utf8(payload)
        .ok()
        .and_then(|text| text.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .ok_or_else(|| MarlinError::ParsePkt("value is not a valid float".to_owned()))
}

/// Adds `incr` to `sum` with the signed-comparison overflow check.
pub(super) fn checked_sum(sum: i64, incr: i64) -> MarlinResult<i64> {
    if (incr < 0 && sum < 0 && incr < i64::MIN - sum)
        || (incr > 0 && sum > 0 && incr > i64::MAX - sum)
    {
        return Err(MarlinError::Overflow(
            "increment or decrement would overflow".to_owned(),
        ));
    }
    Ok(sum + incr)
}

/// Formats a float the way the INCRBYFLOAT reply expects: shortest round-trip
/// representation, no trailing zeros, no exponent for integral values.
pub(super) fn format_float(value: f64) -> String {
    format!("{value}")
}

/// Resolves a `[start, end]` byte range against a string of `len` bytes.
///
/// Negative indices wrap from the end, both bounds clamp into `[0, len-1]`, and an
/// empty or inverted range resolves to `None`.
pub(super) fn normalize_range(start: i64, end: i64, len: usize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }

    let len_i64 = i64::try_from(len).unwrap_or(i64::MAX);
    let mut start = if start < 0 {
        start.saturating_add(len_i64)
    } else {
        start
    };
    let mut end = if end < 0 {
        end.saturating_add(len_i64)
    } else {
        end
    };

    if start < 0 {
        start = 0;
    }
    if end < 0 {
        end = 0;
    }
    if end >= len_i64 {
        end = len_i64 - 1;
    }
    if start > end {
        return None;
    }

    let start_index = usize::try_from(start).ok()?;
    let end_index = usize::try_from(end).ok()?;
    Some((start_index, end_index))
}
