//! Wire codec for binlog transaction-group batches.
//!
//! A batch frame is `u32 payload length` followed by the payload: group count, then
//! per group the transaction id, entry count, and length-prefixed op records in
//! ascending transaction order.

use std::collections::BTreeMap;

use marlin_common::error::{MarlinError, MarlinResult};
use marlin_common::ids::TxnId;
use marlin_store::binlog::ReplLogEntry;
use marlin_store::codec::{ByteReader, write_len_prefixed, write_u32, write_u64};

/// Encodes one batch into a length-prefixed frame.
///
/// # Errors
///
/// Returns `MarlinError::Decode` when counts or fields exceed format limits.
pub fn encode_batch_frame(batch: &BTreeMap<TxnId, Vec<ReplLogEntry>>) -> MarlinResult<Vec<u8>> {
    let mut payload = Vec::new();
    let group_count = u32::try_from(batch.len())
        .map_err(|_| MarlinError::Decode("batch group count exceeds u32::MAX".to_owned()))?;
    write_u32(&mut payload, group_count);

    for (txn_id, entries) in batch {
        write_u64(&mut payload, *txn_id);
        let entry_count = u32::try_from(entries.len())
            .map_err(|_| MarlinError::Decode("batch entry count exceeds u32::MAX".to_owned()))?;
        write_u32(&mut payload, entry_count);
        for entry in entries {
            write_len_prefixed(&mut payload, &entry.encode_op()?)?;
        }
    }

    let mut frame = Vec::with_capacity(payload.len() + 4);
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| MarlinError::Decode("batch payload exceeds u32::MAX".to_owned()))?;
    write_u32(&mut frame, payload_len);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes a frame payload (the bytes after the length prefix) into a batch.
///
/// # Errors
///
/// Returns `MarlinError::Decode` when the payload is truncated, carries duplicate or
/// out-of-order transaction ids, or holds malformed op records.
pub fn decode_batch_payload(payload: &[u8]) -> MarlinResult<BTreeMap<TxnId, Vec<ReplLogEntry>>> {
    let mut reader = ByteReader::new(payload);
    let group_count = reader.read_u32()?;

    let mut batch = BTreeMap::new();
    let mut previous_txn: Option<TxnId> = None;
    for _ in 0..group_count {
        let txn_id = reader.read_u64()?;
        if previous_txn.is_some_and(|previous| previous >= txn_id) {
            return Err(MarlinError::Decode(format!(
                "batch transaction ids must strictly ascend, saw {txn_id} after {}",
                previous_txn.unwrap_or(0)
            )));
        }
        previous_txn = Some(txn_id);

        let entry_count = reader.read_u32()?;
        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let op_bytes = reader.read_len_prefixed()?;
            entries.push(ReplLogEntry::decode_op(txn_id, &op_bytes)?);
        }
        let _ = batch.insert(txn_id, entries);
    }

    reader.ensure_fully_consumed()?;
    Ok(batch)
}
