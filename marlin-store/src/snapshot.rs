//! Binary snapshot codec for store backups.
//!
//! A backup directory holds one snapshot file carrying the full record set plus the
//! binlog resume position a restarted replica continues from.

use std::fs;
use std::path::Path;

use marlin_common::error::{MarlinError, MarlinResult};
use marlin_common::ids::TxnId;

use crate::codec::{ByteReader, write_len_prefixed, write_u16, write_u32, write_u64};
use crate::record::{RecordKey, RecordValue};

/// Fixed magic marker at the beginning of every snapshot payload.
const SNAPSHOT_MAGIC: &[u8; 8] = b"MRLNSNAP";
/// Current snapshot format version.
const SNAPSHOT_VERSION: u16 = 1;

/// File name of the snapshot inside a backup directory.
pub const SNAPSHOT_FILE: &str = "store.snapshot";

/// Encodes a record set into snapshot bytes.
///
/// # Errors
///
/// Returns `MarlinError::Decode` when entry list or byte fields exceed format limits.
pub fn encode_snapshot(
    entries: &[(RecordKey, RecordValue)],
    resume_txn_id: TxnId,
) -> MarlinResult<Vec<u8>> {
    let mut output = Vec::new();
    output.extend_from_slice(SNAPSHOT_MAGIC);
    write_u16(&mut output, SNAPSHOT_VERSION);
    write_u64(&mut output, resume_txn_id);
    let entry_count = u32::try_from(entries.len())
        .map_err(|_| MarlinError::Decode("snapshot entry count exceeds u32::MAX".to_owned()))?;
    write_u32(&mut output, entry_count);

    for (key, value) in entries {
        write_len_prefixed(&mut output, &key.encode()?)?;
        write_len_prefixed(&mut output, &value.encode()?)?;
    }

    Ok(output)
}

/// Decodes snapshot bytes into a record set and the resume transaction id.
///
/// # Errors
///
/// Returns `MarlinError::Decode` when the payload is truncated or semantically invalid.
pub fn decode_snapshot(payload: &[u8]) -> MarlinResult<(Vec<(RecordKey, RecordValue)>, TxnId)> {
    let mut reader = ByteReader::new(payload);

    let magic = reader.read_slice(SNAPSHOT_MAGIC.len())?;
    if magic != SNAPSHOT_MAGIC {
        return Err(MarlinError::Decode("invalid snapshot magic".to_owned()));
    }

    let version = reader.read_u16()?;
    if version != SNAPSHOT_VERSION {
        return Err(MarlinError::Decode(format!(
            "unsupported snapshot version {version}"
        )));
    }

    let resume_txn_id = reader.read_u64()?;
    let entry_count = usize::try_from(reader.read_u32()?)
        .map_err(|_| MarlinError::Decode("entry count exceeds platform limits".to_owned()))?;
    let mut entries = Vec::with_capacity(entry_count);

    for _ in 0..entry_count {
        let key = RecordKey::decode(&reader.read_len_prefixed()?)?;
        let value = RecordValue::decode(&reader.read_len_prefixed()?)?;
        entries.push((key, value));
    }

    reader.ensure_fully_consumed()?;
    Ok((entries, resume_txn_id))
}

/// Writes a snapshot file under `backup_dir`, creating the directory.
///
/// # Errors
///
/// Returns `MarlinError::Io` on filesystem failure, `MarlinError::Decode` when the
/// record set cannot be encoded.
pub fn save_backup(
    backup_dir: &Path,
    entries: &[(RecordKey, RecordValue)],
    resume_txn_id: TxnId,
) -> MarlinResult<()> {
    fs::create_dir_all(backup_dir)?;
    let payload = encode_snapshot(entries, resume_txn_id)?;
    fs::write(backup_dir.join(SNAPSHOT_FILE), payload)?;
    Ok(())
}

/// Reads the snapshot file under `backup_dir`.
///
/// # Errors
///
/// Returns `MarlinError::Io` when the file is missing, `MarlinError::Decode` when its
/// content is malformed.
pub fn load_backup(backup_dir: &Path) -> MarlinResult<(Vec<(RecordKey, RecordValue)>, TxnId)> {
    let payload = fs::read(backup_dir.join(SNAPSHOT_FILE))?;
    decode_snapshot(&payload)
}
