//! Binlog record model shared by the engine and the replication stream.
//!
//! A binlog entry describes one logical mutation (`SET` or `DEL`) of an encoded record
//! key. Entries sharing one transaction id form a transaction group and are applied
//! atomically on the replica.

use marlin_common::error::{MarlinError, MarlinResult};
use marlin_common::ids::{ChunkId, TxnId};

use crate::codec::{ByteReader, write_len_prefixed, write_u8};
use crate::record::{RecordKey, RecordType, RecordValue};

/// Chunk id reserved for binlog rows, disjoint from the user-key chunk space.
pub const BINLOG_CHUNK: ChunkId = ChunkId::MAX;

/// Logical mutation kinds carried by the binlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplOp {
    /// Write of an encoded record value.
    Set,
    /// Deletion of the encoded record key.
    Del,
}

impl ReplOp {
    fn as_u8(self) -> u8 {
        match self {
            Self::Set => 0,
            Self::Del => 1,
        }
    }

    fn from_u8(value: u8) -> MarlinResult<Self> {
        match value {
            0 => Ok(Self::Set),
            1 => Ok(Self::Del),
            other => Err(MarlinError::Decode(format!("invalid binlog op byte {other}"))),
        }
    }
}

/// One ordered binlog record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplLogEntry {
    /// Transaction id this entry belongs to.
    pub txn_id: TxnId,
    /// Mutation kind.
    pub op: ReplOp,
    /// Encoded [`RecordKey`] bytes of the mutated record.
    pub op_key: Vec<u8>,
    /// Encoded [`RecordValue`] bytes for `Set`, empty for `Del`.
    pub op_value: Vec<u8>,
}

impl ReplLogEntry {
    /// Encodes the op triple into one byte field (the binlog row payload).
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Decode` when a field exceeds format limits.
    pub fn encode_op(&self) -> MarlinResult<Vec<u8>> {
        let mut output = Vec::new();
        write_u8(&mut output, self.op.as_u8());
        write_len_prefixed(&mut output, &self.op_key)?;
        write_len_prefixed(&mut output, &self.op_value)?;
        Ok(output)
    }

    /// Decodes one op triple produced by [`Self::encode_op`].
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Decode` when the payload is truncated or semantically invalid.
    pub fn decode_op(txn_id: TxnId, payload: &[u8]) -> MarlinResult<Self> {
        let mut reader = ByteReader::new(payload);
        let op = ReplOp::from_u8(reader.read_u8()?)?;
        let op_key = reader.read_len_prefixed()?;
        let op_value = reader.read_len_prefixed()?;
        reader.ensure_fully_consumed()?;
        Ok(Self {
            txn_id,
            op,
            op_key,
            op_value,
        })
    }

    /// Returns the `(key, value)` pair under which this entry is stored as a binlog row.
    ///
    /// The primary key orders rows by `(txn id, entry index)` big-endian so lexicographic
    /// key order matches apply order.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Decode` when the op payload exceeds format limits.
    pub fn record_pair(&self, entry_index: u32) -> MarlinResult<(RecordKey, RecordValue)> {
        let mut primary_key = Vec::with_capacity(12);
        primary_key.extend_from_slice(&self.txn_id.to_be_bytes());
        primary_key.extend_from_slice(&entry_index.to_be_bytes());
        let key = RecordKey::new(BINLOG_CHUNK, 0, RecordType::Binlog, primary_key, Vec::new());
        let value = RecordValue::new(self.encode_op()?, 0);
        Ok((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::{BINLOG_CHUNK, ReplLogEntry, ReplOp};
    use crate::record::{RecordKey, RecordType, RecordValue};
    use googletest::prelude::*;
    use rstest::rstest;

    fn sample_entry(txn_id: u64, op: ReplOp) -> ReplLogEntry {
        let key = RecordKey::new(3, 0, RecordType::Kv, b"k".to_vec(), Vec::new());
        let value = RecordValue::new(b"v".to_vec(), 0);
        ReplLogEntry {
            txn_id,
            op,
            op_key: key.encode().expect("key must encode"),
            op_value: match op {
                ReplOp::Set => value.encode().expect("value must encode"),
                ReplOp::Del => Vec::new(),
            },
        }
    }

    #[rstest]
    #[case(ReplOp::Set)]
    #[case(ReplOp::Del)]
    fn op_codec_roundtrips(#[case] op: ReplOp) {
        let entry = sample_entry(12, op);
        let encoded = entry.encode_op().expect("op must encode");
        let decoded = ReplLogEntry::decode_op(12, &encoded).expect("op must decode");
        assert_that!(&decoded, eq(&entry));
    }

    #[rstest]
    fn op_codec_rejects_unknown_op_byte() {
        let mut encoded = sample_entry(1, ReplOp::Set)
            .encode_op()
            .expect("op must encode");
        encoded[0] = 9;
        assert_that!(ReplLogEntry::decode_op(1, &encoded).is_err(), eq(true));
    }

    #[rstest]
    fn binlog_rows_sort_by_txn_then_index() {
        let first = sample_entry(1, ReplOp::Set)
            .record_pair(1)
            .expect("pair must build");
        let second = sample_entry(2, ReplOp::Set)
            .record_pair(0)
            .expect("pair must build");

        assert_that!(first.0.chunk_id, eq(BINLOG_CHUNK));
        assert_that!(first.0.record_type, eq(RecordType::Binlog));
        assert_that!(first.0.primary_key < second.0.primary_key, eq(true));
    }
}
