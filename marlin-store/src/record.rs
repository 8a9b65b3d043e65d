//! Record model for the keyspace.
//!
//! A stored record is addressed by a semantic 5-tuple [`RecordKey`] and carries a
//! [`RecordValue`] triple of payload bytes, absolute TTL, and a CAS counter.

use marlin_common::error::{MarlinError, MarlinResult};
use marlin_common::ids::{ChunkId, DbId};

use crate::codec::{ByteReader, write_len_prefixed, write_u8, write_u32, write_u64};

/// Stored record categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// Plain key-value record.
    Kv,
    /// Replication binlog row.
    Binlog,
}

impl RecordType {
    fn as_u8(self) -> u8 {
        match self {
            Self::Kv => 0,
            Self::Binlog => 1,
        }
    }

    fn from_u8(value: u8) -> MarlinResult<Self> {
        match value {
            0 => Ok(Self::Kv),
            1 => Ok(Self::Binlog),
            other => Err(MarlinError::Decode(format!(
                "invalid record type byte {other}"
            ))),
        }
    }
}

/// Semantic key tuple: chunk id, logical database, record type, primary and secondary key.
///
/// Two keys compare equal iff all five fields match. The secondary key is empty for
/// plain KV records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    /// Hash bucket assigned by the segment router.
    pub chunk_id: ChunkId,
    /// Logical database id from the session context.
    pub db_id: DbId,
    /// Record category.
    pub record_type: RecordType,
    /// User-visible key bytes.
    pub primary_key: Vec<u8>,
    /// Sub-key bytes, empty for plain KV.
    pub secondary_key: Vec<u8>,
}

impl RecordKey {
    /// Builds a record key.
    #[must_use]
    pub fn new(
        chunk_id: ChunkId,
        db_id: DbId,
        record_type: RecordType,
        primary_key: impl Into<Vec<u8>>,
        secondary_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            chunk_id,
            db_id,
            record_type,
            primary_key: primary_key.into(),
            secondary_key: secondary_key.into(),
        }
    }

    /// Encodes the key into storage bytes.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Decode` when a key field exceeds format limits.
    pub fn encode(&self) -> MarlinResult<Vec<u8>> {
        let mut output = Vec::new();
        write_u32(&mut output, self.chunk_id);
        write_u32(&mut output, self.db_id);
        write_u8(&mut output, self.record_type.as_u8());
        write_len_prefixed(&mut output, &self.primary_key)?;
        write_len_prefixed(&mut output, &self.secondary_key)?;
        Ok(output)
    }

    /// Decodes a key from storage bytes.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Decode` when the payload is truncated or semantically invalid.
    pub fn decode(payload: &[u8]) -> MarlinResult<Self> {
        let mut reader = ByteReader::new(payload);
        let chunk_id = reader.read_u32()?;
        let db_id = reader.read_u32()?;
        let record_type = RecordType::from_u8(reader.read_u8()?)?;
        let primary_key = reader.read_len_prefixed()?;
        let secondary_key = reader.read_len_prefixed()?;
        reader.ensure_fully_consumed()?;
        Ok(Self {
            chunk_id,
            db_id,
            record_type,
            primary_key,
            secondary_key,
        })
    }
}

/// Stored value triple: payload bytes, absolute TTL in Unix milliseconds, CAS counter.
///
/// A TTL of `0` means "no expiry"; the TTL is always an absolute instant, never a
/// duration. The CAS counter starts at 0 and moves only through explicit
/// compare-and-swap mutations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordValue {
    value: Vec<u8>,
    ttl_ms: u64,
    cas: u64,
}

impl RecordValue {
    /// Builds a value with the given payload and absolute TTL, CAS at zero.
    #[must_use]
    pub fn new(value: impl Into<Vec<u8>>, ttl_ms: u64) -> Self {
        Self {
            value: value.into(),
            ttl_ms,
            cas: 0,
        }
    }

    /// Payload bytes.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Consumes the record and returns the payload bytes.
    #[must_use]
    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    /// Absolute TTL in Unix milliseconds, `0` when the record never expires.
    #[must_use]
    pub fn ttl(&self) -> u64 {
        self.ttl_ms
    }

    /// Replaces the TTL.
    pub fn set_ttl(&mut self, ttl_ms: u64) {
        self.ttl_ms = ttl_ms;
    }

    /// CAS counter.
    #[must_use]
    pub fn cas(&self) -> u64 {
        self.cas
    }

    /// Replaces the CAS counter.
    pub fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    /// Returns whether the record is expired relative to `now_ms`.
    #[must_use]
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.ttl_ms != 0 && now_ms >= self.ttl_ms
    }

    /// Encodes the value into storage bytes.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Decode` when the payload exceeds format limits.
    pub fn encode(&self) -> MarlinResult<Vec<u8>> {
        let mut output = Vec::new();
        write_u64(&mut output, self.ttl_ms);
        write_u64(&mut output, self.cas);
        write_len_prefixed(&mut output, &self.value)?;
        Ok(output)
    }

    /// Decodes a value from storage bytes.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Decode` when the payload is truncated or semantically invalid.
    pub fn decode(payload: &[u8]) -> MarlinResult<Self> {
        let mut reader = ByteReader::new(payload);
        let ttl_ms = reader.read_u64()?;
        let cas = reader.read_u64()?;
        let value = reader.read_len_prefixed()?;
        reader.ensure_fully_consumed()?;
        Ok(Self { value, ttl_ms, cas })
    }
}
