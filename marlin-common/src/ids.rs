//! Canonical identifier types used across commands, storage, and replication.

/// Numeric store instance identifier inside a single process.
pub type StoreId = u32;

/// Logical database index (Redis `SELECT` compatible model).
pub type DbId = u32;

/// Hash-bucket identifier assigned by the segment router, part of the stored key tuple.
pub type ChunkId = u32;

/// Monotonic transaction identifier assigned at commit time.
pub type TxnId = u64;

/// Network session identifier allocated by the session registry.
pub type SessionId = u64;

/// Largest transaction id a committed transaction can carry.
///
/// `MAX_VALID_TXNID + 1` marks "binlog resume position unknown" in replication metadata.
pub const MAX_VALID_TXNID: TxnId = u64::MAX / 2;

/// Sentinel for a store that has never committed anything. Invalid as a binlog resume point.
pub const TXNID_UNINITED: TxnId = u64::MAX;

/// Sentinel for "no replication session bound".
pub const SESSION_NONE: SessionId = u64::MAX;

/// Strongly typed store-count wrapper to avoid passing raw integers around runtime APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreCount(u32);

impl StoreCount {
    /// Creates a validated store-count value.
    ///
    /// Returns `None` for zero because the segment router always requires at least one
    /// owning store instance.
    #[must_use]
    pub fn new(value: u32) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the inner count.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::{MAX_VALID_TXNID, StoreCount, TXNID_UNINITED};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn store_count_rejects_zero() {
        assert_that!(StoreCount::new(0), eq(None));
    }

    #[rstest]
    #[case(1)]
    #[case(16)]
    #[case(u32::MAX)]
    fn store_count_accepts_positive_values(#[case] input: u32) {
        let count = StoreCount::new(input).expect("positive count must be valid");
        assert_that!(count.get(), eq(input));
    }

    #[rstest]
    fn resume_unknown_marker_is_distinct_from_uninited_marker() {
        assert_that!(MAX_VALID_TXNID + 1 == TXNID_UNINITED, eq(false));
    }
}
