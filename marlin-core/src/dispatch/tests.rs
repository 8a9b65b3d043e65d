use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use googletest::prelude::*;
use marlin_common::error::{MarlinError, MarlinResult};
use marlin_common::ids::{StoreId, TxnId};
use marlin_store::engine::Transaction;
use marlin_store::memstore::MemEngine;
use marlin_store::{KvEngine, RecordKey, RecordType, RecordValue, SegmentRouter};
use rstest::rstest;

use super::{CommandRegistry, DispatchContext};
use crate::command::{CommandReply, Session};

struct Fixture {
    _dir: tempfile::TempDir,
    registry: CommandRegistry,
    ctx: DispatchContext,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir must be available");
        let stores = (0..2_u32)
            .map(|id| {
                Arc::new(MemEngine::new(id, dir.path().join(format!("backup-{id}"))))
                    as Arc<dyn KvEngine>
            })
            .collect();
        let router = Arc::new(SegmentRouter::new(stores).expect("router must build"));
        Self {
            _dir: dir,
            registry: CommandRegistry::with_builtin_commands(),
            ctx: DispatchContext::new(router, 3),
        }
    }

    fn run(&self, parts: &[&[u8]]) -> CommandReply {
        self.run_in_db(0, parts)
    }

    fn run_in_db(&self, db: u32, parts: &[&[u8]]) -> CommandReply {
        let args = parts.iter().map(|part| part.to_vec()).collect();
        self.registry.dispatch(&Session::new(db, args), &self.ctx)
    }

    /// Raw engine read bypassing the expire prelude, for TTL/CAS assertions.
    fn raw_record(&self, key: &[u8]) -> MarlinResult<RecordValue> {
        let view = self.ctx.router.resolve(key);
        let record_key = RecordKey::new(view.chunk_id, 0, RecordType::Kv, key, Vec::new());
        let mut txn = view.store.create_transaction().expect("txn must open");
        view.store.get_kv(&record_key, &mut txn)
    }
}

fn bulk(payload: &[u8]) -> CommandReply {
    CommandReply::BulkString(payload.to_vec())
}

#[rstest]
fn set_then_get_roundtrips_arbitrary_bytes() {
    let fixture = Fixture::new();
    let payload: &[u8] = b"\x00\xffbinary\r\npayload";
    assert_that!(
        fixture.run(&[b"SET", b"blob", payload]),
        eq(&(CommandReply::ok()))
    );
    assert_that!(fixture.run(&[b"GET", b"blob"]), eq(&(bulk(payload))));
}

#[rstest]
fn get_on_missing_key_returns_null() {
    let fixture = Fixture::new();
    assert_that!(fixture.run(&[b"GET", b"ghost"]), eq(&(CommandReply::Null)));
}

#[rstest]
fn set_with_ttl_expires_and_is_deleted_on_access() {
    let fixture = Fixture::new();
    assert_that!(
        fixture.run(&[b"SET", b"foo", b"hello", b"PX", b"60"]),
        eq(&(CommandReply::ok()))
    );
    assert_that!(fixture.run(&[b"GET", b"foo"]), eq(&(bulk(b"hello"))));

    std::thread::sleep(Duration::from_millis(100));
    assert_that!(fixture.run(&[b"GET", b"foo"]), eq(&(CommandReply::Null)));
    // the expired record was deleted by the read, not merely hidden
    assert_that!(
        matches!(fixture.raw_record(b"foo"), Err(MarlinError::NotFound(_))),
        eq(true)
    );
}

#[rstest]
fn set_nx_never_overwrites_a_live_key() {
    let fixture = Fixture::new();
    assert_that!(
        fixture.run(&[b"SET", b"k", b"x", b"NX"]),
        eq(&(CommandReply::ok()))
    );
    assert_that!(
        fixture.run(&[b"SET", b"k", b"y", b"NX"]),
        eq(&(CommandReply::Null))
    );
    assert_that!(fixture.run(&[b"GET", b"k"]), eq(&(bulk(b"x"))));
}

#[rstest]
fn set_xx_requires_an_existing_key() {
    let fixture = Fixture::new();
    assert_that!(
        fixture.run(&[b"SET", b"k", b"v", b"XX"]),
        eq(&(CommandReply::Null))
    );
    let _ = fixture.run(&[b"SET", b"k", b"v"]);
    assert_that!(
        fixture.run(&[b"SET", b"k", b"w", b"xx"]),
        eq(&(CommandReply::ok()))
    );
    assert_that!(fixture.run(&[b"GET", b"k"]), eq(&(bulk(b"w"))));
}

#[rstest]
fn set_nx_treats_expired_keys_as_absent_and_purges_them() {
    let fixture = Fixture::new();
    let _ = fixture.run(&[b"SET", b"k", b"old", b"PX", b"40"]);
    std::thread::sleep(Duration::from_millis(80));

    assert_that!(
        fixture.run(&[b"SET", b"k", b"new", b"NX"]),
        eq(&(CommandReply::ok()))
    );
    assert_that!(fixture.run(&[b"GET", b"k"]), eq(&(bulk(b"new"))));
}

#[rstest]
fn set_xx_abort_on_expired_key_still_deletes_the_stale_record() {
    let fixture = Fixture::new();
    let _ = fixture.run(&[b"SET", b"k", b"old", b"PX", b"40"]);
    std::thread::sleep(Duration::from_millis(80));

    assert_that!(
        fixture.run(&[b"SET", b"k", b"w", b"XX"]),
        eq(&(CommandReply::Null))
    );
    assert_that!(
        matches!(fixture.raw_record(b"k"), Err(MarlinError::NotFound(_))),
        eq(true)
    );
}

#[rstest]
fn setnx_replies_one_on_success_and_zero_on_abort() {
    let fixture = Fixture::new();
    assert_that!(fixture.run(&[b"SETNX", b"k", b"v"]), eq(&(CommandReply::one())));
    assert_that!(fixture.run(&[b"SETNX", b"k", b"w"]), eq(&(CommandReply::zero())));
    assert_that!(fixture.run(&[b"GET", b"k"]), eq(&(bulk(b"v"))));
}

#[rstest]
fn setex_and_psetex_attach_absolute_ttls() {
    let fixture = Fixture::new();
    assert_that!(
        fixture.run(&[b"SETEX", b"k", b"100", b"v"]),
        eq(&(CommandReply::ok()))
    );
    assert_that!(fixture.run(&[b"GET", b"k"]), eq(&(bulk(b"v"))));
    let record = fixture.raw_record(b"k").expect("record must exist");
    assert_that!(record.ttl() > 0, eq(true));

    assert_that!(
        fixture.run(&[b"PSETEX", b"p", b"50", b"v"]),
        eq(&(CommandReply::ok()))
    );
    std::thread::sleep(Duration::from_millis(90));
    assert_that!(fixture.run(&[b"GET", b"p"]), eq(&(CommandReply::Null)));
}

#[rstest]
fn set_rejects_malformed_options() {
    let fixture = Fixture::new();
    assert_that!(
        fixture.run(&[b"SET", b"k", b"v", b"EX", b"abc"]),
        eq(&(CommandReply::Error(
            "value is not an integer or out of range".to_owned()
        )))
    );
    assert_that!(
        fixture.run(&[b"SET", b"k", b"v", b"BOGUS"]),
        eq(&(CommandReply::Error("syntax error".to_owned())))
    );
    assert_that!(
        fixture.run(&[b"SET", b"k", b"v", b"NX", b"XX"]),
        eq(&(CommandReply::Error("syntax error".to_owned())))
    );
}

#[rstest]
fn counters_add_subtract_and_detect_overflow() {
    let fixture = Fixture::new();
    let _ = fixture.run(&[b"SET", b"n", b"10"]);
    assert_that!(
        fixture.run(&[b"INCRBY", b"n", b"5"]),
        eq(&(CommandReply::Integer(15)))
    );
    assert_that!(
        fixture.run(&[b"INCRBY", b"n", b"9223372036854775807"]),
        eq(&(CommandReply::Error(
            "increment or decrement would overflow".to_owned()
        )))
    );
    // the failed increment left the value untouched
    assert_that!(fixture.run(&[b"GET", b"n"]), eq(&(bulk(b"15"))));

    assert_that!(fixture.run(&[b"INCR", b"fresh"]), eq(&(CommandReply::Integer(1))));
    assert_that!(fixture.run(&[b"DECR", b"fresh"]), eq(&(CommandReply::Integer(0))));
    assert_that!(
        fixture.run(&[b"DECRBY", b"fresh", b"7"]),
        eq(&(CommandReply::Integer(-7)))
    );
}

#[rstest]
fn counters_reject_non_integer_values_strictly() {
    let fixture = Fixture::new();
    let _ = fixture.run(&[b"SET", b"k", b" 12"]);
    assert_that!(
        fixture.run(&[b"INCR", b"k"]),
        eq(&(CommandReply::Error(
            "value is not an integer or out of range".to_owned()
        )))
    );
    assert_that!(
        fixture.run(&[b"INCRBY", b"k", b"1x"]),
        eq(&(CommandReply::Error(
            "value is not an integer or out of range".to_owned()
        )))
    );
}

#[rstest]
fn counters_preserve_the_existing_ttl() {
    let fixture = Fixture::new();
    let _ = fixture.run(&[b"SET", b"n", b"1", b"EX", b"100"]);
    let before = fixture.raw_record(b"n").expect("record must exist").ttl();
    let _ = fixture.run(&[b"INCR", b"n"]);
    let after = fixture.raw_record(b"n").expect("record must exist").ttl();
    assert_that!(before > 0, eq(true));
    assert_that!(after, eq(before));
}

#[rstest]
fn incrbyfloat_accumulates_and_formats_without_trailing_zeros() {
    let fixture = Fixture::new();
    let _ = fixture.run(&[b"SET", b"f", b"10.5"]);
    assert_that!(
        fixture.run(&[b"INCRBYFLOAT", b"f", b"0.1"]),
        eq(&(bulk(b"10.6")))
    );
    assert_that!(
        fixture.run(&[b"INCRBYFLOAT", b"g", b"3"]),
        eq(&(bulk(b"3")))
    );
    assert_that!(
        fixture.run(&[b"INCRBYFLOAT", b"f", b"oops"]),
        eq(&(CommandReply::Error("value is not a valid float".to_owned())))
    );
}

#[rstest]
fn append_concatenates_and_preserves_ttl() {
    let fixture = Fixture::new();
    assert_that!(
        fixture.run(&[b"APPEND", b"k", b"Hello "]),
        eq(&(CommandReply::Integer(6)))
    );
    assert_that!(
        fixture.run(&[b"APPEND", b"k", b"World"]),
        eq(&(CommandReply::Integer(11)))
    );
    assert_that!(fixture.run(&[b"GET", b"k"]), eq(&(bulk(b"Hello World"))));

    let _ = fixture.run(&[b"SET", b"t", b"v", b"EX", b"100"]);
    let before = fixture.raw_record(b"t").expect("record must exist").ttl();
    let _ = fixture.run(&[b"APPEND", b"t", b"w"]);
    let after = fixture.raw_record(b"t").expect("record must exist").ttl();
    assert_that!(after, eq(before));
}

#[rstest]
fn getset_returns_previous_value_and_clears_ttl() {
    let fixture = Fixture::new();
    assert_that!(
        fixture.run(&[b"GETSET", b"k", b"first"]),
        eq(&(CommandReply::Null))
    );
    let _ = fixture.run(&[b"SET", b"k", b"second", b"EX", b"100"]);
    assert_that!(
        fixture.run(&[b"GETSET", b"k", b"third"]),
        eq(&(bulk(b"second")))
    );
    let record = fixture.raw_record(b"k").expect("record must exist");
    assert_that!(record.ttl(), eq(0_u64));
    assert_that!(record.value(), eq(b"third".as_slice()));
}

#[rstest]
fn getrange_wraps_negative_indices_and_clamps() {
    let fixture = Fixture::new();
    let _ = fixture.run(&[b"SET", b"k", b"This is a string"]);
    assert_that!(fixture.run(&[b"GETRANGE", b"k", b"0", b"3"]), eq(&(bulk(b"This"))));
    assert_that!(fixture.run(&[b"GETRANGE", b"k", b"-3", b"-1"]), eq(&(bulk(b"ing"))));
    assert_that!(
        fixture.run(&[b"GETRANGE", b"k", b"10", b"100"]),
        eq(&(bulk(b"string")))
    );
    assert_that!(fixture.run(&[b"GETRANGE", b"k", b"5", b"2"]), eq(&(bulk(b""))));
    assert_that!(fixture.run(&[b"SUBSTR", b"k", b"0", b"3"]), eq(&(bulk(b"This"))));
    assert_that!(
        fixture.run(&[b"GETRANGE", b"missing", b"0", b"-1"]),
        eq(&(bulk(b"")))
    );
}

#[rstest]
fn strlen_reports_length_and_zero_for_missing() {
    let fixture = Fixture::new();
    assert_that!(fixture.run(&[b"STRLEN", b"k"]), eq(&(CommandReply::zero())));
    let _ = fixture.run(&[b"SET", b"k", b"hello"]);
    assert_that!(fixture.run(&[b"STRLEN", b"k"]), eq(&(CommandReply::Integer(5))));
}

#[rstest]
fn setrange_overlays_zero_pads_and_validates_offsets() {
    let fixture = Fixture::new();
    let _ = fixture.run(&[b"SET", b"k", b"Hello World"]);
    assert_that!(
        fixture.run(&[b"SETRANGE", b"k", b"6", b"Redis"]),
        eq(&(CommandReply::Integer(11)))
    );
    assert_that!(fixture.run(&[b"GET", b"k"]), eq(&(bulk(b"Hello Redis"))));

    assert_that!(
        fixture.run(&[b"SETRANGE", b"padded", b"5", b"x"]),
        eq(&(CommandReply::Integer(6)))
    );
    assert_that!(
        fixture.run(&[b"GET", b"padded"]),
        eq(&(bulk(b"\x00\x00\x00\x00\x00x")))
    );

    assert_that!(
        fixture.run(&[b"SETRANGE", b"k", b"-1", b"x"]),
        eq(&(CommandReply::Error("offset is out of range".to_owned())))
    );
    assert_that!(
        fixture.run(&[b"SETRANGE", b"k", b"536870912", b"x"]),
        eq(&(CommandReply::Error(
            "string exceeds maximum allowed size (512MB)".to_owned()
        )))
    );
}

#[rstest]
fn setbit_replies_with_the_previous_bit() {
    let fixture = Fixture::new();
    assert_that!(
        fixture.run(&[b"SETBIT", b"k", b"7", b"1"]),
        eq(&(CommandReply::zero()))
    );
    assert_that!(fixture.run(&[b"GET", b"k"]), eq(&(bulk(b"\x01"))));
    // setting the same bit again reports it as already set and changes nothing
    assert_that!(
        fixture.run(&[b"SETBIT", b"k", b"7", b"1"]),
        eq(&(CommandReply::one()))
    );
    assert_that!(fixture.run(&[b"GET", b"k"]), eq(&(bulk(b"\x01"))));

    assert_that!(
        fixture.run(&[b"SETBIT", b"k", b"7", b"0"]),
        eq(&(CommandReply::one()))
    );
    assert_that!(fixture.run(&[b"GET", b"k"]), eq(&(bulk(b"\x00"))));

    assert_that!(
        fixture.run(&[b"SETBIT", b"k", b"3", b"9"]),
        eq(&(CommandReply::Error(
            "bit is not an integer or out of range".to_owned()
        )))
    );
    assert_that!(
        fixture.run(&[b"SETBIT", b"k", b"4294967296000000", b"1"]),
        eq(&(CommandReply::Error(
            "bit offset is not an integer or out of range".to_owned()
        )))
    );
}

#[rstest]
fn bitcount_and_bitpos_cover_range_and_all_ones_rules() {
    let fixture = Fixture::new();
    let _ = fixture.run(&[b"SET", b"a", b"\xff\xf0\x00"]);
    assert_that!(fixture.run(&[b"BITCOUNT", b"a"]), eq(&(CommandReply::Integer(12))));
    assert_that!(
        fixture.run(&[b"BITPOS", b"a", b"0"]),
        eq(&(CommandReply::Integer(12)))
    );
    assert_that!(
        fixture.run(&[b"BITPOS", b"a", b"0", b"0", b"-1"]),
        eq(&(CommandReply::Integer(12)))
    );
    assert_that!(
        fixture.run(&[b"BITPOS", b"a", b"0", b"2", b"2"]),
        eq(&(CommandReply::Integer(16)))
    );
    assert_that!(
        fixture.run(&[b"BITPOS", b"a", b"1", b"2", b"2"]),
        eq(&(CommandReply::Integer(-1)))
    );

    let _ = fixture.run(&[b"SET", b"ones", b"\xff\xff"]);
    // without an explicit end a clear-bit probe may point one past the string
    assert_that!(
        fixture.run(&[b"BITPOS", b"ones", b"0"]),
        eq(&(CommandReply::Integer(16)))
    );
    assert_that!(
        fixture.run(&[b"BITPOS", b"ones", b"0", b"0", b"-1"]),
        eq(&(CommandReply::Integer(-1)))
    );

    assert_that!(fixture.run(&[b"BITCOUNT", b"missing"]), eq(&(CommandReply::zero())));
    assert_that!(
        fixture.run(&[b"BITPOS", b"missing", b"1"]),
        eq(&(CommandReply::Integer(-1)))
    );
    assert_that!(
        fixture.run(&[b"BITPOS", b"a", b"7"]),
        eq(&(CommandReply::Error("The bit argument must be 1 or 0.".to_owned())))
    );
}

#[rstest]
fn bitop_folds_sources_and_deletes_dest_when_all_empty() {
    let fixture = Fixture::new();
    let _ = fixture.run(&[b"SET", b"x", b"abc"]);

    assert_that!(
        fixture.run(&[b"BITOP", b"AND", b"d", b"x", b"x"]),
        eq(&(CommandReply::Integer(3)))
    );
    assert_that!(fixture.run(&[b"GET", b"d"]), eq(&(bulk(b"abc"))));

    assert_that!(
        fixture.run(&[b"BITOP", b"xor", b"d", b"x", b"x"]),
        eq(&(CommandReply::Integer(3)))
    );
    assert_that!(fixture.run(&[b"GET", b"d"]), eq(&(bulk(b"\x00\x00\x00"))));

    let _ = fixture.run(&[b"SET", b"y", b"a"]);
    assert_that!(
        fixture.run(&[b"BITOP", b"OR", b"d", b"x", b"y"]),
        eq(&(CommandReply::Integer(3)))
    );

    assert_that!(
        fixture.run(&[b"BITOP", b"NOT", b"d", b"x", b"y"]),
        eq(&(CommandReply::Error(
            "BITOP NOT must be called with a single source key.".to_owned()
        )))
    );

    // all sources empty: the destination is dropped instead of written
    assert_that!(
        fixture.run(&[b"BITOP", b"AND", b"d", b"m1", b"m2"]),
        eq(&(CommandReply::zero()))
    );
    assert_that!(fixture.run(&[b"GET", b"d"]), eq(&(CommandReply::Null)));
}

#[rstest]
fn cas_creates_matches_and_rejects_stale_versions() {
    let fixture = Fixture::new();
    assert_that!(
        fixture.run(&[b"CAS", b"k", b"7", b"v"]),
        eq(&(CommandReply::ok()))
    );
    assert_that!(
        fixture.run(&[b"GETVSN", b"k"]),
        eq(&(CommandReply::Array(vec![
            CommandReply::Integer(7),
            bulk(b"v"),
        ])))
    );

    assert_that!(
        fixture.run(&[b"CAS", b"k", b"7", b"w"]),
        eq(&(CommandReply::ok()))
    );
    assert_that!(
        fixture.run(&[b"CAS", b"k", b"7", b"x"]),
        eq(&(CommandReply::Error("cas unmatch".to_owned())))
    );
    assert_that!(
        fixture.run(&[b"GETVSN", b"k"]),
        eq(&(CommandReply::Array(vec![
            CommandReply::Integer(8),
            bulk(b"w"),
        ])))
    );
}

#[rstest]
fn cas_preserves_ttl_on_successful_swap() {
    let fixture = Fixture::new();
    let _ = fixture.run(&[b"SET", b"k", b"v", b"EX", b"100"]);
    let before = fixture.raw_record(b"k").expect("record must exist").ttl();
    assert_that!(
        fixture.run(&[b"CAS", b"k", b"0", b"w"]),
        eq(&(CommandReply::ok()))
    );
    let after = fixture.raw_record(b"k").expect("record must exist").ttl();
    assert_that!(after, eq(before));
}

#[rstest]
fn getvsn_reports_minus_one_and_null_for_missing_keys() {
    let fixture = Fixture::new();
    assert_that!(
        fixture.run(&[b"GETVSN", b"missing"]),
        eq(&(CommandReply::Array(vec![
            CommandReply::Integer(-1),
            CommandReply::Null,
        ])))
    );
}

#[rstest]
fn mget_mixes_values_and_nulls_in_request_order() {
    let fixture = Fixture::new();
    let _ = fixture.run(&[b"SET", b"k1", b"a"]);
    let _ = fixture.run(&[b"SET", b"k2", b"b"]);
    assert_that!(
        fixture.run(&[b"MGET", b"k1", b"missing", b"k2"]),
        eq(&(CommandReply::Array(vec![
            bulk(b"a"),
            CommandReply::Null,
            bulk(b"b"),
        ])))
    );
}

#[rstest]
fn mset_writes_pairs_sequentially() {
    let fixture = Fixture::new();
    assert_that!(
        fixture.run(&[b"MSET", b"k1", b"a", b"k2", b"b"]),
        eq(&(CommandReply::ok()))
    );
    assert_that!(fixture.run(&[b"GET", b"k1"]), eq(&(bulk(b"a"))));
    assert_that!(fixture.run(&[b"GET", b"k2"]), eq(&(bulk(b"b"))));

    assert_that!(
        fixture.run(&[b"MSET", b"k1", b"a", b"k2"]),
        eq(&(CommandReply::Error(
            "wrong number of arguments for 'mset' command".to_owned()
        )))
    );
}

#[rstest]
#[case(b"MOVE".as_slice())]
#[case(b"RENAME".as_slice())]
#[case(b"RENAMENX".as_slice())]
fn relocation_commands_are_not_supported(#[case] name: &[u8]) {
    let fixture = Fixture::new();
    assert_that!(
        fixture.run(&[name, b"a", b"b"]),
        eq(&(CommandReply::Error("not support".to_owned())))
    );
}

#[rstest]
fn dispatch_validates_arity_and_rejects_unknown_commands() {
    let fixture = Fixture::new();
    assert_that!(
        fixture.run(&[b"GET"]),
        eq(&(CommandReply::Error(
            "wrong number of arguments for 'get' command".to_owned()
        )))
    );
    assert_that!(
        fixture.run(&[b"SET", b"k"]),
        eq(&(CommandReply::Error(
            "wrong number of arguments for 'set' command".to_owned()
        )))
    );
    assert_that!(
        fixture.run(&[b"NOSUCH", b"k"]),
        eq(&(CommandReply::Error("unknown command 'NOSUCH'".to_owned())))
    );
}

#[rstest]
fn sessions_in_different_databases_are_isolated() {
    let fixture = Fixture::new();
    let _ = fixture.run_in_db(0, &[b"SET", b"k", b"zero"]);
    assert_that!(fixture.run_in_db(1, &[b"GET", b"k"]), eq(&(CommandReply::Null)));
    assert_that!(fixture.run_in_db(0, &[b"GET", b"k"]), eq(&(bulk(b"zero"))));
}

#[rstest]
fn key_extraction_follows_dispatch_metadata() {
    let fixture = Fixture::new();
    let registry = &fixture.registry;

    let keys = |parts: &[&[u8]]| {
        let args: Vec<Vec<u8>> = parts.iter().map(|part| part.to_vec()).collect();
        registry.command_keys(&args).expect("keys must extract")
    };

    assert_that!(
        keys(&[b"SET", b"k", b"v", b"EX", b"10"]),
        eq(&(vec![b"k".to_vec()]))
    );
    assert_that!(
        keys(&[b"MSET", b"k1", b"v1", b"k2", b"v2"]),
        eq(&(vec![b"k1".to_vec(), b"k2".to_vec()]))
    );
    assert_that!(
        keys(&[b"MGET", b"a", b"b", b"c"]),
        eq(&(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]))
    );
    assert_that!(
        keys(&[b"BITOP", b"AND", b"dest", b"s1", b"s2"]),
        eq(&(vec![b"dest".to_vec(), b"s1".to_vec(), b"s2".to_vec()]))
    );
    assert_that!(
        keys(&[b"RENAME", b"src", b"dst"]),
        eq(&(vec![b"src".to_vec(), b"dst".to_vec()]))
    );
}

/// Engine wrapper that fails the next N commits with `CommitRetry`.
struct ConflictEngine {
    inner: MemEngine,
    failures_left: AtomicU32,
}

impl ConflictEngine {
    fn new(inner: MemEngine, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
        }
    }
}

impl KvEngine for ConflictEngine {
    fn store_id(&self) -> StoreId {
        self.inner.store_id()
    }

    fn create_transaction(&self) -> MarlinResult<Transaction> {
        self.inner.create_transaction()
    }

    fn get_kv(&self, key: &RecordKey, txn: &mut Transaction) -> MarlinResult<RecordValue> {
        self.inner.get_kv(key, txn)
    }

    fn set_kv(
        &self,
        key: &RecordKey,
        value: &RecordValue,
        txn: &mut Transaction,
        with_log: bool,
    ) -> MarlinResult<()> {
        self.inner.set_kv(key, value, txn, with_log)
    }

    fn del_kv(&self, key: &RecordKey, txn: &mut Transaction, with_log: bool) -> MarlinResult<()> {
        self.inner.del_kv(key, txn, with_log)
    }

    fn commit(&self, txn: Transaction) -> MarlinResult<TxnId> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            let _ = self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(MarlinError::CommitRetry);
        }
        self.inner.commit(txn)
    }

    fn stop(&self) -> MarlinResult<()> {
        self.inner.stop()
    }

    fn clear(&self) -> MarlinResult<()> {
        self.inner.clear()
    }

    fn restart(&self, load_backup: bool) -> MarlinResult<TxnId> {
        self.inner.restart(load_backup)
    }

    fn backup_dir(&self) -> std::path::PathBuf {
        self.inner.backup_dir()
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }
}

fn conflict_fixture(failures: u32, retry_count: u32) -> (tempfile::TempDir, CommandRegistry, DispatchContext) {
    let dir = tempfile::tempdir().expect("tempdir must be available");
    let engine = ConflictEngine::new(MemEngine::new(0, dir.path().join("backup")), failures);
    let router =
        Arc::new(SegmentRouter::new(vec![Arc::new(engine)]).expect("router must build"));
    (
        dir,
        CommandRegistry::with_builtin_commands(),
        DispatchContext::new(router, retry_count),
    )
}

#[rstest]
fn commit_conflicts_are_retried_within_the_bound() {
    let (_dir, registry, ctx) = conflict_fixture(2, 3);
    let session = Session::new(0, vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
    assert_that!(registry.dispatch(&session, &ctx), eq(&(CommandReply::ok())));

    let session = Session::new(0, vec![b"GET".to_vec(), b"k".to_vec()]);
    assert_that!(registry.dispatch(&session, &ctx), eq(&(bulk(b"v"))));
}

#[rstest]
fn exhausted_retries_surface_the_commit_conflict() {
    let (_dir, registry, ctx) = conflict_fixture(5, 3);
    let session = Session::new(0, vec![b"INCR".to_vec(), b"k".to_vec()]);
    assert_that!(
        registry.dispatch(&session, &ctx),
        eq(&(CommandReply::Error("commit conflict".to_owned())))
    );
}
