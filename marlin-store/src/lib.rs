//! Record model, transactional store abstraction, and segment routing.
//!
//! The command layer talks to storage exclusively through [`KvEngine`] and
//! [`SegmentRouter`]; the in-memory engine behind them lives in [`memstore`].

pub mod binlog;
pub mod codec;
pub mod engine;
pub mod memstore;
pub mod record;
pub mod router;
pub mod snapshot;

pub use engine::{KvEngine, Transaction};
pub use record::{RecordKey, RecordType, RecordValue};
pub use router::{KeyLockGuard, LockMode, SegmentRouter, SegmentView};
