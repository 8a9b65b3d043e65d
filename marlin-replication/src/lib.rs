//! Replica-side replication: full snapshot transfer and incremental binlog apply.
//!
//! Each replicated store walks `Connect -> Transfer -> Connected`: a file-level
//! snapshot transfer from the primary, then a continuous stream of binlog
//! transaction groups applied by [`manager::ReplManager::apply_binlogs`].

pub mod client;
pub mod manager;
pub mod meta;
pub mod wire;
pub mod worker;

pub use client::BlockingTcpClient;
pub use manager::{ReplManager, SessionPromoter};
pub use meta::{ReplState, StoreMeta};
