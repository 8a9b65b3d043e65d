//! Runtime configuration shared by process bootstrap code.

use std::path::PathBuf;
use std::time::Duration;

use crate::ids::StoreCount;

/// Bootstrap configuration used by `marlin-server` during process startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// RESP listener address.
    pub listen_addr: String,
    /// Number of store instances behind the segment router.
    pub store_count: StoreCount,
    /// Upper bound on optimistic commit attempts per command.
    pub retry_count: u32,
    /// Directory holding persisted replication metadata.
    pub meta_dir: PathBuf,
    /// Directory holding per-store data and backup directories.
    pub data_dir: PathBuf,
    /// Worker threads serving client connections.
    pub worker_threads: usize,
    /// Replication timing knobs.
    pub repl: ReplTimingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6379".to_owned(),
            store_count: StoreCount::new(4).expect("literal store count must be non-zero"),
            retry_count: 3,
            meta_dir: PathBuf::from("marlin-meta"),
            data_dir: PathBuf::from("marlin-data"),
            worker_threads: 4,
            repl: ReplTimingConfig::default(),
        }
    }
}

/// Timing knobs for the replica-side sync routine.
///
/// Defaults match the protocol the primary expects; tests shrink them to keep
/// scheduler-driven cases fast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplTimingConfig {
    /// Reschedule delay when no primary is configured.
    pub no_primary_resched: Duration,
    /// Reschedule delay after a full-sync attempt.
    pub fullsync_resched: Duration,
    /// Reschedule delay while in steady incremental sync.
    pub connected_resched: Duration,
    /// Reconnect when the last successful sync is older than this.
    pub reconnect_threshold: Duration,
    /// Timeout for single control-line reads and writes.
    pub line_timeout: Duration,
    /// Timeout for the first reply line of a handshake.
    pub handshake_read_timeout: Duration,
    /// Upper bound on one bulk read during file transfer.
    pub transfer_chunk_bytes: usize,
}

impl Default for ReplTimingConfig {
    fn default() -> Self {
        Self {
            no_primary_resched: Duration::from_secs(1),
            fullsync_resched: Duration::from_secs(3),
            connected_resched: Duration::from_secs(10),
            reconnect_threshold: Duration::from_secs(10),
            line_timeout: Duration::from_secs(1),
            handshake_read_timeout: Duration::from_secs(3),
            transfer_chunk_bytes: 20 * 1024 * 1024,
        }
    }
}
