//! Session registry and replication stream ingestion.
//!
//! The replication manager hands a connected client here; promotion allocates a
//! session id and spawns a reader thread that decodes binlog batch frames and feeds
//! them into the apply sink. A session that errors simply ends; the next sync status
//! check reconnects and re-binds, which invalidates the stale session id.

use std::collections::BTreeMap;
use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use marlin_common::error::{MarlinError, MarlinResult};
use marlin_common::ids::{SessionId, StoreId, TxnId};
use marlin_replication::manager::SessionPromoter;
use marlin_replication::wire::decode_batch_payload;
use marlin_replication::BlockingTcpClient;
use marlin_store::binlog::ReplLogEntry;
use tracing::{info, warn};

/// Receives decoded binlog batches from replication sessions.
pub trait BinlogSink: Send + Sync {
    /// Applies one ordered batch delivered over `session_id`.
    ///
    /// # Errors
    ///
    /// Returns an error when the session is stale or apply fails; the session ends.
    fn apply(
        &self,
        store_id: StoreId,
        session_id: SessionId,
        batch: &BTreeMap<TxnId, Vec<ReplLogEntry>>,
    ) -> MarlinResult<()>;
}

impl BinlogSink for marlin_replication::ReplManager {
    fn apply(
        &self,
        store_id: StoreId,
        session_id: SessionId,
        batch: &BTreeMap<TxnId, Vec<ReplLogEntry>>,
    ) -> MarlinResult<()> {
        self.apply_binlogs(store_id, session_id, batch)
    }
}

/// Allocates session ids and owns the replication reader threads.
pub struct SessionRegistry {
    next_session_id: AtomicU64,
    sink: Mutex<Option<Arc<dyn BinlogSink>>>,
}

impl SessionRegistry {
    /// Creates a registry with no sink bound yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_session_id: AtomicU64::new(0),
            sink: Mutex::new(None),
        }
    }

    /// Binds the apply sink; promotion fails until one is bound.
    pub fn bind_sink(&self, sink: Arc<dyn BinlogSink>) {
        *self
            .sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sink);
    }

    fn allocate_session_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionPromoter for SessionRegistry {
    fn promote(&self, client: BlockingTcpClient, store_id: StoreId) -> MarlinResult<SessionId> {
        let sink = self
            .sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(MarlinError::InvalidState("no binlog sink bound"))?;

        let session_id = self.allocate_session_id();
        let stream = client.into_stream();
        stream
            .set_read_timeout(None)
            .map_err(|error| MarlinError::Network(error.to_string()))?;

        let _ = std::thread::Builder::new()
            .name(format!("repl-session-{session_id}"))
            .spawn(move || replication_session_loop(stream, &sink, store_id, session_id))
            .map_err(|error| MarlinError::Internal(format!("session thread spawn failed: {error}")))?;
        Ok(session_id)
    }
}

/// Reads length-prefixed binlog batch frames until the stream or the apply fails.
fn replication_session_loop(
    mut stream: TcpStream,
    sink: &Arc<dyn BinlogSink>,
    store_id: StoreId,
    session_id: SessionId,
) {
    loop {
        let mut header = [0_u8; 4];
        if let Err(read_error) = stream.read_exact(&mut header) {
            info!(store = store_id, session = session_id, error = %read_error, "replication session closed");
            return;
        }
        let length = u32::from_le_bytes(header) as usize;
        let mut payload = vec![0_u8; length];
        if let Err(read_error) = stream.read_exact(&mut payload) {
            warn!(store = store_id, session = session_id, error = %read_error, "replication frame truncated");
            return;
        }

        let batch = match decode_batch_payload(&payload) {
            Ok(batch) => batch,
            Err(decode_error) => {
                warn!(store = store_id, session = session_id, error = %decode_error, "replication frame malformed");
                return;
            }
        };
        if let Err(apply_error) = sink.apply(store_id, session_id, &batch) {
            warn!(store = store_id, session = session_id, error = %apply_error, "binlog apply failed");
            return;
        }
    }
}
