//! Process composition root.

use std::sync::Arc;

use marlin_common::config::RuntimeConfig;
use marlin_common::error::MarlinResult;
use marlin_core::{CommandRegistry, CommandReply, DispatchContext, Session};
use marlin_replication::{ReplManager, SessionPromoter};
use marlin_store::memstore::MemEngine;
use marlin_store::{KvEngine, SegmentRouter};
use tracing::info;

use crate::session::{BinlogSink, SessionRegistry};

/// Fully wired server: stores, router, command table, replication, sessions.
pub struct ServerApp {
    config: RuntimeConfig,
    registry: CommandRegistry,
    ctx: DispatchContext,
    repl: Arc<ReplManager>,
}

impl ServerApp {
    /// Builds every subsystem from the runtime configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the router cannot be built or persisted replication
    /// metadata is unreadable.
    pub fn bootstrap(config: RuntimeConfig) -> MarlinResult<Arc<Self>> {
        let stores = (0..config.store_count.get())
            .map(|store_id| {
                let backup_dir = config
                    .data_dir
                    .join(format!("store-{store_id}"))
                    .join("backup");
                Arc::new(MemEngine::new(store_id, backup_dir)) as Arc<dyn KvEngine>
            })
            .collect::<Vec<_>>();
        let router = Arc::new(SegmentRouter::new(stores)?);

        let sessions = Arc::new(SessionRegistry::new());
        let repl = Arc::new(ReplManager::new(
            Arc::clone(&router),
            config.meta_dir.clone(),
            config.repl.clone(),
            Arc::clone(&sessions) as Arc<dyn SessionPromoter>,
        )?);
        sessions.bind_sink(Arc::clone(&repl) as Arc<dyn BinlogSink>);

        let registry = CommandRegistry::with_builtin_commands();
        let ctx = DispatchContext::new(Arc::clone(&router), config.retry_count);

        info!(
            stores = config.store_count.get(),
            listen = %config.listen_addr,
            "server bootstrap complete"
        );
        Ok(Arc::new(Self {
            config,
            registry,
            ctx,
            repl,
        }))
    }

    /// Runtime configuration this process was built from.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Replication manager handle.
    #[must_use]
    pub fn replication(&self) -> &Arc<ReplManager> {
        &self.repl
    }

    /// Starts the replication scheduler.
    pub fn start_replication(&self) {
        self.repl.start(self.config.worker_threads);
    }

    /// Configures every local store to follow its same-id store on the primary.
    ///
    /// # Errors
    ///
    /// Returns an error when metadata persistence fails.
    pub fn follow_primary(&self, host: &str, port: u16) -> MarlinResult<()> {
        for store_id in 0..self.config.store_count.get() {
            self.repl.set_primary(store_id, host, port, store_id)?;
        }
        info!(host, port, "replica mode armed");
        Ok(())
    }

    /// Executes one parsed command for the given logical database.
    #[must_use]
    pub fn execute(&self, db: u32, args: Vec<Vec<u8>>) -> CommandReply {
        self.registry.dispatch(&Session::new(db, args), &self.ctx)
    }
}
