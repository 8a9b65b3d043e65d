//! Binary entrypoint for `marlin-server`.

use std::path::PathBuf;

use clap::Parser;
use marlin_common::config::RuntimeConfig;
use marlin_common::error::{MarlinError, MarlinResult};
use marlin_common::ids::StoreCount;
use marlin_server::{Server, ServerApp};

#[derive(Debug, Parser)]
#[command(
    name = "marlin-server",
    about = "Redis-protocol key-value store with primary-replica replication"
)]
struct Flags {
    /// RESP listener address.
    #[arg(long, default_value = "127.0.0.1:6379")]
    listen: String,

    /// Number of store instances behind the segment router.
    #[arg(long, default_value_t = 4)]
    store_count: u32,

    /// Upper bound on optimistic commit attempts per command.
    #[arg(long, default_value_t = 3)]
    retry_count: u32,

    /// Directory holding persisted replication metadata.
    #[arg(long, default_value = "marlin-meta")]
    meta_dir: PathBuf,

    /// Directory holding per-store data and backup directories.
    #[arg(long, default_value = "marlin-data")]
    data_dir: PathBuf,

    /// Worker threads serving client connections.
    #[arg(long, default_value_t = 4)]
    worker_threads: usize,

    /// Follow a primary at `host:port`, store ids mapped one to one.
    #[arg(long)]
    sync_from: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(error) = run(&Flags::parse()) {
        eprintln!("failed to start marlin-server: {error}");
        std::process::exit(1);
    }
}

fn run(flags: &Flags) -> MarlinResult<()> {
    let store_count = StoreCount::new(flags.store_count)
        .ok_or(MarlinError::InvalidState("store count must be positive"))?;
    let config = RuntimeConfig {
        listen_addr: flags.listen.clone(),
        store_count,
        retry_count: flags.retry_count,
        meta_dir: flags.meta_dir.clone(),
        data_dir: flags.data_dir.clone(),
        worker_threads: flags.worker_threads,
        ..RuntimeConfig::default()
    };

    let app = ServerApp::bootstrap(config)?;
    if let Some(primary) = &flags.sync_from {
        let (host, port) = parse_host_port(primary)?;
        app.follow_primary(host, port)?;
    }
    app.start_replication();

    let server = Server::bind(app)?;
    server.run();
    Ok(())
}

fn parse_host_port(raw: &str) -> MarlinResult<(&str, u16)> {
    let Some((host, port)) = raw.rsplit_once(':') else {
        return Err(MarlinError::ParseOpt(format!(
            "sync-from must be host:port, got {raw}"
        )));
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| MarlinError::ParseOpt(format!("invalid sync-from port in {raw}")))?;
    Ok((host, port))
}
