//! Blocking accept loop over a worker thread pool.
//!
//! Command handlers run on pool workers with plain blocking reads; there is no
//! cooperative scheduler. One connection is served by one worker at a time.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use marlin_common::error::MarlinResult;
use marlin_core::CommandReply;
use marlin_replication::worker::WorkerPool;
use tracing::{info, warn};

use crate::app::ServerApp;
use crate::resp::RespParser;

const READ_CHUNK_BYTES: usize = 8192;

/// RESP listener bound to the configured address.
pub struct Server {
    listener: TcpListener,
    app: Arc<ServerApp>,
}

impl Server {
    /// Binds the listener for the app's configured address.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Io` when the address cannot be bound.
    pub fn bind(app: Arc<ServerApp>) -> MarlinResult<Self> {
        let listener = TcpListener::bind(&app.config().listen_addr)?;
        info!(addr = %app.config().listen_addr, "listener bound");
        Ok(Self { listener, app })
    }

    /// Actual bound address, useful with an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Io` when the socket has no local address.
    pub fn local_addr(&self) -> MarlinResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves connections until the process exits.
    pub fn run(self) {
        let pool = WorkerPool::new(self.app.config().worker_threads);
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let app = Arc::clone(&self.app);
                    pool.execute(move || handle_connection(stream, &app));
                }
                Err(accept_error) => {
                    warn!(error = %accept_error, "accept failed");
                }
            }
        }
    }
}

/// Serves one connection: read, parse, dispatch, reply, until EOF or a protocol
/// error.
fn handle_connection(mut stream: TcpStream, app: &Arc<ServerApp>) {
    let mut parser = RespParser::new();
    let mut chunk = [0_u8; READ_CHUNK_BYTES];
    loop {
        let read = match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(read) => read,
            Err(read_error) => {
                warn!(error = %read_error, "connection read failed");
                return;
            }
        };
        parser.feed(&chunk[..read]);

        loop {
            match parser.next_command() {
                Ok(Some(args)) => {
                    let reply = app.execute(0, args);
                    if stream.write_all(&reply.to_resp_bytes()).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(protocol_error) => {
                    let reply = CommandReply::from_error(&protocol_error);
                    let _ = stream.write_all(&reply.to_resp_bytes());
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Server;
    use crate::app::ServerApp;
    use googletest::prelude::*;
    use marlin_common::config::RuntimeConfig;
    use marlin_common::ids::StoreCount;
    use rstest::rstest;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn resp_command(parts: &[&[u8]]) -> Vec<u8> {
        let mut payload = format!("*{}\r\n", parts.len()).into_bytes();
        for part in parts {
            payload.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
            payload.extend_from_slice(part);
            payload.extend_from_slice(b"\r\n");
        }
        payload
    }

    fn read_reply(stream: &mut TcpStream, expected_len: usize) -> Vec<u8> {
        let mut reply = vec![0_u8; expected_len];
        stream.read_exact(&mut reply).expect("reply must arrive");
        reply
    }

    #[rstest]
    fn server_round_trips_commands_over_tcp() {
        let dir = tempfile::tempdir().expect("tempdir must be available");
        let config = RuntimeConfig {
            listen_addr: "127.0.0.1:0".to_owned(),
            store_count: StoreCount::new(2).expect("literal is valid"),
            meta_dir: dir.path().join("meta"),
            data_dir: dir.path().join("data"),
            ..RuntimeConfig::default()
        };
        let app = ServerApp::bootstrap(config).expect("bootstrap must succeed");
        let server = Server::bind(app).expect("bind must succeed");
        let address = server.local_addr().expect("address must resolve");
        let _serve = std::thread::spawn(move || server.run());

        let mut client = TcpStream::connect(address).expect("connect must succeed");
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout must apply");

        client
            .write_all(&resp_command(&[b"SET", b"greeting", b"hello"]))
            .expect("command must send");
        assert_that!(read_reply(&mut client, 5), eq(&b"+OK\r\n".to_vec()));

        client
            .write_all(&resp_command(&[b"GET", b"greeting"]))
            .expect("command must send");
        assert_that!(read_reply(&mut client, 11), eq(&b"$5\r\nhello\r\n".to_vec()));

        client
            .write_all(&resp_command(&[b"INCR", b"counter"]))
            .expect("command must send");
        assert_that!(read_reply(&mut client, 4), eq(&b":1\r\n".to_vec()));

        client
            .write_all(&resp_command(&[b"GET", b"missing"]))
            .expect("command must send");
        assert_that!(read_reply(&mut client, 5), eq(&b"$-1\r\n".to_vec()));
    }
}
