//! Blocking TCP client with per-call timeouts.
//!
//! Every read and write carries an explicit deadline mapped onto the socket; timeouts
//! and peer shutdowns surface as `MarlinError::Network` and unwind to the caller's
//! rollback guard. Line reads go one byte at a time so the stream can later be handed
//! to the session layer without buffered leftovers.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use marlin_common::error::{MarlinError, MarlinResult};

/// Blocking, timeout-driven TCP connection to the primary.
#[derive(Debug)]
pub struct BlockingTcpClient {
    stream: TcpStream,
}

impl BlockingTcpClient {
    /// Connects to `host:port` within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Network` when resolution or the connection fails.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> MarlinResult<Self> {
        let address = (host, port)
            .to_socket_addrs()
            .map_err(network_error)?
            .next()
            .ok_or_else(|| {
                MarlinError::Network(format!("no address resolved for {host}:{port}"))
            })?;
        let stream = TcpStream::connect_timeout(&address, timeout).map_err(network_error)?;
        stream.set_nodelay(true).map_err(network_error)?;
        Ok(Self { stream })
    }

    /// Wraps an already-connected stream.
    #[must_use]
    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Writes one CRLF-terminated line.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Network` on write failure or timeout.
    pub fn write_line(&mut self, line: &str, timeout: Duration) -> MarlinResult<()> {
        let mut payload = Vec::with_capacity(line.len() + 2);
        payload.extend_from_slice(line.as_bytes());
        payload.extend_from_slice(b"\r\n");
        self.write_bytes(&payload, timeout)
    }

    /// Writes raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Network` on write failure or timeout.
    pub fn write_bytes(&mut self, payload: &[u8], timeout: Duration) -> MarlinResult<()> {
        self.stream
            .set_write_timeout(Some(timeout))
            .map_err(network_error)?;
        self.stream.write_all(payload).map_err(network_error)
    }

    /// Reads one line, stripping the trailing CRLF.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Network` on timeout, peer shutdown, or non-UTF-8 content.
    pub fn read_line(&mut self, timeout: Duration) -> MarlinResult<String> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(network_error)?;

        let mut line = Vec::new();
        let mut byte = [0_u8; 1];
        loop {
            let read = self.stream.read(&mut byte).map_err(network_error)?;
            if read == 0 {
                return Err(MarlinError::Network(
                    "connection closed while reading line".to_owned(),
                ));
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        if line.last() == Some(&b'\r') {
            let _ = line.pop();
        }
        String::from_utf8(line)
            .map_err(|_| MarlinError::Network("line is not valid UTF-8".to_owned()))
    }

    /// Reads exactly `len` raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Network` on timeout or peer shutdown.
    pub fn read_exact_bytes(&mut self, len: usize, timeout: Duration) -> MarlinResult<Vec<u8>> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(network_error)?;
        let mut payload = vec![0_u8; len];
        self.stream
            .read_exact(&mut payload)
            .map_err(network_error)?;
        Ok(payload)
    }

    /// Releases the underlying stream for session promotion.
    #[must_use]
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

fn network_error(error: std::io::Error) -> MarlinError {
    MarlinError::Network(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::BlockingTcpClient;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::io::Write;
    use std::net::TcpListener;
    use std::time::Duration;

    #[rstest]
    fn lines_and_bulk_payloads_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener must bind");
        let address = listener.local_addr().expect("address must resolve");

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept must succeed");
            stream
                .write_all(b"+HELLO\r\nbulkdata")
                .expect("write must succeed");
            let mut peer = BlockingTcpClient::from_stream(stream);
            peer.read_line(Duration::from_secs(1))
                .expect("line must arrive")
        });

        let mut client = BlockingTcpClient::connect(
            "127.0.0.1",
            address.port(),
            Duration::from_secs(1),
        )
        .expect("connect must succeed");

        let line = client
            .read_line(Duration::from_secs(1))
            .expect("line must read");
        assert_that!(line.as_str(), eq("+HELLO"));

        let bulk = client
            .read_exact_bytes(8, Duration::from_secs(1))
            .expect("bulk must read");
        assert_that!(bulk, eq(&b"bulkdata".to_vec()));

        client
            .write_line("+PONG", Duration::from_secs(1))
            .expect("write must succeed");
        let echoed = server.join().expect("server must finish");
        assert_that!(echoed.as_str(), eq("+PONG"));
    }

    #[rstest]
    fn reads_fail_on_timeout_and_peer_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener must bind");
        let address = listener.local_addr().expect("address must resolve");

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept must succeed");
            // hold the connection silently, then drop it
            std::thread::sleep(Duration::from_millis(150));
            drop(stream);
        });

        let mut client = BlockingTcpClient::connect(
            "127.0.0.1",
            address.port(),
            Duration::from_secs(1),
        )
        .expect("connect must succeed");

        let timed_out = client.read_line(Duration::from_millis(50));
        assert_that!(timed_out.is_err(), eq(true));

        server.join().expect("server must finish");
        let closed = client.read_exact_bytes(4, Duration::from_secs(1));
        assert_that!(closed.is_err(), eq(true));
    }
}
