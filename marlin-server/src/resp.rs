//! Incremental RESP request parser.
//!
//! Commands arrive as arrays of bulk strings. The parser buffers partial reads and
//! yields one complete argument vector at a time; malformed headers are protocol
//! errors that terminate the connection.

use marlin_common::error::{MarlinError, MarlinResult};

/// Streaming parser over one connection's inbound bytes.
#[derive(Debug, Default)]
pub struct RespParser {
    buffer: Vec<u8>,
}

impl RespParser {
    /// Creates an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Extracts the next complete command, `None` while the buffer holds only a
    /// partial frame.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::ParsePkt` on malformed framing; the buffer is left
    /// untouched and the connection should be dropped.
    pub fn next_command(&mut self) -> MarlinResult<Option<Vec<Vec<u8>>>> {
        loop {
            if self.buffer.is_empty() {
                return Ok(None);
            }

            let Some((mut position, header)) = take_line(&self.buffer, 0) else {
                return Ok(None);
            };
            if header.first() != Some(&b'*') {
                return Err(MarlinError::ParsePkt("expected array header".to_owned()));
            }
            let count = parse_length(&header[1..])
                .ok_or_else(|| MarlinError::ParsePkt("invalid multibulk length".to_owned()))?;

            if count == 0 {
                // empty arrays are legal keepalive noise, skip them
                let _ = self.buffer.drain(..position);
                continue;
            }

            let mut args = Vec::with_capacity(count);
            for _ in 0..count {
                let Some((payload_start, bulk_header)) = take_line(&self.buffer, position) else {
                    return Ok(None);
                };
                if bulk_header.first() != Some(&b'$') {
                    return Err(MarlinError::ParsePkt("expected bulk length".to_owned()));
                }
                let length = parse_length(&bulk_header[1..])
                    .ok_or_else(|| MarlinError::ParsePkt("invalid bulk length".to_owned()))?;

                let payload_end = payload_start + length;
                if self.buffer.len() < payload_end + 2 {
                    return Ok(None);
                }
                if &self.buffer[payload_end..payload_end + 2] != b"\r\n" {
                    return Err(MarlinError::ParsePkt(
                        "bulk payload is not CRLF terminated".to_owned(),
                    ));
                }

                args.push(self.buffer[payload_start..payload_end].to_vec());
                position = payload_end + 2;
            }

            let _ = self.buffer.drain(..position);
            return Ok(Some(args));
        }
    }
}

/// Returns the position after the CRLF and the line body starting at `start`.
fn take_line(buffer: &[u8], start: usize) -> Option<(usize, &[u8])> {
    let mut index = start;
    while index + 1 < buffer.len() {
        if buffer[index] == b'\r' && buffer[index + 1] == b'\n' {
            return Some((index + 2, &buffer[start..index]));
        }
        index += 1;
    }
    None
}

fn parse_length(digits: &[u8]) -> Option<usize> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|text| text.parse::<usize>().ok())
}
