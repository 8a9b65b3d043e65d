//! Shared little-endian byte codec used by records, snapshots, and binlog frames.

use marlin_common::error::{MarlinError, MarlinResult};

/// Stateful byte reader that tracks decoding position for robust error messages.
#[derive(Debug)]
pub struct ByteReader<'a> {
    payload: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    /// Starts a cursor at the beginning of `payload`.
    #[must_use]
    pub fn new(payload: &'a [u8]) -> Self {
        Self { payload, offset: 0 }
    }

    /// Reads one byte.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Decode` when the payload is exhausted.
    pub fn read_u8(&mut self) -> MarlinResult<u8> {
        let bytes = self.read_slice(1)?;
        Ok(bytes[0])
    }

    /// Reads one little-endian `u16`.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Decode` when the payload is exhausted.
    pub fn read_u16(&mut self) -> MarlinResult<u16> {
        let bytes = self.read_slice(2)?;
        let mut array = [0_u8; 2];
        array.copy_from_slice(bytes);
        Ok(u16::from_le_bytes(array))
    }

    /// Reads one little-endian `u32`.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Decode` when the payload is exhausted.
    pub fn read_u32(&mut self) -> MarlinResult<u32> {
        let bytes = self.read_slice(4)?;
        let mut array = [0_u8; 4];
        array.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(array))
    }

    /// Reads one little-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Decode` when the payload is exhausted.
    pub fn read_u64(&mut self) -> MarlinResult<u64> {
        let bytes = self.read_slice(8)?;
        let mut array = [0_u8; 8];
        array.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(array))
    }

    /// Reads a `u32`-length-prefixed byte field.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Decode` when the length header or body is truncated.
    pub fn read_len_prefixed(&mut self) -> MarlinResult<Vec<u8>> {
        let len = usize::try_from(self.read_u32()?)
            .map_err(|_| MarlinError::Decode("field length exceeds platform limits".to_owned()))?;
        Ok(self.read_slice(len)?.to_vec())
    }

    /// Reads exactly `len` raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Decode` when fewer than `len` bytes remain.
    pub fn read_slice(&mut self, len: usize) -> MarlinResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or_else(|| MarlinError::Decode("offset overflow while decoding".to_owned()))?;
        if end > self.payload.len() {
            return Err(MarlinError::Decode(format!(
                "unexpected end of payload at byte offset {} while reading {len} bytes",
                self.offset
            )));
        }

        let bytes = &self.payload[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    /// Number of bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.offset
    }

    /// Asserts the cursor consumed the whole payload.
    ///
    /// # Errors
    ///
    /// Returns `MarlinError::Decode` when trailing bytes remain.
    pub fn ensure_fully_consumed(&self) -> MarlinResult<()> {
        if self.offset == self.payload.len() {
            return Ok(());
        }
        Err(MarlinError::Decode(format!(
            "trailing bytes after payload body: consumed {}, total {}",
            self.offset,
            self.payload.len()
        )))
    }
}

/// Appends one byte.
pub fn write_u8(output: &mut Vec<u8>, value: u8) {
    output.push(value);
}

/// Appends one little-endian `u16`.
pub fn write_u16(output: &mut Vec<u8>, value: u16) {
    output.extend_from_slice(&value.to_le_bytes());
}

/// Appends one little-endian `u32`.
pub fn write_u32(output: &mut Vec<u8>, value: u32) {
    output.extend_from_slice(&value.to_le_bytes());
}

/// Appends one little-endian `u64`.
pub fn write_u64(output: &mut Vec<u8>, value: u64) {
    output.extend_from_slice(&value.to_le_bytes());
}

/// Appends a `u32`-length-prefixed byte field.
///
/// # Errors
///
/// Returns `MarlinError::Decode` when the field exceeds `u32::MAX` bytes.
pub fn write_len_prefixed(output: &mut Vec<u8>, payload: &[u8]) -> MarlinResult<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| MarlinError::Decode("field length exceeds u32::MAX".to_owned()))?;
    write_u32(output, len);
    output.extend_from_slice(payload);
    Ok(())
}
