//! Bounds-checked buffer access for protocol parsing
//!
//! All integers on the wire are big-endian. The reader tracks its own
//! position so parsers never do offset bookkeeping by hand.

use crate::errors::{OutboxError, OutboxResult};

/// A buffer reader that manages position and provides meaningful parsing methods
#[derive(Debug)]
pub struct BufferReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    /// Create a new buffer reader from a byte slice
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Get current position in the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get remaining bytes in the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Check if we have at least `count` bytes remaining
    pub fn has_bytes(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    /// Read a single byte at current position
    pub fn read_u8(&mut self) -> OutboxResult<u8> {
        if !self.has_bytes(1) {
            return Err(OutboxError::protocol("not enough bytes for u8"));
        }
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    /// Read a signed byte at current position
    pub fn read_i8(&mut self) -> OutboxResult<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// Read a byte as an ASCII tag character
    pub fn read_char(&mut self) -> OutboxResult<char> {
        Ok(self.read_u8()? as char)
    }

    /// Read a 16-bit signed integer at current position
    pub fn read_i16(&mut self) -> OutboxResult<i16> {
        let bytes = self.take(2, "i16")?;
        Ok(i16::from_be_bytes(bytes.try_into().unwrap()))
    }

    /// Read a 32-bit unsigned integer at current position
    pub fn read_u32(&mut self) -> OutboxResult<u32> {
        let bytes = self.take(4, "u32")?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    /// Read a 32-bit signed integer at current position
    pub fn read_i32(&mut self) -> OutboxResult<i32> {
        let bytes = self.take(4, "i32")?;
        Ok(i32::from_be_bytes(bytes.try_into().unwrap()))
    }

    /// Read a 64-bit unsigned integer at current position
    pub fn read_u64(&mut self) -> OutboxResult<u64> {
        let bytes = self.take(8, "u64")?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    /// Read a 64-bit signed integer at current position
    pub fn read_i64(&mut self) -> OutboxResult<i64> {
        let bytes = self.take(8, "i64")?;
        Ok(i64::from_be_bytes(bytes.try_into().unwrap()))
    }

    /// Read a null-terminated string at current position
    pub fn read_cstr(&mut self) -> OutboxResult<String> {
        let start = self.position;
        while self.position < self.buffer.len() && self.buffer[self.position] != 0 {
            self.position += 1;
        }
        if self.position >= self.buffer.len() {
            return Err(OutboxError::protocol("string not null-terminated"));
        }
        let value = String::from_utf8_lossy(&self.buffer[start..self.position]).into_owned();
        self.position += 1; // Skip the null terminator
        Ok(value)
    }

    /// Read `count` bytes at current position
    pub fn read_bytes(&mut self, count: usize) -> OutboxResult<Vec<u8>> {
        Ok(self.take(count, "bytes")?.to_vec())
    }

    /// Skip `count` bytes without copying them
    pub fn skip(&mut self, count: usize) -> OutboxResult<()> {
        self.take(count, "skip")?;
        Ok(())
    }

    /// Peek at the next byte without advancing position
    pub fn peek_u8(&self) -> OutboxResult<u8> {
        if !self.has_bytes(1) {
            return Err(OutboxError::protocol("no bytes to peek"));
        }
        Ok(self.buffer[self.position])
    }

    fn take(&mut self, count: usize, what: &str) -> OutboxResult<&'a [u8]> {
        if !self.has_bytes(count) {
            return Err(OutboxError::protocol(format!(
                "not enough bytes for {what}"
            )));
        }
        let slice = &self.buffer[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }
}

/// A buffer writer that manages position over a fixed-size reply buffer
#[derive(Debug)]
pub struct BufferWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> BufferWriter<'a> {
    /// Create a new buffer writer from a mutable byte slice
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Check if we have at least `count` bytes of space remaining
    pub fn has_space(&self, count: usize) -> bool {
        self.buffer.len().saturating_sub(self.position) >= count
    }

    /// Write a single byte at current position
    pub fn write_u8(&mut self, value: u8) -> OutboxResult<()> {
        if !self.has_space(1) {
            return Err(OutboxError::protocol("not enough space for u8"));
        }
        self.buffer[self.position] = value;
        self.position += 1;
        Ok(())
    }

    /// Write a 64-bit unsigned integer at current position
    pub fn write_u64(&mut self, value: u64) -> OutboxResult<()> {
        self.write_all(&value.to_be_bytes())
    }

    /// Write a 64-bit signed integer at current position
    pub fn write_i64(&mut self, value: i64) -> OutboxResult<()> {
        self.write_all(&value.to_be_bytes())
    }

    /// Get the total bytes written so far
    pub fn bytes_written(&self) -> usize {
        self.position
    }

    fn write_all(&mut self, bytes: &[u8]) -> OutboxResult<()> {
        if !self.has_space(bytes.len()) {
            return Err(OutboxError::protocol("not enough space in reply buffer"));
        }
        self.buffer[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_integers_big_endian() {
        let data = [0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0xFF];
        let mut reader = BufferReader::new(&data);
        assert_eq!(reader.read_i16().unwrap(), 1);
        assert_eq!(reader.read_u32().unwrap(), 2);
        assert_eq!(reader.read_u8().unwrap(), 0xFF);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn cstr_stops_at_null_terminator() {
        let data = b"public\0outbox\0";
        let mut reader = BufferReader::new(data);
        assert_eq!(reader.read_cstr().unwrap(), "public");
        assert_eq!(reader.read_cstr().unwrap(), "outbox");
    }

    #[test]
    fn missing_terminator_is_an_error() {
        let mut reader = BufferReader::new(b"oops");
        assert!(reader.read_cstr().is_err());
    }

    #[test]
    fn short_reads_are_errors_not_panics() {
        let mut reader = BufferReader::new(&[0x01]);
        assert!(reader.read_u64().is_err());
    }

    #[test]
    fn writer_tracks_position() {
        let mut buf = [0u8; 9];
        let mut writer = BufferWriter::new(&mut buf);
        writer.write_u8(b'r').unwrap();
        writer.write_u64(0x0102030405060708).unwrap();
        assert_eq!(writer.bytes_written(), 9);
        assert_eq!(buf[0], b'r');
        assert_eq!(buf[8], 0x08);
    }

    #[test]
    fn writer_rejects_overflow() {
        let mut buf = [0u8; 4];
        let mut writer = BufferWriter::new(&mut buf);
        assert!(writer.write_u64(1).is_err());
    }
}
