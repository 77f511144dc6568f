//! Pull-based reader over a file channel.
//!
//! Serializers consume persisted bytes through a [`BufferHandler`]: a
//! fixed-size intermediate buffer that refills from the underlying file on
//! demand, so record decoding never has to care about read boundaries.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::Read;

/// Default size of the intermediate buffer (4KB).
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// A pull reader feeding a fixed buffer from a file.
///
/// `read(n)` returns the next `n` bytes of the stream. A request that
/// starts exactly at end-of-stream raises [`Error::EndOfInput`]; a request
/// that can only be partially satisfied raises [`Error::Corruption`].
pub struct BufferHandler {
    file: File,
    buffer: Vec<u8>,
    /// Read position within the valid region of the buffer.
    pos: usize,
    /// Number of valid bytes in the buffer.
    len: usize,
}

impl BufferHandler {
    /// Creates a handler with the default buffer size.
    pub fn new(file: File) -> Self {
        Self::with_capacity(file, DEFAULT_BUFFER_SIZE)
    }

    /// Creates a handler with an explicit buffer size.
    pub fn with_capacity(file: File, capacity: usize) -> Self {
        BufferHandler {
            file,
            buffer: vec![0u8; capacity.max(1)],
            pos: 0,
            len: 0,
        }
    }

    /// Returns the next `n` bytes of the stream.
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if self.pos == self.len {
                self.refill()?;
                if self.len == 0 {
                    if out.is_empty() {
                        return Err(Error::EndOfInput);
                    }
                    return Err(Error::Corruption(format!(
                        "short read: wanted {} bytes, got {}",
                        n,
                        out.len()
                    )));
                }
            }
            let take = (n - out.len()).min(self.len - self.pos);
            out.extend_from_slice(&self.buffer[self.pos..self.pos + take]);
            self.pos += take;
        }
        Ok(out)
    }

    /// Returns the next single byte of the stream.
    pub fn read_byte(&mut self) -> Result<u8> {
        if self.pos == self.len {
            self.refill()?;
            if self.len == 0 {
                return Err(Error::EndOfInput);
            }
        }
        let byte = self.buffer[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    /// Refills the buffer from the file. Leaves `len == 0` at end-of-stream.
    fn refill(&mut self) -> Result<()> {
        self.pos = 0;
        self.len = 0;
        loop {
            match self.file.read(&mut self.buffer) {
                Ok(n) => {
                    self.len = n;
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    fn file_with(content: &[u8]) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(content).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file
    }

    #[test]
    fn test_read_across_refills() {
        let data: Vec<u8> = (0..=255).collect();
        let mut handler = BufferHandler::with_capacity(file_with(&data), 7);

        let first = handler.read(10).unwrap();
        assert_eq!(first, (0..10).collect::<Vec<u8>>());

        let rest = handler.read(246).unwrap();
        assert_eq!(rest, (10..=255).collect::<Vec<u8>>());
    }

    #[test]
    fn test_end_of_input_at_boundary() {
        let mut handler = BufferHandler::new(file_with(&[1, 2, 3]));
        assert_eq!(handler.read(3).unwrap(), vec![1, 2, 3]);
        assert!(matches!(handler.read(1), Err(Error::EndOfInput)));
        assert!(matches!(handler.read_byte(), Err(Error::EndOfInput)));
    }

    #[test]
    fn test_short_read_is_corruption() {
        let mut handler = BufferHandler::new(file_with(&[1, 2, 3]));
        assert!(matches!(handler.read(4), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_read_byte_sequence() {
        let mut handler = BufferHandler::with_capacity(file_with(&[9, 8, 7]), 2);
        assert_eq!(handler.read_byte().unwrap(), 9);
        assert_eq!(handler.read_byte().unwrap(), 8);
        assert_eq!(handler.read_byte().unwrap(), 7);
    }
}
