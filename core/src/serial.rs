//! Serial byte-stream framing
//!
//! Each encrypted frame is wrapped as:
//! ```text
//! [ D5 CA ][ 2 bytes: payload length (u16, little-endian) ][ payload ]
//! ```
//!
//! The reconstructor accepts arbitrary byte chunks and emits complete
//! frames. A zero length resets the parser; an oversize length discards
//! bytes while resyncing to the next sync pair. Sync bytes appearing
//! inside a payload are not escaped; a false frame assembled from them is
//! only rejected once it fails decryption.

use bytes::{Buf, BufMut, BytesMut};

/// Frame sync bytes preceding every length prefix.
pub const SYNC_BYTES: [u8; 2] = [0xD5, 0xCA];

/// Sync bytes plus the length field.
pub const PREFIX_SIZE: usize = 4;

/// Wrap an encrypted frame for the wire.
pub fn encode_frame(frame: &[u8], out: &mut BytesMut) {
    out.reserve(PREFIX_SIZE + frame.len());
    out.put_slice(&SYNC_BYTES);
    out.put_u16_le(frame.len() as u16);
    out.put_slice(frame);
}

/// Streaming frame reconstructor for the serial byte stream.
#[derive(Debug)]
pub struct Reconstructor {
    buffer: BytesMut,
    max_payload: usize,
}

impl Reconstructor {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_payload + PREFIX_SIZE),
            max_payload,
        }
    }

    /// Add raw bytes from the wire.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to assemble the next frame.
    ///
    /// Call repeatedly until it returns `None` to drain all complete
    /// frames from the accumulated input.
    pub fn next_frame(&mut self) -> Option<BytesMut> {
        loop {
            self.resync();
            if self.buffer.len() < PREFIX_SIZE {
                return None;
            }

            let len = u16::from_le_bytes([self.buffer[2], self.buffer[3]]) as usize;
            if len == 0 {
                // Zero-length payloads are invalid; drop the prefix and
                // start over at the next sync pair.
                self.buffer.advance(PREFIX_SIZE);
                continue;
            }
            if len > self.max_payload {
                self.buffer.advance(PREFIX_SIZE);
                continue;
            }

            if self.buffer.len() < PREFIX_SIZE + len {
                return None;
            }

            self.buffer.advance(PREFIX_SIZE);
            return Some(self.buffer.split_to(len));
        }
    }

    /// Drop bytes until the buffer starts with a sync pair (or could,
    /// once more input arrives).
    fn resync(&mut self) {
        while !self.buffer.is_empty() {
            if self.buffer[0] != SYNC_BYTES[0] {
                self.buffer.advance(1);
                continue;
            }
            if self.buffer.len() < 2 {
                return;
            }
            if self.buffer[1] == SYNC_BYTES[1] {
                return;
            }
            self.buffer.advance(1);
        }
    }

    /// Bytes currently buffered (for diagnostics).
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
