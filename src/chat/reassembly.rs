//! Reassembly of protocol units from an arbitrarily chunked byte stream.
//!
//! The transport hands over whatever bytes it has. The reassembler buffers them
//! and yields a unit only once all of its bytes are present: first the peer's
//! raw 32-byte public key, then length-prefixed frames.

use crate::chat::error::ChannelError;
use crate::crypto::{LENGTH_PREFIX_SIZE, MIN_FRAME_BODY, PUBLIC_KEY_SIZE};

/// A complete unit taken off the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// The peer's handshake public key.
    PeerKey([u8; PUBLIC_KEY_SIZE]),
    /// A frame body: nonce followed by ciphertext, without the length prefix.
    Frame(Vec<u8>),
}

/// Receive buffer for one connection.
#[derive(Debug)]
pub struct Reassembler {
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl Reassembler {
    /// Create an empty buffer that rejects frames larger than `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    /// Append newly received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Largest frame body this buffer will accept.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Number of bytes waiting to be consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Take the next complete unit, if one is buffered.
    ///
    /// While `handshake_done` is false the next unit is the peer key. Returns
    /// `Ok(None)` when more data is needed; nothing is consumed in that case.
    /// A length prefix outside `[MIN_FRAME_BODY, max_frame_size]` is a
    /// protocol error and leaves the buffer untouched.
    pub fn next_unit(&mut self, handshake_done: bool) -> Result<Option<Unit>, ChannelError> {
        if !handshake_done {
            if self.buffer.len() < PUBLIC_KEY_SIZE {
                return Ok(None);
            }
            let mut key = [0u8; PUBLIC_KEY_SIZE];
            key.copy_from_slice(&self.buffer[..PUBLIC_KEY_SIZE]);
            self.buffer.drain(..PUBLIC_KEY_SIZE);
            return Ok(Some(Unit::PeerKey(key)));
        }

        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX_SIZE]);
        let len = u32::from_le_bytes(prefix) as usize;

        if len > self.max_frame_size {
            return Err(ChannelError::Protocol(format!(
                "Frame too large: {} bytes (max {})",
                len, self.max_frame_size
            )));
        }
        if len < MIN_FRAME_BODY {
            return Err(ChannelError::Protocol(format!(
                "Frame too short: {} bytes (min {})",
                len, MIN_FRAME_BODY
            )));
        }

        let total = LENGTH_PREFIX_SIZE + len;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let body = self.buffer[LENGTH_PREFIX_SIZE..total].to_vec();
        self.buffer.drain(..total);
        Ok(Some(Unit::Frame(body)))
    }
}
