//! DNS-over-TCP message reassembly per RFC 7766.
//!
//! Each message on the wire is a 2-byte big-endian length followed by that
//! many DNS bytes. Clients may pipeline, and the kernel may split or
//! coalesce segments arbitrarily, so the buffer accepts chunks of any size
//! and emits complete messages as they materialise.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Smallest well-formed DNS message: the fixed 12-byte header.
pub const MIN_DNS_PACKET: usize = 12;

/// Largest DNS message expressible in the 16-bit length prefix.
pub const MAX_DNS_PACKET: usize = 65_535;

/// Framing violation; the connection must be closed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FramingError {
    #[error("declared message length {0} below the DNS header size")]
    Undersized(usize),
}

/// Per-connection reassembly state.
///
/// The length prefix accumulates in `len_buf`; the body is allocated lazily
/// to exactly the declared size once the prefix is complete, and released
/// again when the message is emitted.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    len_buf: [u8; 2],
    len_off: usize,
    body: Option<BytesMut>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one inbound chunk, returning every message it completes.
    ///
    /// Loops over the chunk so a single segment carrying several pipelined
    /// messages yields all of them in order.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<Vec<Bytes>, FramingError> {
        let mut complete = Vec::new();

        while !chunk.is_empty() {
            if self.len_off < 2 {
                let take = std::cmp::min(2 - self.len_off, chunk.len());
                self.len_buf[self.len_off..self.len_off + take]
                    .copy_from_slice(&chunk[..take]);
                self.len_off += take;
                chunk = &chunk[take..];

                if self.len_off < 2 {
                    break;
                }

                let qlen = u16::from_be_bytes(self.len_buf) as usize;
                if qlen < MIN_DNS_PACKET {
                    return Err(FramingError::Undersized(qlen));
                }
                self.body = Some(BytesMut::with_capacity(qlen));
            }

            let body = self.body.as_mut().unwrap_or_else(|| unreachable!());
            let qlen = u16::from_be_bytes(self.len_buf) as usize;
            let take = std::cmp::min(qlen - body.len(), chunk.len());
            body.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];

            if body.len() == qlen {
                complete.push(self.reset());
            }
        }

        Ok(complete)
    }

    /// Emits the completed body and re-arms the prefix.
    fn reset(&mut self) -> Bytes {
        self.len_off = 0;
        self.body
            .take()
            .map(BytesMut::freeze)
            .unwrap_or_else(Bytes::new)
    }

    /// True when no partial message is pending.
    pub fn is_empty(&self) -> bool {
        self.len_off == 0 && self.body.is_none()
    }
}
