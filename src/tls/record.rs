//! Record completeness check ahead of every decode attempt
//!
//! A read from a socket can end anywhere inside a TLS record. Before a
//! buffer reaches an engine it is checked for one complete record; partial
//! records are queued and merged with the next read.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use super::predicate::{TLS_CONTENT_TYPES, TLS_RECORD_HEADER_LEN};
use crate::packet::bytes::read_u16;

/// Outcome of [`verify_packet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyResult {
    /// The record is not complete yet
    NotEnough,
    /// The bytes do not look like TLS or SSLv2 framing
    NotEncrypted,
    /// At least one full record is buffered
    Ready,
}

/// Decide whether `buf` holds a complete TLS record
///
/// TLS framing (content type 20..=24, major version 3) takes its length from
/// bytes 3..5. Anything else is tried as SSLv2 framing, whose header is 2
/// bytes when the top bit of the first byte is set and 3 bytes otherwise.
#[must_use]
pub fn verify_packet(buf: &[u8]) -> VerifyResult {
    if buf.len() < TLS_RECORD_HEADER_LEN {
        return VerifyResult::NotEnough;
    }

    let mut packet_len = 0;
    let mut tls = TLS_CONTENT_TYPES.contains(&buf[0]);
    if tls {
        if buf[1] == 3 {
            packet_len = usize::from(read_u16(buf, 3)) + TLS_RECORD_HEADER_LEN;
            if packet_len <= TLS_RECORD_HEADER_LEN {
                tls = false;
            }
        } else {
            tls = false;
        }
    }

    if !tls {
        let header_len = if buf[0] & 0x80 != 0 { 2 } else { 3 };
        let major = buf[header_len + 1];
        if major != 2 && major != 3 {
            return VerifyResult::NotEncrypted;
        }
        let raw = usize::from(read_u16(buf, 0));
        packet_len = if header_len == 2 {
            (raw & 0x7FFF) + 2
        } else {
            (raw & 0x3FFF) + 3
        };
        if packet_len <= header_len {
            return VerifyResult::NotEnough;
        }
    }

    if packet_len > buf.len() {
        VerifyResult::NotEnough
    } else {
        VerifyResult::Ready
    }
}

/// FIFO of not-yet-decodable chunks for one session direction
#[derive(Debug, Default)]
pub struct PendingQueue {
    chunks: VecDeque<Bytes>,
}

impl PendingQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
    }

    /// Merge every queued chunk into one buffer, leaving the queue empty
    pub fn take_merged(&mut self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks.pop_front().unwrap_or_default(),
            _ => {
                let total = self.chunks.iter().map(Bytes::len).sum();
                let mut merged = BytesMut::with_capacity(total);
                for chunk in self.chunks.drain(..) {
                    merged.extend_from_slice(&chunk);
                }
                merged.freeze()
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }
}
