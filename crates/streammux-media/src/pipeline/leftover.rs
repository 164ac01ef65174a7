//! Unconsumed-byte bookkeeping shared by demuxers.

use bytes::Bytes;
use streammux_common::bytes::concat;

/// Tracks the bytes a demuxer could not fully parse yet.
///
/// A push follows the same pattern in every demuxer:
///
/// 1. [`Leftover::merge`] the new chunk with what was kept last time,
/// 2. parse, calling [`Leftover::save_last_byte`] with the end of every unit
///    that was fully understood,
/// 3. [`Leftover::save_leftover`] to keep everything after the furthest
///    consumed byte for the next push.
///
/// A consumed offset past the end of the buffer (a skipped box whose payload
/// has not arrived yet) is remembered and dropped from the next chunks.
#[derive(Debug, Default, Clone)]
pub struct Leftover {
    pending: Bytes,
    last_byte: usize,
    skip: u64,
    base_offset: u64,
}

impl Leftover {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concatenate the kept tail with a new chunk.
    pub fn merge(&mut self, chunk: Bytes) -> Bytes {
        let mut chunk = chunk;
        if self.skip > 0 {
            let n = (self.skip.min(chunk.len() as u64)) as usize;
            self.skip -= n as u64;
            chunk = chunk.slice(n..);
        }
        self.last_byte = 0;
        let pending = std::mem::take(&mut self.pending);
        concat(&pending, &chunk)
    }

    /// Record that everything up to `end` (exclusive) of the merged buffer
    /// has been consumed.
    pub fn save_last_byte(&mut self, end: usize) {
        self.last_byte = self.last_byte.max(end);
    }

    /// Furthest consumed offset recorded since the last merge.
    pub fn last_byte(&self) -> usize {
        self.last_byte
    }

    /// Keep everything after the furthest consumed offset. When nothing was
    /// consumed the whole buffer is kept.
    pub fn save_leftover(&mut self, whole: &Bytes) {
        let end = self.last_byte.min(whole.len());
        self.skip += (self.last_byte - end) as u64;
        self.base_offset += self.last_byte as u64;
        self.pending = whole.slice(end..);
        self.last_byte = 0;
    }

    /// Absolute stream offset of the first byte of the merged buffer.
    pub fn absolute_offset(&self) -> u64 {
        self.base_offset
    }

    /// Take the kept tail, leaving nothing behind.
    pub fn take(&mut self) -> Bytes {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
