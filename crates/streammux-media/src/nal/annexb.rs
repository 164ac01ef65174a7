//! Annex-B start code scanning and NAL unit framing.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use streammux_common::bytes::concat;

/// Find the next `00 00 01` at or after `from`. Returns the offset of the
/// first zero; a preceding fourth zero is left to trailing-zero trimming.
pub fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 2 < data.len() {
        if data[i + 2] > 1 {
            i += 3;
        } else if data[i + 2] == 1 && data[i + 1] == 0 && data[i] == 0 {
            return Some(i);
        } else {
            i += 1;
        }
    }
    None
}

fn trim_trailing_zeros(data: &[u8], start: usize, mut end: usize) -> usize {
    while end > start && data[end - 1] == 0 {
        end -= 1;
    }
    end
}

/// Split a complete Annex-B buffer into NAL units (start codes removed,
/// trailing zero bytes trimmed). Bytes before the first start code are
/// ignored.
pub fn split_annex_b(data: &Bytes) -> Vec<Bytes> {
    let mut units = Vec::new();
    let Some(mut code) = find_start_code(data, 0) else {
        return units;
    };
    loop {
        let start = code + 3;
        let next = find_start_code(data, start);
        let end = trim_trailing_zeros(data, start, next.unwrap_or(data.len()));
        if end > start {
            units.push(data.slice(start..end));
        }
        match next {
            Some(n) => code = n,
            None => return units,
        }
    }
}

/// Incremental Annex-B splitter.
///
/// Every push returns the NAL units that are known to be complete, that is
/// followed by another start code. The last unit is held back until
/// [`AnnexBScanner::flush`], since a later push may still extend it.
#[derive(Debug, Default, Clone)]
pub struct AnnexBScanner {
    pending: Bytes,
    /// Start of the held-back unit's payload in `pending`.
    unit_start: Option<usize>,
    /// Where the next start code search resumes.
    search_from: usize,
}

impl AnnexBScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Bytes) -> Vec<Bytes> {
        let data = concat(&self.pending, &chunk);
        let mut units = Vec::new();
        let mut pos = self.search_from;

        while let Some(code) = find_start_code(&data, pos) {
            if let Some(start) = self.unit_start {
                let end = trim_trailing_zeros(&data, start, code);
                if end > start {
                    units.push(data.slice(start..end));
                }
            }
            self.unit_start = Some(code + 3);
            pos = code + 3;
        }

        // Keep only the held-back unit; drop anything before the first start
        // code except the bytes a split start code may begin with.
        let keep_from = match self.unit_start {
            Some(start) => start,
            None => data.len().saturating_sub(2),
        };
        self.pending = data.slice(keep_from..);
        self.unit_start = self.unit_start.map(|s| s - keep_from);
        self.search_from = data.len().saturating_sub(2).max(pos).saturating_sub(keep_from);
        units
    }

    /// Return the held-back unit.
    pub fn flush(&mut self) -> Vec<Bytes> {
        let data = std::mem::take(&mut self.pending);
        let out = match self.unit_start.take() {
            Some(start) => {
                let end = trim_trailing_zeros(&data, start, data.len());
                if end > start {
                    vec![data.slice(start..end)]
                } else {
                    vec![]
                }
            }
            None => vec![],
        };
        self.search_from = 0;
        out
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Remove emulation prevention bytes: the `03` of every `00 00 03`.
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

/// Join NAL units into one 4-byte length-prefixed buffer.
pub fn to_length_prefixed(units: &[Bytes]) -> Bytes {
    let total: usize = units.iter().map(|u| u.len() + 4).sum();
    let mut buf = BytesMut::with_capacity(total);
    for unit in units {
        buf.put_u32(unit.len() as u32);
        buf.put_slice(unit);
    }
    buf.freeze()
}

/// Split a length-prefixed buffer (`length_size` of 1, 2 or 4).
pub fn split_length_prefixed(data: &Bytes, length_size: usize) -> Result<Vec<Bytes>> {
    if !matches!(length_size, 1 | 2 | 4) {
        return Err(Error::invalid(format!("NAL length size {length_size}")));
    }
    let mut units = Vec::new();
    let mut pos = 0;
    while pos + length_size <= data.len() {
        let len = data[pos..pos + length_size]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        pos += length_size;
        if pos + len > data.len() {
            return Err(Error::invalid("NAL length exceeds sample"));
        }
        units.push(data.slice(pos..pos + len));
        pos += len;
    }
    Ok(units)
}
