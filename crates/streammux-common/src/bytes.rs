//! Byte buffer helpers used by every parser.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// How [`number_from_bytes`] interprets its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NumberFormat {
    pub signed: bool,
    pub little_endian: bool,
}

impl NumberFormat {
    pub const UNSIGNED_BE: NumberFormat = NumberFormat {
        signed: false,
        little_endian: false,
    };
    pub const SIGNED_BE: NumberFormat = NumberFormat {
        signed: true,
        little_endian: false,
    };
}

/// Concatenate two buffers. Either side being empty returns the other one
/// without copying.
pub fn concat(a: &Bytes, b: &Bytes) -> Bytes {
    if a.is_empty() {
        return b.clone();
    }
    if b.is_empty() {
        return a.clone();
    }
    let mut out = BytesMut::with_capacity(a.len() + b.len());
    out.put_slice(a);
    out.put_slice(b);
    out.freeze()
}

/// Whether `pattern` occurs in `buf` at `offset`, comparing only the bits
/// set in `mask` when one is given.
pub fn match_bytes(buf: &[u8], pattern: &[u8], offset: usize, mask: Option<&[u8]>) -> bool {
    let Some(window) = buf.get(offset..offset + pattern.len()) else {
        return false;
    };
    match mask {
        Some(mask) => window
            .iter()
            .zip(pattern)
            .enumerate()
            .all(|(i, (b, p))| {
                let m = mask.get(i).copied().unwrap_or(0xFF);
                b & m == p & m
            }),
        None => window == pattern,
    }
}

/// Read an integer of up to 8 bytes.
pub fn number_from_bytes(buf: &[u8], format: NumberFormat) -> Result<i64> {
    if buf.len() > 8 {
        return Err(Error::TooWide(buf.len()));
    }
    if buf.is_empty() {
        return Ok(0);
    }
    let mut value: u64 = 0;
    let mut push = |b: u8| value = (value << 8) | b as u64;
    if format.little_endian {
        buf.iter().rev().copied().for_each(&mut push);
    } else {
        buf.iter().copied().for_each(&mut push);
    }
    let bits = buf.len() as u32 * 8;
    if format.signed && bits < 64 && value & (1 << (bits - 1)) != 0 {
        value |= u64::MAX << bits;
    }
    Ok(value as i64)
}

/// Minimal big-endian encoding of `n` (at least one byte).
pub fn number_to_bytes(n: u64) -> Vec<u8> {
    let len = (8 - n.leading_zeros() as usize / 8).max(1);
    n.to_be_bytes()[8 - len..].to_vec()
}

/// Length of an ID3v2 tag at the start of `buf`, or 0.
///
/// A tag that is only partly present still reports its full length so the
/// caller knows how many bytes to wait for.
pub fn skip_id3(buf: &[u8]) -> usize {
    if buf.len() < 10 || &buf[..3] != b"ID3" {
        return 0;
    }
    let size = buf[6..10]
        .iter()
        .fold(0usize, |acc, b| (acc << 7) | (*b & 0x7F) as usize);
    let footer = if buf[5] & 0x10 != 0 { 10 } else { 0 };
    10 + size + footer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat() {
        let a = Bytes::from_static(b"ab");
        let b = Bytes::from_static(b"cd");
        assert_eq!(&concat(&a, &b)[..], b"abcd");
        assert_eq!(&concat(&Bytes::new(), &b)[..], b"cd");
    }

    #[test]
    fn test_match_bytes_with_mask() {
        let buf = [0x00, 0xFF, 0xF1, 0x50];
        assert!(match_bytes(&buf, &[0xFF, 0xF0], 1, Some(&[0xFF, 0xF6])));
        assert!(!match_bytes(&buf, &[0xFF, 0xF0], 1, None));
        assert!(!match_bytes(&buf, &[0x50, 0x00], 3, None));
    }

    #[test]
    fn test_number_from_bytes() {
        assert_eq!(number_from_bytes(&[0x01, 0x00], NumberFormat::UNSIGNED_BE), Ok(256));
        assert_eq!(number_from_bytes(&[0xFF, 0xFE], NumberFormat::SIGNED_BE), Ok(-2));
        let le = NumberFormat {
            signed: false,
            little_endian: true,
        };
        assert_eq!(number_from_bytes(&[0x01, 0x00], le), Ok(1));
        assert_eq!(number_from_bytes(&[0; 9], le), Err(Error::TooWide(9)));
    }

    #[test]
    fn test_number_to_bytes() {
        assert_eq!(number_to_bytes(0), vec![0]);
        assert_eq!(number_to_bytes(0x1234), vec![0x12, 0x34]);
        assert_eq!(number_to_bytes(0x0100_0000), vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_skip_id3() {
        let mut tag = b"ID3\x04\x00\x00\x00\x00\x01\x00".to_vec();
        tag.extend_from_slice(&[0u8; 128]);
        assert_eq!(skip_id3(&tag), 138);
        assert_eq!(skip_id3(b"\xFF\xF1\x50\x80\x00\x1F\xFC\x00\x00\x00"), 0);
    }
}
