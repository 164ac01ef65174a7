//! EBML variable-length integers.
//!
//! The number of leading zero bits of the first byte gives the length
//! (`1xxxxxxx` is one byte, `01xxxxxx xxxxxxxx` two, up to eight). Sizes
//! whose value bits are all ones mean "unknown size".

use crate::error::{Error, Result};
use bytes::BufMut;

/// Longest vint EBML allows.
pub const MAX_VINT_LENGTH: usize = 8;

/// Largest value an 8-byte vint can carry.
pub const MAX_VINT_VALUE: u64 = (1 << 56) - 1;

/// Eight-byte unknown-size marker.
pub const UNKNOWN_SIZE: [u8; 8] = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

/// A decoded vint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vint {
    /// Value with the length marker removed.
    pub value: u64,
    /// Encoded length in bytes.
    pub length: usize,
}

impl Vint {
    /// All value bits set: the unknown-size marker for this length.
    pub fn is_unknown(&self) -> bool {
        self.value == all_ones(self.length)
    }
}

fn all_ones(length: usize) -> u64 {
    (1u64 << (7 * length)) - 1
}

/// Length of the vint starting with `first`, `None` for a zero byte.
pub fn vint_length(first: u8) -> Option<usize> {
    if first == 0 {
        None
    } else {
        Some(first.leading_zeros() as usize + 1)
    }
}

/// Read a vint from the start of `data`.
///
/// `Ok(None)` means the vint is cut off by the end of the buffer.
pub fn read_vint(data: &[u8]) -> Result<Option<Vint>> {
    let Some(&first) = data.first() else {
        return Ok(None);
    };
    let length = vint_length(first).ok_or_else(|| Error::invalid("vint with zero first byte"))?;
    if data.len() < length {
        return Ok(None);
    }
    let mut value = first as u64 & (0xFFu64 >> length);
    for b in &data[1..length] {
        value = (value << 8) | *b as u64;
    }
    Ok(Some(Vint { value, length }))
}

/// Read a signed vint as used by EBML lacing deltas.
pub fn read_signed_vint(data: &[u8]) -> Result<Option<(i64, usize)>> {
    Ok(read_vint(data)?.map(|v| {
        let bias = (1i64 << (7 * v.length - 1)) - 1;
        (v.value as i64 - bias, v.length)
    }))
}

/// Read an element id. Ids keep their length marker bits and are at most
/// four bytes long.
pub fn read_element_id(data: &[u8]) -> Result<Option<(u32, usize)>> {
    let Some(&first) = data.first() else {
        return Ok(None);
    };
    let length = vint_length(first).ok_or_else(|| Error::invalid("element id with zero first byte"))?;
    if length > 4 {
        return Err(Error::invalid(format!("element id of {length} bytes")));
    }
    if data.len() < length {
        return Ok(None);
    }
    let id = data[..length]
        .iter()
        .fold(0u32, |acc, b| (acc << 8) | *b as u32);
    Ok(Some((id, length)))
}

/// Minimal encoded length for `value`.
///
/// A length whose all-ones pattern equals the value is skipped, since that
/// pattern reads back as "unknown size": 127 needs two bytes.
pub fn encoded_length(value: u64) -> usize {
    (1..MAX_VINT_LENGTH)
        .find(|&len| value < all_ones(len))
        .unwrap_or(MAX_VINT_LENGTH)
}

/// Encode `value` with a fixed `length`.
pub fn encode_vint_with_length(value: u64, length: usize) -> Result<Vec<u8>> {
    if !(1..=MAX_VINT_LENGTH).contains(&length) || value > all_ones(length) {
        return Err(Error::invalid(format!(
            "value {value} does not fit a {length}-byte vint"
        )));
    }
    let mut out = value.to_be_bytes()[8 - length..].to_vec();
    out[0] |= 0x80 >> (length - 1);
    Ok(out)
}

/// Encode `value` with its minimal length.
pub fn encode_vint(value: u64) -> Result<Vec<u8>> {
    if value > MAX_VINT_VALUE {
        return Err(Error::invalid(format!("value {value} exceeds 56 bits")));
    }
    encode_vint_with_length(value, encoded_length(value))
}

/// Append a minimal vint to `buf`.
pub fn put_vint(buf: &mut impl BufMut, value: u64) -> Result<()> {
    buf.put_slice(&encode_vint(value)?);
    Ok(())
}

/// Append an element id (marker bits included) to `buf`.
pub fn put_element_id(buf: &mut impl BufMut, id: u32) {
    let bytes = id.to_be_bytes();
    let skip = (id.leading_zeros() / 8).min(3) as usize;
    buf.put_slice(&bytes[skip..]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_read_one_byte_vint() {
        let v = read_vint(&[0x81]).unwrap().unwrap();
        assert_eq!(v, Vint { value: 1, length: 1 });
    }

    #[test]
    fn test_read_two_byte_vint() {
        let v = read_vint(&[0x40, 0x02]).unwrap().unwrap();
        assert_eq!(v.value, 2);
        assert_eq!(v.length, 2);
    }

    #[test]
    fn test_read_truncated_vint() {
        assert_eq!(read_vint(&[0x40]).unwrap(), None);
        assert_eq!(read_vint(&[]).unwrap(), None);
    }

    #[test]
    fn test_zero_first_byte_is_invalid() {
        assert!(read_vint(&[0x00, 0x01]).is_err());
    }

    #[test]
    fn test_unknown_size() {
        assert!(read_vint(&[0xFF]).unwrap().unwrap().is_unknown());
        assert!(read_vint(&UNKNOWN_SIZE).unwrap().unwrap().is_unknown());
        assert!(!read_vint(&[0x40, 0x7F]).unwrap().unwrap().is_unknown());
    }

    #[test]
    fn test_eight_byte_vint_drops_marker() {
        let v = read_vint(&UNKNOWN_SIZE).unwrap().unwrap();
        assert_eq!(v.length, 8);
        assert_eq!(v.value, MAX_VINT_VALUE);

        let v = read_vint(&[0x01, 0, 0, 0, 0, 0, 0x01, 0x00]).unwrap().unwrap();
        assert_eq!(v, Vint { value: 256, length: 8 });
        assert_eq!(encode_vint(MAX_VINT_VALUE - 1).unwrap().len(), 8);
    }

    #[test]
    fn test_127_uses_two_bytes() {
        assert_eq!(encode_vint(126).unwrap(), vec![0xFE]);
        assert_eq!(encode_vint(127).unwrap(), vec![0x40, 0x7F]);
    }

    #[test]
    fn test_element_id_keeps_marker() {
        assert_eq!(
            read_element_id(&[0x1A, 0x45, 0xDF, 0xA3]).unwrap(),
            Some((0x1A45DFA3, 4))
        );
        assert_eq!(read_element_id(&[0xA3]).unwrap(), Some((0xA3, 1)));
        assert!(read_element_id(&[0x08, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_put_element_id() {
        let mut buf = Vec::new();
        put_element_id(&mut buf, 0x1F43B675);
        put_element_id(&mut buf, 0xE7);
        assert_eq!(buf, vec![0x1F, 0x43, 0xB6, 0x75, 0xE7]);
    }

    #[test]
    fn test_signed_vint() {
        // 0x80 | 62 is a one-byte signed value of -1
        assert_eq!(read_signed_vint(&[0xBE]).unwrap(), Some((-1, 1)));
        assert_eq!(read_signed_vint(&[0xBF]).unwrap(), Some((0, 1)));
        assert_eq!(read_signed_vint(&[0xC0]).unwrap(), Some((1, 1)));
    }

    proptest! {
        #[test]
        fn prop_vint_round_trip(n in 0u64..(1u64 << 56)) {
            let encoded = encode_vint(n).unwrap();
            let decoded = read_vint(&encoded).unwrap().unwrap();
            prop_assert_eq!(decoded.value, n);
            prop_assert_eq!(decoded.length, encoded.len());
        }
    }
}
