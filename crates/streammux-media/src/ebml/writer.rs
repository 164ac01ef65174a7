//! Element writers used by the Matroska muxer.

use super::vint::{put_element_id, put_vint, UNKNOWN_SIZE};
use crate::error::Result;
use bytes::{BufMut, BytesMut};
use streammux_common::bytes::number_to_bytes;

/// Write an element with a known-size payload.
pub fn put_element(buf: &mut BytesMut, id: u32, payload: &[u8]) -> Result<()> {
    put_element_id(buf, id);
    put_vint(buf, payload.len() as u64)?;
    buf.put_slice(payload);
    Ok(())
}

/// Unsigned integer element in the fewest bytes that hold the value.
pub fn put_uint(buf: &mut BytesMut, id: u32, value: u64) -> Result<()> {
    put_element(buf, id, &number_to_bytes(value))
}

/// 8-byte IEEE float element.
pub fn put_float(buf: &mut BytesMut, id: u32, value: f64) -> Result<()> {
    put_element(buf, id, &value.to_be_bytes())
}

pub fn put_string(buf: &mut BytesMut, id: u32, value: &str) -> Result<()> {
    put_element(buf, id, value.as_bytes())
}

/// Master element whose children are written by `body`.
pub fn put_master<F>(buf: &mut BytesMut, id: u32, body: F) -> Result<()>
where
    F: FnOnce(&mut BytesMut) -> Result<()>,
{
    let mut content = BytesMut::new();
    body(&mut content)?;
    put_element(buf, id, &content)
}

/// Header of a master element whose size is left unknown (live Segment).
pub fn put_unknown_size_header(buf: &mut BytesMut, id: u32) {
    put_element_id(buf, id);
    buf.put_slice(&UNKNOWN_SIZE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebml::find::read_element_header;

    #[test]
    fn test_uint_is_minimal() {
        let mut buf = BytesMut::new();
        put_uint(&mut buf, 0xD7, 1).unwrap();
        assert_eq!(&buf[..], &[0xD7, 0x81, 0x01]);
        buf.clear();
        put_uint(&mut buf, 0x2AD7B1, 1_000_000).unwrap();
        assert_eq!(&buf[..], &[0x2A, 0xD7, 0xB1, 0x83, 0x0F, 0x42, 0x40]);
    }

    #[test]
    fn test_master_wraps_children() {
        let mut buf = BytesMut::new();
        put_master(&mut buf, 0xAE, |b| {
            put_uint(b, 0xD7, 2)?;
            put_string(b, 0x86, "A_OPUS")
        })
        .unwrap();
        let header = read_element_header(&buf).unwrap().unwrap();
        assert_eq!(header.id, 0xAE);
        assert_eq!(header.size, Some(3 + 8));
    }

    #[test]
    fn test_unknown_size_header() {
        let mut buf = BytesMut::new();
        put_unknown_size_header(&mut buf, 0x18538067);
        let header = read_element_header(&buf).unwrap().unwrap();
        assert_eq!(header.size, None);
        assert_eq!(header.header_len, 12);
    }

    #[test]
    fn test_float() {
        let mut buf = BytesMut::new();
        put_float(&mut buf, 0x4489, 1500.0).unwrap();
        assert_eq!(buf.len(), 2 + 1 + 8);
    }
}
