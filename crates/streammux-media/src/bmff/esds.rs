//! MPEG-4 elementary stream descriptors (`esds`).

use super::boxes::Reader;
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

const ES_DESCRIPTOR: u8 = 0x03;
const DECODER_CONFIG: u8 = 0x04;
const DECODER_SPECIFIC_INFO: u8 = 0x05;
const SL_CONFIG: u8 = 0x06;

/// MPEG-4 audio (AAC and friends).
pub const OTI_MPEG4_AUDIO: u8 = 0x40;
pub const OTI_MPEG2_AUDIO: u8 = 0x69;
pub const OTI_MPEG1_AUDIO: u8 = 0x6B;

const STREAM_TYPE_AUDIO: u8 = 0x05;

/// What the descriptor tree says about the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsDescriptor {
    pub es_id: u16,
    pub object_type_indication: u8,
    pub max_bitrate: u32,
    pub avg_bitrate: u32,
    pub decoder_specific_info: Bytes,
}

impl EsDescriptor {
    /// Short codec string for the object type.
    pub fn codec_family(&self) -> &'static str {
        match self.object_type_indication {
            OTI_MPEG1_AUDIO | OTI_MPEG2_AUDIO => "mp3",
            _ => "mp4a",
        }
    }
}

/// Descriptor length: up to four bytes of 7 bits each, high bit continues.
fn read_length(r: &mut Reader<'_>) -> Result<usize> {
    let mut len = 0usize;
    for _ in 0..4 {
        let b = r.u8()?;
        len = len << 7 | (b & 0x7F) as usize;
        if b & 0x80 == 0 {
            return Ok(len);
        }
    }
    Ok(len)
}

fn read_descriptor<'a>(r: &mut Reader<'a>) -> Result<(u8, &'a [u8])> {
    let tag = r.u8()?;
    let len = read_length(r)?;
    let len = len.min(r.remaining());
    Ok((tag, r.bytes(len)?))
}

/// Parse an `esds` payload (full box header included).
pub fn parse_esds(data: &[u8]) -> Result<EsDescriptor> {
    let mut r = Reader::new(data);
    r.skip(4)?;
    let (tag, es) = read_descriptor(&mut r)?;
    if tag != ES_DESCRIPTOR {
        return Err(Error::invalid(format!("esds starts with descriptor tag {tag:#04x}")));
    }
    let mut r = Reader::new(es);
    let es_id = r.u16()?;
    let flags = r.u8()?;
    if flags & 0x80 != 0 {
        r.skip(2)?; // depends_on_es_id
    }
    if flags & 0x40 != 0 {
        let url_len = r.u8()? as usize;
        r.skip(url_len)?;
    }
    if flags & 0x20 != 0 {
        r.skip(2)?; // ocr_es_id
    }

    while r.remaining() > 0 {
        let (tag, body) = read_descriptor(&mut r)?;
        if tag != DECODER_CONFIG {
            continue;
        }
        let mut d = Reader::new(body);
        let object_type_indication = d.u8()?;
        d.skip(1)?; // stream type, upstream, reserved
        d.skip(3)?; // buffer size
        let max_bitrate = d.u32()?;
        let avg_bitrate = d.u32()?;
        let mut decoder_specific_info = Bytes::new();
        while d.remaining() > 0 {
            let (tag, info) = read_descriptor(&mut d)?;
            if tag == DECODER_SPECIFIC_INFO {
                decoder_specific_info = Bytes::copy_from_slice(info);
                break;
            }
        }
        return Ok(EsDescriptor {
            es_id,
            object_type_indication,
            max_bitrate,
            avg_bitrate,
            decoder_specific_info,
        });
    }
    Err(Error::invalid("esds without DecoderConfigDescriptor"))
}

fn put_descriptor(buf: &mut BytesMut, tag: u8, body: &[u8]) {
    buf.put_u8(tag);
    // always the four-byte length form
    let len = body.len() as u32;
    buf.put_slice(&[
        0x80 | (len >> 21 & 0x7F) as u8,
        0x80 | (len >> 14 & 0x7F) as u8,
        0x80 | (len >> 7 & 0x7F) as u8,
        (len & 0x7F) as u8,
    ]);
    buf.put_slice(body);
}

/// Build an `esds` payload (full box header included) for an audio stream.
pub fn write_esds(es_id: u16, object_type_indication: u8, decoder_specific_info: &[u8]) -> Bytes {
    let mut config = BytesMut::new();
    config.put_u8(object_type_indication);
    config.put_u8(STREAM_TYPE_AUDIO << 2 | 1);
    config.put_slice(&[0, 0, 0]);
    config.put_u32(0);
    config.put_u32(0);
    if !decoder_specific_info.is_empty() {
        put_descriptor(&mut config, DECODER_SPECIFIC_INFO, decoder_specific_info);
    }

    let mut es = BytesMut::new();
    es.put_u16(es_id);
    es.put_u8(0);
    put_descriptor(&mut es, DECODER_CONFIG, &config);
    put_descriptor(&mut es, SL_CONFIG, &[0x02]);

    let mut out = BytesMut::new();
    out.put_u32(0);
    put_descriptor(&mut out, ES_DESCRIPTOR, &es);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_parse() {
        let esds = write_esds(1, OTI_MPEG4_AUDIO, &[0x12, 0x10]);
        let parsed = parse_esds(&esds).unwrap();
        assert_eq!(parsed.es_id, 1);
        assert_eq!(parsed.object_type_indication, 0x40);
        assert_eq!(&parsed.decoder_specific_info[..], &[0x12, 0x10]);
        assert_eq!(parsed.codec_family(), "mp4a");
    }

    #[test]
    fn test_single_byte_lengths_and_flags() {
        // ES_Descriptor with the URL flag set, short length forms throughout
        let raw = [
            0, 0, 0, 0, // version, flags
            0x03, 22, 0x00, 0x02, 0x40, 3, b'a', b'b', b'c', // es id 2, url "abc"
            0x04, 13, 0x6B, 0x15, 0, 0, 0, 0, 0, 0x10, 0, 0, 0, 0x10, 0, //
        ];
        let parsed = parse_esds(&raw).unwrap();
        assert_eq!(parsed.es_id, 2);
        assert_eq!(parsed.object_type_indication, OTI_MPEG1_AUDIO);
        assert_eq!(parsed.max_bitrate, 0x1000);
        assert!(parsed.decoder_specific_info.is_empty());
        assert_eq!(parsed.codec_family(), "mp3");
    }

    #[test]
    fn test_rejects_other_descriptors() {
        assert!(parse_esds(&[0, 0, 0, 0, 0x04, 0]).is_err());
        assert!(parse_esds(&[0, 0]).is_err());
    }
}
