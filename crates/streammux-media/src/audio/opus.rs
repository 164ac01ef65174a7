//! Opus identification header and packet durations.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Opus always runs its clock at 48 kHz.
pub const OPUS_RATE: u32 = 48_000;

const MAGIC: &[u8; 8] = b"OpusHead";

/// Contents of an `OpusHead` packet (Matroska and Ogg codec private) or a
/// `dOps` box (MP4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpusHead {
    pub channels: u8,
    pub pre_skip: u16,
    pub input_sample_rate: u32,
    pub output_gain: i16,
    pub mapping_family: u8,
    /// Stream count, coupled count and channel mapping when the family is not 0.
    pub mapping_table: Bytes,
}

impl OpusHead {
    /// Parse the little-endian `OpusHead` form.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 19 || &data[..8] != MAGIC {
            return Err(Error::invalid("not an OpusHead packet"));
        }
        Ok(Self {
            channels: data[9],
            pre_skip: u16::from_le_bytes([data[10], data[11]]),
            input_sample_rate: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
            output_gain: i16::from_le_bytes([data[16], data[17]]),
            mapping_family: data[18],
            mapping_table: Bytes::copy_from_slice(&data[19..]),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(19 + self.mapping_table.len());
        buf.put_slice(MAGIC);
        buf.put_u8(1);
        buf.put_u8(self.channels);
        buf.put_u16_le(self.pre_skip);
        buf.put_u32_le(self.input_sample_rate);
        buf.put_i16_le(self.output_gain);
        buf.put_u8(self.mapping_family);
        buf.put_slice(&self.mapping_table);
        buf.freeze()
    }

    /// Parse a big-endian `dOps` box payload.
    pub fn from_dops(data: &[u8]) -> Result<Self> {
        if data.len() < 11 {
            return Err(Error::Truncated {
                need: 11,
                have: data.len(),
            });
        }
        Ok(Self {
            channels: data[1],
            pre_skip: u16::from_be_bytes([data[2], data[3]]),
            input_sample_rate: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            output_gain: i16::from_be_bytes([data[8], data[9]]),
            mapping_family: data[10],
            mapping_table: Bytes::copy_from_slice(&data[11..]),
        })
    }

    pub fn to_dops(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(11 + self.mapping_table.len());
        buf.put_u8(0);
        buf.put_u8(self.channels);
        buf.put_u16(self.pre_skip);
        buf.put_u32(self.input_sample_rate);
        buf.put_i16(self.output_gain);
        buf.put_u8(self.mapping_family);
        buf.put_slice(&self.mapping_table);
        buf.freeze()
    }

    /// Stereo head used when a track carries no codec private.
    pub fn stereo() -> Self {
        Self {
            channels: 2,
            pre_skip: 312,
            input_sample_rate: OPUS_RATE,
            output_gain: 0,
            mapping_family: 0,
            mapping_table: Bytes::new(),
        }
    }
}

/// Duration of an Opus packet in 48 kHz samples, from its TOC byte.
pub fn packet_samples(packet: &[u8]) -> Option<u32> {
    let toc = *packet.first()?;
    let config = toc >> 3;
    // frame size in units of 2.5 ms (120 samples)
    let units = match config {
        0..=11 => [4, 8, 16, 24][(config & 3) as usize],
        12..=15 => [4, 8][(config & 1) as usize],
        _ => [1, 2, 4, 8][(config & 3) as usize],
    };
    let frames = match toc & 3 {
        0 => 1,
        1 | 2 => 2,
        _ => (*packet.get(1)? & 0x3F) as u32,
    };
    Some(units * 120 * frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opus_head_forms() {
        let head = OpusHead {
            channels: 2,
            pre_skip: 3840,
            input_sample_rate: 44_100,
            output_gain: -256,
            mapping_family: 0,
            mapping_table: Bytes::new(),
        };
        let raw = head.to_bytes();
        assert_eq!(raw.len(), 19);
        assert_eq!(OpusHead::parse(&raw).unwrap(), head);
        assert_eq!(OpusHead::from_dops(&head.to_dops()).unwrap(), head);
        assert!(OpusHead::parse(b"OpusTags...........").is_err());
    }

    #[test]
    fn test_packet_durations() {
        // CELT 20 ms, one frame
        assert_eq!(packet_samples(&[31 << 3]), Some(960));
        // SILK 60 ms, two frames
        assert_eq!(packet_samples(&[(3 << 3) | 1]), Some(5760));
        // hybrid 10 ms, code 3 with four frames
        assert_eq!(packet_samples(&[(12 << 3) | 3, 4]), Some(1920));
        assert_eq!(packet_samples(&[]), None);
    }
}
