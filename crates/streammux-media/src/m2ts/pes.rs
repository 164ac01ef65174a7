//! PES packet reassembly and header parsing.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};

/// PTS/DTS values wrap at 2^33.
pub const TIMESTAMP_WRAP: u64 = 1 << 33;

/// Read a 33-bit timestamp from its 5-byte marker-bit encoding.
pub fn read_timestamp(data: &[u8]) -> u64 {
    ((data[0] as u64 & 0x0E) << 29)
        | ((data[1] as u64) << 22)
        | ((data[2] as u64 & 0xFE) << 14)
        | ((data[3] as u64) << 7)
        | ((data[4] as u64) >> 1)
}

/// Signed distance from `base` to `ts`, taking wrap-around into account.
pub fn timestamp_delta(ts: u64, base: u64) -> i64 {
    let diff = ts.wrapping_sub(base) % TIMESTAMP_WRAP;
    if diff >= TIMESTAMP_WRAP / 2 {
        diff as i64 - TIMESTAMP_WRAP as i64
    } else {
        diff as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pes {
    pub stream_id: u8,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub payload: Bytes,
}

impl Pes {
    pub fn parse(data: &Bytes) -> Result<Self> {
        if data.len() < 6 {
            return Err(Error::Truncated {
                need: 6,
                have: data.len(),
            });
        }
        if data[..3] != [0, 0, 1] {
            return Err(Error::invalid("missing PES start code"));
        }
        let stream_id = data[3];
        let packet_len = u16::from_be_bytes([data[4], data[5]]) as usize;
        let end = if packet_len == 0 {
            data.len()
        } else {
            (6 + packet_len).min(data.len())
        };
        // padding, private_stream_2 and friends carry no optional header
        if matches!(stream_id, 0xBC | 0xBE | 0xBF | 0xF0 | 0xF1 | 0xF2 | 0xF8 | 0xFF) {
            return Ok(Self {
                stream_id,
                pts: None,
                dts: None,
                payload: data.slice(6..end),
            });
        }
        if data.len() < 9 {
            return Err(Error::Truncated {
                need: 9,
                have: data.len(),
            });
        }
        let flags = data[7] >> 6;
        let header_end = 9 + data[8] as usize;
        if header_end > end {
            return Err(Error::invalid("PES header longer than the packet"));
        }
        let timestamp = |at: usize| data.get(at..at + 5).map(read_timestamp);
        let (pts, dts) = match flags {
            0b10 => (timestamp(9), None),
            0b11 => (timestamp(9), timestamp(14)),
            _ => (None, None),
        };
        Ok(Self {
            stream_id,
            pts,
            dts,
            payload: data.slice(header_end..end),
        })
    }

    /// Decode timestamp, falling back to the presentation timestamp.
    pub fn decode_time(&self) -> Option<u64> {
        self.dts.or(self.pts)
    }
}

/// Collects the payloads of one PID into complete PES packets.
#[derive(Debug, Default)]
pub struct PesBuffer {
    data: BytesMut,
    started: bool,
}

impl PesBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one packet payload; returns the PES packet it completed.
    pub fn push(&mut self, payload: &[u8], unit_start: bool) -> Option<Bytes> {
        let mut done = None;
        if unit_start {
            done = self.finish();
            self.started = true;
        } else if !self.started {
            return None;
        }
        self.data.extend_from_slice(payload);
        if done.is_none() && self.data.len() >= 6 {
            let len = u16::from_be_bytes([self.data[4], self.data[5]]) as usize;
            if len > 0 && self.data.len() >= 6 + len {
                self.started = false;
                let packet = self.data.split_to(6 + len).freeze();
                self.data.clear();
                return Some(packet);
            }
        }
        done
    }

    /// Take the packet being collected, if any.
    pub fn finish(&mut self) -> Option<Bytes> {
        self.started = false;
        if self.data.is_empty() {
            return None;
        }
        Some(self.data.split().freeze())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn write_timestamp(prefix: u8, value: u64) -> [u8; 5] {
        [
            prefix | ((((value >> 30) & 0x07) as u8) << 1) | 0x01,
            (value >> 22) as u8,
            ((((value >> 15) & 0x7F) as u8) << 1) | 0x01,
            (value >> 7) as u8,
            (((value & 0x7F) as u8) << 1) | 0x01,
        ]
    }

    /// A PES packet with a PTS and, if given, a DTS. Unbounded length when
    /// `bounded` is false.
    pub(crate) fn pes(stream_id: u8, pts: u64, dts: Option<u64>, payload: &[u8], bounded: bool) -> Vec<u8> {
        let mut header = Vec::new();
        match dts {
            Some(dts) => {
                header.extend_from_slice(&write_timestamp(0x30, pts));
                header.extend_from_slice(&write_timestamp(0x10, dts));
            }
            None => header.extend_from_slice(&write_timestamp(0x20, pts)),
        }
        let flags = if dts.is_some() { 0xC0 } else { 0x80 };
        let len = if bounded { 3 + header.len() + payload.len() } else { 0 };
        let mut out = vec![0, 0, 1, stream_id, (len >> 8) as u8, len as u8, 0x80, flags, header.len() as u8];
        out.extend(header);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_timestamps() {
        let data = Bytes::from(pes(0xE0, 0x1_2345_6789, Some(0x1_2345_0000), b"video", true));
        let p = Pes::parse(&data).unwrap();
        assert_eq!(p.stream_id, 0xE0);
        assert_eq!(p.pts, Some(0x1_2345_6789));
        assert_eq!(p.dts, Some(0x1_2345_0000));
        assert_eq!(p.decode_time(), Some(0x1_2345_0000));
        assert_eq!(&p.payload[..], b"video");
    }

    #[test]
    fn test_pts_only_unbounded() {
        let data = Bytes::from(pes(0xC0, 900, None, b"audio", false));
        let p = Pes::parse(&data).unwrap();
        assert_eq!(p.pts, Some(900));
        assert_eq!(p.dts, None);
        assert_eq!(p.decode_time(), Some(900));
        assert_eq!(&p.payload[..], b"audio");
    }

    #[test]
    fn test_bad_packets() {
        assert!(Pes::parse(&Bytes::from_static(&[0, 0, 2, 0xE0, 0, 0, 0x80, 0, 0])).is_err());
        assert!(Pes::parse(&Bytes::from_static(&[0, 0, 1, 0xE0, 0, 0, 0x80, 0, 20])).is_err());
        assert!(Pes::parse(&Bytes::from_static(&[0, 0, 1])).is_err());
    }

    #[test]
    fn test_timestamp_delta_wraps() {
        assert_eq!(timestamp_delta(100, 40), 60);
        assert_eq!(timestamp_delta(40, 100), -60);
        assert_eq!(timestamp_delta(10, TIMESTAMP_WRAP - 20), 30);
    }

    #[test]
    fn test_buffer_completes_on_length_and_unit_start() {
        let bounded = pes(0xC0, 0, None, b"abc", true);
        let mut buffer = PesBuffer::new();
        assert!(buffer.push(&[1, 2, 3], false).is_none());
        assert!(buffer.push(&bounded[..8], true).is_none());
        let mut tail = bounded[8..].to_vec();
        tail.extend_from_slice(&[0xFF; 4]);
        assert_eq!(&buffer.push(&tail, false).unwrap()[..], &bounded[..]);
        assert!(buffer.is_empty());

        let unbounded = pes(0xE0, 0, None, b"xyz", false);
        assert!(buffer.push(&unbounded, true).is_none());
        assert_eq!(&buffer.push(&unbounded, true).unwrap()[..], &unbounded[..]);
        assert_eq!(&buffer.finish().unwrap()[..], &unbounded[..]);
        assert!(buffer.finish().is_none());
    }
}
