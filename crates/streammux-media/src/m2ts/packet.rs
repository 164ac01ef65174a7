//! 188-byte transport stream packets.

use crate::error::{Error, Result};
use bytes::Bytes;

pub const PACKET_LEN: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;

pub const PID_PAT: u16 = 0x0000;
pub const PID_NULL: u16 = 0x1FFF;

/// Header fields and payload of one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsPacket {
    pub pid: u16,
    /// payload_unit_start_indicator
    pub unit_start: bool,
    pub continuity_counter: u8,
    pub random_access: bool,
    pub payload: Bytes,
}

impl TsPacket {
    /// Parse a packet from exactly [`PACKET_LEN`] bytes.
    pub fn parse(data: &Bytes) -> Result<Self> {
        if data.len() != PACKET_LEN {
            return Err(Error::Truncated {
                need: PACKET_LEN,
                have: data.len(),
            });
        }
        if data[0] != SYNC_BYTE {
            return Err(Error::invalid("missing TS sync byte"));
        }
        if data[1] & 0x80 != 0 {
            return Err(Error::invalid("TS packet with transport error indicator"));
        }
        let control = (data[3] >> 4) & 0x03;
        let mut start = 4;
        let mut random_access = false;
        if control & 0x02 != 0 {
            let len = data[4] as usize;
            if len > 0 {
                random_access = data[5] & 0x40 != 0;
            }
            start = 5 + len;
            if start > PACKET_LEN {
                return Err(Error::invalid(format!("adaptation field of {len} bytes")));
            }
        }
        let payload = if control & 0x01 != 0 {
            data.slice(start..)
        } else {
            Bytes::new()
        };
        Ok(Self {
            pid: (((data[1] & 0x1F) as u16) << 8) | data[2] as u16,
            unit_start: data[1] & 0x40 != 0,
            continuity_counter: data[3] & 0x0F,
            random_access,
            payload,
        })
    }
}

/// Offset of the next packet boundary at or after `from`: a sync byte that
/// is followed by another one a packet later, when the buffer reaches that far.
pub fn find_sync(data: &[u8], from: usize) -> Option<usize> {
    (from..data.len()).find(|&i| {
        data[i] == SYNC_BYTE && data.get(i + PACKET_LEN).map_or(true, |b| *b == SYNC_BYTE)
    })
}
