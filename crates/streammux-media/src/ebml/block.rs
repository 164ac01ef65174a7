//! SimpleBlock / Block payload decoding and encoding.

use super::vint::{put_vint, read_signed_vint, read_vint};
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

const FLAG_KEYFRAME: u8 = 0x80;
const FLAG_INVISIBLE: u8 = 0x08;
const FLAG_LACING: u8 = 0x06;
const FLAG_DISCARDABLE: u8 = 0x01;

/// Lacing mode from block flags bits 2-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lacing {
    None,
    Xiph,
    Fixed,
    Ebml,
}

impl Lacing {
    fn from_flags(flags: u8) -> Self {
        match (flags & FLAG_LACING) >> 1 {
            0 => Self::None,
            1 => Self::Xiph,
            2 => Self::Fixed,
            _ => Self::Ebml,
        }
    }
}

/// A decoded block with its laced frames split apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub track_number: u64,
    /// Timestamp relative to the enclosing cluster, in TimestampScale ticks.
    pub timecode: i16,
    /// Only meaningful for SimpleBlock.
    pub keyframe: bool,
    pub invisible: bool,
    /// Only meaningful for SimpleBlock.
    pub discardable: bool,
    pub lacing: Lacing,
    pub frames: Vec<Bytes>,
}

/// Decode a SimpleBlock (`simple == true`) or Block payload.
///
/// Frames are zero-copy slices of `data`.
pub fn parse_block(data: &Bytes, simple: bool) -> Result<Block> {
    let track = read_vint(data)?.ok_or_else(|| Error::invalid("block shorter than its track number"))?;
    let mut pos = track.length;
    if data.len() < pos + 3 {
        return Err(Error::invalid("block header truncated"));
    }
    let timecode = i16::from_be_bytes([data[pos], data[pos + 1]]);
    let flags = data[pos + 2];
    pos += 3;

    let lacing = Lacing::from_flags(flags);
    let frames = match lacing {
        Lacing::None => vec![data.slice(pos..)],
        _ => {
            let count = *data
                .get(pos)
                .ok_or_else(|| Error::invalid("laced block without frame count"))? as usize
                + 1;
            pos += 1;
            let sizes = lace_sizes(data, &mut pos, count, lacing)?;
            let mut frames = Vec::with_capacity(count);
            for size in sizes {
                let end = pos + size;
                if end > data.len() {
                    return Err(Error::invalid("laced frame exceeds block"));
                }
                frames.push(data.slice(pos..end));
                pos = end;
            }
            frames
        }
    };

    Ok(Block {
        track_number: track.value,
        timecode,
        keyframe: simple && flags & FLAG_KEYFRAME != 0,
        invisible: flags & FLAG_INVISIBLE != 0,
        discardable: simple && flags & FLAG_DISCARDABLE != 0,
        lacing,
        frames,
    })
}

/// Sizes of all `count` laced frames; the last one takes what is left.
fn lace_sizes(data: &[u8], pos: &mut usize, count: usize, lacing: Lacing) -> Result<Vec<usize>> {
    let mut sizes = Vec::with_capacity(count);
    match lacing {
        Lacing::Xiph => {
            for _ in 1..count {
                let mut size = 0usize;
                loop {
                    let b = *data
                        .get(*pos)
                        .ok_or_else(|| Error::invalid("xiph lace size truncated"))?;
                    *pos += 1;
                    size += b as usize;
                    if b != 0xFF {
                        break;
                    }
                }
                sizes.push(size);
            }
        }
        Lacing::Ebml => {
            let first = read_vint(&data[*pos..])?
                .ok_or_else(|| Error::invalid("ebml lace size truncated"))?;
            *pos += first.length;
            let mut size = first.value as i64;
            sizes.push(size as usize);
            for _ in 2..count {
                let (delta, len) = read_signed_vint(&data[*pos..])?
                    .ok_or_else(|| Error::invalid("ebml lace delta truncated"))?;
                *pos += len;
                size += delta;
                if size < 0 {
                    return Err(Error::invalid("negative ebml lace size"));
                }
                sizes.push(size as usize);
            }
        }
        Lacing::Fixed => {
            let remaining = data.len().saturating_sub(*pos);
            if remaining % count != 0 {
                return Err(Error::invalid(format!(
                    "{remaining} bytes do not split into {count} fixed-size frames"
                )));
            }
            return Ok(vec![remaining / count; count]);
        }
        Lacing::None => return Ok(vec![data.len().saturating_sub(*pos)]),
    }

    let used: usize = sizes.iter().sum();
    let remaining = data
        .len()
        .checked_sub(*pos + used)
        .ok_or_else(|| Error::invalid("lace sizes exceed block"))?;
    sizes.push(remaining);
    Ok(sizes)
}

/// Flags carried by a written block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockFlags {
    pub keyframe: bool,
    pub invisible: bool,
    pub discardable: bool,
}

/// Encode an unlaced SimpleBlock payload (without its element header).
pub fn encode_simple_block(track_number: u64, timecode: i16, flags: BlockFlags, frame: &[u8]) -> Result<Bytes> {
    let mut flag_byte = 0u8;
    if flags.keyframe {
        flag_byte |= FLAG_KEYFRAME;
    }
    if flags.invisible {
        flag_byte |= FLAG_INVISIBLE;
    }
    if flags.discardable {
        flag_byte |= FLAG_DISCARDABLE;
    }
    encode(track_number, timecode, flag_byte, frame)
}

/// Encode an unlaced Block payload for a BlockGroup.
pub fn encode_block(track_number: u64, timecode: i16, invisible: bool, frame: &[u8]) -> Result<Bytes> {
    encode(
        track_number,
        timecode,
        if invisible { FLAG_INVISIBLE } else { 0 },
        frame,
    )
}

fn encode(track_number: u64, timecode: i16, flags: u8, frame: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(frame.len() + 4);
    put_vint(&mut buf, track_number)?;
    buf.put_i16(timecode);
    buf.put_u8(flags);
    buf.put_slice(frame);
    Ok(buf.freeze())
}
