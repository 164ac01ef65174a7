//! MPEG-1/2/2.5 audio (layers I, II and III) frame headers.

use super::framed::{AudioSyntax, FrameHeader, FramedAudioDemuxer, AUDIO_TRACK};
use crate::error::{Error, Result};
use streammux_common::Track;

pub const HEADER_LEN: usize = 4;

/// Bitrates in kbit/s by bitrate index 1..=14.
const BITRATES_V1_L1: [u32; 14] = [32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448];
const BITRATES_V1_L2: [u32; 14] = [32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];
const BITRATES_V1_L3: [u32; 14] = [32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATES_V2_L1: [u32; 14] = [32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256];
const BITRATES_V2_L23: [u32; 14] = [8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

const SAMPLE_RATES_V1: [u32; 3] = [44_100, 48_000, 32_000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegVersion {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    I,
    II,
    III,
}

impl Layer {
    pub fn codec(self) -> &'static str {
        match self {
            Layer::I => "mp1",
            Layer::II => "mp2",
            Layer::III => "mp3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpegAudioHeader {
    pub version: MpegVersion,
    pub layer: Layer,
    pub crc: bool,
    /// kbit/s
    pub bitrate: u32,
    pub sample_rate: u32,
    pub padding: bool,
    pub channels: u16,
}

impl MpegAudioHeader {
    pub fn is_sync(data: &[u8]) -> bool {
        data.len() >= 2 && data[0] == 0xFF && data[1] & 0xE0 == 0xE0
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Truncated {
                need: HEADER_LEN,
                have: data.len(),
            });
        }
        if !Self::is_sync(data) {
            return Err(Error::invalid("missing MPEG audio sync"));
        }
        let version = match (data[1] >> 3) & 0x03 {
            0 => MpegVersion::Mpeg25,
            2 => MpegVersion::Mpeg2,
            3 => MpegVersion::Mpeg1,
            _ => return Err(Error::invalid("reserved MPEG audio version")),
        };
        let layer = match (data[1] >> 1) & 0x03 {
            1 => Layer::III,
            2 => Layer::II,
            3 => Layer::I,
            _ => return Err(Error::invalid("reserved MPEG audio layer")),
        };
        let bitrate_index = (data[2] >> 4) as usize;
        if bitrate_index == 0 {
            return Err(Error::unsupported("free-format MPEG audio"));
        }
        if bitrate_index == 15 {
            return Err(Error::invalid("bad MPEG audio bitrate index"));
        }
        let table = match (version, layer) {
            (MpegVersion::Mpeg1, Layer::I) => &BITRATES_V1_L1,
            (MpegVersion::Mpeg1, Layer::II) => &BITRATES_V1_L2,
            (MpegVersion::Mpeg1, Layer::III) => &BITRATES_V1_L3,
            (_, Layer::I) => &BITRATES_V2_L1,
            _ => &BITRATES_V2_L23,
        };
        let rate_index = ((data[2] >> 2) & 0x03) as usize;
        let base_rate = *SAMPLE_RATES_V1
            .get(rate_index)
            .ok_or_else(|| Error::invalid("reserved MPEG audio sample rate"))?;
        let sample_rate = match version {
            MpegVersion::Mpeg1 => base_rate,
            MpegVersion::Mpeg2 => base_rate / 2,
            MpegVersion::Mpeg25 => base_rate / 4,
        };
        Ok(Self {
            version,
            layer,
            crc: data[1] & 0x01 == 0,
            bitrate: table[bitrate_index - 1],
            sample_rate,
            padding: (data[2] >> 1) & 0x01 == 1,
            channels: if data[3] >> 6 == 3 { 1 } else { 2 },
        })
    }

    pub fn samples_per_frame(&self) -> u32 {
        match (self.layer, self.version) {
            (Layer::I, _) => 384,
            (Layer::II, _) | (Layer::III, MpegVersion::Mpeg1) => 1152,
            (Layer::III, _) => 576,
        }
    }

    /// Frame length in bytes, header included.
    pub fn frame_len(&self) -> usize {
        let bits = self.bitrate as u64 * 1000;
        let rate = self.sample_rate as u64;
        match self.layer {
            Layer::I => ((12 * bits / rate) as usize + self.padding as usize) * 4,
            _ => {
                let bytes_per_frame = self.samples_per_frame() as u64 / 8;
                (bytes_per_frame * bits / rate) as usize + self.padding as usize
            }
        }
    }

    /// Offset of a Xing/Info tag inside a layer III frame.
    fn xing_offset(&self) -> usize {
        let side_info = match (self.version, self.channels) {
            (MpegVersion::Mpeg1, 1) => 17,
            (MpegVersion::Mpeg1, _) => 32,
            (_, 1) => 9,
            _ => 17,
        };
        HEADER_LEN + if self.crc { 2 } else { 0 } + side_info
    }

    /// Whether `frame` is an encoder tag frame (Xing, Info or VBRI) rather
    /// than audio.
    pub fn is_tag_frame(&self, frame: &[u8]) -> bool {
        if self.layer != Layer::III {
            return false;
        }
        let at = |offset: usize, tag: &[u8]| frame.get(offset..offset + 4) == Some(tag);
        let xing = self.xing_offset();
        at(xing, b"Xing") || at(xing, b"Info") || at(HEADER_LEN + 32, b"VBRI")
    }
}

/// Framing rules for [`MpegAudioDemuxer`].
#[derive(Debug)]
pub enum MpegAudio {}

impl AudioSyntax for MpegAudio {
    const NAME: &'static str = "mpeg-audio";

    fn is_sync(data: &[u8]) -> bool {
        MpegAudioHeader::is_sync(data)
    }

    fn parse_header(data: &[u8]) -> Result<Option<FrameHeader>> {
        if data.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = MpegAudioHeader::parse(data)?;
        let frame_len = header.frame_len();
        if frame_len <= HEADER_LEN {
            return Err(Error::invalid("MPEG audio frame shorter than its header"));
        }
        Ok(Some(FrameHeader {
            frame_len,
            payload: 0..frame_len,
            samples: header.samples_per_frame(),
            sample_rate: header.sample_rate,
        }))
    }

    fn track(frame: &[u8], _header: &FrameHeader) -> Result<Track> {
        let header = MpegAudioHeader::parse(frame)?;
        Ok(Track::audio(
            AUDIO_TRACK,
            header.layer.codec(),
            header.channels,
            header.sample_rate,
        ))
    }

    fn is_metadata(frame: &[u8], _header: &FrameHeader) -> bool {
        MpegAudioHeader::parse(frame).is_ok_and(|h| h.is_tag_frame(frame))
    }
}

/// Demuxer for raw `.mp3`/`.mp2` streams. Frames keep their headers.
pub type MpegAudioDemuxer = FramedAudioDemuxer<MpegAudio>;
