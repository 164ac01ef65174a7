//! ADTS-framed AAC: header codec, demuxer and muxer.

use super::aac::{sample_rate_index, AudioSpecificConfig, SAMPLES_PER_FRAME, SAMPLE_RATES};
use super::framed::{AudioSyntax, FrameHeader, FramedAudioDemuxer};
use crate::error::{Error, Result};
use crate::pipeline::{DemuxData, Node};
use bytes::{BufMut, Bytes, BytesMut};
use streammux_common::Track;
use tracing::{debug, warn};

pub const HEADER_LEN: usize = 7;
pub const HEADER_LEN_CRC: usize = 9;

/// Largest value of the 13-bit frame length field.
const MAX_FRAME_LEN: usize = 0x1FFF;

/// Fixed and variable parts of one ADTS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// MPEG-4 audio object type (profile + 1).
    pub object_type: u8,
    pub sample_rate_index: u8,
    pub channel_config: u8,
    pub protection_absent: bool,
    /// Whole frame length, header included.
    pub frame_len: usize,
    /// Raw data blocks in the frame, at least one.
    pub blocks: u8,
}

impl AdtsHeader {
    pub fn is_sync(data: &[u8]) -> bool {
        data.len() >= 2 && data[0] == 0xFF && data[1] & 0xF6 == 0xF0
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Truncated {
                need: HEADER_LEN,
                have: data.len(),
            });
        }
        if !Self::is_sync(data) {
            return Err(Error::invalid("missing ADTS syncword"));
        }
        let sample_rate_index = (data[2] >> 2) & 0x0F;
        if sample_rate_index as usize >= SAMPLE_RATES.len() {
            return Err(Error::invalid(format!(
                "ADTS sampling frequency index {sample_rate_index}"
            )));
        }
        let header = Self {
            object_type: (data[2] >> 6) + 1,
            sample_rate_index,
            channel_config: ((data[2] & 0x01) << 2) | (data[3] >> 6),
            protection_absent: data[1] & 0x01 == 1,
            frame_len: (((data[3] & 0x03) as usize) << 11)
                | ((data[4] as usize) << 3)
                | ((data[5] >> 5) as usize),
            blocks: (data[6] & 0x03) + 1,
        };
        if header.frame_len < header.header_len() {
            return Err(Error::invalid(format!(
                "ADTS frame length {} shorter than its header",
                header.frame_len
            )));
        }
        Ok(header)
    }

    pub fn header_len(&self) -> usize {
        if self.protection_absent {
            HEADER_LEN
        } else {
            HEADER_LEN_CRC
        }
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATES[self.sample_rate_index as usize % SAMPLE_RATES.len()]
    }

    pub fn config(&self) -> AudioSpecificConfig {
        AudioSpecificConfig {
            object_type: self.object_type,
            sample_rate: self.sample_rate(),
            channel_config: self.channel_config,
        }
    }

    /// Header for a single-block, CRC-less frame carrying `payload_len` bytes.
    pub fn for_payload(config: &AudioSpecificConfig, payload_len: usize) -> Result<Self> {
        let sample_rate_index = sample_rate_index(config.sample_rate).ok_or_else(|| {
            Error::unsupported(format!("sample rate {} in ADTS", config.sample_rate))
        })?;
        if !(1..=4).contains(&config.object_type) {
            return Err(Error::unsupported(format!(
                "AAC object type {} in ADTS",
                config.object_type
            )));
        }
        let frame_len = payload_len + HEADER_LEN;
        if frame_len > MAX_FRAME_LEN {
            return Err(Error::invalid(format!("AAC frame of {payload_len} bytes exceeds ADTS")));
        }
        Ok(Self {
            object_type: config.object_type,
            sample_rate_index,
            channel_config: config.channel_config,
            protection_absent: true,
            frame_len,
            blocks: 1,
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        let profile = self.object_type.saturating_sub(1) & 0x03;
        let len = self.frame_len;
        buf.put_u8(0xFF);
        buf.put_u8(0xF0 | self.protection_absent as u8);
        buf.put_u8((profile << 6) | (self.sample_rate_index << 2) | ((self.channel_config >> 2) & 0x01));
        buf.put_u8(((self.channel_config & 0x03) << 6) | ((len >> 11) & 0x03) as u8);
        buf.put_u8((len >> 3) as u8);
        // buffer fullness 0x7FF (variable rate)
        buf.put_u8((((len & 0x07) as u8) << 5) | 0x1F);
        buf.put_u8(0xFC | (self.blocks.saturating_sub(1) & 0x03));
        if !self.protection_absent {
            buf.put_u16(0);
        }
    }
}

/// Framing rules for [`AdtsDemuxer`].
#[derive(Debug)]
pub enum Adts {}

impl AudioSyntax for Adts {
    const NAME: &'static str = "adts";

    fn is_sync(data: &[u8]) -> bool {
        AdtsHeader::is_sync(data)
    }

    fn parse_header(data: &[u8]) -> Result<Option<FrameHeader>> {
        if data.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = AdtsHeader::parse(data)?;
        Ok(Some(FrameHeader {
            frame_len: header.frame_len,
            payload: header.header_len()..header.frame_len,
            samples: SAMPLES_PER_FRAME * header.blocks as u32,
            sample_rate: header.sample_rate(),
        }))
    }

    fn track(frame: &[u8], _header: &FrameHeader) -> Result<Track> {
        let config = AdtsHeader::parse(frame)?.config();
        Ok(Track::audio(
            super::framed::AUDIO_TRACK,
            config.codec_string(),
            config.channels(),
            config.sample_rate,
        )
        .with_codec_private(config.to_bytes()))
    }
}

/// Demuxer for raw `.aac` streams.
pub type AdtsDemuxer = FramedAudioDemuxer<Adts>;

/// Wraps the AAC frames of the first AAC track in ADTS headers.
#[derive(Debug, Default)]
pub struct AdtsMuxer {
    track: Option<(u32, AudioSpecificConfig)>,
    configured: bool,
}

impl AdtsMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_tracks(&mut self, tracks: &[Track]) -> Result<()> {
        self.configured = true;
        let Some(track) = tracks
            .iter()
            .find(|t| t.is_audio() && t.codec_family() == "mp4a")
        else {
            return Err(Error::unsupported("ADTS output needs an AAC track"));
        };
        let config = if track.codec_private.is_empty() {
            // no private data: rebuild an LC config from the track
            let object_type = track
                .codec
                .rsplit('.')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(super::aac::AOT_AAC_LC);
            AudioSpecificConfig {
                object_type,
                sample_rate: track.sample_rate().unwrap_or(44_100),
                channel_config: track.channels().unwrap_or(2) as u8,
            }
        } else {
            AudioSpecificConfig::parse(&track.codec_private)?
        };
        // fail early rather than on the first frame
        AdtsHeader::for_payload(&config, 0)?;
        debug!(track = track.number, codec = %config.codec_string(), "ADTS output configured");
        self.track = Some((track.number, config));
        Ok(())
    }
}

impl Node for AdtsMuxer {
    type Input = DemuxData;
    type Output = Bytes;

    fn push(&mut self, data: DemuxData) -> Result<Vec<Bytes>> {
        if let Some(tracks) = &data.tracks {
            if self.configured {
                debug!("Ignoring track list received after ADTS output started");
            } else {
                self.set_tracks(tracks)?;
            }
        }
        let Some((number, config)) = &self.track else {
            if !data.frames.is_empty() {
                warn!(frames = data.frames.len(), "Dropping frames without a track list");
            }
            return Ok(Vec::new());
        };
        let mut buf = BytesMut::new();
        for frame in data.frames.iter().filter(|f| f.track_number == *number) {
            AdtsHeader::for_payload(config, frame.data.len())?.write(&mut buf);
            buf.put_slice(&frame.data);
        }
        if buf.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![buf.freeze()])
    }

    fn flush(&mut self) -> Result<Vec<Bytes>> {
        Ok(Vec::new())
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}
