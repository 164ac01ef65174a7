//! Demuxing of self-synchronising audio streams (ADTS, MPEG audio).

use crate::error::Result;
use crate::pipeline::{DemuxData, Leftover, Node, Probe, ProbeResult};
use bytes::Bytes;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Range;
use streammux_common::bytes::skip_id3;
use streammux_common::{ContainerInfo, Frame, Rational, Time, TimeUnit, Track};
use tracing::{debug, warn};

/// Track number of the single track of a raw audio stream.
pub const AUDIO_TRACK: u32 = 1;

/// Bytes needed to recognise an ID3v2 tag.
const ID3_HEADER_LEN: usize = 10;

/// One parsed frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Whole frame length, header included.
    pub frame_len: usize,
    /// Part of the frame handed out as the frame payload.
    pub payload: Range<usize>,
    /// PCM samples the frame decodes to.
    pub samples: u32,
    pub sample_rate: u32,
}

/// Framing rules of one audio format.
pub trait AudioSyntax {
    const NAME: &'static str;

    /// Whether `data` starts with this format's sync pattern.
    fn is_sync(data: &[u8]) -> bool;

    /// Parse the header at the start of `data`. `Ok(None)` when more bytes
    /// are needed, `Err` when the bytes are not a valid header.
    fn parse_header(data: &[u8]) -> Result<Option<FrameHeader>>;

    /// Track described by the first frame.
    fn track(frame: &[u8], header: &FrameHeader) -> Result<Track>;

    /// Frames that carry stream metadata rather than audio.
    fn is_metadata(_frame: &[u8], _header: &FrameHeader) -> bool {
        false
    }
}

/// Demuxer for a stream of back-to-back audio frames, optionally preceded
/// by an ID3v2 tag. Resynchronises on the next sync pattern after garbage.
pub struct FramedAudioDemuxer<S> {
    leftover: Leftover,
    id3_checked: bool,
    track: Option<Track>,
    sample_rate: u32,
    /// Samples emitted so far; the next frame's timestamp.
    samples: i64,
    frames: Vec<Frame>,
    _syntax: PhantomData<S>,
}

impl<S> fmt::Debug for FramedAudioDemuxer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedAudioDemuxer")
            .field("track", &self.track)
            .field("samples", &self.samples)
            .finish()
    }
}

impl<S: AudioSyntax> Default for FramedAudioDemuxer<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: AudioSyntax> FramedAudioDemuxer<S> {
    pub fn new() -> Self {
        Self {
            leftover: Leftover::new(),
            id3_checked: false,
            track: None,
            sample_rate: 0,
            samples: 0,
            frames: Vec::new(),
            _syntax: PhantomData,
        }
    }

    pub fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    fn time(&self, samples: i64) -> Time {
        Time::new(Rational::new(samples, self.sample_rate.max(1) as i64), TimeUnit::Seconds)
    }

    fn next_sync(data: &[u8], from: usize) -> Option<usize> {
        (from..data.len().saturating_sub(1)).find(|i| S::is_sync(&data[*i..]))
    }

    fn parse(&mut self, data: &Bytes, out: &mut Vec<DemuxData>) -> Result<()> {
        let mut pos = 0;
        if !self.id3_checked {
            if data.len() < ID3_HEADER_LEN {
                return Ok(());
            }
            self.id3_checked = true;
            pos = skip_id3(data);
            if pos > 0 {
                debug!(format = S::NAME, size = pos, "Skipping ID3v2 tag");
            }
            self.leftover.save_last_byte(pos);
        }

        let mut skipped = 0;
        while pos + 1 < data.len() {
            if !S::is_sync(&data[pos..]) {
                let next = Self::next_sync(data, pos + 1).unwrap_or(data.len() - 1);
                skipped += next - pos;
                pos = next;
                self.leftover.save_last_byte(pos);
                continue;
            }
            let header = match S::parse_header(&data[pos..]) {
                Ok(Some(h)) => h,
                Ok(None) => break,
                Err(_) => {
                    skipped += 1;
                    pos += 1;
                    self.leftover.save_last_byte(pos);
                    continue;
                }
            };
            let end = pos + header.frame_len;
            if end > data.len() {
                break;
            }
            let frame = data.slice(pos..end);
            if self.track.is_none() {
                let track = S::track(&frame, &header)?;
                debug!(format = S::NAME, codec = %track.codec, sample_rate = header.sample_rate, "Audio stream configured");
                self.sample_rate = header.sample_rate;
                out.push(DemuxData::init(
                    ContainerInfo::new(Rational::new(1, header.sample_rate.max(1) as i64)),
                    vec![track.clone()],
                ));
                self.track = Some(track);
            }
            if !S::is_metadata(&frame, &header) {
                let timestamp = self.time(self.samples);
                self.samples += header.samples as i64;
                let duration = self.time(self.samples) - timestamp;
                self.frames.push(
                    Frame::new(AUDIO_TRACK, timestamp, frame.slice(header.payload))
                        .with_duration(duration)
                        .with_keyframe(true),
                );
            }
            pos = end;
            self.leftover.save_last_byte(pos);
        }
        if skipped > 0 {
            warn!(format = S::NAME, bytes = skipped, "Skipped data between audio frames");
        }
        Ok(())
    }

    fn emit(&mut self, out: &mut Vec<DemuxData>) {
        if self.track.is_some() && !self.frames.is_empty() {
            out.push(DemuxData::frames(std::mem::take(&mut self.frames)));
        }
    }
}

impl<S: AudioSyntax> Node for FramedAudioDemuxer<S> {
    type Input = Bytes;
    type Output = DemuxData;

    fn push(&mut self, chunk: Bytes) -> Result<Vec<DemuxData>> {
        let data = self.leftover.merge(chunk);
        let mut out = Vec::new();
        self.parse(&data, &mut out)?;
        self.leftover.save_leftover(&data);
        self.emit(&mut out);
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<DemuxData>> {
        let mut out = Vec::new();
        let rest = self.leftover.take();
        if !self.id3_checked && !rest.is_empty() {
            // streams shorter than an ID3 header
            self.id3_checked = true;
            self.parse(&rest, &mut out)?;
        } else if rest.len() > 1 {
            warn!(format = S::NAME, bytes = rest.len(), "Dropping truncated audio frame");
        }
        self.emit(&mut out);
        self.leftover.clear();
        Ok(out)
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

impl<S: AudioSyntax> Probe for FramedAudioDemuxer<S> {
    fn probe(data: &[u8]) -> Option<ProbeResult> {
        let mut demuxer = Self::new();
        let out = demuxer.push(Bytes::copy_from_slice(data)).ok()?;
        out.into_iter().find_map(|d| {
            Some(ProbeResult {
                info: d.info?,
                tracks: d.tracks?,
            })
        })
    }
}
