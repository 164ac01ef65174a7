//! Per-PID elementary stream parsers turning PES packets into frames.

use super::pes::{timestamp_delta, Pes};
use crate::audio::framed::AudioSyntax;
use crate::error::Result;
use crate::nal::annexb::split_annex_b;
use crate::nal::demuxer::{AccessUnit, AccessUnitBuilder, NalSyntax, ParameterSets};
use bytes::BytesMut;
use std::fmt;
use std::marker::PhantomData;
use streammux_common::{Frame, Rational, Time, Track};
use tracing::debug;

/// The 90 kHz system clock.
pub fn system_timescale() -> Rational {
    Rational::new(1, 90_000)
}

/// Maps PTS/DTS values onto stream time, relative to the first timestamp of
/// the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clock {
    base: u64,
}

impl Clock {
    pub fn new(base: u64) -> Self {
        Self { base }
    }

    pub fn time(&self, ts: u64) -> Time {
        Time::from_ticks(timestamp_delta(ts, self.base), system_timescale())
    }
}

/// Parser for the payload of one elementary stream.
pub trait StreamParser: fmt::Debug {
    /// Consume one PES packet, appending every frame it completed.
    fn push(&mut self, pes: &Pes, clock: Clock, out: &mut Vec<Frame>) -> Result<()>;

    /// End of stream: append whatever frame is still being built.
    fn finish(&mut self, out: &mut Vec<Frame>);

    /// The track, once the stream's configuration is known.
    fn track(&self) -> Option<&Track>;
}

/// H.264/H.265 carried as Annex-B access units.
pub struct VideoParser<C> {
    number: u32,
    params: ParameterSets,
    track: Option<Track>,
    builder: AccessUnitBuilder<C>,
    /// PTS and DTS of the access unit being built.
    timing: Option<(Time, Time)>,
    /// Last complete frame and its decode time, waiting for the next decode
    /// time to learn its duration.
    held: Option<(Frame, Time)>,
    duration: Time,
}

impl<C> fmt::Debug for VideoParser<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoParser")
            .field("number", &self.number)
            .field("track", &self.track)
            .finish()
    }
}

impl<C: NalSyntax> VideoParser<C> {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            params: ParameterSets::default(),
            track: None,
            builder: AccessUnitBuilder::new(),
            timing: None,
            held: None,
            duration: Time::ZERO,
        }
    }

    fn complete(&mut self, unit: AccessUnit, out: &mut Vec<Frame>) {
        let (pts, dts) = self.timing.unwrap_or((Time::ZERO, Time::ZERO));
        let frame = Frame::new(self.number, pts, unit.to_sample()).with_keyframe(unit.keyframe);
        if let Some((prev, prev_dts)) = self.held.take() {
            if dts > prev_dts {
                self.duration = dts - prev_dts;
            }
            out.push(prev.with_duration(self.duration));
        }
        self.held = Some((frame, dts));
    }

    fn configure(&mut self) -> Result<()> {
        if let Some((mut track, _)) = C::track(&self.params)? {
            track.number = self.number;
            debug!(format = C::NAME, track = self.number, codec = %track.codec, "TS video stream configured");
            self.track = Some(track);
        }
        Ok(())
    }
}

impl<C: NalSyntax> StreamParser for VideoParser<C> {
    fn push(&mut self, pes: &Pes, clock: Clock, out: &mut Vec<Frame>) -> Result<()> {
        if let Some(unit) = self.builder.finish() {
            self.complete(unit, out);
        }
        self.timing = match (pes.pts, pes.decode_time()) {
            (Some(pts), Some(dts)) => Some((clock.time(pts), clock.time(dts))),
            _ => self
                .timing
                .map(|(pts, dts)| (pts + self.duration, dts + self.duration)),
        };
        for nal in split_annex_b(&pes.payload) {
            if nal.is_empty() {
                continue;
            }
            if self.track.is_none() {
                self.params.remember::<C>(&nal);
            }
            if let Some(unit) = self.builder.push(nal) {
                self.complete(unit, out);
            }
        }
        if self.track.is_none() {
            self.configure()?;
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<Frame>) {
        if let Some(unit) = self.builder.finish() {
            self.complete(unit, out);
        }
        if let Some((frame, _)) = self.held.take() {
            out.push(frame.with_duration(self.duration));
        }
    }

    fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }
}

/// Self-framed audio (ADTS, MPEG audio) split into frames.
pub struct AudioParser<S> {
    number: u32,
    track: Option<Track>,
    carry: BytesMut,
    next: Option<Time>,
    _syntax: PhantomData<S>,
}

impl<S> fmt::Debug for AudioParser<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioParser")
            .field("number", &self.number)
            .field("track", &self.track)
            .finish()
    }
}

impl<S: AudioSyntax> AudioParser<S> {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            track: None,
            carry: BytesMut::new(),
            next: None,
            _syntax: PhantomData,
        }
    }
}

impl<S: AudioSyntax> StreamParser for AudioParser<S> {
    fn push(&mut self, pes: &Pes, clock: Clock, out: &mut Vec<Frame>) -> Result<()> {
        if let (Some(pts), true) = (pes.pts, self.carry.is_empty()) {
            self.next = Some(clock.time(pts));
        }
        self.carry.extend_from_slice(&pes.payload);
        let data = self.carry.split().freeze();
        let mut pos = 0;
        while pos + 1 < data.len() {
            if !S::is_sync(&data[pos..]) {
                pos += 1;
                continue;
            }
            let header = match S::parse_header(&data[pos..]) {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(_) => {
                    pos += 1;
                    continue;
                }
            };
            let end = pos + header.frame_len;
            if end > data.len() {
                break;
            }
            let frame = data.slice(pos..end);
            if self.track.is_none() {
                let mut track = S::track(&frame, &header)?;
                track.number = self.number;
                debug!(format = S::NAME, track = self.number, codec = %track.codec, "TS audio stream configured");
                self.track = Some(track);
            }
            if !S::is_metadata(&frame, &header) {
                let timestamp = self.next.unwrap_or(Time::ZERO);
                let duration = Time::from_ticks(
                    header.samples as i64,
                    Rational::new(1, header.sample_rate.max(1) as i64),
                );
                out.push(
                    Frame::new(self.number, timestamp, frame.slice(header.payload))
                        .with_duration(duration)
                        .with_keyframe(true),
                );
                self.next = Some(timestamp + duration);
            }
            pos = end;
        }
        self.carry = BytesMut::from(&data[pos.min(data.len())..]);
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<Frame>) {
        if !self.carry.is_empty() {
            debug!(format = S::NAME, bytes = self.carry.len(), "Dropping partial TS audio frame");
            self.carry.clear();
        }
    }

    fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }
}
