//! Raw H.264 / H.265 elementary stream demuxers.

use super::annexb::{to_length_prefixed, AnnexBScanner};
use super::{h264, h265};
use crate::error::Result;
use crate::pipeline::{DemuxData, Node, Probe, ProbeResult};
use bytes::Bytes;
use std::fmt;
use std::marker::PhantomData;
use streammux_common::{CodecInfo, ContainerInfo, Frame, Rational, Time, Track};
use tracing::debug;

/// Track number used for the single track of an elementary stream.
pub const ELEMENTARY_TRACK: u32 = 1;

/// Clock of elementary stream tracks (90 kHz, as in MPEG systems).
pub fn elementary_timescale() -> Rational {
    Rational::new(1, 90_000)
}

/// Options for elementary stream demuxing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct ElementaryOptions {
    /// Frames per second when the SPS carries no timing information.
    pub frame_rate: Rational,
}

impl Default for ElementaryOptions {
    fn default() -> Self {
        Self {
            frame_rate: Rational::from_integer(25),
        }
    }
}

/// Role of a NAL unit in access unit delimitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalClass {
    Delimiter,
    Vps,
    Sps,
    Pps,
    Sei,
    Slice { first_in_picture: bool, keyframe: bool },
    Other,
}

/// Latest parameter sets seen in the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    pub vps: Option<Bytes>,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl ParameterSets {
    /// Keep `nal` if it is the first parameter set of its kind.
    pub fn remember<C: NalSyntax>(&mut self, nal: &Bytes) {
        let slot = match C::classify(nal) {
            NalClass::Vps => &mut self.vps,
            NalClass::Sps => &mut self.sps,
            NalClass::Pps => &mut self.pps,
            _ => return,
        };
        if slot.is_none() {
            *slot = Some(nal.clone());
        }
    }
}

/// Codec-specific NAL syntax.
pub trait NalSyntax {
    const NAME: &'static str;

    fn classify(nal: &[u8]) -> NalClass;

    /// The track described by `params`, or `None` while some are missing.
    /// Also returns the stream's own frame rate when it signals one.
    fn track(params: &ParameterSets) -> Result<Option<(Track, Option<Rational>)>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct H264;

impl NalSyntax for H264 {
    const NAME: &'static str = "h264";

    fn classify(nal: &[u8]) -> NalClass {
        match h264::nal_type(nal) {
            Some(h264::NAL_AUD) => NalClass::Delimiter,
            Some(h264::NAL_SPS) => NalClass::Sps,
            Some(h264::NAL_PPS) => NalClass::Pps,
            Some(h264::NAL_SEI) => NalClass::Sei,
            Some(t @ (h264::NAL_SLICE | h264::NAL_IDR)) => NalClass::Slice {
                first_in_picture: h264::first_mb_in_slice(nal).map_or(false, |mb| mb == 0),
                keyframe: t == h264::NAL_IDR,
            },
            _ => NalClass::Other,
        }
    }

    fn track(params: &ParameterSets) -> Result<Option<(Track, Option<Rational>)>> {
        let (Some(sps), Some(pps)) = (&params.sps, &params.pps) else {
            return Ok(None);
        };
        let parsed = h264::parse_sps(sps)?;
        let config = h264::AvcConfig::from_parameter_sets(vec![sps.clone()], vec![pps.clone()])?;
        let mut track = Track::video(ELEMENTARY_TRACK, config.codec_string(), parsed.width, parsed.height)
            .with_timescale(elementary_timescale())
            .with_codec_private(config.to_bytes());
        if let CodecInfo::Video { color, .. } = &mut track.info {
            *color = parsed.color;
        }
        Ok(Some((track, parsed.framerate())))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct H265;

impl NalSyntax for H265 {
    const NAME: &'static str = "h265";

    fn classify(nal: &[u8]) -> NalClass {
        match h265::nal_type(nal) {
            Some(h265::NAL_AUD) => NalClass::Delimiter,
            Some(h265::NAL_VPS) => NalClass::Vps,
            Some(h265::NAL_SPS) => NalClass::Sps,
            Some(h265::NAL_PPS) => NalClass::Pps,
            Some(h265::NAL_PREFIX_SEI) => NalClass::Sei,
            Some(t) if h265::is_vcl(t) => NalClass::Slice {
                first_in_picture: h265::first_slice_segment_in_pic(nal),
                keyframe: h265::is_irap(t),
            },
            _ => NalClass::Other,
        }
    }

    fn track(params: &ParameterSets) -> Result<Option<(Track, Option<Rational>)>> {
        let (Some(vps), Some(sps), Some(pps)) = (&params.vps, &params.sps, &params.pps) else {
            return Ok(None);
        };
        let parsed = h265::parse_sps(sps)?;
        let config = h265::HevcConfig::from_parameter_sets(vec![vps.clone()], vec![sps.clone()], vec![pps.clone()])?;
        let track = Track::video(ELEMENTARY_TRACK, config.codec_string(), parsed.width, parsed.height)
            .with_timescale(elementary_timescale())
            .with_codec_private(config.to_bytes());
        Ok(Some((track, None)))
    }
}

/// NAL units of one picture, in decode order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessUnit {
    pub units: Vec<Bytes>,
    pub keyframe: bool,
}

impl AccessUnit {
    /// The unit as a 4-byte length-prefixed sample.
    pub fn to_sample(&self) -> Bytes {
        to_length_prefixed(&self.units)
    }
}

/// Groups NAL units into access units.
///
/// A new unit starts at a delimiter, at the first slice of a picture, or at
/// a parameter set or SEI message, but only once the current unit already
/// holds a slice.
#[derive(Debug, Default)]
pub struct AccessUnitBuilder<C> {
    current: AccessUnit,
    has_slice: bool,
    _codec: PhantomData<C>,
}

impl<C: NalSyntax> AccessUnitBuilder<C> {
    pub fn new() -> Self {
        Self {
            current: AccessUnit::default(),
            has_slice: false,
            _codec: PhantomData,
        }
    }

    /// Add a NAL unit; returns the access unit it completed, if any.
    pub fn push(&mut self, nal: Bytes) -> Option<AccessUnit> {
        let class = C::classify(&nal);
        let starts_new = self.has_slice
            && matches!(
                class,
                NalClass::Delimiter
                    | NalClass::Vps
                    | NalClass::Sps
                    | NalClass::Pps
                    | NalClass::Sei
                    | NalClass::Slice {
                        first_in_picture: true,
                        ..
                    }
            );
        let done = if starts_new { self.finish() } else { None };

        match class {
            NalClass::Delimiter => {}
            NalClass::Slice { keyframe, .. } => {
                self.has_slice = true;
                self.current.keyframe |= keyframe;
                self.current.units.push(nal);
            }
            _ => self.current.units.push(nal),
        }
        done
    }

    /// Take the unit being built, if it holds a slice.
    pub fn finish(&mut self) -> Option<AccessUnit> {
        let unit = std::mem::take(&mut self.current);
        let had_slice = std::mem::replace(&mut self.has_slice, false);
        had_slice.then_some(unit)
    }

    pub fn reset(&mut self) {
        self.current = AccessUnit::default();
        self.has_slice = false;
    }
}

/// Demuxer for an Annex-B elementary stream.
///
/// Tracks are reported once the parameter sets are known; access units seen
/// before that are held and emitted right after. Timestamps follow decode
/// order at the stream's frame rate.
pub struct ElementaryDemuxer<C> {
    options: ElementaryOptions,
    scanner: AnnexBScanner,
    builder: AccessUnitBuilder<C>,
    params: ParameterSets,
    track: Option<Track>,
    frame_duration: Time,
    held: Vec<AccessUnit>,
    frame_index: i64,
}

pub type H264Demuxer = ElementaryDemuxer<H264>;
pub type H265Demuxer = ElementaryDemuxer<H265>;

impl<C> fmt::Debug for ElementaryDemuxer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementaryDemuxer")
            .field("track", &self.track)
            .field("held", &self.held.len())
            .field("frame_index", &self.frame_index)
            .finish()
    }
}

impl<C: NalSyntax> Default for ElementaryDemuxer<C> {
    fn default() -> Self {
        Self::new(ElementaryOptions::default())
    }
}

impl<C: NalSyntax> ElementaryDemuxer<C> {
    pub fn new(options: ElementaryOptions) -> Self {
        Self {
            options,
            scanner: AnnexBScanner::new(),
            builder: AccessUnitBuilder::new(),
            params: ParameterSets::default(),
            track: None,
            frame_duration: Time::ZERO,
            held: Vec::new(),
            frame_index: 0,
        }
    }

    pub fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    fn process(&mut self, nals: Vec<Bytes>, out: &mut Vec<DemuxData>) -> Result<()> {
        for nal in nals {
            if nal.is_empty() {
                continue;
            }
            if self.track.is_none() {
                self.params.remember::<C>(&nal);
            }
            if let Some(unit) = self.builder.push(nal) {
                self.held.push(unit);
            }
        }
        self.try_init(out)?;
        self.release(out);
        Ok(())
    }

    fn try_init(&mut self, out: &mut Vec<DemuxData>) -> Result<()> {
        if self.track.is_some() {
            return Ok(());
        }
        let Some((track, rate)) = C::track(&self.params)? else {
            return Ok(());
        };
        let rate = rate
            .filter(|r| !r.is_zero())
            .unwrap_or(self.options.frame_rate);
        self.frame_duration = rate.recip().map(Time::from_seconds).unwrap_or(Time::ZERO);
        debug!(
            format = C::NAME,
            codec = %track.codec,
            frame_rate = %rate,
            "Elementary stream configured"
        );
        let track = track.with_default_duration(self.frame_duration);
        out.push(DemuxData::init(
            ContainerInfo::new(elementary_timescale()),
            vec![track.clone()],
        ));
        self.track = Some(track);
        Ok(())
    }

    fn release(&mut self, out: &mut Vec<DemuxData>) {
        if self.track.is_none() || self.held.is_empty() {
            return;
        }
        let duration = self.frame_duration;
        let frames = std::mem::take(&mut self.held)
            .into_iter()
            .map(|unit| {
                let timestamp = Time::from_seconds(duration.seconds() * Rational::from_integer(self.frame_index));
                self.frame_index += 1;
                Frame::new(ELEMENTARY_TRACK, timestamp, unit.to_sample())
                    .with_duration(duration)
                    .with_keyframe(unit.keyframe)
            })
            .collect();
        out.push(DemuxData::frames(frames));
    }
}

impl<C: NalSyntax> Node for ElementaryDemuxer<C> {
    type Input = Bytes;
    type Output = DemuxData;

    fn push(&mut self, chunk: Bytes) -> Result<Vec<DemuxData>> {
        let nals = self.scanner.push(chunk);
        let mut out = Vec::new();
        self.process(nals, &mut out)?;
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<DemuxData>> {
        let nals = self.scanner.flush();
        let mut out = Vec::new();
        self.process(nals, &mut out)?;
        if let Some(unit) = self.builder.finish() {
            self.held.push(unit);
        }
        self.release(&mut out);
        if self.track.is_none() && !self.held.is_empty() {
            tracing::warn!(
                format = C::NAME,
                dropped = self.held.len(),
                "Stream ended before its parameter sets"
            );
            self.held.clear();
        }
        Ok(out)
    }

    fn reset(&mut self) {
        *self = Self::new(self.options.clone());
    }
}

impl<C: NalSyntax> Probe for ElementaryDemuxer<C> {
    fn probe(data: &[u8]) -> Option<ProbeResult> {
        let mut demuxer = Self::default();
        let out = demuxer.push(Bytes::copy_from_slice(data)).ok()?;
        out.into_iter().find_map(|d| {
            Some(ProbeResult {
                info: d.info?,
                tracks: d.tracks?,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nal::annexb::split_length_prefixed;
    use crate::nal::h264::tests::baseline_sps;

    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];

    fn annexb(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for u in units {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(u);
        }
        out
    }

    /// SPS, PPS, IDR, two P slices, then an AUD-delimited P picture.
    fn stream(timing: bool) -> Vec<u8> {
        let sps = baseline_sps(80, 45, 0, timing);
        annexb(&[
            &sps,
            PPS,
            &[0x65, 0x88, 0x84, 0x00],
            &[0x41, 0x9A, 0x01],
            &[0x41, 0x9A, 0x02],
            &[0x09, 0xF0],
            &[0x41, 0x9A, 0x03],
        ])
    }

    fn collect(out: Vec<DemuxData>) -> (Vec<Track>, Vec<Frame>) {
        let mut tracks = Vec::new();
        let mut frames = Vec::new();
        for d in out {
            tracks.extend(d.tracks.unwrap_or_default());
            frames.extend(d.frames);
        }
        (tracks, frames)
    }

    #[test]
    fn test_aggregates_access_units() {
        let mut d = H264Demuxer::default();
        let mut out = d.push(Bytes::from(stream(false))).unwrap();
        out.extend(d.flush().unwrap());
        let (tracks, frames) = collect(out);

        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].codec, "avc1.42c01f");
        assert_eq!(tracks[0].dimensions(), Some((1280, 720)));
        assert_eq!(frames.len(), 4);
        assert!(frames[0].keyframe);
        assert!(!frames[1].keyframe);

        // The first unit carries the parameter sets in band.
        let units = split_length_prefixed(&frames[0].data, 4).unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(units[2][0], 0x65);
        // Delimiters are dropped.
        let last = split_length_prefixed(&frames[3].data, 4).unwrap();
        assert_eq!(last, vec![Bytes::from_static(&[0x41, 0x9A, 0x03])]);
    }

    #[test]
    fn test_timestamps_use_default_rate() {
        let mut d = H264Demuxer::default();
        let mut out = d.push(Bytes::from(stream(false))).unwrap();
        out.extend(d.flush().unwrap());
        let (_, frames) = collect(out);
        assert_eq!(frames[2].timestamp, Time::new(80, streammux_common::TimeUnit::Milliseconds));
        assert_eq!(frames[2].duration, Time::new(40, streammux_common::TimeUnit::Milliseconds));
    }

    #[test]
    fn test_timestamps_use_vui_rate() {
        let options = ElementaryOptions {
            frame_rate: Rational::from_integer(60),
        };
        let mut d = H264Demuxer::new(options);
        let mut out = d.push(Bytes::from(stream(true))).unwrap();
        out.extend(d.flush().unwrap());
        let (_, frames) = collect(out);
        // VUI says 25 fps, which wins over the configured default.
        assert_eq!(frames[1].timestamp.seconds(), Rational::new(1, 25));
    }

    #[test]
    fn test_split_pushes_match_single_push() {
        let data = stream(false);
        let mut single = H264Demuxer::default();
        let mut expected = single.push(Bytes::from(data.clone())).unwrap();
        expected.extend(single.flush().unwrap());
        let (_, expected) = collect(expected);

        for split in [1, 5, 17, data.len() - 2] {
            let mut d = H264Demuxer::default();
            let mut out = d.push(Bytes::copy_from_slice(&data[..split])).unwrap();
            out.extend(d.push(Bytes::copy_from_slice(&data[split..])).unwrap());
            out.extend(d.flush().unwrap());
            let (_, frames) = collect(out);
            assert_eq!(frames, expected, "split at {split}");
        }
    }

    #[test]
    fn test_probe_reports_track() {
        let result = H264Demuxer::probe(&stream(false)).unwrap();
        assert_eq!(result.tracks[0].codec, "avc1.42c01f");
        assert!(H264Demuxer::probe(&[0, 0, 1, 0x41, 0x9A]).is_none());
    }

    #[test]
    fn test_h265_stream() {
        let sps = crate::nal::h265::tests::main_sps(640, 360, 0);
        let data = annexb(&[
            &[0x40, 0x01, 0x0C],
            &sps,
            &[0x44, 0x01, 0xC1],
            &[0x26, 0x01, 0xAF, 0x01],
            &[0x02, 0x01, 0xD0, 0x02],
            &[0x02, 0x01, 0x50, 0x03],
        ]);
        let mut d = H265Demuxer::default();
        let mut out = d.push(Bytes::from(data)).unwrap();
        out.extend(d.flush().unwrap());
        let (tracks, frames) = collect(out);
        assert_eq!(tracks[0].dimensions(), Some((640, 360)));
        assert!(tracks[0].codec.starts_with("hvc1.1."));
        // The third slice continues the second picture.
        assert_eq!(frames.len(), 2);
        assert!(frames[0].keyframe);
        assert!(!frames[1].keyframe);
    }

    #[test]
    fn test_reset_forgets_parameter_sets() {
        let mut d = H264Demuxer::default();
        d.push(Bytes::from(stream(false))).unwrap();
        assert!(d.track().is_some());
        d.reset();
        assert!(d.track().is_none());
        assert!(d.flush().unwrap().is_empty());
    }
}
