//! Incremental Matroska / WebM demuxer.

use super::block::parse_block;
use super::codec_id;
use super::find::{find_ebml, read_element_header, EbmlElement, Matcher};
use super::ids;
use crate::error::{Error, Result};
use crate::pipeline::{DemuxData, Leftover, Node, Probe, ProbeResult};
use bytes::Bytes;
use std::collections::HashMap;
use streammux_common::bytes::{number_from_bytes, NumberFormat};
use streammux_common::{CodecInfo, ColorInfo, ContainerInfo, Frame, Rational, Time, TimeUnit, Track, TrackKind};
use tracing::{debug, trace, warn};

/// TimestampScale when Info does not say otherwise (1 ms).
pub const DEFAULT_TIMESTAMP_SCALE_NS: u64 = 1_000_000;

const ANY: &[Matcher] = &[Matcher::Any];
const CLUSTER_ID: [u8; 4] = ids::CLUSTER.to_be_bytes();

pub(crate) fn read_uint(data: &[u8]) -> u64 {
    number_from_bytes(data, NumberFormat::UNSIGNED_BE).map_or(0, |v| v as u64)
}

pub(crate) fn read_float(data: &[u8]) -> Option<f64> {
    match data.len() {
        4 => Some(f32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64),
        8 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(data);
            Some(f64::from_be_bytes(b))
        }
        _ => None,
    }
}

pub(crate) fn read_string(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the EBML header and the Segment header.
    Header,
    /// Walking level-1 elements.
    Body,
}

#[derive(Debug, Default)]
struct TrackState {
    default_duration: Option<Time>,
    /// Last frame whose duration waits for the next timestamp.
    held: Option<Frame>,
}

/// Matroska / WebM demuxer.
///
/// Emits `{info, tracks}` once the Tracks element is parsed, then frames
/// from every complete Cluster. Unknown-size Clusters are complete once the
/// next level-1 element starts; the last one is drained on flush.
#[derive(Debug)]
pub struct EbmlDemuxer {
    leftover: Leftover,
    state: State,
    doc_type: Option<String>,
    scale_ns: u64,
    duration: Option<Time>,
    tracks: Vec<Track>,
    track_states: HashMap<u32, TrackState>,
    initialized: bool,
    known_tracks: bool,
    /// Frames parsed before the track list was reported.
    pending: Vec<Frame>,
}

impl Default for EbmlDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl EbmlDemuxer {
    pub fn new() -> Self {
        Self {
            leftover: Leftover::new(),
            state: State::Header,
            doc_type: None,
            scale_ns: DEFAULT_TIMESTAMP_SCALE_NS,
            duration: None,
            tracks: Vec::new(),
            track_states: HashMap::new(),
            initialized: false,
            known_tracks: false,
            pending: Vec::new(),
        }
    }

    /// Demux a stream whose tracks are already known, such as media
    /// segments without an initialization header.
    pub fn with_tracks(info: ContainerInfo, tracks: Vec<Track>) -> Self {
        let mut demuxer = Self::new();
        let scale = (info.timestamp_scale * Rational::from_integer(1_000_000_000)).round();
        if scale > 0 {
            demuxer.scale_ns = scale as u64;
        }
        demuxer.duration = info.duration;
        demuxer.set_tracks(tracks);
        demuxer.known_tracks = true;
        demuxer
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn doc_type(&self) -> Option<&str> {
        self.doc_type.as_deref()
    }

    fn timestamp_scale(&self) -> Rational {
        Rational::new(self.scale_ns as i64, 1_000_000_000)
    }

    fn info(&self) -> ContainerInfo {
        let info = ContainerInfo::new(self.timestamp_scale());
        match self.duration {
            Some(d) => info.with_duration(d),
            None => info,
        }
    }

    fn ticks_to_time(&self, ticks: i64) -> Time {
        Time::new(ticks.saturating_mul(self.scale_ns as i64), TimeUnit::Nanoseconds)
    }

    fn set_tracks(&mut self, tracks: Vec<Track>) {
        self.track_states = tracks
            .iter()
            .map(|t| {
                (
                    t.number,
                    TrackState {
                        default_duration: t.default_duration,
                        held: None,
                    },
                )
            })
            .collect();
        self.tracks = tracks;
    }

    /// Skip the EBML header and everything up to the Segment payload.
    /// Returns the offset of the first level-1 element once known.
    fn parse_header(&mut self, data: &Bytes) -> Result<Option<usize>> {
        let mut pos = 0;
        loop {
            let Some(header) = read_element_header(&data[pos..])? else {
                return Ok(None);
            };
            match header.id {
                ids::SEGMENT => return Ok(Some(pos + header.header_len)),
                ids::CLUSTER if self.known_tracks => return Ok(Some(pos)),
                ids::EBML => {
                    let end = match header.size {
                        Some(size) => pos + header.header_len + size as usize,
                        None => return Err(Error::invalid("EBML header with unknown size")),
                    };
                    if end > data.len() {
                        return Ok(None);
                    }
                    let body = data.slice(pos + header.header_len..end);
                    if let Some(doc_type) = find_ebml(&body, &[Matcher::Id(ids::DOC_TYPE)], true).next() {
                        self.doc_type = Some(read_string(&doc_type.data));
                    }
                    pos = end;
                }
                id if pos == 0 => {
                    return Err(Error::invalid(format!("stream starts with element {id:#x}, not EBML")));
                }
                _ => {
                    // Void or CRC between the header and the Segment.
                    let Some(size) = header.size else {
                        return Err(Error::invalid("unknown-size element before Segment"));
                    };
                    let end = pos + header.header_len + size as usize;
                    if end > data.len() {
                        return Ok(None);
                    }
                    pos = end;
                }
            }
        }
    }

    /// Walk level-1 elements from `pos`, resyncing on the next Cluster id
    /// after malformed data.
    fn walk(&mut self, data: &Bytes, mut pos: usize, full_only: bool, out: &mut Vec<DemuxData>) -> Result<()> {
        loop {
            let body = data.slice(pos..);
            let mut iter = find_ebml(&body, ANY, full_only);
            for element in iter.by_ref() {
                self.handle_level1(element, out)?;
            }
            let consumed = iter.consumed();
            self.leftover.save_last_byte(pos + consumed);
            let Some(error) = iter.error() else {
                return Ok(());
            };
            warn!(offset = self.leftover.absolute_offset() + (pos + consumed) as u64, error = %error, "Skipping malformed EBML data");
            match find_cluster(&body, consumed + 1) {
                Some(next) => {
                    pos += next;
                    self.leftover.save_last_byte(pos);
                }
                None => {
                    // Keep what could be the start of a split Cluster id.
                    self.leftover.save_last_byte(data.len().saturating_sub(CLUSTER_ID.len() - 1));
                    return Ok(());
                }
            }
        }
    }

    fn handle_level1(&mut self, element: EbmlElement, out: &mut Vec<DemuxData>) -> Result<()> {
        match element.id {
            ids::INFO => self.parse_info(&element.data),
            ids::TRACKS if !self.known_tracks => {
                let tracks = self.parse_tracks(&element.data);
                debug!(count = tracks.len(), doc_type = ?self.doc_type, "Matroska tracks parsed");
                self.set_tracks(tracks);
            }
            ids::CLUSTER => self.parse_cluster(&element.data),
            id => trace!(id = format_args!("{id:#x}"), size = element.data.len(), "Skipping level-1 element"),
        }
        if !self.initialized && !self.tracks.is_empty() {
            self.initialized = true;
            out.push(DemuxData::init(self.info(), self.tracks.clone()));
        }
        Ok(())
    }

    fn parse_info(&mut self, data: &Bytes) {
        let mut duration = None;
        for child in find_ebml(data, ANY, true) {
            match child.id {
                ids::TIMESTAMP_SCALE => {
                    let scale = read_uint(&child.data);
                    if scale > 0 {
                        self.scale_ns = scale;
                    }
                }
                ids::DURATION => duration = read_float(&child.data),
                _ => {}
            }
        }
        if let Some(ticks) = duration {
            let ns = (ticks * self.scale_ns as f64).round() as i64;
            self.duration = Some(Time::new(ns, TimeUnit::Nanoseconds));
        }
    }

    fn parse_tracks(&self, data: &Bytes) -> Vec<Track> {
        find_ebml(data, &[Matcher::Id(ids::TRACK_ENTRY)], true)
            .filter_map(|entry| self.parse_track_entry(&entry.data))
            .collect()
    }

    fn parse_track_entry(&self, data: &Bytes) -> Option<Track> {
        let mut number = None;
        let mut track_type = 0;
        let mut codec_id = String::new();
        let mut private = Bytes::new();
        let mut default_duration = None;
        let mut language = None;
        let mut video = None;
        let mut audio = None;

        for child in find_ebml(data, ANY, true) {
            match child.id {
                ids::TRACK_NUMBER => number = Some(read_uint(&child.data) as u32),
                ids::TRACK_TYPE => track_type = read_uint(&child.data),
                ids::CODEC_ID => codec_id = read_string(&child.data),
                ids::CODEC_PRIVATE => private = child.data,
                ids::DEFAULT_DURATION => {
                    default_duration = Some(Time::new(read_uint(&child.data) as i64, TimeUnit::Nanoseconds))
                }
                ids::LANGUAGE => language = Some(read_string(&child.data)),
                ids::VIDEO => video = Some(parse_video(&child.data)),
                ids::AUDIO => audio = Some(parse_audio(&child.data)),
                _ => {}
            }
        }

        let Some(number) = number.filter(|n| *n > 0) else {
            warn!("Skipping TrackEntry without TrackNumber");
            return None;
        };
        let kind = match track_type {
            ids::TRACK_TYPE_VIDEO => TrackKind::Video,
            ids::TRACK_TYPE_AUDIO => TrackKind::Audio,
            ids::TRACK_TYPE_SUBTITLE => TrackKind::Subtitle,
            _ => TrackKind::Other,
        };
        let codec = codec_id::from_codec_id(&codec_id, &private);
        let mut track = Track::new(number, kind, codec)
            .with_timescale(self.timestamp_scale())
            .with_codec_private(private);
        track.info = match kind {
            TrackKind::Video => video.unwrap_or(CodecInfo::Video {
                width: 0,
                height: 0,
                color: None,
            }),
            TrackKind::Audio => audio.unwrap_or(CodecInfo::Audio {
                channels: 1,
                sample_rate: 8000,
                bit_depth: 16,
            }),
            _ => CodecInfo::None,
        };
        track.language = language;
        track.default_duration = default_duration;
        Some(track)
    }

    fn parse_cluster(&mut self, data: &Bytes) {
        let mut cluster_ts = 0i64;
        let mut blocks = 0usize;
        for child in find_ebml(data, ANY, true) {
            match child.id {
                ids::TIMESTAMP => cluster_ts = read_uint(&child.data) as i64,
                ids::SIMPLE_BLOCK => {
                    blocks += 1;
                    self.parse_block(&child.data, true, cluster_ts, None, true);
                }
                ids::BLOCK_GROUP => {
                    blocks += 1;
                    self.parse_block_group(&child.data, cluster_ts);
                }
                _ => {}
            }
        }
        trace!(timestamp = cluster_ts, blocks, "Cluster parsed");
    }

    fn parse_block_group(&mut self, data: &Bytes, cluster_ts: i64) {
        let mut block = None;
        let mut duration = None;
        let mut referenced = false;
        for child in find_ebml(data, ANY, true) {
            match child.id {
                ids::BLOCK => block = Some(child.data),
                ids::BLOCK_DURATION => duration = Some(read_uint(&child.data) as i64),
                ids::REFERENCE_BLOCK => referenced = true,
                _ => {}
            }
        }
        if let Some(block) = block {
            self.parse_block(&block, false, cluster_ts, duration, !referenced);
        }
    }

    fn parse_block(&mut self, data: &Bytes, simple: bool, cluster_ts: i64, duration_ticks: Option<i64>, keyframe: bool) {
        let block = match parse_block(data, simple) {
            Ok(block) => block,
            Err(e) => {
                warn!(error = %e, "Skipping malformed block");
                return;
            }
        };
        let track_number = block.track_number as u32;
        let Some(state) = self.track_states.get(&track_number) else {
            trace!(track = track_number, "Block for unknown track");
            return;
        };
        let default_duration = state.default_duration;
        let base = self.ticks_to_time(cluster_ts + block.timecode as i64);
        let count = block.frames.len() as i64;
        let block_duration = duration_ticks.map(|d| self.ticks_to_time(d));
        let frame_duration = match block_duration {
            Some(d) => Some(Time::from_seconds(d.seconds() / Rational::from_integer(count.max(1)))),
            None => default_duration,
        };
        let step = frame_duration.unwrap_or(Time::ZERO);

        for (i, payload) in block.frames.into_iter().enumerate() {
            let timestamp = Time::from_seconds(base.seconds() + step.seconds() * Rational::from_integer(i as i64));
            let mut frame = Frame::new(track_number, timestamp, payload);
            frame.keyframe = if simple { block.keyframe } else { keyframe };
            frame.invisible = block.invisible;
            frame.discardable = block.discardable;
            if let Some(d) = frame_duration {
                frame.duration = d;
            }
            self.deliver(frame, frame_duration.is_some());
        }
    }

    /// Hand a frame out, holding back frames without a known duration until
    /// the next frame of their track shows where they end.
    fn deliver(&mut self, frame: Frame, has_duration: bool) {
        let Some(state) = self.track_states.get_mut(&frame.track_number) else {
            return;
        };
        if let Some(mut held) = state.held.take() {
            let gap = frame.timestamp.seconds() - held.timestamp.seconds();
            held.duration = if gap > Rational::ZERO {
                Time::from_seconds(gap)
            } else {
                Time::ZERO
            };
            self.pending.push(held);
        }
        if has_duration {
            self.pending.push(frame);
        } else {
            state.held = Some(frame);
        }
    }

    fn release_held(&mut self) {
        let mut numbers: Vec<u32> = self.track_states.keys().copied().collect();
        numbers.sort_unstable();
        for number in numbers {
            if let Some(state) = self.track_states.get_mut(&number) {
                if let Some(mut frame) = state.held.take() {
                    frame.duration = state.default_duration.unwrap_or(Time::ZERO);
                    self.pending.push(frame);
                }
            }
        }
    }

    fn emit_frames(&mut self, out: &mut Vec<DemuxData>) {
        if self.initialized && !self.pending.is_empty() {
            out.push(DemuxData::frames(std::mem::take(&mut self.pending)));
        }
    }
}

fn find_cluster(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(CLUSTER_ID.len())
        .position(|w| w == CLUSTER_ID)
        .map(|i| from + i)
}

fn parse_video(data: &Bytes) -> CodecInfo {
    let mut width = 0;
    let mut height = 0;
    let mut color = None;
    for child in find_ebml(data, ANY, true) {
        match child.id {
            ids::PIXEL_WIDTH => width = read_uint(&child.data) as u32,
            ids::PIXEL_HEIGHT => height = read_uint(&child.data) as u32,
            ids::COLOUR => color = Some(parse_colour(&child.data)),
            _ => {}
        }
    }
    CodecInfo::Video { width, height, color }
}

fn parse_colour(data: &Bytes) -> ColorInfo {
    let mut info = ColorInfo {
        primaries: 2,
        transfer: 2,
        matrix: 2,
        full_range: false,
    };
    for child in find_ebml(data, ANY, true) {
        let value = read_uint(&child.data) as u8;
        match child.id {
            ids::PRIMARIES => info.primaries = value,
            ids::TRANSFER_CHARACTERISTICS => info.transfer = value,
            ids::MATRIX_COEFFICIENTS => info.matrix = value,
            ids::RANGE => info.full_range = value == 2,
            _ => {}
        }
    }
    info
}

fn parse_audio(data: &Bytes) -> CodecInfo {
    let mut channels = 1;
    let mut sample_rate = 8000;
    let mut bit_depth = 16;
    for child in find_ebml(data, ANY, true) {
        match child.id {
            ids::SAMPLING_FREQUENCY => {
                if let Some(rate) = read_float(&child.data) {
                    sample_rate = rate.round() as u32;
                }
            }
            ids::CHANNELS => channels = read_uint(&child.data) as u16,
            ids::BIT_DEPTH => bit_depth = read_uint(&child.data) as u16,
            _ => {}
        }
    }
    CodecInfo::Audio {
        channels,
        sample_rate,
        bit_depth,
    }
}

impl Node for EbmlDemuxer {
    type Input = Bytes;
    type Output = DemuxData;

    fn push(&mut self, chunk: Bytes) -> Result<Vec<DemuxData>> {
        let data = self.leftover.merge(chunk);
        let mut out = Vec::new();
        let mut pos = 0;

        if self.state == State::Header {
            match self.parse_header(&data)? {
                Some(start) => {
                    pos = start;
                    self.state = State::Body;
                    self.leftover.save_last_byte(start);
                }
                None => {
                    self.leftover.save_leftover(&data);
                    return Ok(out);
                }
            }
        }

        if self.known_tracks && !self.initialized {
            self.initialized = true;
            out.push(DemuxData::init(self.info(), self.tracks.clone()));
        }

        self.walk(&data, pos, true, &mut out)?;
        self.leftover.save_leftover(&data);
        self.emit_frames(&mut out);
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<DemuxData>> {
        let data = self.leftover.take();
        let mut out = Vec::new();
        if self.state == State::Body && !data.is_empty() {
            self.walk(&data, 0, false, &mut out)?;
        }
        self.release_held();
        self.emit_frames(&mut out);
        self.leftover.clear();
        Ok(out)
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Probe for EbmlDemuxer {
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
