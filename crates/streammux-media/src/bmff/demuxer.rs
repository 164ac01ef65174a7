//! Incremental ISO BMFF demuxer for progressive and fragmented MP4.

use super::boxes::{children, find_first, find_named_box, fourcc_str, full_box_header, read_box_header, BoxMatcher, Reader};
use super::frame_table::{build_frame_table, FrameEntry, SampleTables};
use super::sample_entry::{kind_for_handler, parse_stsd};
use super::writer::{tfhd_flags, trun_flags, unpack_language};
use crate::error::{Error, Result};
use crate::pipeline::{DemuxData, Leftover, Node, Probe, ProbeResult};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use streammux_common::{CodecInfo, ContainerInfo, Frame, Rational, Time, Track, TrackKind};
use tracing::{debug, trace, warn};

const TKHD: &[BoxMatcher] = &[BoxMatcher::Type(*b"tkhd")];
const MDHD: &[BoxMatcher] = &[BoxMatcher::Type(*b"mdia"), BoxMatcher::Type(*b"mdhd")];
const HDLR: &[BoxMatcher] = &[BoxMatcher::Type(*b"mdia"), BoxMatcher::Type(*b"hdlr")];
const STBL: &[BoxMatcher] = &[
    BoxMatcher::Type(*b"mdia"),
    BoxMatcher::Type(*b"minf"),
    BoxMatcher::Type(*b"stbl"),
];

/// `sample_is_non_sync_sample` in sample flags.
const NON_SYNC: u32 = 0x0001_0000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TrexDefaults {
    duration: u32,
    size: u32,
    flags: u32,
}

#[derive(Debug, Clone)]
struct TrackContext {
    track: Track,
    defaults: TrexDefaults,
    /// Decode time the next fragment starts at when it has no `tfdt`.
    next_decode_time: u64,
}

/// A sample whose bytes have not been emitted yet. Offsets are absolute.
#[derive(Debug, Clone, Copy)]
struct PendingFrame {
    track: u32,
    entry: FrameEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// At a top-level box boundary.
    Boxes,
    /// Inside an mdat payload ending at this absolute offset (`None` runs to
    /// the end of the stream).
    Mdat { end: Option<u64> },
}

/// Everything a complete `moov` describes.
#[derive(Debug, Default)]
struct Movie {
    info: ContainerInfo,
    tracks: Vec<TrackContext>,
    fragmented: bool,
    frames: Vec<PendingFrame>,
}

/// MP4 demuxer.
///
/// Progressive files need `moov` ahead of `mdat`: every sample table is
/// joined up front and samples are emitted in file order as soon as their
/// bytes are buffered. Fragmented files describe samples per `moof` and are
/// read from the `mdat` that follows it.
#[derive(Debug)]
pub struct BmffDemuxer {
    leftover: Leftover,
    state: State,
    info: ContainerInfo,
    tracks: Vec<TrackContext>,
    fragmented: bool,
    initialized: bool,
    pending: VecDeque<PendingFrame>,
}

impl Default for BmffDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl BmffDemuxer {
    pub fn new() -> Self {
        Self {
            leftover: Leftover::new(),
            state: State::Boxes,
            info: ContainerInfo::default(),
            tracks: Vec::new(),
            fragmented: false,
            initialized: false,
            pending: VecDeque::new(),
        }
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.tracks.iter().map(|t| t.track.clone()).collect()
    }

    pub fn is_fragmented(&self) -> bool {
        self.fragmented
    }

    fn handle_moov(&mut self, moov: &Bytes, out: &mut Vec<DemuxData>) -> Result<()> {
        if self.initialized {
            debug!("Ignoring additional moov");
            return Ok(());
        }
        let movie = parse_movie(moov)?;
        debug!(
            tracks = movie.tracks.len(),
            fragmented = movie.fragmented,
            samples = movie.frames.len(),
            "MP4 movie parsed"
        );
        self.info = movie.info;
        self.tracks = movie.tracks;
        self.fragmented = movie.fragmented;
        self.pending = movie.frames.into();
        self.initialized = true;
        out.push(DemuxData::init(self.info.clone(), self.tracks()));
        Ok(())
    }

    fn handle_moof(&mut self, moof: &Bytes, moof_start: u64) -> Result<()> {
        let mut sequence = 0;
        let mut data_end = moof_start;
        let mut added = Vec::new();
        for child in children(moof) {
            match &child.box_type {
                b"mfhd" => sequence = Reader::new(child.data.get(4..).unwrap_or_default()).u32()?,
                b"traf" => data_end = self.parse_traf(&child.data, moof_start, data_end, &mut added)?,
                _ => {}
            }
        }
        trace!(sequence, samples = added.len(), "Fragment parsed");
        self.pending.extend(added);
        self.pending.make_contiguous().sort_by_key(|p| p.entry.byte_start);
        Ok(())
    }

    /// Queue the samples of one `traf`; returns the end of its data.
    fn parse_traf(&mut self, traf: &Bytes, moof_start: u64, prev_end: u64, added: &mut Vec<PendingFrame>) -> Result<u64> {
        let tfhd = children(traf)
            .find(|c| &c.box_type == b"tfhd")
            .ok_or_else(|| Error::invalid("traf without tfhd"))?;
        let (_, flags) = full_box_header(&tfhd.data)?;
        let mut r = Reader::new(&tfhd.data[4..]);
        let track_id = r.u32()?;
        let base = if flags & tfhd_flags::BASE_DATA_OFFSET != 0 {
            r.u64()?
        } else if flags & tfhd_flags::DEFAULT_BASE_IS_MOOF != 0 {
            moof_start
        } else {
            prev_end
        };
        if flags & tfhd_flags::SAMPLE_DESCRIPTION_INDEX != 0 {
            r.u32()?;
        }
        let Some(ctx) = self.tracks.iter_mut().find(|t| t.track.number == track_id) else {
            trace!(track = track_id, "Fragment for unknown track");
            return Ok(prev_end);
        };
        let mut defaults = ctx.defaults;
        if flags & tfhd_flags::DEFAULT_DURATION != 0 {
            defaults.duration = r.u32()?;
        }
        if flags & tfhd_flags::DEFAULT_SIZE != 0 {
            defaults.size = r.u32()?;
        }
        if flags & tfhd_flags::DEFAULT_FLAGS != 0 {
            defaults.flags = r.u32()?;
        }

        let mut decode_time = ctx.next_decode_time;
        let mut cursor = base;
        for child in children(traf) {
            match &child.box_type {
                b"tfdt" => {
                    let (version, _) = full_box_header(&child.data)?;
                    decode_time = Reader::new(&child.data[4..]).versioned(version)?;
                }
                b"trun" => {
                    let (version, tf) = full_box_header(&child.data)?;
                    let mut r = Reader::new(&child.data[4..]);
                    let count = r.u32()?;
                    if tf & trun_flags::DATA_OFFSET != 0 {
                        let offset = r.i32()? as i64;
                        cursor = base
                            .checked_add_signed(offset)
                            .ok_or_else(|| Error::invalid("trun data offset before stream start"))?;
                    }
                    let first_flags = if tf & trun_flags::FIRST_SAMPLE_FLAGS != 0 {
                        Some(r.u32()?)
                    } else {
                        None
                    };
                    for i in 0..count {
                        let duration = if tf & trun_flags::DURATION != 0 { r.u32()? } else { defaults.duration };
                        let size = if tf & trun_flags::SIZE != 0 { r.u32()? } else { defaults.size };
                        let per_sample = if tf & trun_flags::FLAGS != 0 { Some(r.u32()?) } else { None };
                        let sample_flags = if i == 0 { first_flags.or(per_sample) } else { per_sample };
                        let sample_flags = sample_flags.unwrap_or(defaults.flags);
                        let offset = match (tf & trun_flags::COMPOSITION_OFFSET != 0, version) {
                            (false, _) => 0,
                            (true, 0) => r.u32()? as i64,
                            (true, _) => r.i32()? as i64,
                        };
                        added.push(PendingFrame {
                            track: track_id,
                            entry: FrameEntry {
                                byte_start: cursor,
                                byte_end: cursor + size as u64,
                                keyframe: sample_flags & NON_SYNC == 0,
                                timestamp: decode_time as i64 + offset,
                                decode_time,
                                duration,
                            },
                        });
                        cursor += size as u64;
                        decode_time += duration as u64;
                    }
                }
                _ => {}
            }
        }
        ctx.next_decode_time = decode_time;
        Ok(cursor)
    }

    fn make_frame(&self, pending: &PendingFrame, data: Bytes) -> Option<Frame> {
        let ctx = self.tracks.iter().find(|t| t.track.number == pending.track)?;
        let scale = ctx.track.timescale;
        let entry = &pending.entry;
        Some(
            Frame::new(pending.track, Time::from_ticks(entry.timestamp, scale), data)
                .with_duration(Time::from_ticks(entry.duration as i64, scale))
                .with_keyframe(entry.keyframe),
        )
    }

    /// Emit every queued sample of the current mdat that is fully buffered,
    /// then consume up to the next sample still missing. Returns the new
    /// position, which may lie past the end of `data`.
    fn read_mdat(&mut self, data: &Bytes, pos: usize, end: Option<u64>, frames: &mut Vec<Frame>) -> usize {
        let base = self.leftover.absolute_offset();
        let here = base + pos as u64;
        let buffered = base + data.len() as u64;

        let mut stale = 0;
        while self.pending.front().is_some_and(|p| p.entry.byte_start < here) {
            self.pending.pop_front();
            stale += 1;
        }
        if stale > 0 {
            warn!(count = stale, "Dropping samples located before the current mdat position");
        }

        while let Some(p) = self.pending.front().copied() {
            if end.is_some_and(|e| p.entry.byte_start >= e) || p.entry.byte_end > buffered {
                break;
            }
            self.pending.pop_front();
            let slice = data.slice((p.entry.byte_start - base) as usize..(p.entry.byte_end - base) as usize);
            if let Some(frame) = self.make_frame(&p, slice) {
                frames.push(frame);
            }
        }

        let target = match (self.pending.front(), end) {
            (Some(p), Some(e)) => p.entry.byte_start.min(e),
            (Some(p), None) => p.entry.byte_start,
            (None, Some(e)) => e,
            (None, None) => buffered,
        };
        if end == Some(target) {
            self.state = State::Boxes;
        }
        (target - base) as usize
    }
}

fn parse_movie(moov: &Bytes) -> Result<Movie> {
    let mut movie_timescale = 1000u32;
    let mut duration = 0u64;
    let mut fragment_duration = None;
    let mut traks = Vec::new();
    let mut trex = HashMap::new();
    let mut fragmented = false;

    for child in children(moov) {
        match &child.box_type {
            b"mvhd" => {
                let (version, _) = full_box_header(&child.data)?;
                let mut r = Reader::new(&child.data[4..]);
                r.versioned(version)?;
                r.versioned(version)?;
                movie_timescale = r.u32()?;
                duration = r.versioned(version)?;
            }
            b"trak" => traks.push(child.data),
            b"mvex" => {
                fragmented = true;
                for ext in children(&child.data) {
                    let (version, _) = full_box_header(&ext.data)?;
                    let mut r = Reader::new(&ext.data[4..]);
                    match &ext.box_type {
                        b"trex" => {
                            let track_id = r.u32()?;
                            r.u32()?;
                            let defaults = TrexDefaults {
                                duration: r.u32()?,
                                size: r.u32()?,
                                flags: r.u32()?,
                            };
                            trex.insert(track_id, defaults);
                        }
                        b"mehd" => fragment_duration = Some(r.versioned(version)?),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    let scale = Rational::new(1, movie_timescale.max(1) as i64);
    let duration = [Some(duration), fragment_duration]
        .into_iter()
        .flatten()
        .find(|d| *d != 0 && *d != u32::MAX as u64 && *d != u64::MAX);
    let mut info = ContainerInfo::new(scale);
    if let Some(ticks) = duration {
        info = info.with_duration(Time::from_ticks(ticks as i64, scale));
    }

    let mut tracks = Vec::new();
    let mut frames = Vec::new();
    for trak in &traks {
        let Some((track, entries)) = parse_trak(trak)? else {
            continue;
        };
        frames.extend(entries.into_iter().map(|entry| PendingFrame {
            track: track.number,
            entry,
        }));
        tracks.push(TrackContext {
            defaults: trex.get(&track.number).copied().unwrap_or_default(),
            track,
            next_decode_time: 0,
        });
    }
    frames.sort_by_key(|p| p.entry.byte_start);

    Ok(Movie {
        info,
        tracks,
        fragmented,
        frames,
    })
}

fn parse_trak(trak: &Bytes) -> Result<Option<(Track, Vec<FrameEntry>)>> {
    let Some(tkhd) = find_first(trak, TKHD) else {
        warn!("Skipping trak without tkhd");
        return Ok(None);
    };
    let (version, _) = full_box_header(&tkhd.data)?;
    let mut r = Reader::new(&tkhd.data[4..]);
    r.versioned(version)?;
    r.versioned(version)?;
    let track_id = r.u32()?;
    r.skip(4)?;
    r.versioned(version)?;
    r.skip(8 + 8 + 36)?;
    let tkhd_width = r.u32()? >> 16;
    let tkhd_height = r.u32()? >> 16;

    let Some(mdhd) = find_first(trak, MDHD) else {
        warn!(track = track_id, "Skipping trak without mdhd");
        return Ok(None);
    };
    let (version, _) = full_box_header(&mdhd.data)?;
    let mut r = Reader::new(&mdhd.data[4..]);
    r.versioned(version)?;
    r.versioned(version)?;
    let timescale = r.u32()?;
    r.versioned(version)?;
    let language = unpack_language(r.u16()?);

    let handler = find_first(trak, HDLR)
        .and_then(|h| h.data.get(8..12).map(|t| [t[0], t[1], t[2], t[3]]))
        .unwrap_or(*b"    ");
    let kind = kind_for_handler(&handler);
    if kind == TrackKind::Other {
        debug!(track = track_id, handler = %fourcc_str(&handler), "Skipping track with unhandled handler");
        return Ok(None);
    }

    let Some(stbl) = find_first(trak, STBL) else {
        warn!(track = track_id, "Skipping trak without stbl");
        return Ok(None);
    };
    let Some(stsd) = children(&stbl.data).find(|c| &c.box_type == b"stsd") else {
        warn!(track = track_id, "Skipping trak without stsd");
        return Ok(None);
    };
    let Some(entry) = parse_stsd(&stsd.data, kind)? else {
        warn!(track = track_id, "Skipping trak with empty stsd");
        return Ok(None);
    };

    let mut track = Track::new(track_id, kind, entry.codec)
        .with_timescale(Rational::new(1, timescale.max(1) as i64))
        .with_codec_private(entry.codec_private);
    track.info = match entry.info {
        CodecInfo::Video { width: 0, height: 0, color } => CodecInfo::Video {
            width: tkhd_width,
            height: tkhd_height,
            color,
        },
        info => info,
    };
    track.language = language;

    let tables = SampleTables::parse(&stbl.data)?;
    let entries = if tables.sample_count == 0 {
        Vec::new()
    } else {
        build_frame_table(&tables)?
    };
    Ok(Some((track, entries)))
}

impl Node for BmffDemuxer {
    type Input = Bytes;
    type Output = DemuxData;

    fn push(&mut self, chunk: Bytes) -> Result<Vec<DemuxData>> {
        let data = self.leftover.merge(chunk);
        let base = self.leftover.absolute_offset();
        let mut out = Vec::new();
        let mut frames = Vec::new();
        let mut pos = 0usize;

        while pos < data.len() {
            if let State::Mdat { end } = self.state {
                pos = self.read_mdat(&data, pos, end, &mut frames);
                self.leftover.save_last_byte(pos);
                if self.state == State::Boxes {
                    continue;
                }
                break;
            }

            let Some(header) = read_box_header(&data[pos..])? else {
                break;
            };
            let start = pos;
            if &header.box_type == b"mdat" {
                if !self.initialized {
                    warn!("mdat before moov; its samples cannot be located");
                }
                pos += header.header_len;
                self.leftover.save_last_byte(pos);
                self.state = State::Mdat {
                    end: header.size.map(|s| base + start as u64 + s),
                };
                continue;
            }

            let Some(size) = header.size else {
                // runs to the end of the stream; parsed on flush
                break;
            };
            let end = start.saturating_add(size as usize);
            if end > data.len() {
                if !matches!(&header.box_type, b"moov" | b"moof") {
                    trace!(box_type = %fourcc_str(&header.box_type), size, "Skipping partially buffered box");
                    self.leftover.save_last_byte(end);
                }
                break;
            }
            let payload = data.slice(start + header.header_len..end);
            match &header.box_type {
                b"moov" => self.handle_moov(&payload, &mut out)?,
                b"moof" => {
                    if let Err(e) = self.handle_moof(&payload, base + start as u64) {
                        warn!(error = %e, "Skipping malformed moof");
                    }
                }
                other => trace!(box_type = %fourcc_str(other), size, "Skipping top-level box"),
            }
            pos = end;
            self.leftover.save_last_byte(pos);
        }

        self.leftover.save_leftover(&data);
        if self.initialized && !frames.is_empty() {
            out.push(DemuxData::frames(frames));
        }
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<DemuxData>> {
        let mut out = Vec::new();
        let data = self.leftover.take();
        if self.state == State::Boxes {
            if let Ok(Some(header)) = read_box_header(&data) {
                if header.size.is_none() && &header.box_type == b"moov" {
                    self.handle_moov(&data.slice(header.header_len..), &mut out)?;
                }
            }
        }
        if !self.pending.is_empty() {
            warn!(count = self.pending.len(), "Dropping samples cut off by end of stream");
            self.pending.clear();
        }
        self.leftover.clear();
        self.state = State::Boxes;
        Ok(out)
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Probe for BmffDemuxer {
    fn probe(data: &[u8]) -> Option<ProbeResult> {
        let data = Bytes::copy_from_slice(data);
        let moov = find_named_box(&data, b"moov")?;
        let movie = parse_movie(&moov.data).ok()?;
        Some(ProbeResult {
            info: movie.info,
            tracks: movie.tracks.into_iter().map(|t| t.track).collect(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bmff::sample_entry::{handler_for_kind, put_stsd};
    use crate::bmff::writer::*;
    use bytes::{BufMut, BytesMut};
    use streammux_common::TimeUnit;

    struct TestTrack {
        track: Track,
        /// (chunk offsets relative to mdat payload, samples per chunk)
        chunks: Vec<(u64, u32)>,
        sizes: Vec<u32>,
        delta: u32,
        sync: Vec<u32>,
    }

    fn put_trak(buf: &mut BytesMut, t: &TestTrack, mdat_payload: u64) {
        let (handler, name) = handler_for_kind(t.track.kind);
        let (w, h) = t.track.dimensions().unwrap_or((0, 0));
        let timescale = t.track.timescale.recip().map_or(1000, |r| r.round() as u32);
        put_box(buf, b"trak", |b| {
            put_tkhd(b, t.track.number, 0, t.track.is_audio(), w, h);
            put_box(b, b"mdia", |m| {
                put_mdhd(m, timescale, 0, t.track.language.as_deref());
                put_hdlr(m, handler, name);
                put_box(m, b"minf", |i| {
                    put_media_header(i, handler);
                    put_dinf(i);
                    put_box(i, b"stbl", |s| {
                        put_stsd(s, &t.track).unwrap();
                        put_full_box(s, b"stts", 0, 0, |x| {
                            x.put_u32(1);
                            x.put_u32(t.sizes.len() as u32);
                            x.put_u32(t.delta);
                        });
                        if !t.sync.is_empty() {
                            put_full_box(s, b"stss", 0, 0, |x| {
                                x.put_u32(t.sync.len() as u32);
                                t.sync.iter().for_each(|n| x.put_u32(*n));
                            });
                        }
                        put_full_box(s, b"stsc", 0, 0, |x| {
                            x.put_u32(t.chunks.len() as u32);
                            for (i, (_, per_chunk)) in t.chunks.iter().enumerate() {
                                x.put_u32(i as u32 + 1);
                                x.put_u32(*per_chunk);
                                x.put_u32(1);
                            }
                        });
                        put_full_box(s, b"stsz", 0, 0, |x| {
                            x.put_u32(0);
                            x.put_u32(t.sizes.len() as u32);
                            t.sizes.iter().for_each(|n| x.put_u32(*n));
                        });
                        put_full_box(s, b"stco", 0, 0, |x| {
                            x.put_u32(t.chunks.len() as u32);
                            t.chunks.iter().for_each(|(o, _)| x.put_u32((mdat_payload + o) as u32));
                        });
                    });
                });
            });
        });
    }

    fn put_moov(buf: &mut BytesMut, tracks: &[TestTrack], mdat_payload: u64) {
        put_box(buf, b"moov", |b| {
            put_mvhd(b, 1000, 2000, tracks.len() as u32 + 1);
            tracks.iter().for_each(|t| put_trak(b, t, mdat_payload));
        });
    }

    fn test_tracks() -> Vec<TestTrack> {
        let video = Track::video(1, "vp09.00.10.08", 64, 48).with_timescale(Rational::new(1, 90_000));
        let mut audio = Track::audio(2, "mp4a.40.2", 2, 48_000).with_codec_private(Bytes::from_static(&[0x11, 0x90]));
        audio.language = Some("eng".into());
        vec![
            TestTrack {
                track: video,
                chunks: vec![(0, 2), (42, 1)],
                sizes: vec![10, 12, 8],
                delta: 3000,
                sync: vec![1, 3],
            },
            TestTrack {
                track: audio,
                chunks: vec![(22, 4)],
                sizes: vec![5, 5, 5, 5],
                delta: 1024,
                sync: vec![],
            },
        ]
    }

    /// ftyp, moov, then one mdat with video samples 0-1, four audio samples
    /// and video sample 2.
    pub(crate) fn progressive_file() -> Bytes {
        let tracks = test_tracks();
        let mut ftyp = BytesMut::new();
        put_ftyp(&mut ftyp, b"isom", &[*b"isom", *b"mp41"]);
        let mut probe = BytesMut::new();
        put_moov(&mut probe, &tracks, 0);
        let mdat_payload = (ftyp.len() + probe.len() + 8) as u64;

        let mut buf = ftyp;
        put_moov(&mut buf, &tracks, mdat_payload);
        let payload: Vec<u8> = (0..50u8).collect();
        put_box(&mut buf, b"mdat", |b| b.put_slice(&payload));
        buf.freeze()
    }

    fn run(chunks: &[Bytes]) -> (Vec<Track>, Vec<Frame>) {
        let mut demuxer = BmffDemuxer::new();
        let mut tracks = Vec::new();
        let mut frames = Vec::new();
        let mut outputs = Vec::new();
        for chunk in chunks {
            outputs.extend(demuxer.push(chunk.clone()).unwrap());
        }
        outputs.extend(demuxer.flush().unwrap());
        for d in outputs {
            tracks.extend(d.tracks.unwrap_or_default());
            frames.extend(d.frames);
        }
        (tracks, frames)
    }

    #[test]
    fn test_progressive_tracks() {
        let (tracks, _) = run(&[progressive_file()]);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].codec, "vp09.00.10.08");
        assert_eq!(tracks[0].dimensions(), Some((64, 48)));
        assert_eq!(tracks[0].timescale, Rational::new(1, 90_000));
        assert_eq!(tracks[1].codec, "mp4a.40.2");
        assert_eq!(tracks[1].language.as_deref(), Some("eng"));
        assert_eq!(tracks[1].sample_rate(), Some(48_000));
    }

    #[test]
    fn test_progressive_frames_in_file_order() {
        let (_, frames) = run(&[progressive_file()]);
        let order: Vec<(u32, u8, usize)> = frames.iter().map(|f| (f.track_number, f.data[0], f.len())).collect();
        assert_eq!(
            order,
            vec![(1, 0, 10), (1, 10, 12), (2, 22, 5), (2, 27, 5), (2, 32, 5), (2, 37, 5), (1, 42, 8)]
        );
        let video: Vec<_> = frames.iter().filter(|f| f.track_number == 1).collect();
        assert_eq!(video[2].timestamp, Time::from_ticks(6000, Rational::new(1, 90_000)));
        assert_eq!(video[1].duration, Time::from_ticks(3000, Rational::new(1, 90_000)));
        let keys: Vec<bool> = video.iter().map(|f| f.keyframe).collect();
        assert_eq!(keys, vec![true, false, true]);
        let audio: Vec<_> = frames.iter().filter(|f| f.track_number == 2).collect();
        assert_eq!(audio[3].timestamp, Time::from_ticks(3072, Rational::new(1, 48_000)));
    }

    #[test]
    fn test_progressive_incremental_equivalence() {
        let data = progressive_file();
        let (tracks, expected) = run(&[data.clone()]);
        for split in [1, 9, 100, data.len() - 30, data.len() - 1] {
            let (t, frames) = run(&[data.slice(..split), data.slice(split..)]);
            assert_eq!(t, tracks, "split at {split}");
            assert_eq!(frames, expected, "split at {split}");
        }
        let bytes: Vec<Bytes> = (0..data.len()).map(|i| data.slice(i..i + 1)).collect();
        assert_eq!(run(&bytes).1, expected);
    }

    #[test]
    fn test_frames_emitted_once_buffered() {
        let data = progressive_file();
        let mdat_payload = data.len() - 50;
        let mut demuxer = BmffDemuxer::new();
        let out = demuxer.push(data.slice(..mdat_payload + 25)).unwrap();
        let frames: usize = out.iter().map(|d| d.frames.len()).sum();
        // both leading video samples and the first audio sample
        assert_eq!(frames, 3);
        let out = demuxer.push(data.slice(mdat_payload + 25..)).unwrap();
        assert_eq!(out.iter().map(|d| d.frames.len()).sum::<usize>(), 4);
    }

    #[test]
    fn test_probe_reads_moov() {
        let data = progressive_file();
        let result = BmffDemuxer::probe(&data).unwrap();
        assert_eq!(result.tracks.len(), 2);
        assert_eq!(result.info.duration, Some(Time::new(2, TimeUnit::Seconds)));
        assert!(BmffDemuxer::probe(&data[..100]).is_none());
    }

    #[test]
    fn test_truncated_stream_drops_missing_samples() {
        let data = progressive_file();
        let (_, frames) = run(&[data.slice(..data.len() - 10)]);
        assert_eq!(frames.len(), 6);
    }

    #[test]
    fn test_fragment_with_explicit_fields() {
        let track = Track::audio(1, "opus", 2, 48_000);
        let mut init = BytesMut::new();
        put_ftyp(&mut init, b"iso6", &[*b"iso6"]);
        put_box(&mut init, b"moov", |b| {
            put_mvhd(b, 1000, 0, 2);
            put_box(b, b"trak", |t| {
                put_tkhd(t, 1, 0, true, 0, 0);
                put_box(t, b"mdia", |m| {
                    put_mdhd(m, 48_000, 0, None);
                    put_hdlr(m, b"soun", "SoundHandler");
                    put_box(m, b"minf", |i| {
                        put_box(i, b"stbl", |s| {
                            put_stsd(s, &track).unwrap();
                            put_empty_tables(s);
                        });
                    });
                });
            });
            put_box(b, b"mvex", |x| put_trex(x, 1));
        });

        // moof with a base data offset and no default-base-is-moof
        let moof_start = init.len() as u64;
        let mut moof = BytesMut::new();
        put_box(&mut moof, b"moof", |m| {
            put_mfhd(m, 1);
            put_box(m, b"traf", |t| {
                put_full_box(t, b"tfhd", 0, tfhd_flags::BASE_DATA_OFFSET | tfhd_flags::DEFAULT_DURATION, |h| {
                    h.put_u32(1);
                    h.put_u64(0); // patched below
                    h.put_u32(960);
                });
                put_tfdt(t, 48_000);
                put_full_box(t, b"trun", 0, trun_flags::SIZE, |r| {
                    r.put_u32(2);
                    r.put_u32(3);
                    r.put_u32(4);
                });
            });
        });
        let mdat_payload = moof_start + moof.len() as u64 + 8;
        // tfhd base_data_offset sits after moof, mfhd, traf and tfhd headers
        let at = 8 + 16 + 8 + 12 + 4;
        moof[at..at + 8].copy_from_slice(&mdat_payload.to_be_bytes());

        let mut file = init;
        file.extend_from_slice(&moof);
        put_box(&mut file, b"mdat", |b| b.put_slice(b"abcdefg"));
        let file = file.freeze();
        let mut demuxer = BmffDemuxer::new();
        demuxer.push(file.clone()).unwrap();
        assert!(demuxer.is_fragmented());

        let (tracks, frames) = run(&[file]);
        assert_eq!(tracks[0].codec, "opus");
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].data[..], b"abc");
        assert_eq!(&frames[1].data[..], b"defg");
        assert_eq!(frames[0].timestamp, Time::new(1, TimeUnit::Seconds));
        assert_eq!(frames[1].timestamp, Time::from_ticks(48_960, Rational::new(1, 48_000)));
        assert!(frames.iter().all(|f| f.keyframe));
    }
}
