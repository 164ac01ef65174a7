//! Fragmented MP4 muxer: one init segment, then a `moof`+`mdat` per batch.

use super::boxes::FourCc;
use super::sample_entry::{handler_for_kind, put_stsd};
use super::writer::{
    box_header_len, put_box, put_box_header, put_dinf, put_empty_tables, put_ftyp, put_full_box, put_hdlr,
    put_mdhd, put_media_header, put_mfhd, put_mvhd, put_tfdt, put_tkhd, put_trex, tfhd_flags, trun_flags,
    NON_SYNC_SAMPLE_FLAGS, SYNC_SAMPLE_FLAGS,
};
use crate::error::Result;
use crate::pipeline::{DemuxData, Node};
use bytes::{BufMut, Bytes, BytesMut};
use streammux_common::{ContainerInfo, Frame, Rational, TimeUnit, Track, TrackKind};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct BmffMuxerOptions {
    /// `ftyp` major brand.
    pub major_brand: String,
    /// Media timescale of video tracks. Audio tracks use their sample rate.
    pub video_timescale: u32,
}

impl Default for BmffMuxerOptions {
    fn default() -> Self {
        Self {
            major_brand: "iso6".to_string(),
            video_timescale: 90_000,
        }
    }
}

impl BmffMuxerOptions {
    fn brand(&self) -> FourCc {
        let mut brand = *b"    ";
        for (slot, b) in brand.iter_mut().zip(self.major_brand.bytes()) {
            *slot = b;
        }
        brand
    }
}

#[derive(Debug, Clone)]
struct OutputTrack {
    source: u32,
    id: u32,
    track: Track,
    timescale: u32,
    /// Decode time of the next sample; unset until the first one arrives.
    decode_time: Option<u64>,
}

impl OutputTrack {
    fn scale(&self) -> Rational {
        Rational::new(1, self.timescale as i64)
    }
}

/// One sample laid out for a `trun`.
#[derive(Debug, Clone, Copy)]
struct Sample {
    duration: u32,
    size: u32,
    flags: u32,
    composition_offset: i32,
}

/// Samples of one track within a fragment.
#[derive(Debug)]
struct Run {
    track_id: u32,
    base_decode_time: u64,
    samples: Vec<Sample>,
    data: Vec<Bytes>,
}

impl Run {
    fn data_len(&self) -> usize {
        self.data.iter().map(Bytes::len).sum()
    }
}

/// Fragmented MP4 muxer.
///
/// Emits `ftyp`+`moov` once the track list is known, then turns every
/// pushed frames batch into one `moof`+`mdat` pair. Tracks are numbered
/// from 1 in the order they were announced.
#[derive(Debug)]
pub struct BmffMuxer {
    options: BmffMuxerOptions,
    info: Option<ContainerInfo>,
    tracks: Vec<OutputTrack>,
    init_written: bool,
    sequence: u32,
    pending: Vec<Frame>,
}

impl Default for BmffMuxer {
    fn default() -> Self {
        Self::new(BmffMuxerOptions::default())
    }
}

impl BmffMuxer {
    pub fn new(options: BmffMuxerOptions) -> Self {
        Self {
            options,
            info: None,
            tracks: Vec::new(),
            init_written: false,
            sequence: 0,
            pending: Vec::new(),
        }
    }

    fn set_tracks(&mut self, tracks: Vec<Track>) {
        self.tracks = tracks
            .into_iter()
            .enumerate()
            .map(|(i, track)| {
                let timescale = match track.kind {
                    TrackKind::Audio => track.sample_rate().filter(|r| *r > 0).unwrap_or(48_000),
                    TrackKind::Video => self.options.video_timescale.max(1),
                    _ => 1000,
                };
                OutputTrack {
                    source: track.number,
                    id: i as u32 + 1,
                    track,
                    timescale,
                    decode_time: None,
                }
            })
            .collect();
    }

    fn write_init(&self) -> Result<Bytes> {
        let mut moov_body = BytesMut::new();
        let duration_ms = self
            .info
            .as_ref()
            .and_then(|i| i.duration)
            .map_or(0, |d| d.get(TimeUnit::Milliseconds).round().max(0) as u64);
        put_mvhd(&mut moov_body, 1000, duration_ms, self.tracks.len() as u32 + 1);
        for out in &self.tracks {
            write_trak(&mut moov_body, out)?;
        }
        put_box(&mut moov_body, b"mvex", |b| {
            for out in &self.tracks {
                put_trex(b, out.id);
            }
        });

        let mut buf = BytesMut::new();
        let brand = self.options.brand();
        put_ftyp(&mut buf, &brand, &[brand, *b"iso6", *b"mp41"]);
        put_box(&mut buf, b"moov", |b| b.put_slice(&moov_body));
        Ok(buf.freeze())
    }

    /// Group pending frames into one run per track, in announcement order.
    fn build_runs(&mut self) -> Vec<Run> {
        let frames = std::mem::take(&mut self.pending);
        let mut runs = Vec::new();
        for out in &mut self.tracks {
            let scale = out.scale();
            let mut run: Option<Run> = None;
            for frame in frames.iter().filter(|f| f.track_number == out.source) {
                let pts = frame.timestamp.ticks(scale);
                let dts = *out.decode_time.get_or_insert(pts.max(0) as u64);
                let duration = frame.duration.ticks(scale).clamp(0, u32::MAX as i64) as u32;
                let run = run.get_or_insert_with(|| Run {
                    track_id: out.id,
                    base_decode_time: dts,
                    samples: Vec::new(),
                    data: Vec::new(),
                });
                run.samples.push(Sample {
                    duration,
                    size: frame.data.len() as u32,
                    flags: if frame.keyframe { SYNC_SAMPLE_FLAGS } else { NON_SYNC_SAMPLE_FLAGS },
                    composition_offset: (pts - dts as i64).clamp(i32::MIN as i64, i32::MAX as i64) as i32,
                });
                run.data.push(frame.data.clone());
                out.decode_time = Some(dts + duration as u64);
            }
            runs.extend(run);
        }
        let known = runs.iter().map(|r| r.samples.len()).sum::<usize>();
        if known < frames.len() {
            trace!(dropped = frames.len() - known, "Frames for unknown tracks");
        }
        runs
    }

    fn write_fragment(&mut self) -> Option<Bytes> {
        let runs = self.build_runs();
        if runs.is_empty() {
            return None;
        }
        self.sequence += 1;
        let data_len: usize = runs.iter().map(Run::data_len).sum();
        let mdat_header = box_header_len(data_len as u64);

        // data offsets depend on the moof size, which they do not change
        let sizing = put_moof(self.sequence, &runs, &vec![0; runs.len()]);
        let mut offsets = Vec::with_capacity(runs.len());
        let mut at = sizing.len() + mdat_header;
        for run in &runs {
            offsets.push(at as i32);
            at += run.data_len();
        }

        let mut buf = BytesMut::with_capacity(at);
        buf.put_slice(&put_moof(self.sequence, &runs, &offsets));
        put_box_header(&mut buf, b"mdat", data_len as u64);
        for run in &runs {
            for data in &run.data {
                buf.put_slice(data);
            }
        }
        trace!(sequence = self.sequence, tracks = runs.len(), bytes = buf.len(), "Fragment written");
        Some(buf.freeze())
    }

    fn start(&mut self, out: &mut Vec<Bytes>) -> Result<()> {
        if self.init_written || self.tracks.is_empty() {
            return Ok(());
        }
        out.push(self.write_init()?);
        self.init_written = true;
        debug!(tracks = self.tracks.len(), "MP4 init segment written");
        Ok(())
    }
}

fn write_trak(buf: &mut BytesMut, out: &OutputTrack) -> Result<()> {
    let track = &out.track;
    let (handler, name) = handler_for_kind(track.kind);
    let (width, height) = track.dimensions().unwrap_or((0, 0));
    let mut stbl = BytesMut::new();
    put_stsd(&mut stbl, track)?;
    put_empty_tables(&mut stbl);

    put_box(buf, b"trak", |t| {
        put_tkhd(t, out.id, 0, track.is_audio(), width, height);
        put_box(t, b"mdia", |m| {
            put_mdhd(m, out.timescale, 0, track.language.as_deref());
            put_hdlr(m, handler, name);
            put_box(m, b"minf", |i| {
                put_media_header(i, handler);
                put_dinf(i);
                put_box(i, b"stbl", |s| s.put_slice(&stbl));
            });
        });
    });
    Ok(())
}

fn uniform<T: PartialEq + Copy>(samples: &[Sample], field: impl Fn(&Sample) -> T) -> Option<T> {
    let first = field(samples.first()?);
    samples.iter().all(|s| field(s) == first).then_some(first)
}

fn put_moof(sequence: u32, runs: &[Run], data_offsets: &[i32]) -> BytesMut {
    let mut buf = BytesMut::new();
    put_box(&mut buf, b"moof", |m| {
        put_mfhd(m, sequence);
        for (run, data_offset) in runs.iter().zip(data_offsets) {
            put_box(m, b"traf", |t| put_traf(t, run, *data_offset));
        }
    });
    buf
}

fn put_traf(buf: &mut BytesMut, run: &Run, data_offset: i32) {
    let duration = uniform(&run.samples, |s| s.duration);
    let size = uniform(&run.samples, |s| s.size);
    let flags = uniform(&run.samples, |s| s.flags);
    let with_offsets = run.samples.iter().any(|s| s.composition_offset != 0);

    let mut tfhd = tfhd_flags::DEFAULT_BASE_IS_MOOF;
    if duration.is_some() {
        tfhd |= tfhd_flags::DEFAULT_DURATION;
    }
    if size.is_some() {
        tfhd |= tfhd_flags::DEFAULT_SIZE;
    }
    if flags.is_some() {
        tfhd |= tfhd_flags::DEFAULT_FLAGS;
    }
    put_full_box(buf, b"tfhd", 0, tfhd, |b| {
        b.put_u32(run.track_id);
        [duration, size, flags].into_iter().flatten().for_each(|v| b.put_u32(v));
    });
    put_tfdt(buf, run.base_decode_time);

    let mut trun = trun_flags::DATA_OFFSET;
    if duration.is_none() {
        trun |= trun_flags::DURATION;
    }
    if size.is_none() {
        trun |= trun_flags::SIZE;
    }
    if flags.is_none() {
        trun |= trun_flags::FLAGS;
    }
    if with_offsets {
        trun |= trun_flags::COMPOSITION_OFFSET;
    }
    put_full_box(buf, b"trun", 1, trun, |b| {
        b.put_u32(run.samples.len() as u32);
        b.put_i32(data_offset);
        for s in &run.samples {
            if duration.is_none() {
                b.put_u32(s.duration);
            }
            if size.is_none() {
                b.put_u32(s.size);
            }
            if flags.is_none() {
                b.put_u32(s.flags);
            }
            if with_offsets {
                b.put_i32(s.composition_offset);
            }
        }
    });
}

impl Node for BmffMuxer {
    type Input = DemuxData;
    type Output = Bytes;

    fn push(&mut self, data: DemuxData) -> Result<Vec<Bytes>> {
        if let Some(info) = data.info {
            self.info = Some(info);
        }
        if let Some(tracks) = data.tracks {
            if self.init_written {
                debug!("Ignoring track list received after the init segment");
            } else {
                self.set_tracks(tracks);
            }
        }
        self.pending.extend(data.frames);

        let mut out = Vec::new();
        self.start(&mut out)?;
        if self.init_written {
            out.extend(self.write_fragment());
        }
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<Bytes>> {
        let mut out = Vec::new();
        self.start(&mut out)?;
        if self.init_written {
            out.extend(self.write_fragment());
        } else if !self.pending.is_empty() {
            debug!(frames = self.pending.len(), "Dropping frames without a track list");
            self.pending.clear();
        }
        Ok(out)
    }

    fn reset(&mut self) {
        *self = Self::new(self.options.clone());
    }
}

/// Whether `codec` can be described in a fragmented MP4 sample entry.
pub fn supports_codec(codec: &str) -> bool {
    let family = codec.split('.').next().unwrap_or(codec);
    super::sample_entry::WRITABLE_FAMILIES.contains(&family)
}
