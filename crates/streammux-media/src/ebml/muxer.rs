//! Matroska / WebM muxer with keyframe-synchronised clusters.

use super::block::{encode_block, encode_simple_block, BlockFlags};
use super::codec_id;
use super::ids;
use super::writer::{put_element, put_float, put_master, put_string, put_uint, put_unknown_size_header};
use crate::error::{Error, Result};
use crate::pipeline::{DemuxData, Node};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use streammux_common::{CodecInfo, ContainerInfo, Frame, Time, TimeUnit, Track, TrackKind};
use tracing::{debug, trace, warn};

const APP_NAME: &str = "streammux";

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct EbmlMuxerOptions {
    /// Shortest cluster, in milliseconds, before a new one may open.
    pub min_cluster_duration_ms: u32,
    /// Forced DocType; chosen from the track codecs when unset.
    pub doc_type: Option<String>,
}

impl Default for EbmlMuxerOptions {
    fn default() -> Self {
        Self {
            min_cluster_duration_ms: 1000,
            doc_type: None,
        }
    }
}

#[derive(Debug)]
struct OpenCluster {
    timestamp_ms: i64,
    body: BytesMut,
}

#[derive(Debug, Clone, Copy)]
struct OutputTrack {
    number: u64,
    kind: TrackKind,
}

/// Matroska muxer.
///
/// Emits the EBML header, an unknown-size Segment, Info and Tracks once the
/// track list is known, then one known-size Cluster per output buffer. A
/// cluster is closed only after every track that has produced frames has
/// emitted a keyframe since it opened, so each cluster starts decodable.
#[derive(Debug)]
pub struct EbmlMuxer {
    options: EbmlMuxerOptions,
    info: Option<ContainerInfo>,
    tracks: Vec<Track>,
    mapping: HashMap<u32, OutputTrack>,
    /// Whether any output track is video; clusters then open on video keyframes.
    has_video: bool,
    header_written: bool,
    pending: Vec<Frame>,
    cluster: Option<OpenCluster>,
    keyframes_seen: HashMap<u64, bool>,
    /// Added to every timestamp; set from the first frame so a stream that
    /// starts below zero begins at cluster time 0.
    offset_ms: Option<i64>,
    /// Output completed by a call that then failed, returned by the next one.
    ready: Vec<Bytes>,
}

impl Default for EbmlMuxer {
    fn default() -> Self {
        Self::new(EbmlMuxerOptions::default())
    }
}

impl EbmlMuxer {
    pub fn new(options: EbmlMuxerOptions) -> Self {
        Self {
            options,
            info: None,
            tracks: Vec::new(),
            mapping: HashMap::new(),
            has_video: false,
            header_written: false,
            pending: Vec::new(),
            cluster: None,
            keyframes_seen: HashMap::new(),
            offset_ms: None,
            ready: Vec::new(),
        }
    }

    /// DocType written in the EBML header.
    pub fn doc_type(&self) -> String {
        if let Some(doc_type) = &self.options.doc_type {
            return doc_type.clone();
        }
        if !self.tracks.is_empty() && self.tracks.iter().all(|t| codec_id::is_webm_codec(&t.codec)) {
            "webm".to_string()
        } else {
            "matroska".to_string()
        }
    }

    fn set_tracks(&mut self, tracks: Vec<Track>) {
        self.mapping = tracks
            .iter()
            .enumerate()
            .map(|(i, t)| {
                (
                    t.number,
                    OutputTrack {
                        number: i as u64 + 1,
                        kind: t.kind,
                    },
                )
            })
            .collect();
        self.has_video = tracks.iter().any(Track::is_video);
        self.tracks = tracks;
    }

    fn write_header(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        let doc_type = self.doc_type();
        put_master(&mut buf, ids::EBML, |b| {
            put_uint(b, ids::EBML_VERSION, 1)?;
            put_uint(b, ids::EBML_READ_VERSION, 1)?;
            put_uint(b, ids::EBML_MAX_ID_LENGTH, 4)?;
            put_uint(b, ids::EBML_MAX_SIZE_LENGTH, 8)?;
            put_string(b, ids::DOC_TYPE, &doc_type)?;
            put_uint(b, ids::DOC_TYPE_VERSION, 4)?;
            put_uint(b, ids::DOC_TYPE_READ_VERSION, 2)
        })?;
        put_unknown_size_header(&mut buf, ids::SEGMENT);

        let duration = self.info.as_ref().and_then(|i| i.duration);
        put_master(&mut buf, ids::INFO, |b| {
            put_uint(b, ids::TIMESTAMP_SCALE, 1_000_000)?;
            put_string(b, ids::MUXING_APP, APP_NAME)?;
            put_string(b, ids::WRITING_APP, APP_NAME)?;
            if let Some(duration) = duration {
                put_float(b, ids::DURATION, duration.get(TimeUnit::Milliseconds).to_f64())?;
            }
            Ok(())
        })?;

        put_master(&mut buf, ids::TRACKS, |b| {
            for track in &self.tracks {
                let number = self.mapping.get(&track.number).map_or(1, |t| t.number);
                put_master(b, ids::TRACK_ENTRY, |t| write_track_entry(t, number, track))?;
            }
            Ok(())
        })?;
        debug!(doc_type = %doc_type, tracks = self.tracks.len(), "Wrote Matroska header");
        Ok(buf.freeze())
    }

    fn all_tracks_synced(&self) -> bool {
        self.keyframes_seen.values().all(|seen| *seen)
    }

    fn close_cluster(&mut self) -> Result<Option<Bytes>> {
        let Some(cluster) = self.cluster.take() else {
            return Ok(None);
        };
        let timestamp = u64::try_from(cluster.timestamp_ms)
            .map_err(|_| Error::invalid(format!("negative cluster timestamp {} ms", cluster.timestamp_ms)))?;
        let mut buf = BytesMut::with_capacity(cluster.body.len() + 16);
        put_master(&mut buf, ids::CLUSTER, |b| {
            put_uint(b, ids::TIMESTAMP, timestamp)?;
            b.extend_from_slice(&cluster.body);
            Ok(())
        })?;
        trace!(timestamp = cluster.timestamp_ms, bytes = buf.len(), "Closed cluster");
        Ok(Some(buf.freeze()))
    }

    fn open_cluster(&mut self, timestamp_ms: i64) {
        self.cluster = Some(OpenCluster {
            timestamp_ms,
            body: BytesMut::new(),
        });
        for seen in self.keyframes_seen.values_mut() {
            *seen = false;
        }
    }

    fn write_frame(&mut self, frame: Frame, out: &mut Vec<Bytes>) -> Result<()> {
        let Some(track) = self.mapping.get(&frame.track_number).copied() else {
            trace!(track = frame.track_number, "Dropping frame of unknown track");
            return Ok(());
        };
        let raw_ms = to_ms(frame.timestamp);
        let offset = *self.offset_ms.get_or_insert_with(|| {
            if raw_ms < 0 {
                debug!(shift_ms = -raw_ms, "Shifting timestamps to start at zero");
            }
            (-raw_ms).max(0)
        });
        let timestamp_ms = raw_ms + offset;
        let cut_candidate = frame.keyframe && (!self.has_video || track.kind == TrackKind::Video);

        // `None` opens a new cluster at this frame.
        let delta = match &self.cluster {
            None => None,
            Some(cluster) => {
                let delta = timestamp_ms - cluster.timestamp_ms;
                let long_enough = delta >= self.options.min_cluster_duration_ms as i64;
                let overflow = i16::try_from(delta).is_err();
                let cut = cut_candidate && (long_enough || overflow) && self.all_tracks_synced();
                if overflow && !cut {
                    return Err(Error::TimestampOverflow {
                        track: frame.track_number,
                        delta,
                    });
                }
                (!cut).then_some(delta)
            }
        };
        if delta.is_none() && timestamp_ms < 0 {
            return Err(Error::invalid(format!(
                "frame at {raw_ms} ms precedes the first frame by more than a cluster"
            )));
        }

        let timecode = delta.unwrap_or(0) as i16;
        let mut element = BytesMut::new();
        if track.kind == TrackKind::Subtitle {
            let block = encode_block(track.number, timecode, frame.invisible, &frame.data)?;
            let duration_ms = to_ms(frame.duration).max(0) as u64;
            put_master(&mut element, ids::BLOCK_GROUP, |b| {
                put_element(b, ids::BLOCK, &block)?;
                put_uint(b, ids::BLOCK_DURATION, duration_ms)
            })?;
        } else {
            let flags = BlockFlags {
                keyframe: frame.keyframe,
                invisible: frame.invisible,
                discardable: frame.discardable,
            };
            let block = encode_simple_block(track.number, timecode, flags, &frame.data)?;
            put_element(&mut element, ids::SIMPLE_BLOCK, &block)?;
        }

        if delta.is_none() {
            out.extend(self.close_cluster()?);
            self.open_cluster(timestamp_ms);
        }
        let Some(cluster) = self.cluster.as_mut() else {
            return Err(Error::Invariant("cluster must be open before writing a block"));
        };
        cluster.body.extend_from_slice(&element);
        let seen = self.keyframes_seen.entry(track.number).or_insert(false);
        *seen |= frame.keyframe;
        Ok(())
    }

    /// Write the queued frames in timestamp order. A frame that cannot be
    /// written is dropped; the ones after it stay queued.
    fn drain(&mut self, out: &mut Vec<Bytes>) -> Result<()> {
        self.pending.sort_by_key(|f| f.timestamp);
        let mut frames = std::mem::take(&mut self.pending).into_iter();
        while let Some(frame) = frames.next() {
            let track = frame.track_number;
            if let Err(err) = self.write_frame(frame, out) {
                warn!(track, error = %err, "Dropping frame the cluster cannot hold");
                self.pending.extend(frames);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Hand back `out`, or park it for the next call when `result` failed.
    fn finish_call(&mut self, mut out: Vec<Bytes>, result: Result<()>) -> Result<Vec<Bytes>> {
        match result {
            Ok(()) => Ok(out),
            Err(err) => {
                self.ready.append(&mut out);
                Err(err)
            }
        }
    }

    fn start(&mut self, out: &mut Vec<Bytes>) -> Result<()> {
        if !self.header_written && !self.tracks.is_empty() {
            out.push(self.write_header()?);
            self.header_written = true;
        }
        Ok(())
    }
}

fn to_ms(time: Time) -> i64 {
    time.get(TimeUnit::Milliseconds).round()
}

fn write_track_entry(buf: &mut BytesMut, number: u64, track: &Track) -> Result<()> {
    put_uint(buf, ids::TRACK_NUMBER, number)?;
    put_uint(buf, ids::TRACK_UID, number)?;
    let track_type = match track.kind {
        TrackKind::Video => ids::TRACK_TYPE_VIDEO,
        TrackKind::Audio => ids::TRACK_TYPE_AUDIO,
        TrackKind::Subtitle => ids::TRACK_TYPE_SUBTITLE,
        TrackKind::Other => return Err(Error::unsupported(format!("track {} of kind other", track.number))),
    };
    put_uint(buf, ids::TRACK_TYPE, track_type)?;
    put_uint(buf, ids::FLAG_LACING, 0)?;
    put_string(buf, ids::CODEC_ID, &codec_id::to_codec_id(&track.codec))?;
    let private = codec_id::codec_private(track);
    if !private.is_empty() {
        put_element(buf, ids::CODEC_PRIVATE, &private)?;
    }
    if let Some(duration) = track.default_duration {
        let ns = duration.get(TimeUnit::Nanoseconds).round();
        if ns > 0 {
            put_uint(buf, ids::DEFAULT_DURATION, ns as u64)?;
        }
    }
    if let Some(language) = &track.language {
        put_string(buf, ids::LANGUAGE, language)?;
    }
    match track.info {
        CodecInfo::Video { width, height, color } => put_master(buf, ids::VIDEO, |v| {
            put_uint(v, ids::PIXEL_WIDTH, width as u64)?;
            put_uint(v, ids::PIXEL_HEIGHT, height as u64)?;
            if let Some(color) = color {
                put_master(v, ids::COLOUR, |c| {
                    put_uint(c, ids::MATRIX_COEFFICIENTS, color.matrix as u64)?;
                    put_uint(c, ids::RANGE, if color.full_range { 2 } else { 1 })?;
                    put_uint(c, ids::TRANSFER_CHARACTERISTICS, color.transfer as u64)?;
                    put_uint(c, ids::PRIMARIES, color.primaries as u64)
                })?;
            }
            Ok(())
        }),
        CodecInfo::Audio {
            channels,
            sample_rate,
            bit_depth,
        } => put_master(buf, ids::AUDIO, |a| {
            put_float(a, ids::SAMPLING_FREQUENCY, sample_rate as f64)?;
            put_uint(a, ids::CHANNELS, channels as u64)?;
            put_uint(a, ids::BIT_DEPTH, bit_depth as u64)
        }),
        CodecInfo::None => Ok(()),
    }
}

impl Node for EbmlMuxer {
    type Input = DemuxData;
    type Output = Bytes;

    fn push(&mut self, data: DemuxData) -> Result<Vec<Bytes>> {
        if let Some(info) = data.info {
            self.info = Some(info);
        }
        if let Some(tracks) = data.tracks {
            if self.header_written {
                debug!("Ignoring track list received after the header was written");
            } else {
                self.set_tracks(tracks);
            }
        }
        self.pending.extend(data.frames);

        let mut out = std::mem::take(&mut self.ready);
        let mut result = self.start(&mut out);
        if result.is_ok() && self.header_written {
            result = self.drain(&mut out);
        }
        self.finish_call(out, result)
    }

    fn flush(&mut self) -> Result<Vec<Bytes>> {
        let mut out = std::mem::take(&mut self.ready);
        let mut result = self.start(&mut out);
        if result.is_ok() && self.header_written {
            result = self.drain(&mut out);
            if result.is_ok() {
                match self.close_cluster() {
                    Ok(cluster) => out.extend(cluster),
                    Err(err) => result = Err(err),
                }
            }
        } else if !self.pending.is_empty() {
            debug!(frames = self.pending.len(), "Dropping frames without a track list");
            self.pending.clear();
        }
        self.finish_call(out, result)
    }

    fn reset(&mut self) {
        *self = Self::new(self.options.clone());
    }
}
