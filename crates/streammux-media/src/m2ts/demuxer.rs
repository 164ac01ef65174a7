//! MPEG transport stream demuxer.

use super::packet::{find_sync, TsPacket, PACKET_LEN, PID_NULL, PID_PAT, SYNC_BYTE};
use super::pes::{timestamp_delta, Pes, PesBuffer};
use super::psi::{
    Pat, Pmt, SectionBuffer, STREAM_AAC_ADTS, STREAM_H264, STREAM_H265, STREAM_MPEG1_AUDIO,
    STREAM_MPEG2_AUDIO,
};
use super::stream::{system_timescale, AudioParser, Clock, StreamParser, VideoParser};
use crate::audio::adts::Adts;
use crate::audio::mpeg::MpegAudio;
use crate::error::Result;
use crate::nal::demuxer::{H264, H265};
use crate::pipeline::{DemuxData, Leftover, Node, Probe, ProbeResult};
use bytes::Bytes;
use streammux_common::{ContainerInfo, Frame, Time, Track};
use tracing::{debug, trace, warn};

#[derive(Debug)]
struct Stream {
    pid: u16,
    buffer: PesBuffer,
    parser: Box<dyn StreamParser>,
}

fn parser_for(stream_type: u8, number: u32) -> Option<Box<dyn StreamParser>> {
    let parser: Box<dyn StreamParser> = match stream_type {
        STREAM_H264 => Box::new(VideoParser::<H264>::new(number)),
        STREAM_H265 => Box::new(VideoParser::<H265>::new(number)),
        STREAM_AAC_ADTS => Box::new(AudioParser::<Adts>::new(number)),
        STREAM_MPEG1_AUDIO | STREAM_MPEG2_AUDIO => Box::new(AudioParser::<MpegAudio>::new(number)),
        _ => return None,
    };
    Some(parser)
}

/// Demuxer for MPEG-TS. Only the first program of the PAT is read. Tracks
/// are numbered in PMT order, skipping unsupported stream types, and are
/// reported once every stream has its configuration; frames are held until
/// then.
#[derive(Debug, Default)]
pub struct M2tsDemuxer {
    leftover: Leftover,
    pat: SectionBuffer,
    pmt: SectionBuffer,
    pmt_pid: Option<u16>,
    streams: Vec<Stream>,
    /// The PMT was read and `streams` is final.
    program_known: bool,
    clock: Option<Clock>,
    tracks: Vec<u32>,
    initialized: bool,
    pending: Vec<Frame>,
}

impl M2tsDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// PIDs of the elementary streams being demuxed, in track order.
    pub fn pids(&self) -> Vec<u16> {
        self.streams.iter().map(|s| s.pid).collect()
    }

    fn handle_packet(&mut self, packet: TsPacket) -> Result<()> {
        if packet.payload.is_empty() || packet.pid == PID_NULL {
            return Ok(());
        }
        if packet.pid == PID_PAT {
            if let Some(section) = self.pat.push(&packet.payload, packet.unit_start) {
                self.handle_pat(&section);
            }
            return Ok(());
        }
        if Some(packet.pid) == self.pmt_pid {
            if let Some(section) = self.pmt.push(&packet.payload, packet.unit_start) {
                self.handle_pmt(&section);
            }
            return Ok(());
        }
        let Some(index) = self.streams.iter().position(|s| s.pid == packet.pid) else {
            trace!(pid = packet.pid, "Skipping packet of an unmapped PID");
            return Ok(());
        };
        if let Some(pes) = self.streams[index].buffer.push(&packet.payload, packet.unit_start) {
            self.handle_pes(index, pes)?;
        }
        Ok(())
    }

    fn handle_pat(&mut self, section: &[u8]) {
        if self.pmt_pid.is_some() {
            return;
        }
        match Pat::parse(section) {
            Ok(pat) => {
                if let Some((program, pid)) = pat.programs.first() {
                    debug!(program, pmt_pid = pid, "Found program");
                    self.pmt_pid = Some(*pid);
                }
            }
            Err(err) => warn!(error = %err, "Skipping malformed PAT"),
        }
    }

    fn handle_pmt(&mut self, section: &[u8]) {
        if self.program_known {
            return;
        }
        let pmt = match Pmt::parse(section) {
            Ok(pmt) => pmt,
            Err(err) => {
                warn!(error = %err, "Skipping malformed PMT");
                return;
            }
        };
        for es in pmt.streams {
            let number = self.streams.len() as u32 + 1;
            match parser_for(es.stream_type, number) {
                Some(parser) => self.streams.push(Stream {
                    pid: es.pid,
                    buffer: PesBuffer::new(),
                    parser,
                }),
                None => debug!(
                    pid = es.pid,
                    stream_type = es.stream_type,
                    "Ignoring unsupported stream type"
                ),
            }
        }
        debug!(streams = self.streams.len(), "Program map read");
        self.program_known = true;
    }

    fn handle_pes(&mut self, index: usize, data: Bytes) -> Result<()> {
        let pes = match Pes::parse(&data) {
            Ok(pes) => pes,
            Err(err) => {
                warn!(pid = self.streams[index].pid, error = %err, "Skipping malformed PES packet");
                return Ok(());
            }
        };
        if self.clock.is_none() {
            self.clock = pes.decode_time().map(Clock::new);
        }
        let clock = self.clock.unwrap_or(Clock::new(0));
        self.streams[index].parser.push(&pes, clock, &mut self.pending)
    }

    fn parse(&mut self, data: &Bytes) -> Result<()> {
        let mut pos = 0;
        while pos + PACKET_LEN <= data.len() {
            if data[pos] != SYNC_BYTE {
                let next = find_sync(data, pos + 1).unwrap_or(data.len());
                warn!(skipped = next - pos, "Resynchronising transport stream");
                pos = next;
                self.leftover.save_last_byte(pos);
                continue;
            }
            match TsPacket::parse(&data.slice(pos..pos + PACKET_LEN)) {
                Ok(packet) => self.handle_packet(packet)?,
                Err(err) => trace!(error = %err, "Skipping TS packet"),
            }
            pos += PACKET_LEN;
            self.leftover.save_last_byte(pos);
        }
        Ok(())
    }

    /// Hand the PES packets still being collected to their parsers.
    fn finish_streams(&mut self) -> Result<()> {
        for index in 0..self.streams.len() {
            if let Some(pes) = self.streams[index].buffer.finish() {
                self.handle_pes(index, pes)?;
            }
            self.streams[index].parser.finish(&mut self.pending);
        }
        Ok(())
    }

    fn try_init(&mut self, force: bool, out: &mut Vec<DemuxData>) {
        if self.initialized || !self.program_known {
            return;
        }
        let ready = self.streams.iter().all(|s| s.parser.track().is_some());
        if !ready && !force {
            return;
        }
        let tracks: Vec<Track> = self
            .streams
            .iter()
            .filter_map(|s| s.parser.track().cloned())
            .collect();
        if tracks.is_empty() {
            return;
        }
        self.initialized = true;
        self.tracks = tracks.iter().map(|t| t.number).collect();
        debug!(tracks = tracks.len(), "Transport stream tracks ready");
        out.push(DemuxData::init(ContainerInfo::new(system_timescale()), tracks));
    }

    fn emit(&mut self, out: &mut Vec<DemuxData>) {
        if !self.initialized || self.pending.is_empty() {
            return;
        }
        let tracks = &self.tracks;
        let frames: Vec<Frame> = std::mem::take(&mut self.pending)
            .into_iter()
            .filter(|f| tracks.contains(&f.track_number))
            .collect();
        if !frames.is_empty() {
            out.push(DemuxData::frames(frames));
        }
    }
}

impl Node for M2tsDemuxer {
    type Input = Bytes;
    type Output = DemuxData;

    fn push(&mut self, chunk: Bytes) -> Result<Vec<DemuxData>> {
        let data = self.leftover.merge(chunk);
        self.parse(&data)?;
        self.leftover.save_leftover(&data);
        let mut out = Vec::new();
        self.try_init(false, &mut out);
        self.emit(&mut out);
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<DemuxData>> {
        let rest = self.leftover.take();
        if !rest.is_empty() {
            warn!(bytes = rest.len(), "Dropping partial TS packet");
        }
        self.finish_streams()?;
        let mut out = Vec::new();
        self.try_init(true, &mut out);
        self.emit(&mut out);
        self.pending.clear();
        self.leftover.clear();
        Ok(out)
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

/// PTS of the packet at `offset` if it starts a PES packet on `pid`.
fn pes_start_pts(data: &[u8], offset: usize, pid: u16) -> Option<u64> {
    let packet = TsPacket::parse(&Bytes::copy_from_slice(data.get(offset..offset + PACKET_LEN)?)).ok()?;
    if packet.pid != pid || !packet.unit_start {
        return None;
    }
    Pes::parse(&packet.payload).ok()?.pts
}

/// Duration covered by the PES timestamps of `pid`: the last PTS found by
/// walking packets back from the end, minus the first.
pub fn stream_duration(data: &[u8], pid: u16) -> Option<Time> {
    let start = find_sync(data, 0)?;
    let count = (data.len() - start) / PACKET_LEN;
    let offsets = || (0..count).map(|k| start + k * PACKET_LEN);
    let first = offsets().find_map(|o| pes_start_pts(data, o, pid))?;
    let last = offsets().rev().find_map(|o| pes_start_pts(data, o, pid))?;
    let delta = timestamp_delta(last, first);
    (delta > 0).then(|| Time::from_ticks(delta, system_timescale()))
}

impl M2tsDemuxer {
    /// Parse a whole buffer, deliver the PES packets still open at its end
    /// and return the init record, if any.
    fn probe_with(data: &[u8], force: bool) -> Option<ProbeResult> {
        let mut demuxer = Self::new();
        let mut out = demuxer.push(Bytes::copy_from_slice(data)).ok()?;
        if !out.iter().any(|d| d.tracks.is_some()) {
            demuxer.finish_streams().ok()?;
            demuxer.try_init(force, &mut out);
        }
        let (info, tracks) = out.into_iter().find_map(|d| Some((d.info?, d.tracks?)))?;
        let info = match demuxer.pids().first().and_then(|pid| stream_duration(data, *pid)) {
            Some(duration) => info.with_duration(duration),
            None => info,
        };
        Some(ProbeResult { info, tracks })
    }
}

impl Probe for M2tsDemuxer {
    /// `None` until every stream of the program has its configuration.
    fn probe(data: &[u8]) -> Option<ProbeResult> {
        Self::probe_with(data, false)
    }

    fn probe_complete(data: &[u8]) -> Option<ProbeResult> {
        Self::probe_with(data, true)
    }
}
