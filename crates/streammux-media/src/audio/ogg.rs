//! Ogg demuxer for Opus and Vorbis logical streams.

use super::opus::{packet_samples, OpusHead, OPUS_RATE};
use crate::error::{Error, Result};
use crate::pipeline::{DemuxData, Leftover, Node, Probe, ProbeResult};
use bytes::{BufMut, Bytes, BytesMut};
use streammux_common::{ContainerInfo, Frame, Rational, Time, Track};
use tracing::{debug, trace, warn};

const CAPTURE: &[u8; 4] = b"OggS";
const PAGE_HEADER_LEN: usize = 27;

const FLAG_CONTINUED: u8 = 0x01;
const FLAG_BOS: u8 = 0x02;

/// Granule position of a page on which no packet ends.
const NO_GRANULE: i64 = -1;

#[derive(Debug, Clone)]
struct Page {
    flags: u8,
    granule: i64,
    serial: u32,
    lacing: Bytes,
    body: Bytes,
}

impl Page {
    /// Parse the page at the start of `data`; `Ok(None)` when incomplete.
    fn parse(data: &Bytes) -> Result<Option<(Page, usize)>> {
        if data.len() < PAGE_HEADER_LEN {
            return Ok(None);
        }
        if &data[..4] != CAPTURE {
            return Err(Error::invalid("missing OggS capture pattern"));
        }
        if data[4] != 0 {
            return Err(Error::unsupported(format!("Ogg page version {}", data[4])));
        }
        let segments = data[26] as usize;
        let header_len = PAGE_HEADER_LEN + segments;
        if data.len() < header_len {
            return Ok(None);
        }
        let lacing = data.slice(PAGE_HEADER_LEN..header_len);
        let body_len: usize = lacing.iter().map(|l| *l as usize).sum();
        let end = header_len + body_len;
        if data.len() < end {
            return Ok(None);
        }
        let mut granule = [0u8; 8];
        granule.copy_from_slice(&data[6..14]);
        Ok(Some((
            Page {
                flags: data[5],
                granule: i64::from_le_bytes(granule),
                serial: u32::from_le_bytes([data[14], data[15], data[16], data[17]]),
                lacing,
                body: data.slice(header_len..end),
            },
            end,
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OggCodec {
    Pending,
    Opus,
    Vorbis,
    Unknown,
}

#[derive(Debug)]
struct LogicalStream {
    serial: u32,
    number: u32,
    codec: OggCodec,
    headers: Vec<Bytes>,
    track: Option<Track>,
    partial: BytesMut,
    /// Granule of the last page that completed a packet.
    granule: i64,
    /// Opus samples emitted so far.
    samples: i64,
}

impl LogicalStream {
    fn new(serial: u32, number: u32) -> Self {
        Self {
            serial,
            number,
            codec: OggCodec::Pending,
            headers: Vec::new(),
            track: None,
            partial: BytesMut::new(),
            granule: 0,
            samples: 0,
        }
    }

    /// No more header packets are expected.
    fn is_ready(&self) -> bool {
        self.track.is_some() || self.codec == OggCodec::Unknown
    }

    fn rate(&self) -> i64 {
        self.track
            .as_ref()
            .and_then(Track::sample_rate)
            .unwrap_or(OPUS_RATE) as i64
    }

    /// Split a page body into completed packets, carrying an unfinished one
    /// over to the next page.
    fn packets(&mut self, page: &Page) -> Vec<Bytes> {
        if page.flags & FLAG_CONTINUED == 0 && !self.partial.is_empty() {
            warn!(serial = self.serial, bytes = self.partial.len(), "Dropping unfinished Ogg packet");
            self.partial.clear();
        }
        let mut skip_continuation = page.flags & FLAG_CONTINUED != 0 && self.partial.is_empty();
        let mut packets = Vec::new();
        let mut offset = 0;
        for lace in page.lacing.iter().map(|l| *l as usize) {
            let segment = &page.body[offset..offset + lace];
            offset += lace;
            if !skip_continuation {
                self.partial.put_slice(segment);
            }
            if lace < 255 {
                if skip_continuation {
                    // joined in the middle of a packet
                    skip_continuation = false;
                } else {
                    packets.push(self.partial.split().freeze());
                }
            }
        }
        packets
    }

    fn header_packet(&mut self, packet: Bytes) -> Result<()> {
        if self.codec == OggCodec::Pending {
            self.codec = if packet.starts_with(b"OpusHead") {
                OggCodec::Opus
            } else if packet.starts_with(b"\x01vorbis") {
                OggCodec::Vorbis
            } else {
                warn!(serial = self.serial, "Ignoring Ogg stream with an unknown codec");
                OggCodec::Unknown
            };
        }
        match self.codec {
            OggCodec::Opus => {
                self.headers.push(packet);
                if self.headers.len() == 2 {
                    let head = OpusHead::parse(&self.headers[0])?;
                    self.track = Some(
                        Track::audio(self.number, "opus", head.channels as u16, OPUS_RATE)
                            .with_codec_private(self.headers[0].clone()),
                    );
                }
            }
            OggCodec::Vorbis => {
                let expected = [1u8, 3, 5][self.headers.len()];
                if packet.first() != Some(&expected) || packet.get(1..7) != Some(b"vorbis") {
                    return Err(Error::invalid(format!("expected Vorbis header type {expected}")));
                }
                self.headers.push(packet);
                if self.headers.len() == 3 {
                    let ident = &self.headers[0];
                    if ident.len() < 16 {
                        return Err(Error::Truncated {
                            need: 16,
                            have: ident.len(),
                        });
                    }
                    let channels = ident[11] as u16;
                    let rate = u32::from_le_bytes([ident[12], ident[13], ident[14], ident[15]]);
                    self.track = Some(
                        Track::audio(self.number, "vorbis", channels, rate)
                            .with_codec_private(xiph_lace(&self.headers)),
                    );
                }
            }
            OggCodec::Pending | OggCodec::Unknown => {}
        }
        if let Some(track) = &self.track {
            debug!(serial = self.serial, track = track.number, codec = %track.codec, "Ogg stream configured");
        }
        Ok(())
    }

    fn time(&self, ticks: Rational) -> Time {
        Time::from_seconds(ticks / Rational::from_integer(self.rate()))
    }

    /// Timestamp the audio packets completed on `page`.
    fn audio_frames(&mut self, page: &Page, packets: Vec<Bytes>) -> Vec<Frame> {
        match self.codec {
            OggCodec::Opus => packets
                .into_iter()
                .map(|packet| {
                    let samples = packet_samples(&packet).unwrap_or(0) as i64;
                    let start = Rational::from_integer(self.samples);
                    self.samples += samples;
                    Frame::new(self.number, self.time(start), packet)
                        .with_duration(self.time(Rational::from_integer(samples)))
                        .with_keyframe(true)
                })
                .collect(),
            OggCodec::Vorbis => {
                let count = packets.len() as i64;
                let start = self.granule;
                if page.granule != NO_GRANULE {
                    self.granule = page.granule.max(start);
                }
                let step = Rational::new((self.granule - start).max(0), count.max(1));
                packets
                    .into_iter()
                    .enumerate()
                    .map(|(i, packet)| {
                        let at = Rational::from_integer(start) + step * Rational::from_integer(i as i64);
                        Frame::new(self.number, self.time(at), packet)
                            .with_duration(self.time(step))
                            .with_keyframe(true)
                    })
                    .collect()
            }
            OggCodec::Pending | OggCodec::Unknown => Vec::new(),
        }
    }
}

/// Xiph-laced codec private: packet count minus one, the laced sizes of all
/// packets but the last, then the packets.
pub fn xiph_lace(packets: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(packets.len().saturating_sub(1) as u8);
    for packet in packets.iter().take(packets.len().saturating_sub(1)) {
        let mut size = packet.len();
        while size >= 255 {
            buf.put_u8(255);
            size -= 255;
        }
        buf.put_u8(size as u8);
    }
    for packet in packets {
        buf.put_slice(packet);
    }
    buf.freeze()
}

/// Demuxer for Ogg files. Each logical stream becomes a track, numbered in
/// order of its first page; chained streams after the first audio page are
/// ignored.
#[derive(Debug, Default)]
pub struct OggDemuxer {
    leftover: Leftover,
    streams: Vec<LogicalStream>,
    /// A page other than a beginning-of-stream page was seen.
    streams_known: bool,
    initialized: bool,
    pending: Vec<Frame>,
}

impl OggDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_page(&mut self, page: Page) -> Result<()> {
        if page.flags & FLAG_BOS != 0 {
            if self.streams_known {
                warn!(serial = page.serial, "Ignoring chained Ogg stream");
                return Ok(());
            }
            let number = self.streams.len() as u32 + 1;
            self.streams.push(LogicalStream::new(page.serial, number));
        } else {
            self.streams_known = true;
        }
        let Some(stream) = self.streams.iter_mut().find(|s| s.serial == page.serial) else {
            trace!(serial = page.serial, "Skipping page of an unknown Ogg stream");
            return Ok(());
        };
        let mut audio = Vec::new();
        for packet in stream.packets(&page) {
            if stream.is_ready() {
                audio.push(packet);
            } else {
                stream.header_packet(packet)?;
            }
        }
        if !audio.is_empty() {
            self.pending.extend(stream.audio_frames(&page, audio));
        } else if page.granule != NO_GRANULE && stream.track.is_some() && stream.codec == OggCodec::Vorbis {
            stream.granule = stream.granule.max(page.granule);
        }
        Ok(())
    }

    fn try_init(&mut self, force: bool, out: &mut Vec<DemuxData>) {
        if self.initialized || self.streams.is_empty() {
            return;
        }
        let ready = self.streams.iter().all(LogicalStream::is_ready);
        if !(force || (ready && self.streams_known)) {
            return;
        }
        let tracks: Vec<Track> = self.streams.iter().filter_map(|s| s.track.clone()).collect();
        if tracks.is_empty() {
            return;
        }
        self.initialized = true;
        let timescale = tracks[0].timescale;
        debug!(tracks = tracks.len(), "Ogg tracks ready");
        out.push(DemuxData::init(ContainerInfo::new(timescale), tracks));
    }

    fn emit(&mut self, out: &mut Vec<DemuxData>) {
        if self.initialized && !self.pending.is_empty() {
            out.push(DemuxData::frames(std::mem::take(&mut self.pending)));
        }
    }

    fn parse(&mut self, data: &Bytes) -> Result<()> {
        let mut pos = 0;
        while pos + PAGE_HEADER_LEN <= data.len() {
            let rest = data.slice(pos..);
            match Page::parse(&rest) {
                Ok(Some((page, len))) => {
                    self.handle_page(page)?;
                    pos += len;
                    self.leftover.save_last_byte(pos);
                }
                Ok(None) => break,
                Err(err) => {
                    let next = rest[1..]
                        .windows(4)
                        .position(|w| w == CAPTURE)
                        .map_or(data.len() - 3, |p| pos + 1 + p);
                    warn!(error = %err, skipped = next - pos, "Resynchronising Ogg stream");
                    pos = next;
                    self.leftover.save_last_byte(pos);
                }
            }
        }
        Ok(())
    }
}

impl Node for OggDemuxer {
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
            warn!(bytes = rest.len(), "Dropping truncated Ogg page");
        }
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

impl Probe for OggDemuxer {
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

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use streammux_common::TimeUnit;

    /// One page from explicit lacing values. The CRC is left at zero.
    pub(crate) fn raw_page(flags: u8, granule: i64, serial: u32, lacing: &[u8], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(CAPTURE);
        out.push(0);
        out.push(flags);
        out.extend_from_slice(&granule.to_le_bytes());
        out.extend_from_slice(&serial.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.push(lacing.len() as u8);
        out.extend_from_slice(lacing);
        out.extend_from_slice(body);
        out
    }

    /// One page holding whole packets.
    pub(crate) fn page(flags: u8, granule: i64, serial: u32, packets: &[&[u8]]) -> Vec<u8> {
        let mut lacing = Vec::new();
        let mut body = Vec::new();
        for packet in packets {
            let mut size = packet.len();
            while size >= 255 {
                lacing.push(255);
                size -= 255;
            }
            lacing.push(size as u8);
            body.extend_from_slice(packet);
        }
        raw_page(flags, granule, serial, &lacing, &body)
    }

    /// Stereo Opus stream with three 20 ms packets.
    pub(crate) fn opus_file() -> Vec<u8> {
        let head = OpusHead::stereo().to_bytes();
        let celt_20ms: &[u8] = &[31 << 3, 0xAA];
        let mut out = page(FLAG_BOS, 0, 7, &[&head]);
        out.extend(page(0, 0, 7, &[b"OpusTags\0\0\0\0\0\0\0\0"]));
        out.extend(page(0, 1920, 7, &[celt_20ms, celt_20ms]));
        out.extend(page(0x04, 2880, 7, &[celt_20ms]));
        out
    }

    fn vorbis_ident() -> Vec<u8> {
        let mut ident = b"\x01vorbis".to_vec();
        ident.extend_from_slice(&0u32.to_le_bytes());
        ident.push(2);
        ident.extend_from_slice(&44_100u32.to_le_bytes());
        ident.extend_from_slice(&[0; 12]);
        ident.push(0xB8);
        ident.push(1);
        ident
    }

    fn run(chunks: &[&[u8]]) -> Vec<DemuxData> {
        let mut demuxer = OggDemuxer::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(demuxer.push(Bytes::copy_from_slice(chunk)).unwrap());
        }
        out.extend(demuxer.flush().unwrap());
        out
    }

    fn frames(out: &[DemuxData]) -> Vec<Frame> {
        out.iter().flat_map(|d| d.frames.clone()).collect()
    }

    fn ms(n: i64) -> Time {
        Time::new(n, TimeUnit::Milliseconds)
    }

    #[test]
    fn test_opus_stream() {
        let out = run(&[&opus_file()]);
        let tracks = out[0].tracks.as_ref().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].codec, "opus");
        assert_eq!(tracks[0].channels(), Some(2));
        assert_eq!(OpusHead::parse(&tracks[0].codec_private).unwrap(), OpusHead::stereo());

        let frames = frames(&out);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].timestamp, ms(20));
        assert_eq!(frames[2].timestamp, ms(40));
        assert_eq!(frames[2].duration, ms(20));
        assert_eq!(&frames[0].data[..], &[31 << 3, 0xAA]);
    }

    #[test]
    fn test_incremental_equivalence() {
        let data = opus_file();
        let whole = frames(&run(&[&data]));
        for split in [1, 27, 30, 60, data.len() - 1] {
            let (a, b) = data.split_at(split);
            assert_eq!(frames(&run(&[a, b])), whole, "split at {split}");
        }
        let bytes: Vec<&[u8]> = data.chunks(1).collect();
        assert_eq!(frames(&run(&bytes)), whole);
    }

    #[test]
    fn test_vorbis_private_and_granule_durations() {
        let ident = vorbis_ident();
        let comment = b"\x03vorbis-comment".to_vec();
        let setup = b"\x05vorbis-setup-data".to_vec();
        let mut data = page(FLAG_BOS, 0, 3, &[&ident]);
        data.extend(page(0, 0, 3, &[&comment, &setup]));
        data.extend(page(0, 882, 3, &[b"a", b"b"]));
        data.extend(page(0x04, 1323, 3, &[b"c"]));
        let out = run(&[&data]);

        let track = &out[0].tracks.as_ref().unwrap()[0];
        assert_eq!(track.codec, "vorbis");
        assert_eq!(track.sample_rate(), Some(44_100));
        let private = &track.codec_private;
        assert_eq!(private[0], 2);
        assert_eq!(private[1] as usize, ident.len());
        assert_eq!(private[2] as usize, comment.len());
        assert_eq!(&private[3..3 + ident.len()], &ident[..]);
        assert_eq!(private.len(), 3 + ident.len() + comment.len() + setup.len());

        let frames = frames(&out);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].timestamp, Time::ZERO);
        assert_eq!(frames[1].timestamp, ms(10));
        assert_eq!(frames[1].duration, ms(10));
        assert_eq!(frames[2].timestamp, ms(20));
        assert_eq!(frames[2].duration, ms(10));
    }

    #[test]
    fn test_packet_spanning_pages() {
        let head = OpusHead::stereo().to_bytes();
        let mut packet = vec![31 << 3];
        packet.extend(std::iter::repeat(0x55).take(299));
        let mut data = page(FLAG_BOS, 0, 1, &[&head]);
        data.extend(page(0, 0, 1, &[b"OpusTags"]));
        data.extend(raw_page(0, NO_GRANULE, 1, &[255], &packet[..255]));
        data.extend(raw_page(FLAG_CONTINUED, 960, 1, &[45], &packet[255..]));
        let frames = frames(&run(&[&data]));
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].data[..], &packet[..]);
    }

    #[test]
    fn test_multiplexed_streams_and_unknown_codec() {
        let head = OpusHead::stereo().to_bytes();
        let mut data = page(FLAG_BOS, 0, 10, &[b"\x80theora"]);
        data.extend(page(FLAG_BOS, 0, 11, &[&head]));
        data.extend(page(0, 0, 11, &[b"OpusTags"]));
        data.extend(page(0, 0, 10, &[b"theora-data"]));
        data.extend(page(0, 960, 11, &[&[31 << 3]]));
        let out = run(&[&data]);
        let tracks = out[0].tracks.as_ref().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].number, 2);
        let frames = frames(&out);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].track_number, 2);
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut data = b"junkOgg".to_vec();
        data.extend(opus_file());
        assert_eq!(frames(&run(&[&data])).len(), 3);
    }

    #[test]
    fn test_probe() {
        let result = OggDemuxer::probe(&opus_file()).unwrap();
        assert_eq!(result.tracks[0].codec, "opus");
        assert!(OggDemuxer::probe(b"OggS").is_none());
    }

    #[test]
    fn test_xiph_lace_long_packets() {
        let packets = [Bytes::from(vec![0u8; 300]), Bytes::from_static(b"x")];
        let laced = xiph_lace(&packets);
        assert_eq!(&laced[..3], &[1, 255, 45]);
        assert_eq!(laced.len(), 3 + 301);
    }
}
