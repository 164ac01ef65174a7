//! Registry of supported formats.

use crate::audio::{AdtsDemuxer, AdtsHeader, AdtsMuxer, MpegAudioDemuxer, MpegAudioHeader, OggDemuxer};
use crate::bmff::{self, BmffDemuxer, BmffMuxer, BmffMuxerOptions};
use crate::ebml::{codec_id, EbmlDemuxer, EbmlMuxer, EbmlMuxerOptions};
use crate::m2ts::{M2tsDemuxer, PACKET_LEN};
use crate::nal::annexb::find_start_code;
use crate::nal::{h264, h265, ElementaryOptions, H264Demuxer, H265Demuxer};
use crate::pipeline::{Demuxer, Muxer, Probe, ProbeResult};
use std::fmt;
use streammux_common::bytes::skip_id3;

const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Top-level boxes a BMFF file or segment may start with.
const BMFF_LEADING_BOXES: [&[u8; 4]; 6] = [b"ftyp", b"styp", b"moov", b"moof", b"free", b"sidx"];

/// Options of every format that takes any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct FormatOptions {
    pub ebml: EbmlMuxerOptions,
    pub bmff: BmffMuxerOptions,
    pub h26x: ElementaryOptions,
}

/// Base MIME types of a format's video and audio-only variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MimeTypes {
    pub video: Option<&'static str>,
    pub audio: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(rename_all = "lowercase"))]
pub enum Format {
    Ebml,
    Bmff,
    M2ts,
    Adts,
    Mpeg,
    Ogg,
    H264,
    H265,
}

impl Format {
    /// Every format, in detection order.
    pub const ALL: [Format; 8] = [
        Format::Ebml,
        Format::Bmff,
        Format::Ogg,
        Format::M2ts,
        Format::Adts,
        Format::Mpeg,
        Format::H264,
        Format::H265,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Format::Ebml => "ebml",
            Format::Bmff => "bmff",
            Format::M2ts => "m2ts",
            Format::Adts => "adts",
            Format::Mpeg => "mpeg",
            Format::Ogg => "ogg",
            Format::H264 => "h264",
            Format::H265 => "h265",
        }
    }

    /// Canonical container name.
    pub fn container(self) -> &'static str {
        match self {
            Format::Ebml => "webm",
            Format::Bmff => "mp4",
            Format::M2ts => "mpegts",
            Format::Adts => "aac",
            Format::Mpeg => "mp3",
            Format::Ogg => "ogg",
            Format::H264 => "h264",
            Format::H265 => "h265",
        }
    }

    fn aliases(self) -> &'static [&'static str] {
        match self {
            Format::Ebml => &["webm", "mkv", "mka", "matroska", "ebml"],
            Format::Bmff => &["mp4", "m4a", "m4v", "fmp4", "cmaf", "mov", "bmff"],
            Format::M2ts => &["mpegts", "ts", "m2ts", "mp2t"],
            Format::Adts => &["aac", "adts"],
            Format::Mpeg => &["mp3", "mp2", "mpeg", "mpga"],
            Format::Ogg => &["ogg", "oga", "opus"],
            Format::H264 => &["h264", "264", "avc"],
            Format::H265 => &["h265", "265", "hevc"],
        }
    }

    pub fn base_mimetypes(self) -> MimeTypes {
        let (video, audio) = match self {
            Format::Ebml => (Some("video/webm"), Some("audio/webm")),
            Format::Bmff => (Some("video/mp4"), Some("audio/mp4")),
            Format::M2ts => (Some("video/mp2t"), None),
            Format::Adts => (None, Some("audio/aac")),
            Format::Mpeg => (None, Some("audio/mpeg")),
            Format::Ogg => (None, Some("audio/ogg")),
            Format::H264 => (Some("video/h264"), None),
            Format::H265 => (Some("video/h265"), None),
        };
        MimeTypes { video, audio }
    }

    /// Whether `name` (a container name or file extension) names this format.
    pub fn container_match(self, name: &str) -> bool {
        let name = name.trim_start_matches('.');
        self.aliases().iter().any(|a| a.eq_ignore_ascii_case(name))
    }

    /// The format a container name or file extension refers to.
    pub fn from_container(name: &str) -> Option<Format> {
        Self::ALL.into_iter().find(|f| f.container_match(name))
    }

    /// Sniff the format from the first bytes of a stream.
    pub fn detect(data: &[u8]) -> Option<Format> {
        Self::ALL.into_iter().find(|f| f.matches(data))
    }

    fn matches(self, data: &[u8]) -> bool {
        match self {
            Format::Ebml => data.starts_with(&EBML_MAGIC),
            Format::Bmff => data
                .get(4..8)
                .is_some_and(|t| BMFF_LEADING_BOXES.iter().any(|b| &b[..] == t)),
            Format::Ogg => data.starts_with(b"OggS"),
            Format::M2ts => {
                data.len() >= PACKET_LEN
                    && data[0] == 0x47
                    && data.get(PACKET_LEN).map_or(true, |b| *b == 0x47)
            }
            Format::Adts => {
                let start = skip_id3(data);
                data.get(start..).is_some_and(|d| AdtsHeader::parse(d).is_ok())
            }
            Format::Mpeg => {
                let start = skip_id3(data);
                data.get(start..).is_some_and(|d| MpegAudioHeader::parse(d).is_ok())
            }
            Format::H264 | Format::H265 => {
                let Some(nal) = first_nal(data) else {
                    return false;
                };
                let h264_like = matches!(
                    h264::nal_type(nal),
                    Some(h264::NAL_AUD | h264::NAL_SPS | h264::NAL_SEI)
                ) && nal[0] & 0x80 == 0;
                let h265_like = matches!(
                    h265::nal_type(nal),
                    Some(h265::NAL_AUD | h265::NAL_VPS | h265::NAL_SPS)
                ) && nal.get(1).is_some_and(|b| b & 0x07 != 0);
                if self == Format::H265 {
                    h265_like
                } else {
                    h264_like && !h265_like
                }
            }
        }
    }

    /// Stateless read of tracks and container info from a stream prefix.
    pub fn probe(self, data: &[u8]) -> Option<ProbeResult> {
        match self {
            Format::Ebml => EbmlDemuxer::probe(data),
            Format::Bmff => BmffDemuxer::probe(data),
            Format::M2ts => M2tsDemuxer::probe(data),
            Format::Adts => AdtsDemuxer::probe(data),
            Format::Mpeg => MpegAudioDemuxer::probe(data),
            Format::Ogg => OggDemuxer::probe(data),
            Format::H264 => H264Demuxer::probe(data),
            Format::H265 => H265Demuxer::probe(data),
        }
    }

    /// Probe when no more input will arrive: the end of the stream, or the
    /// probe budget ran out.
    pub fn probe_complete(self, data: &[u8]) -> Option<ProbeResult> {
        match self {
            Format::M2ts => M2tsDemuxer::probe_complete(data),
            other => other.probe(data),
        }
    }

    pub fn demuxer(self, options: &FormatOptions) -> Box<dyn Demuxer> {
        match self {
            Format::Ebml => Box::new(EbmlDemuxer::new()),
            Format::Bmff => Box::new(BmffDemuxer::new()),
            Format::M2ts => Box::new(M2tsDemuxer::new()),
            Format::Adts => Box::new(AdtsDemuxer::new()),
            Format::Mpeg => Box::new(MpegAudioDemuxer::new()),
            Format::Ogg => Box::new(OggDemuxer::new()),
            Format::H264 => Box::new(H264Demuxer::new(options.h26x.clone())),
            Format::H265 => Box::new(H265Demuxer::new(options.h26x.clone())),
        }
    }

    /// A muxer writing this format, for the formats that can be written.
    pub fn muxer(self, options: &FormatOptions) -> Option<Box<dyn Muxer>> {
        match self {
            Format::Ebml => Some(Box::new(EbmlMuxer::new(options.ebml.clone()))),
            Format::Bmff => Some(Box::new(BmffMuxer::new(options.bmff.clone()))),
            Format::Adts => Some(Box::new(AdtsMuxer::new())),
            _ => None,
        }
    }

    /// Whether this format can carry `codec`.
    pub fn supports_codec(self, codec: &str) -> bool {
        let family = codec.split('.').next().unwrap_or(codec);
        match self {
            Format::Ebml => codec_id::to_codec_id(codec) != codec,
            Format::Bmff => bmff::muxer::supports_codec(codec),
            Format::M2ts => ["avc1", "avc3", "hvc1", "hev1", "mp4a", "mp3", "mp2", "mp1"].contains(&family),
            Format::Adts => family == "mp4a",
            Format::Mpeg => ["mp3", "mp2", "mp1"].contains(&family),
            Format::Ogg => ["opus", "vorbis"].contains(&family),
            Format::H264 => ["avc1", "avc3"].contains(&family),
            Format::H265 => ["hvc1", "hev1"].contains(&family),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// First NAL unit of an Annex-B stream, which must start with a start code.
fn first_nal(data: &[u8]) -> Option<&[u8]> {
    let start = find_start_code(data, 0)?;
    if data[..start].iter().any(|b| *b != 0) {
        return None;
    }
    let begin = data[start..].iter().position(|b| *b == 1)? + start + 1;
    data.get(begin..).filter(|nal| !nal.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::adts::tests::adts_stream;
    use crate::audio::mpeg::tests::mp3_stream;
    use crate::audio::ogg::tests::opus_file;
    use crate::bmff::demuxer::tests::progressive_file;
    use crate::m2ts::demuxer::tests::ts_file;
    use crate::nal::h264::tests::baseline_sps;
    use crate::nal::h265::tests::main_sps;

    fn annexb(nal: &[u8]) -> Vec<u8> {
        [&[0, 0, 0, 1][..], nal].concat()
    }

    #[test]
    fn test_detect() {
        assert_eq!(Format::detect(&[0x1A, 0x45, 0xDF, 0xA3, 0x9F]), Some(Format::Ebml));
        assert_eq!(Format::detect(&progressive_file()), Some(Format::Bmff));
        assert_eq!(Format::detect(&ts_file(&[])), Some(Format::M2ts));
        assert_eq!(Format::detect(&adts_stream(2)), Some(Format::Adts));
        assert_eq!(Format::detect(&mp3_stream(2)), Some(Format::Mpeg));
        assert_eq!(Format::detect(&opus_file()), Some(Format::Ogg));
        assert_eq!(Format::detect(&annexb(&baseline_sps(20, 15, 0, false))), Some(Format::H264));
        assert_eq!(Format::detect(&annexb(&[0x09, 0xF0])), Some(Format::H264));
        assert_eq!(Format::detect(&annexb(&main_sps(320, 240, 0))), Some(Format::H265));
        assert_eq!(Format::detect(b"plain text"), None);
    }

    #[test]
    fn test_detect_skips_id3() {
        let mut data = b"ID3\x04\x00\x00\x00\x00\x00\x02ab".to_vec();
        data.extend(mp3_stream(1));
        assert_eq!(Format::detect(&data), Some(Format::Mpeg));
    }

    #[test]
    fn test_container_match() {
        assert!(Format::Ebml.container_match("MKV"));
        assert!(Format::Bmff.container_match(".m4a"));
        assert!(!Format::Bmff.container_match("webm"));
        assert_eq!(Format::from_container("ts"), Some(Format::M2ts));
        assert_eq!(Format::from_container("hevc"), Some(Format::H265));
        assert_eq!(Format::from_container("avi"), None);
    }

    #[test]
    fn test_registry_is_consistent() {
        for format in Format::ALL {
            assert!(format.container_match(format.container()), "{format}");
            assert!(format.container_match(format.name()), "{format}");
            let mimes = format.base_mimetypes();
            assert!(mimes.video.is_some() || mimes.audio.is_some());
        }
    }

    #[test]
    fn test_writable_formats() {
        let options = FormatOptions::default();
        let writable: Vec<Format> = Format::ALL
            .into_iter()
            .filter(|f| f.muxer(&options).is_some())
            .collect();
        assert_eq!(writable, vec![Format::Ebml, Format::Bmff, Format::Adts]);
    }

    #[test]
    fn test_supports_codec() {
        assert!(Format::Ebml.supports_codec("vp09.00.10.08"));
        assert!(Format::Ebml.supports_codec("mp4a.40.2"));
        assert!(!Format::Ebml.supports_codec("foo"));
        assert!(Format::Bmff.supports_codec("avc1.42c01f"));
        assert!(!Format::Bmff.supports_codec("vorbis"));
        assert!(Format::Adts.supports_codec("mp4a.40.2"));
        assert!(!Format::Adts.supports_codec("opus"));
    }

    #[test]
    fn test_probe_dispatch() {
        let result = Format::Adts.probe(&adts_stream(2)).unwrap();
        assert_eq!(result.tracks[0].codec, "mp4a.40.2");
        assert!(Format::Bmff.probe(&adts_stream(2)).is_none());
        assert_eq!(Format::M2ts.probe(&ts_file(&[])).unwrap().tracks.len(), 2);
    }
}
