//! Sample descriptions (`stsd`) to and from track codec information.

use super::boxes::{children, fourcc_str, full_box_header, FourCc, Reader};
use super::esds::{parse_esds, write_esds, OTI_MPEG1_AUDIO, OTI_MPEG4_AUDIO};
use super::writer::{put_box, put_full_box};
use crate::audio::aac::AudioSpecificConfig;
use crate::audio::opus::{OpusHead, OPUS_RATE};
use crate::codec_string::{av1_from_av1c, Vp9Params};
use crate::error::{Error, Result};
use crate::nal::h264::AvcConfig;
use crate::nal::h265::HevcConfig;
use bytes::{BufMut, Bytes, BytesMut};
use streammux_common::{CodecInfo, ColorInfo, Track, TrackKind};

const VISUAL_ENTRY_LEN: usize = 78;
const AUDIO_ENTRY_LEN: usize = 28;

/// Codec families the fragmented muxer can describe.
pub const WRITABLE_FAMILIES: &[&str] = &["avc1", "avc3", "hvc1", "hev1", "vp09", "av01", "mp4a", "mp3", "opus", "flac"];

/// The first sample description of a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleEntry {
    pub format: FourCc,
    pub codec: String,
    pub info: CodecInfo,
    pub codec_private: Bytes,
}

/// Track kind for an `hdlr` handler type.
pub fn kind_for_handler(handler: &FourCc) -> TrackKind {
    match handler {
        b"vide" => TrackKind::Video,
        b"soun" => TrackKind::Audio,
        b"text" | b"subt" | b"sbtl" => TrackKind::Subtitle,
        _ => TrackKind::Other,
    }
}

pub fn handler_for_kind(kind: TrackKind) -> (&'static FourCc, &'static str) {
    match kind {
        TrackKind::Video => (b"vide", "VideoHandler"),
        TrackKind::Audio => (b"soun", "SoundHandler"),
        TrackKind::Subtitle => (b"text", "TextHandler"),
        TrackKind::Other => (b"meta", "MetaHandler"),
    }
}

/// Parse the first entry of an `stsd` payload.
pub fn parse_stsd(stsd: &Bytes, kind: TrackKind) -> Result<Option<SampleEntry>> {
    full_box_header(stsd)?;
    if stsd.len() < 8 {
        return Ok(None);
    }
    let entries = stsd.slice(8..);
    let Some(entry) = children(&entries).next() else {
        return Ok(None);
    };
    let parsed = match kind {
        TrackKind::Video => parse_visual(entry.box_type, &entry.data)?,
        TrackKind::Audio => parse_audio(entry.box_type, &entry.data)?,
        _ => SampleEntry {
            format: entry.box_type,
            codec: fourcc_str(&entry.box_type),
            info: CodecInfo::None,
            codec_private: Bytes::new(),
        },
    };
    Ok(Some(parsed))
}

fn parse_visual(format: FourCc, body: &Bytes) -> Result<SampleEntry> {
    if body.len() < VISUAL_ENTRY_LEN {
        return Err(Error::Truncated {
            need: VISUAL_ENTRY_LEN,
            have: body.len(),
        });
    }
    let width = u16::from_be_bytes([body[24], body[25]]) as u32;
    let height = u16::from_be_bytes([body[26], body[27]]) as u32;
    let mut codec = fourcc_str(&format);
    let mut codec_private = Bytes::new();
    let mut color = None;

    for child in children(&body.slice(VISUAL_ENTRY_LEN..)) {
        match &child.box_type {
            b"avcC" => {
                if let Ok(config) = AvcConfig::parse(&child.data) {
                    codec = format!("{}{}", fourcc_str(&format), &config.codec_string()[4..]);
                }
                codec_private = child.data;
            }
            b"hvcC" => {
                if let Ok(config) = HevcConfig::parse(&child.data) {
                    codec = config.ptl.codec_string(&fourcc_str(&format));
                }
                codec_private = child.data;
            }
            b"vpcC" => {
                if let Some(params) = Vp9Params::from_vpcc(&child.data) {
                    codec = params.codec_string();
                }
                codec_private = child.data;
            }
            b"av1C" => {
                if let Some(s) = av1_from_av1c(&child.data) {
                    codec = s;
                }
                codec_private = child.data;
            }
            b"colr" => color = parse_colr(&child.data),
            _ => {}
        }
    }
    Ok(SampleEntry {
        format,
        codec,
        info: CodecInfo::Video { width, height, color },
        codec_private,
    })
}

fn parse_colr(data: &[u8]) -> Option<ColorInfo> {
    if data.len() < 11 || &data[..4] != b"nclx" {
        return None;
    }
    Some(ColorInfo {
        primaries: u16::from_be_bytes([data[4], data[5]]) as u8,
        transfer: u16::from_be_bytes([data[6], data[7]]) as u8,
        matrix: u16::from_be_bytes([data[8], data[9]]) as u8,
        full_range: data[10] & 0x80 != 0,
    })
}

fn parse_audio(format: FourCc, body: &Bytes) -> Result<SampleEntry> {
    let mut r = Reader::new(body);
    r.skip(8)?;
    let version = r.u16()?;
    r.skip(6)?;
    let mut channels = r.u16()?;
    let bit_depth = r.u16()?;
    r.skip(4)?;
    let mut sample_rate = r.u32()? >> 16;
    let children_start = match version {
        1 => AUDIO_ENTRY_LEN + 16,
        2 => {
            r.skip(4)?;
            sample_rate = f64::from_bits(r.u64()?).round() as u32;
            channels = r.u32()? as u16;
            AUDIO_ENTRY_LEN + 36
        }
        _ => AUDIO_ENTRY_LEN,
    };
    if body.len() < children_start {
        return Err(Error::Truncated {
            need: children_start,
            have: body.len(),
        });
    }

    let mut codec = match &format {
        b"mp4a" => "mp4a".to_string(),
        b"Opus" => "opus".to_string(),
        b".mp3" => "mp3".to_string(),
        b"fLaC" => "flac".to_string(),
        other => fourcc_str(other),
    };
    let mut codec_private = Bytes::new();

    for child in children(&body.slice(children_start..)) {
        match &child.box_type {
            b"esds" => {
                let es = parse_esds(&child.data)?;
                codec = es.codec_family().to_string();
                if es.object_type_indication == OTI_MPEG4_AUDIO {
                    if let Ok(asc) = AudioSpecificConfig::parse(&es.decoder_specific_info) {
                        codec = asc.codec_string();
                        sample_rate = asc.sample_rate;
                        if asc.channel_config > 0 {
                            channels = asc.channels();
                        }
                    }
                    codec_private = es.decoder_specific_info;
                }
            }
            b"dOps" => {
                let head = OpusHead::from_dops(&child.data)?;
                channels = head.channels as u16;
                sample_rate = OPUS_RATE;
                codec_private = head.to_bytes();
            }
            b"dfLa" => {
                let mut private = BytesMut::from(&b"fLaC"[..]);
                private.extend_from_slice(child.data.get(4..).unwrap_or_default());
                codec_private = private.freeze();
            }
            _ => {}
        }
    }
    Ok(SampleEntry {
        format,
        codec,
        info: CodecInfo::Audio {
            channels,
            sample_rate,
            bit_depth,
        },
        codec_private,
    })
}

/// Write an `stsd` box describing `track`.
pub fn put_stsd(buf: &mut BytesMut, track: &Track) -> Result<()> {
    let family = track.codec_family();
    let mut entry = BytesMut::new();
    match family {
        "avc1" | "avc3" => put_visual(&mut entry, family, track, b"avcC", track.codec_private.clone()),
        "hvc1" | "hev1" => put_visual(&mut entry, family, track, b"hvcC", track.codec_private.clone()),
        "vp09" => {
            let vpcc = Vp9Params::from_codec_string(&track.codec).to_vpcc();
            put_visual(&mut entry, family, track, b"vpcC", vpcc)
        }
        "av01" => {
            if track.codec_private.is_empty() {
                return Err(Error::unsupported("av01 track without av1C"));
            }
            put_visual(&mut entry, family, track, b"av1C", track.codec_private.clone())
        }
        "mp4a" => {
            let esds = write_esds(track.number as u16, OTI_MPEG4_AUDIO, &track.codec_private);
            put_audio(&mut entry, b"mp4a", track, |b| put_box(b, b"esds", |e| e.put_slice(&esds)))
        }
        "mp3" => {
            let esds = write_esds(track.number as u16, OTI_MPEG1_AUDIO, &[]);
            put_audio(&mut entry, b"mp4a", track, |b| put_box(b, b"esds", |e| e.put_slice(&esds)))
        }
        "opus" => {
            let head = OpusHead::parse(&track.codec_private).unwrap_or_else(|_| OpusHead::stereo());
            put_audio(&mut entry, b"Opus", track, |b| put_box(b, b"dOps", |d| d.put_slice(&head.to_dops())))
        }
        "flac" => {
            let blocks = track.codec_private.get(4..).unwrap_or_default().to_vec();
            put_audio(&mut entry, b"fLaC", track, |b| put_full_box(b, b"dfLa", 0, 0, |d| d.put_slice(&blocks)))
        }
        other => return Err(Error::unsupported(format!("codec {other} in MP4"))),
    }
    put_full_box(buf, b"stsd", 0, 0, |b| {
        b.put_u32(1);
        b.put_slice(&entry);
    });
    Ok(())
}

fn put_visual(buf: &mut BytesMut, family: &str, track: &Track, config_type: &FourCc, config: Bytes) {
    let (width, height, color) = match track.info {
        CodecInfo::Video { width, height, color } => (width, height, color),
        _ => (0, 0, None),
    };
    let mut format = [0u8; 4];
    format.copy_from_slice(&family.as_bytes()[..4]);
    put_box(buf, &format, |b| {
        b.put_bytes(0, 6);
        b.put_u16(1); // data reference index
        b.put_bytes(0, 16);
        b.put_u16(width as u16);
        b.put_u16(height as u16);
        b.put_u32(0x0048_0000); // 72 dpi
        b.put_u32(0x0048_0000);
        b.put_u32(0);
        b.put_u16(1); // frame count
        b.put_bytes(0, 32); // compressor name
        b.put_u16(0x0018);
        b.put_i16(-1);
        if !config.is_empty() {
            put_box(b, config_type, |c| c.put_slice(&config));
        }
        if let Some(color) = color {
            put_box(b, b"colr", |c| {
                c.put_slice(b"nclx");
                c.put_u16(color.primaries as u16);
                c.put_u16(color.transfer as u16);
                c.put_u16(color.matrix as u16);
                c.put_u8(if color.full_range { 0x80 } else { 0 });
            });
        }
    });
}

fn put_audio<F>(buf: &mut BytesMut, format: &FourCc, track: &Track, config: F)
where
    F: FnOnce(&mut BytesMut),
{
    let (channels, sample_rate, bit_depth) = match track.info {
        CodecInfo::Audio {
            channels,
            sample_rate,
            bit_depth,
        } => (channels, sample_rate, bit_depth),
        _ => (2, 48_000, 16),
    };
    // 16.16 rate field; rates above 65535 Hz are carried by the config box
    let rate = if sample_rate > 0xFFFF { 0 } else { sample_rate << 16 };
    put_box(buf, format, |b| {
        b.put_bytes(0, 6);
        b.put_u16(1);
        b.put_bytes(0, 8);
        b.put_u16(channels);
        b.put_u16(bit_depth);
        b.put_u16(0);
        b.put_u16(0);
        b.put_u32(rate);
        config(b);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nal::h264::tests::baseline_sps;

    fn round_trip(track: &Track) -> SampleEntry {
        let mut buf = BytesMut::new();
        put_stsd(&mut buf, track).unwrap();
        let stsd = buf.freeze().slice(8..);
        parse_stsd(&stsd, track.kind).unwrap().unwrap()
    }

    #[test]
    fn test_avc_entry() {
        let config = AvcConfig::from_parameter_sets(
            vec![Bytes::from(baseline_sps(20, 15, 0, false))],
            vec![Bytes::from_static(&[0x68, 0xCE, 0x38, 0x80])],
        )
        .unwrap();
        let track = Track::video(1, config.codec_string(), 320, 240).with_codec_private(config.to_bytes());
        let entry = round_trip(&track);
        assert_eq!(&entry.format, b"avc1");
        assert_eq!(entry.codec, "avc1.42c01f");
        assert_eq!(entry.codec_private, track.codec_private);
        assert_eq!(entry.info, track.info);
    }

    #[test]
    fn test_aac_entry() {
        let asc = Bytes::from_static(&[0x11, 0x90]);
        let track = Track::audio(2, "mp4a.40.2", 2, 48_000).with_codec_private(asc.clone());
        let entry = round_trip(&track);
        assert_eq!(entry.codec, "mp4a.40.2");
        assert_eq!(entry.codec_private, asc);
        assert_eq!(entry.info, track.info);
    }

    #[test]
    fn test_opus_and_vp9_entries() {
        let head = OpusHead::stereo();
        let track = Track::audio(1, "opus", 2, 48_000).with_codec_private(head.to_bytes());
        let entry = round_trip(&track);
        assert_eq!(entry.codec, "opus");
        assert_eq!(OpusHead::parse(&entry.codec_private).unwrap(), head);

        let vp9 = Track::video(1, "vp09.00.31.08", 640, 360);
        assert_eq!(round_trip(&vp9).codec, "vp09.00.31.08");
    }

    #[test]
    fn test_colour_survives() {
        let mut track = Track::video(1, "vp09.02.10.10", 64, 64);
        let color = ColorInfo {
            primaries: 9,
            transfer: 16,
            matrix: 9,
            full_range: false,
        };
        track.info = CodecInfo::Video {
            width: 64,
            height: 64,
            color: Some(color),
        };
        assert_eq!(round_trip(&track).info, track.info);
    }

    #[test]
    fn test_unsupported_codec() {
        let mut buf = BytesMut::new();
        let track = Track::audio(1, "vorbis", 2, 44_100);
        assert!(matches!(put_stsd(&mut buf, &track), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_handlers() {
        assert_eq!(kind_for_handler(b"soun"), TrackKind::Audio);
        assert_eq!(kind_for_handler(handler_for_kind(TrackKind::Video).0), TrackKind::Video);
        assert_eq!(kind_for_handler(b"hint"), TrackKind::Other);
    }
}
