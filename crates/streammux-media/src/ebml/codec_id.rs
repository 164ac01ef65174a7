//! Matroska CodecID <-> short codec string mapping.

use crate::codec_string::{self, Vp9Params};
use bytes::Bytes;
use streammux_common::Track;

/// `(CodecID, codec family)` pairs with a one-to-one mapping.
const TABLE: &[(&str, &str)] = &[
    ("V_VP8", "vp8"),
    ("V_VP9", "vp09"),
    ("V_AV1", "av01"),
    ("V_MPEG4/ISO/AVC", "avc1"),
    ("V_MPEGH/ISO/HEVC", "hvc1"),
    ("V_THEORA", "theora"),
    ("A_OPUS", "opus"),
    ("A_VORBIS", "vorbis"),
    ("A_FLAC", "flac"),
    ("A_MPEG/L3", "mp3"),
    ("A_MPEG/L2", "mp2"),
    ("A_MPEG/L1", "mp1"),
    ("A_AC3", "ac-3"),
    ("A_EAC3", "ec-3"),
    ("A_AAC", "mp4a"),
    ("S_TEXT/WEBVTT", "wvtt"),
];

/// Codecs a WebM file may carry.
const WEBM_FAMILIES: &[&str] = &["vp8", "vp09", "av01", "opus", "vorbis", "wvtt"];

/// Object types named by the legacy `A_AAC/MPEGx/...` ids.
fn legacy_aac_object_type(codec_id: &str) -> u8 {
    let profile = codec_id.splitn(3, '/').nth(2).unwrap_or("LC");
    match profile {
        "MAIN" => 1,
        "SSR" => 3,
        "LTP" => 4,
        "LC/SBR" => 5,
        _ => 2,
    }
}

/// Short codec string for a Matroska CodecID, refined from CodecPrivate
/// where the family needs parameters. Unknown ids are returned unchanged.
pub fn from_codec_id(codec_id: &str, private: &Bytes) -> String {
    if codec_id == "V_VP9" {
        return Vp9Params::from_features(private).codec_string();
    }
    if codec_id.starts_with("A_AAC") {
        return codec_string::from_codec_private("mp4a", private)
            .unwrap_or_else(|| format!("mp4a.40.{}", legacy_aac_object_type(codec_id)));
    }
    match TABLE.iter().find(|(id, _)| *id == codec_id) {
        Some((_, family)) => {
            codec_string::from_codec_private(family, private).unwrap_or_else(|| family.to_string())
        }
        None => codec_id.to_string(),
    }
}

/// Matroska CodecID for a codec string. Unknown codecs are returned unchanged.
pub fn to_codec_id(codec: &str) -> String {
    let family = family(codec);
    let family = match family {
        "avc3" => "avc1",
        "hev1" => "hvc1",
        other => other,
    };
    TABLE
        .iter()
        .find(|(_, f)| *f == family)
        .map_or_else(|| codec.to_string(), |(id, _)| id.to_string())
}

/// CodecPrivate to write for a track.
pub fn codec_private(track: &Track) -> Bytes {
    match track.codec_family() {
        "vp09" => Vp9Params::from_codec_string(&track.codec).to_features(),
        _ => track.codec_private.clone(),
    }
}

pub fn is_webm_codec(codec: &str) -> bool {
    WEBM_FAMILIES.contains(&family(codec))
}

fn family(codec: &str) -> &str {
    codec.split('.').next().unwrap_or(codec)
}
