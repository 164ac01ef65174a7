//! Short codec strings (RFC 6381 style) derived from configuration records.

use crate::audio::aac::AudioSpecificConfig;
use crate::nal::h264::AvcConfig;
use crate::nal::h265::HevcConfig;
use bytes::{BufMut, Bytes, BytesMut};

/// Codec string for a codec family given its configuration record, or
/// `None` when the record is missing or unreadable.
pub fn from_codec_private(family: &str, private: &Bytes) -> Option<String> {
    if private.is_empty() {
        return None;
    }
    match family {
        "avc1" | "avc3" => AvcConfig::parse(private).ok().map(|c| c.codec_string()),
        "hvc1" | "hev1" => HevcConfig::parse(private).ok().map(|c| c.codec_string()),
        "mp4a" => AudioSpecificConfig::parse(private).ok().map(|c| c.codec_string()),
        "vp09" => vp9_from_vpcc(private),
        "av01" => av1_from_av1c(private),
        _ => None,
    }
}

/// VP9 parameters carried by a `vp09.PP.LL.DD` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vp9Params {
    pub profile: u8,
    pub level: u8,
    pub bit_depth: u8,
    /// 0 = 4:2:0 vertical, 1 = 4:2:0 colocated, 2 = 4:2:2, 3 = 4:4:4
    pub chroma_subsampling: u8,
}

impl Default for Vp9Params {
    fn default() -> Self {
        Self {
            profile: 0,
            level: 10,
            bit_depth: 8,
            chroma_subsampling: 1,
        }
    }
}

impl Vp9Params {
    pub fn codec_string(&self) -> String {
        format!("vp09.{:02}.{:02}.{:02}", self.profile, self.level, self.bit_depth)
    }

    /// Parse `vp09.PP.LL.DD[.CC...]`; missing fields keep their defaults.
    pub fn from_codec_string(codec: &str) -> Self {
        let mut params = Self::default();
        let fields: Vec<u8> = codec
            .split('.')
            .skip(1)
            .map_while(|f| f.parse().ok())
            .collect();
        if let Some(p) = fields.first() {
            params.profile = *p;
        }
        if let Some(l) = fields.get(1) {
            params.level = *l;
        }
        if let Some(d) = fields.get(2) {
            params.bit_depth = *d;
        }
        if let Some(c) = fields.get(3) {
            params.chroma_subsampling = *c;
        }
        params
    }

    /// Matroska VP9 CodecPrivate: `(id, length, value)` feature triplets.
    pub fn from_features(private: &[u8]) -> Self {
        let mut params = Self::default();
        let mut pos = 0;
        while pos + 2 <= private.len() {
            let id = private[pos];
            let len = private[pos + 1] as usize;
            pos += 2;
            let Some(value) = private.get(pos..pos + len) else {
                break;
            };
            if let Some(v) = value.first().copied() {
                match id {
                    1 => params.profile = v,
                    2 => params.level = v,
                    3 => params.bit_depth = v,
                    4 => params.chroma_subsampling = v,
                    _ => {}
                }
            }
            pos += len;
        }
        params
    }

    pub fn to_features(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12);
        for (id, value) in [
            (1, self.profile),
            (2, self.level),
            (3, self.bit_depth),
            (4, self.chroma_subsampling),
        ] {
            buf.put_slice(&[id, 1, value]);
        }
        buf.freeze()
    }

    /// Body of a `vpcC` box (version 1 full box header included).
    pub fn to_vpcc(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u32(0x0100_0000);
        buf.put_u8(self.profile);
        buf.put_u8(self.level);
        buf.put_u8(self.bit_depth << 4 | (self.chroma_subsampling & 0x07) << 1);
        // BT.709 primaries, transfer and matrix
        buf.put_slice(&[1, 1, 1]);
        buf.put_u16(0);
        buf.freeze()
    }

    pub fn from_vpcc(vpcc: &[u8]) -> Option<Self> {
        if vpcc.len() < 7 {
            return None;
        }
        Some(Self {
            profile: vpcc[4],
            level: vpcc[5],
            bit_depth: vpcc[6] >> 4,
            chroma_subsampling: (vpcc[6] >> 1) & 0x07,
        })
    }
}

pub fn vp9_from_vpcc(vpcc: &[u8]) -> Option<String> {
    Vp9Params::from_vpcc(vpcc).map(|p| p.codec_string())
}

/// `av01.P.LLT.DD` from an av1C record.
pub fn av1_from_av1c(av1c: &[u8]) -> Option<String> {
    if av1c.len() < 4 || av1c[0] & 0x80 == 0 {
        return None;
    }
    let profile = av1c[1] >> 5;
    let level = av1c[1] & 0x1F;
    let tier = if av1c[2] & 0x80 != 0 { 'H' } else { 'M' };
    let high_bitdepth = av1c[2] & 0x40 != 0;
    let twelve_bit = av1c[2] & 0x20 != 0;
    let bit_depth = match (high_bitdepth, twelve_bit) {
        (true, true) => 12,
        (true, false) => 10,
        _ => 8,
    };
    Some(format!("av01.{profile}.{level:02}{tier}.{bit_depth:02}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vp9_defaults() {
        assert_eq!(Vp9Params::from_features(&[]).codec_string(), "vp09.00.10.08");
    }

    #[test]
    fn test_vp9_features() {
        let params = Vp9Params::from_features(&[1, 1, 2, 2, 1, 31, 3, 1, 10, 4, 1, 1]);
        assert_eq!(params.codec_string(), "vp09.02.31.10");
        assert_eq!(Vp9Params::from_features(&params.to_features()), params);
    }

    #[test]
    fn test_vp9_codec_string_and_vpcc() {
        let params = Vp9Params::from_codec_string("vp09.01.41.10.02");
        assert_eq!(params.profile, 1);
        assert_eq!(params.level, 41);
        assert_eq!(params.chroma_subsampling, 2);
        assert_eq!(Vp9Params::from_vpcc(&params.to_vpcc()), Some(params));
        assert_eq!(Vp9Params::from_codec_string("vp09"), Vp9Params::default());
    }

    #[test]
    fn test_av1_from_av1c() {
        // profile 0, level 8, main tier, 10 bit
        assert_eq!(
            av1_from_av1c(&[0x81, 0x08, 0x4C, 0x00]).as_deref(),
            Some("av01.0.08M.10")
        );
        assert_eq!(av1_from_av1c(&[0x01, 0, 0, 0]), None);
    }

    #[test]
    fn test_from_codec_private_dispatch() {
        let asc = Bytes::from_static(&[0x12, 0x10]);
        assert_eq!(from_codec_private("mp4a", &asc).as_deref(), Some("mp4a.40.2"));
        assert_eq!(from_codec_private("mp4a", &Bytes::new()), None);
        assert_eq!(from_codec_private("opus", &asc), None);
    }
}
