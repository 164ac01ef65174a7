//! H.265 parameter sets and hvcC records.

use super::annexb::remove_emulation_prevention;
use super::golomb::ExpGolombReader;
use super::h264::{cropped, read_bit_depth};
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

pub const NAL_IRAP_FIRST: u8 = 16;
pub const NAL_IRAP_LAST: u8 = 23;
pub const NAL_VPS: u8 = 32;
pub const NAL_SPS: u8 = 33;
pub const NAL_PPS: u8 = 34;
pub const NAL_AUD: u8 = 35;
pub const NAL_PREFIX_SEI: u8 = 39;

/// NAL unit type from the two-byte header.
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| (b >> 1) & 0x3F)
}

/// Coded slice segment types (VCL NAL units).
pub fn is_vcl(nal_type: u8) -> bool {
    nal_type < 32
}

/// Intra random access point pictures.
pub fn is_irap(nal_type: u8) -> bool {
    (NAL_IRAP_FIRST..=NAL_IRAP_LAST).contains(&nal_type)
}

/// `first_slice_segment_in_pic_flag` of a slice segment NAL unit.
pub fn first_slice_segment_in_pic(nal: &[u8]) -> bool {
    nal.get(2).is_some_and(|b| b & 0x80 != 0)
}

/// General profile, tier and level of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfileTierLevel {
    pub profile_space: u8,
    pub tier: bool,
    pub profile_idc: u8,
    pub compatibility_flags: u32,
    /// The 48 constraint indicator bits, most significant byte first.
    pub constraint_flags: [u8; 6],
    pub level_idc: u8,
}

impl ProfileTierLevel {
    /// `hvc1.<space><profile>.<compat>.<tier><level>[.<constraints>]`
    pub fn codec_string(&self, prefix: &str) -> String {
        let space = match self.profile_space {
            1 => "A",
            2 => "B",
            3 => "C",
            _ => "",
        };
        let mut s = format!(
            "{prefix}.{space}{}.{:X}.{}{}",
            self.profile_idc,
            self.compatibility_flags.reverse_bits(),
            if self.tier { 'H' } else { 'L' },
            self.level_idc
        );
        let used = self
            .constraint_flags
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |i| i + 1);
        for b in &self.constraint_flags[..used] {
            s.push_str(&format!(".{b:X}"));
        }
        s
    }
}

/// SPS fields needed to describe a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sps {
    pub ptl: ProfileTierLevel,
    pub chroma_format_idc: u32,
    pub width: u32,
    pub height: u32,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
}

/// Parse an SPS NAL unit (two-byte header included).
pub fn parse_sps(nal: &[u8]) -> Result<Sps> {
    if nal_type(nal) != Some(NAL_SPS) || nal.len() < 3 {
        return Err(Error::invalid("not an H.265 SPS NAL unit"));
    }
    let rbsp = remove_emulation_prevention(&nal[2..]);
    let mut r = ExpGolombReader::new(&rbsp)?;

    r.read_bits(4)?; // sps_video_parameter_set_id
    let max_sub_layers_minus1 = r.read_bits(3)? as u8;
    r.read_bool()?; // sps_temporal_id_nesting_flag
    let ptl = parse_profile_tier_level(&mut r, max_sub_layers_minus1)?;
    r.read_ue()?; // sps_seq_parameter_set_id
    let chroma_format_idc = r.read_ue()?;
    let separate_colour_plane = chroma_format_idc == 3 && r.read_bool()?;
    let mut width = r.read_ue()?;
    let mut height = r.read_ue()?;

    if r.read_bool()? {
        let left = r.read_ue()?;
        let right = r.read_ue()?;
        let top = r.read_ue()?;
        let bottom = r.read_ue()?;
        let (sub_w, sub_h) = match (separate_colour_plane, chroma_format_idc) {
            (false, 1) => (2, 2),
            (false, 2) => (2, 1),
            _ => (1, 1),
        };
        width = cropped(width, sub_w, left, right)?;
        height = cropped(height, sub_h, top, bottom)?;
    }

    let bit_depth_luma = read_bit_depth(&mut r)?;
    let bit_depth_chroma = read_bit_depth(&mut r)?;

    Ok(Sps {
        ptl,
        chroma_format_idc,
        width,
        height,
        bit_depth_luma,
        bit_depth_chroma,
    })
}

fn parse_profile_tier_level(r: &mut ExpGolombReader<'_>, max_sub_layers_minus1: u8) -> Result<ProfileTierLevel> {
    let profile_space = r.read_bits(2)? as u8;
    let tier = r.read_bool()?;
    let profile_idc = r.read_bits(5)? as u8;
    let compatibility_flags = r.read_bits(32)?;
    let mut constraint_flags = [0u8; 6];
    for b in constraint_flags.iter_mut() {
        *b = r.read_u8()?;
    }
    let level_idc = r.read_u8()?;

    let subs = max_sub_layers_minus1 as usize;
    let mut profile_present = Vec::with_capacity(subs);
    let mut level_present = Vec::with_capacity(subs);
    for _ in 0..subs {
        profile_present.push(r.read_bool()?);
        level_present.push(r.read_bool()?);
    }
    if subs > 0 {
        r.skip_bits(2 * (8 - subs))?;
    }
    for i in 0..subs {
        if profile_present[i] {
            // space, tier, idc, compatibility, 48 constraint bits
            r.skip_bits(8 + 32 + 48)?;
        }
        if level_present[i] {
            r.skip_bits(8)?;
        }
    }

    Ok(ProfileTierLevel {
        profile_space,
        tier,
        profile_idc,
        compatibility_flags,
        constraint_flags,
        level_idc,
    })
}

/// One array of same-typed parameter sets in an hvcC record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalArray {
    pub completeness: bool,
    pub nal_type: u8,
    pub units: Vec<Bytes>,
}

/// HEVCDecoderConfigurationRecord.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcConfig {
    pub ptl: ProfileTierLevel,
    pub chroma_format_idc: u8,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
    pub length_size: u8,
    pub arrays: Vec<NalArray>,
}

const HVCC_HEADER_LEN: usize = 23;

impl HevcConfig {
    /// Build a record from VPS, SPS and PPS units; the first SPS supplies
    /// the profile and format fields.
    pub fn from_parameter_sets(vps: Vec<Bytes>, sps: Vec<Bytes>, pps: Vec<Bytes>) -> Result<Self> {
        let first = sps
            .first()
            .ok_or(Error::Invariant("hvcC needs at least one SPS"))?;
        let parsed = parse_sps(first)?;
        let arrays = [(NAL_VPS, vps), (NAL_SPS, sps), (NAL_PPS, pps)]
            .into_iter()
            .filter(|(_, units)| !units.is_empty())
            .map(|(nal_type, units)| NalArray {
                completeness: true,
                nal_type,
                units,
            })
            .collect();
        Ok(Self {
            ptl: parsed.ptl,
            chroma_format_idc: parsed.chroma_format_idc as u8,
            bit_depth_luma: parsed.bit_depth_luma,
            bit_depth_chroma: parsed.bit_depth_chroma,
            length_size: 4,
            arrays,
        })
    }

    pub fn parse(data: &Bytes) -> Result<Self> {
        if data.len() < HVCC_HEADER_LEN || data[0] != 1 {
            return Err(Error::invalid("hvcC record too short or wrong version"));
        }
        let mut constraint_flags = [0u8; 6];
        constraint_flags.copy_from_slice(&data[6..12]);
        let ptl = ProfileTierLevel {
            profile_space: data[1] >> 6,
            tier: data[1] & 0x20 != 0,
            profile_idc: data[1] & 0x1F,
            compatibility_flags: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
            constraint_flags,
            level_idc: data[12],
        };

        let mut pos = HVCC_HEADER_LEN;
        let mut arrays = Vec::with_capacity(data[22] as usize);
        for _ in 0..data[22] {
            if pos + 3 > data.len() {
                return Err(Error::invalid("hvcC array header truncated"));
            }
            let completeness = data[pos] & 0x80 != 0;
            let nal_type = data[pos] & 0x3F;
            let count = u16::from_be_bytes([data[pos + 1], data[pos + 2]]);
            pos += 3;
            let mut units = Vec::with_capacity(count as usize);
            for _ in 0..count {
                if pos + 2 > data.len() {
                    return Err(Error::invalid("hvcC unit length truncated"));
                }
                let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
                pos += 2;
                if pos + len > data.len() {
                    return Err(Error::invalid("hvcC unit truncated"));
                }
                units.push(data.slice(pos..pos + len));
                pos += len;
            }
            arrays.push(NalArray {
                completeness,
                nal_type,
                units,
            });
        }

        Ok(Self {
            ptl,
            chroma_format_idc: data[16] & 0x03,
            bit_depth_luma: (data[17] & 0x07) + 8,
            bit_depth_chroma: (data[18] & 0x07) + 8,
            length_size: (data[21] & 0x03) + 1,
            arrays,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u8(self.ptl.profile_space << 6 | (self.ptl.tier as u8) << 5 | self.ptl.profile_idc & 0x1F);
        buf.put_u32(self.ptl.compatibility_flags);
        buf.put_slice(&self.ptl.constraint_flags);
        buf.put_u8(self.ptl.level_idc);
        buf.put_u16(0xF000); // min_spatial_segmentation_idc
        buf.put_u8(0xFC); // parallelismType
        buf.put_u8(0xFC | self.chroma_format_idc & 0x03);
        buf.put_u8(0xF8 | self.bit_depth_luma.saturating_sub(8) & 0x07);
        buf.put_u8(0xF8 | self.bit_depth_chroma.saturating_sub(8) & 0x07);
        buf.put_u16(0); // avgFrameRate
        buf.put_u8(0x0C | self.length_size.saturating_sub(1) & 0x03);
        buf.put_u8(self.arrays.len() as u8);
        for array in &self.arrays {
            buf.put_u8((array.completeness as u8) << 7 | array.nal_type & 0x3F);
            buf.put_u16(array.units.len() as u16);
            for unit in &array.units {
                buf.put_u16(unit.len() as u16);
                buf.put_slice(unit);
            }
        }
        buf.freeze()
    }

    pub fn units_of_type(&self, nal_type: u8) -> impl Iterator<Item = &Bytes> {
        self.arrays
            .iter()
            .filter(move |a| a.nal_type == nal_type)
            .flat_map(|a| a.units.iter())
    }

    pub fn codec_string(&self) -> String {
        self.ptl.codec_string("hvc1")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::nal::h264::tests::BitWriter;

    /// Main profile, level 4.0, single sub-layer SPS.
    pub(crate) fn main_sps(width: u32, height: u32, crop_bottom: u32) -> Vec<u8> {
        let mut w = BitWriter::default();
        w.bits(0, 4).bits(0, 3).bit(true);
        // profile_tier_level: space 0, tier 0, profile 1
        w.bits(0, 2).bit(false).bits(1, 5);
        w.bits(0x6000_0000, 32);
        w.bits(0x90, 8);
        w.bits(0, 32).bits(0, 8);
        w.bits(120, 8);
        w.ue(0); // sps id
        w.ue(1); // 4:2:0
        w.ue(width).ue(height);
        if crop_bottom > 0 {
            w.bit(true).ue(0).ue(0).ue(0).ue(crop_bottom);
        } else {
            w.bit(false);
        }
        w.ue(0).ue(0);
        let mut nal = vec![0x42, 0x01];
        nal.extend(w.finish());
        nal
    }

    #[test]
    fn test_parse_sps_with_conformance_window() {
        let sps = parse_sps(&main_sps(1920, 1088, 4)).unwrap();
        assert_eq!(sps.width, 1920);
        assert_eq!(sps.height, 1080);
        assert_eq!(sps.ptl.profile_idc, 1);
        assert_eq!(sps.ptl.level_idc, 120);
        assert_eq!(sps.bit_depth_luma, 8);
    }

    #[test]
    fn test_parse_sps_rejects_crop_past_picture() {
        assert!(matches!(
            parse_sps(&main_sps(64, 64, 40)),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_codec_string() {
        let sps = parse_sps(&main_sps(64, 64, 0)).unwrap();
        assert_eq!(sps.ptl.codec_string("hvc1"), "hvc1.1.6.L120.90");
    }

    #[test]
    fn test_nal_header_helpers() {
        assert_eq!(nal_type(&[0x40, 0x01]), Some(NAL_VPS));
        assert_eq!(nal_type(&[0x26, 0x01]), Some(19));
        assert!(is_irap(19));
        assert!(!is_irap(1));
        assert!(first_slice_segment_in_pic(&[0x26, 0x01, 0xAF]));
        assert!(!first_slice_segment_in_pic(&[0x02, 0x01, 0x2F]));
    }

    #[test]
    fn test_hvcc_round_trip() {
        let vps = Bytes::from_static(&[0x40, 0x01, 0x0C]);
        let sps = Bytes::from(main_sps(1280, 720, 0));
        let pps = Bytes::from_static(&[0x44, 0x01, 0xC1]);
        let config = HevcConfig::from_parameter_sets(vec![vps.clone()], vec![sps.clone()], vec![pps]).unwrap();
        let bytes = config.to_bytes();
        let parsed = HevcConfig::parse(&bytes).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.units_of_type(NAL_VPS).collect::<Vec<_>>(), vec![&vps]);
        assert_eq!(parsed.units_of_type(NAL_SPS).next(), Some(&sps));
        assert_eq!(parsed.codec_string(), "hvc1.1.6.L120.90");
    }
}
