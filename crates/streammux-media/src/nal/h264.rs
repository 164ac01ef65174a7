//! H.264 sequence parameter sets and avcC records.

use super::annexb::remove_emulation_prevention;
use super::golomb::ExpGolombReader;
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use streammux_common::{ColorInfo, Rational};

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

/// NAL unit type from the first header byte.
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

/// Profiles whose SPS carries chroma format and scaling matrices.
const HIGH_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// Sample aspect ratios for aspect_ratio_idc 1 to 16 (Table E-1).
const SAR_TABLE: [(u32, u32); 16] = [
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

const EXTENDED_SAR: u8 = 255;

/// VUI timing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate: bool,
}

/// The parts of an SPS needed to describe a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sps {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub sps_id: u32,
    pub chroma_format_idc: u32,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
    pub frame_mbs_only: bool,
    pub width: u32,
    pub height: u32,
    pub sar: Option<(u32, u32)>,
    pub color: Option<ColorInfo>,
    pub timing: Option<Timing>,
}

impl Sps {
    /// Frames per second from VUI timing (two fields per frame).
    pub fn framerate(&self) -> Option<Rational> {
        let t = self.timing?;
        if t.num_units_in_tick == 0 || t.time_scale == 0 {
            return None;
        }
        Some(Rational::new(
            t.time_scale as i64,
            2 * t.num_units_in_tick as i64,
        ))
    }

    /// Seconds per VUI clock tick.
    pub fn timescale(&self) -> Option<Rational> {
        let t = self.timing?;
        (t.time_scale != 0).then(|| Rational::new(1, t.time_scale as i64))
    }

    pub fn codec_string(&self) -> String {
        format!(
            "avc1.{:02x}{:02x}{:02x}",
            self.profile_idc, self.constraint_flags, self.level_idc
        )
    }
}

/// Parse an SPS NAL unit (header byte included).
///
/// Fields are read strictly in the order of H.264 7.3.2.1.1.
pub fn parse_sps(nal: &[u8]) -> Result<Sps> {
    if nal_type(nal) != Some(NAL_SPS) {
        return Err(Error::invalid("not an SPS NAL unit"));
    }
    let rbsp = remove_emulation_prevention(&nal[1..]);
    let mut r = ExpGolombReader::new(&rbsp)?;

    let profile_idc = r.read_u8()?;
    let constraint_flags = r.read_u8()?;
    let level_idc = r.read_u8()?;
    let sps_id = r.read_ue()?;

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    let mut bit_depth_luma = 8;
    let mut bit_depth_chroma = 8;
    if HIGH_PROFILES.contains(&profile_idc) {
        chroma_format_idc = r.read_ue()?;
        if chroma_format_idc > 3 {
            return Err(Error::invalid(format!("chroma_format_idc {chroma_format_idc}")));
        }
        if chroma_format_idc == 3 {
            separate_colour_plane = r.read_bool()?;
        }
        bit_depth_luma = read_bit_depth(&mut r)?;
        bit_depth_chroma = read_bit_depth(&mut r)?;
        r.read_bool()?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bool()? {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.read_bool()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    match r.read_ue()? {
        0 => {
            r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
        }
        1 => {
            r.read_bool()?; // delta_pic_order_always_zero_flag
            r.read_se()?; // offset_for_non_ref_pic
            r.read_se()?; // offset_for_top_to_bottom_field
            let cycle = r.read_ue()?;
            for _ in 0..cycle {
                r.read_se()?;
            }
        }
        _ => {}
    }
    r.read_ue()?; // max_num_ref_frames
    r.read_bool()?; // gaps_in_frame_num_value_allowed_flag
    let width_mbs = r.read_ue()? + 1;
    let height_map_units = r.read_ue()? + 1;
    let frame_mbs_only = r.read_bool()?;
    if !frame_mbs_only {
        r.read_bool()?; // mb_adaptive_frame_field_flag
    }
    r.read_bool()?; // direct_8x8_inference_flag

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if r.read_bool()? {
        crop_left = r.read_ue()?;
        crop_right = r.read_ue()?;
        crop_top = r.read_ue()?;
        crop_bottom = r.read_ue()?;
    }

    let field_factor = if frame_mbs_only { 1 } else { 2 };
    let chroma_array_type = if separate_colour_plane { 0 } else { chroma_format_idc };
    let (crop_unit_x, crop_unit_y) = match chroma_array_type {
        0 => (1, field_factor),
        1 => (2, 2 * field_factor),
        2 => (2, field_factor),
        _ => (1, field_factor),
    };
    let coded_width = width_mbs
        .checked_mul(16)
        .ok_or_else(|| Error::invalid(format!("SPS width of {width_mbs} macroblocks")))?;
    let coded_height = height_map_units
        .checked_mul(16 * field_factor)
        .ok_or_else(|| Error::invalid(format!("SPS height of {height_map_units} map units")))?;
    let width = cropped(coded_width, crop_unit_x, crop_left, crop_right)?;
    let height = cropped(coded_height, crop_unit_y, crop_top, crop_bottom)?;

    let mut sar = None;
    let mut color = None;
    let mut timing = None;
    if r.read_bool()? {
        if r.read_bool()? {
            let idc = r.read_u8()?;
            if idc == EXTENDED_SAR {
                let w = r.read_bits(16)?;
                let h = r.read_bits(16)?;
                sar = Some((w, h));
            } else if (1..=16).contains(&idc) {
                sar = Some(SAR_TABLE[idc as usize - 1]);
            }
        }
        if r.read_bool()? {
            r.read_bool()?; // overscan_appropriate_flag
        }
        if r.read_bool()? {
            r.read_bits(3)?; // video_format
            let full_range = r.read_bool()?;
            let mut info = ColorInfo {
                primaries: 2,
                transfer: 2,
                matrix: 2,
                full_range,
            };
            if r.read_bool()? {
                info.primaries = r.read_u8()?;
                info.transfer = r.read_u8()?;
                info.matrix = r.read_u8()?;
            }
            color = Some(info);
        }
        if r.read_bool()? {
            r.read_ue()?; // chroma_sample_loc_type_top_field
            r.read_ue()?; // chroma_sample_loc_type_bottom_field
        }
        if r.read_bool()? {
            timing = Some(Timing {
                num_units_in_tick: r.read_bits(32)?,
                time_scale: r.read_bits(32)?,
                fixed_frame_rate: r.read_bool()?,
            });
        }
    }

    Ok(Sps {
        profile_idc,
        constraint_flags,
        level_idc,
        sps_id,
        chroma_format_idc,
        bit_depth_luma,
        bit_depth_chroma,
        frame_mbs_only,
        width,
        height,
        sar,
        color,
        timing,
    })
}

/// `8 + bit_depth_minus8`, which may not exceed 14.
pub(crate) fn read_bit_depth(r: &mut ExpGolombReader<'_>) -> Result<u8> {
    let minus8 = r.read_ue()?;
    if minus8 > 6 {
        return Err(Error::invalid(format!("bit depth of {} bits", minus8 as u64 + 8)));
    }
    Ok(8 + minus8 as u8)
}

/// `size` less a crop of `unit * (a + b)` samples; the crop must leave at
/// least one sample.
pub(crate) fn cropped(size: u32, unit: u32, a: u32, b: u32) -> Result<u32> {
    a.checked_add(b)
        .and_then(|crop| crop.checked_mul(unit))
        .and_then(|crop| size.checked_sub(crop))
        .filter(|&left| left > 0)
        .ok_or_else(|| Error::invalid(format!("crop of {unit} * ({a} + {b}) exceeds {size} samples")))
}

fn skip_scaling_list(r: &mut ExpGolombReader<'_>, size: usize) -> Result<()> {
    let mut last = 8i64;
    let mut next = 8i64;
    for _ in 0..size {
        if next != 0 {
            let delta = r.read_se()? as i64;
            next = (last + delta + 256).rem_euclid(256);
        }
        if next != 0 {
            last = next;
        }
    }
    Ok(())
}

/// `first_mb_in_slice` of a slice NAL unit.
pub fn first_mb_in_slice(nal: &[u8]) -> Result<u32> {
    let head = &nal[1.min(nal.len())..nal.len().min(9)];
    let rbsp = remove_emulation_prevention(head);
    ExpGolombReader::new(&rbsp)?.read_ue()
}

/// AVCDecoderConfigurationRecord.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    pub profile_idc: u8,
    pub profile_compatibility: u8,
    pub level_idc: u8,
    pub length_size: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcConfig {
    pub fn from_parameter_sets(sps: Vec<Bytes>, pps: Vec<Bytes>) -> Result<Self> {
        let first = sps
            .first()
            .ok_or(Error::Invariant("avcC needs at least one SPS"))?;
        if first.len() < 4 {
            return Err(Error::invalid("SPS too short for avcC"));
        }
        Ok(Self {
            profile_idc: first[1],
            profile_compatibility: first[2],
            level_idc: first[3],
            length_size: 4,
            sps,
            pps,
        })
    }

    pub fn parse(data: &Bytes) -> Result<Self> {
        if data.len() < 7 || data[0] != 1 {
            return Err(Error::invalid("avcC record too short or wrong version"));
        }
        let length_size = (data[4] & 0x03) + 1;
        let mut pos = 5;
        let sps_count = (data[pos] & 0x1F) as usize;
        pos += 1;
        let sps = read_parameter_sets(data, &mut pos, sps_count)?;
        let pps_count = *data
            .get(pos)
            .ok_or_else(|| Error::invalid("avcC missing PPS count"))? as usize;
        pos += 1;
        let pps = read_parameter_sets(data, &mut pos, pps_count)?;
        Ok(Self {
            profile_idc: data[1],
            profile_compatibility: data[2],
            level_idc: data[3],
            length_size,
            sps,
            pps,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u8(self.profile_idc);
        buf.put_u8(self.profile_compatibility);
        buf.put_u8(self.level_idc);
        buf.put_u8(0xFC | (self.length_size.saturating_sub(1) & 0x03));
        buf.put_u8(0xE0 | (self.sps.len() as u8 & 0x1F));
        for sps in &self.sps {
            buf.put_u16(sps.len() as u16);
            buf.put_slice(sps);
        }
        buf.put_u8(self.pps.len() as u8);
        for pps in &self.pps {
            buf.put_u16(pps.len() as u16);
            buf.put_slice(pps);
        }
        if HIGH_PROFILES.contains(&self.profile_idc) {
            if let Some(Ok(sps)) = self.sps.first().map(|s| parse_sps(s)) {
                buf.put_u8(0xFC | (sps.chroma_format_idc as u8 & 0x03));
                buf.put_u8(0xF8 | (sps.bit_depth_luma - 8));
                buf.put_u8(0xF8 | (sps.bit_depth_chroma - 8));
                buf.put_u8(0);
            }
        }
        buf.freeze()
    }

    pub fn codec_string(&self) -> String {
        format!(
            "avc1.{:02x}{:02x}{:02x}",
            self.profile_idc, self.profile_compatibility, self.level_idc
        )
    }
}

fn read_parameter_sets(data: &Bytes, pos: &mut usize, count: usize) -> Result<Vec<Bytes>> {
    let mut sets = Vec::with_capacity(count);
    for _ in 0..count {
        if *pos + 2 > data.len() {
            return Err(Error::invalid("parameter set length truncated"));
        }
        let len = u16::from_be_bytes([data[*pos], data[*pos + 1]]) as usize;
        *pos += 2;
        if *pos + len > data.len() {
            return Err(Error::invalid("parameter set truncated"));
        }
        sets.push(data.slice(*pos..*pos + len));
        *pos += len;
    }
    Ok(sets)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// MSB-first bit writer for building parameter sets in tests.
    #[derive(Default)]
    pub(crate) struct BitWriter {
        bytes: Vec<u8>,
        bits: u32,
    }

    impl BitWriter {
        pub(crate) fn bit(&mut self, b: bool) -> &mut Self {
            if self.bits % 8 == 0 {
                self.bytes.push(0);
            }
            if b {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 0x80 >> (self.bits % 8);
            }
            self.bits += 1;
            self
        }

        pub(crate) fn bits(&mut self, value: u32, n: u32) -> &mut Self {
            for i in (0..n).rev() {
                self.bit(value >> i & 1 == 1);
            }
            self
        }

        pub(crate) fn ue(&mut self, value: u32) -> &mut Self {
            let v = value as u64 + 1;
            let len = 64 - v.leading_zeros();
            self.bits(0, len - 1);
            for i in (0..len).rev() {
                self.bit(v >> i & 1 == 1);
            }
            self
        }

        pub(crate) fn finish(&mut self) -> Vec<u8> {
            // rbsp_stop_one_bit
            self.bit(true);
            std::mem::take(&mut self.bytes)
        }
    }

    /// Baseline 4:2:0 SPS with an optional bottom crop and 25 fps VUI timing.
    pub(crate) fn baseline_sps(width_mbs: u32, height_mbs: u32, crop_bottom: u32, timing: bool) -> Vec<u8> {
        let mut w = BitWriter::default();
        w.bits(66, 8).bits(0xC0, 8).bits(31, 8);
        w.ue(0); // sps id
        w.ue(0); // log2_max_frame_num_minus4
        w.ue(2); // pic_order_cnt_type
        w.ue(1); // max_num_ref_frames
        w.bit(false);
        w.ue(width_mbs - 1);
        w.ue(height_mbs - 1);
        w.bit(true); // frame_mbs_only
        w.bit(true); // direct_8x8
        if crop_bottom > 0 {
            w.bit(true).ue(0).ue(0).ue(0).ue(crop_bottom);
        } else {
            w.bit(false);
        }
        w.bit(timing); // vui
        if timing {
            w.bit(true).bits(1, 8); // aspect ratio 1:1
            w.bit(false); // overscan
            w.bit(false); // video signal type
            w.bit(false); // chroma loc
            w.bit(true).bits(1, 32).bits(50, 32).bit(true);
        }
        let mut nal = vec![0x67];
        nal.extend(w.finish());
        nal
    }

    #[test]
    fn test_parse_baseline_sps() {
        let nal = baseline_sps(80, 45, 0, false);
        let sps = parse_sps(&nal).unwrap();
        assert_eq!(sps.profile_idc, 66);
        assert_eq!(sps.level_idc, 31);
        assert_eq!(sps.width, 1280);
        assert_eq!(sps.height, 720);
        assert_eq!(sps.framerate(), None);
        assert_eq!(sps.codec_string(), "avc1.42c01f");
    }

    #[test]
    fn test_parse_sps_with_crop_and_timing() {
        // 1920x1088 coded, cropped by 4 * 2 rows to 1080
        let nal = baseline_sps(120, 68, 4, true);
        let sps = parse_sps(&nal).unwrap();
        assert_eq!(sps.width, 1920);
        assert_eq!(sps.height, 1080);
        assert_eq!(sps.sar, Some((1, 1)));
        assert_eq!(sps.framerate(), Some(Rational::from_integer(25)));
        assert_eq!(sps.timescale(), Some(Rational::new(1, 50)));
    }

    #[test]
    fn test_parse_high_profile_with_scaling_list() {
        let mut w = BitWriter::default();
        w.bits(100, 8).bits(0, 8).bits(40, 8);
        w.ue(0); // sps id
        w.ue(1); // chroma_format_idc 4:2:0
        w.ue(2); // bit_depth_luma_minus8
        w.ue(2); // bit_depth_chroma_minus8
        w.bit(false); // transform bypass
        w.bit(true); // seq_scaling_matrix_present
        w.bit(true); // list 0 present
        // delta_scale of 0 repeated would keep next at 8; end the list early
        // with delta -8 (se code 16) so next_scale becomes 0.
        w.ue(16);
        for _ in 1..8 {
            w.bit(false);
        }
        w.ue(0).ue(2).ue(1).bit(false);
        w.ue(39).ue(29);
        w.bit(true).bit(true).bit(false).bit(false);
        let mut nal = vec![0x67];
        nal.extend(w.finish());

        let sps = parse_sps(&nal).unwrap();
        assert_eq!(sps.bit_depth_luma, 10);
        assert_eq!(sps.width, 640);
        assert_eq!(sps.height, 480);
    }

    #[test]
    fn test_parse_rejects_oversized_picture() {
        assert!(matches!(
            parse_sps(&baseline_sps(1 << 28, 45, 0, false)),
            Err(Error::InvalidData(_))
        ));
        // 720 rows cannot lose 2 * 400 of them
        assert!(matches!(
            parse_sps(&baseline_sps(80, 45, 400, false)),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_parse_rejects_bit_depth_past_14() {
        let mut w = BitWriter::default();
        w.bits(100, 8).bits(0, 8).bits(40, 8);
        w.ue(0).ue(1);
        w.ue(250); // bit_depth_luma_minus8
        w.ue(0).bit(false).bit(false);
        let mut nal = vec![0x67];
        nal.extend(w.finish());
        assert!(matches!(parse_sps(&nal), Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_parse_rejects_other_nal_types() {
        assert!(parse_sps(&[0x68, 0xCE]).is_err());
    }

    #[test]
    fn test_avc_config_round_trip() {
        let sps = Bytes::from(baseline_sps(80, 45, 0, false));
        let pps = Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]);
        let config = AvcConfig::from_parameter_sets(vec![sps.clone()], vec![pps.clone()]).unwrap();
        let bytes = config.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[4], 0xFF);
        let parsed = AvcConfig::parse(&bytes).unwrap();
        assert_eq!(parsed.sps, vec![sps]);
        assert_eq!(parsed.pps, vec![pps]);
        assert_eq!(parsed.length_size, 4);
        assert_eq!(parsed.codec_string(), "avc1.42c01f");
    }

    #[test]
    fn test_first_mb_in_slice() {
        // IDR slice with first_mb_in_slice 0 (bit 1) then slice_type ue
        assert_eq!(first_mb_in_slice(&[0x65, 0x88, 0x84]).unwrap(), 0);
        // first_mb_in_slice = 3: 00100
        assert_eq!(first_mb_in_slice(&[0x41, 0x20]).unwrap(), 3);
    }
}
