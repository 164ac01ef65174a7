//! NAL unit handling for H.264 and H.265.
//!
//! Annex-B framing, emulation prevention, Exp-Golomb decoding, parameter set
//! parsing and the access unit aggregation used by elementary stream and
//! MPEG-TS demuxing.

pub mod annexb;
pub mod demuxer;
pub mod golomb;
pub mod h264;
pub mod h265;

pub use annexb::{remove_emulation_prevention, split_annex_b, AnnexBScanner};
pub use demuxer::{
    AccessUnit, AccessUnitBuilder, ElementaryOptions, H264Demuxer, H265Demuxer, NalSyntax, ParameterSets, H264, H265,
};
pub use golomb::ExpGolombReader;
