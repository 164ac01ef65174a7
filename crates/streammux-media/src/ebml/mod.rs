//! Matroska and WebM.
//!
//! EBML variable-length integers, a lazy element finder, block lacing, the
//! CodecID table and the demuxer and muxer built on them.

pub mod block;
pub mod codec_id;
pub mod demuxer;
pub mod find;
pub mod ids;
pub mod muxer;
pub mod vint;
pub mod writer;

pub use block::{parse_block, Block, Lacing};
pub use demuxer::EbmlDemuxer;
pub use find::{find_ebml, EbmlElement, Matcher};
pub use muxer::{EbmlMuxer, EbmlMuxerOptions};
