//! ISO base media file format (MP4).
//!
//! Box headers and the lazy box finder, sample tables, sample descriptions,
//! the progressive/fragmented demuxer and the fragmented muxer.

pub mod boxes;
pub mod demuxer;
pub mod esds;
pub mod frame_table;
pub mod muxer;
pub mod sample_entry;
pub mod writer;

pub use boxes::{find_box, find_named_box, BmffBox, BoxMatcher, FourCc};
pub use demuxer::BmffDemuxer;
pub use frame_table::{build_frame_table, FrameEntry, SampleTables};
pub use muxer::{BmffMuxer, BmffMuxerOptions};
