//! Audio codecs and raw audio stream formats.

pub mod aac;
pub mod adts;
pub mod framed;
pub mod mpeg;
pub mod ogg;
pub mod opus;

pub use adts::{AdtsDemuxer, AdtsHeader, AdtsMuxer};
pub use framed::{AudioSyntax, FrameHeader, FramedAudioDemuxer};
pub use mpeg::{MpegAudioDemuxer, MpegAudioHeader};
pub use ogg::OggDemuxer;
