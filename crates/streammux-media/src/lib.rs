//! Streammux-Media: incremental demuxers and muxers
//!
//! Every component is a push-driven [`pipeline::Node`]: feed it arbitrarily
//! split chunks, collect what those chunks completed, and call `flush` at the
//! end of the stream. Splitting the input differently never changes the
//! result.
//!
//! # Modules
//!
//! - `ebml` - Matroska/WebM demuxer, muxer and element finder
//! - `bmff` - ISO-BMFF (MP4) demuxer and fragmented MP4 muxer
//! - `nal` - Annex-B framing and H.264/H.265 parameter sets
//! - `audio` - ADTS, MPEG audio and Ogg demuxers, ADTS muxer
//! - `m2ts` - MPEG transport stream demuxer
//! - `format` - format registry: detection, probing and factory methods
//! - `transmux` - detect the input and convert it to another format
//!
//! # Example
//!
//! ```
//! use streammux_media::{Format, FormatOptions, Node, TransmuxEvent, TransmuxOptions, Transmuxer};
//!
//! let mut transmuxer = Transmuxer::new(TransmuxOptions::default(), FormatOptions::default());
//! assert_eq!(transmuxer.flush().unwrap(), vec![TransmuxEvent::Done]);
//! assert_eq!(Format::from_container("mkv"), Some(Format::Ebml));
//! ```

pub mod audio;
pub mod bmff;
pub mod codec_string;
pub mod ebml;
pub mod error;
pub mod format;
pub mod m2ts;
pub mod nal;
pub mod pipeline;
pub mod transmux;

pub use error::{Error, Result};
pub use format::{Format, FormatOptions, MimeTypes};
pub use pipeline::{pipe, DemuxData, Demuxer, Muxer, Node, Pipe, Probe, ProbeResult, TrackFilter};
pub use transmux::{OutputMode, OutputStream, TransmuxEvent, TransmuxOptions, TransmuxState, Transmuxer};
