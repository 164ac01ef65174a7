//! Streammux-Common: shared types and byte helpers.
//!
//! This crate provides the vocabulary every streammux demuxer and muxer speaks:
//!
//! - **Exact time**: [`Rational`] numbers and unit-tagged [`Time`] values that
//!   convert between nanoseconds, microseconds, milliseconds and seconds
//!   without rounding
//! - **Tracks**: [`Track`] descriptions with per-kind [`CodecInfo`]
//! - **Frames**: timed [`Frame`]s carrying zero-copy `Bytes` payloads
//! - **Byte helpers**: concatenation, masked pattern matching and
//!   variable-width integer conversion in the `bytes` module
//!
//! # Examples
//!
//! ```
//! use streammux_common::{Rational, Time, TimeUnit};
//!
//! let t = Time::new(1500, TimeUnit::Milliseconds);
//! assert_eq!(t.get(TimeUnit::Seconds), Rational::new(3, 2));
//! assert_eq!(t.ticks(Rational::new(1, 90_000)), 135_000);
//! ```

pub mod bytes;
pub mod error;
pub mod frame;
pub mod rational;
pub mod time;
pub mod track;

pub use error::{Error, Result};
pub use frame::{ContainerInfo, Frame};
pub use rational::Rational;
pub use time::{Time, TimeUnit};
pub use track::{CodecInfo, ColorInfo, Track, TrackKind};
