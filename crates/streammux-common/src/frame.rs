//! Timed frames and container-level information.

use crate::rational::Rational;
use crate::time::Time;
use bytes::Bytes;

/// One coded frame (access unit, audio frame, subtitle cue).
///
/// `data` is usually a slice of the buffer the demuxer was pushed; it keeps
/// that buffer alive for as long as the frame exists.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Frame {
    pub track_number: u32,
    /// Presentation timestamp.
    pub timestamp: Time,
    pub duration: Time,
    pub keyframe: bool,
    pub invisible: bool,
    pub discardable: bool,
    pub data: Bytes,
}

impl Frame {
    pub fn new(track_number: u32, timestamp: Time, data: Bytes) -> Self {
        Self {
            track_number,
            timestamp,
            duration: Time::ZERO,
            keyframe: false,
            invisible: false,
            discardable: false,
            data,
        }
    }

    pub fn with_duration(mut self, duration: Time) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_keyframe(mut self, keyframe: bool) -> Self {
        self.keyframe = keyframe;
        self
    }

    /// Presentation end time.
    pub fn end(&self) -> Time {
        self.timestamp + self.duration
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Container-wide information reported once per demux session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ContainerInfo {
    pub duration: Option<Time>,
    /// Seconds per tick of the container clock (Matroska TimestampScale,
    /// MP4 movie timescale).
    pub timestamp_scale: Rational,
}

impl ContainerInfo {
    pub fn new(timestamp_scale: Rational) -> Self {
        Self {
            duration: None,
            timestamp_scale,
        }
    }

    pub fn with_duration(mut self, duration: Time) -> Self {
        self.duration = Some(duration);
        self
    }
}
