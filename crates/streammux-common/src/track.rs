//! Track descriptions shared by every demuxer and muxer.

use crate::rational::Rational;
use crate::time::Time;
use bytes::Bytes;
use std::fmt;

/// Kind of media carried by a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(rename_all = "lowercase"))]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
    Other,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
            Self::Subtitle => write!(f, "subtitle"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Colour description as coded in H.273 terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ColorInfo {
    pub primaries: u8,
    pub transfer: u8,
    pub matrix: u8,
    pub full_range: bool,
}

/// Kind-specific parameters of a track.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(tag = "kind", rename_all = "lowercase"))]
pub enum CodecInfo {
    Video {
        width: u32,
        height: u32,
        color: Option<ColorInfo>,
    },
    Audio {
        channels: u16,
        sample_rate: u32,
        bit_depth: u16,
    },
    #[default]
    None,
}

/// One elementary stream inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Track {
    /// Container track number (Matroska TrackNumber, MP4 track_ID, TS PID).
    pub number: u32,
    pub kind: TrackKind,
    /// Short codec string such as `avc1.64001f`, `mp4a.40.2` or `opus`.
    pub codec: String,
    /// Seconds per tick of the track's native clock.
    pub timescale: Rational,
    pub info: CodecInfo,
    /// Codec configuration record (avcC, hvcC, AudioSpecificConfig, OpusHead...).
    pub codec_private: Bytes,
    pub language: Option<String>,
    pub default_duration: Option<Time>,
}

impl Track {
    pub fn new(number: u32, kind: TrackKind, codec: impl Into<String>) -> Self {
        Self {
            number,
            kind,
            codec: codec.into(),
            timescale: Rational::new(1, 1000),
            info: CodecInfo::None,
            codec_private: Bytes::new(),
            language: None,
            default_duration: None,
        }
    }

    pub fn video(number: u32, codec: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            info: CodecInfo::Video {
                width,
                height,
                color: None,
            },
            ..Self::new(number, TrackKind::Video, codec)
        }
    }

    pub fn audio(number: u32, codec: impl Into<String>, channels: u16, sample_rate: u32) -> Self {
        Self {
            info: CodecInfo::Audio {
                channels,
                sample_rate,
                bit_depth: 16,
            },
            timescale: Rational::new(1, sample_rate.max(1) as i64),
            ..Self::new(number, TrackKind::Audio, codec)
        }
    }

    pub fn with_timescale(mut self, timescale: Rational) -> Self {
        self.timescale = timescale;
        self
    }

    pub fn with_codec_private(mut self, codec_private: impl Into<Bytes>) -> Self {
        self.codec_private = codec_private.into();
        self
    }

    pub fn with_default_duration(mut self, duration: Time) -> Self {
        self.default_duration = Some(duration);
        self
    }

    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind == TrackKind::Audio
    }

    /// Codec family: the part of the codec string before the first dot.
    pub fn codec_family(&self) -> &str {
        self.codec.split('.').next().unwrap_or(&self.codec)
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self.info {
            CodecInfo::Video { width, height, .. } => Some((width, height)),
            _ => None,
        }
    }

    pub fn sample_rate(&self) -> Option<u32> {
        match self.info {
            CodecInfo::Audio { sample_rate, .. } => Some(sample_rate),
            _ => None,
        }
    }

    pub fn channels(&self) -> Option<u16> {
        match self.info {
            CodecInfo::Audio { channels, .. } => Some(channels),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_family() {
        let t = Track::video(1, "avc1.64001f", 1920, 1080);
        assert_eq!(t.codec_family(), "avc1");
        assert_eq!(Track::new(2, TrackKind::Audio, "opus").codec_family(), "opus");
    }

    #[test]
    fn test_audio_timescale_follows_sample_rate() {
        let t = Track::audio(2, "mp4a.40.2", 2, 48_000);
        assert_eq!(t.timescale, Rational::new(1, 48_000));
        assert_eq!(t.sample_rate(), Some(48_000));
        assert_eq!(t.dimensions(), None);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(TrackKind::Subtitle.to_string(), "subtitle");
    }

    #[cfg(feature = "serialize")]
    #[test]
    fn test_track_serializes() {
        let t = Track::audio(2, "opus", 2, 48_000);
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"kind\":\"audio\""));
    }
}
