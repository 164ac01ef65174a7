//! Track selection node.

use super::{DemuxData, Node};
use crate::error::Result;
use std::collections::HashSet;
use streammux_common::{Track, TrackKind};

/// Keeps only the tracks of the given kinds, and their frames.
///
/// Frames of tracks that were never announced are dropped.
#[derive(Debug, Clone)]
pub struct TrackFilter {
    kinds: Vec<TrackKind>,
    selected: HashSet<u32>,
}

impl TrackFilter {
    pub fn new(kinds: &[TrackKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            selected: HashSet::new(),
        }
    }

    /// Video and audio tracks.
    pub fn media() -> Self {
        Self::new(&[TrackKind::Video, TrackKind::Audio])
    }

    pub fn accepts(&self, track: &Track) -> bool {
        self.kinds.contains(&track.kind)
    }
}

impl Node for TrackFilter {
    type Input = DemuxData;
    type Output = DemuxData;

    fn push(&mut self, input: DemuxData) -> Result<Vec<DemuxData>> {
        let mut tracks = None;
        if let Some(all) = input.tracks {
            let kept: Vec<Track> = all.into_iter().filter(|t| self.accepts(t)).collect();
            self.selected = kept.iter().map(|t| t.number).collect();
            tracks = Some(kept);
        }
        let frames = input
            .frames
            .into_iter()
            .filter(|f| self.selected.contains(&f.track_number))
            .collect();
        let out = DemuxData {
            info: input.info,
            tracks,
            frames,
        };
        Ok(if out.is_empty() { vec![] } else { vec![out] })
    }

    fn flush(&mut self) -> Result<Vec<DemuxData>> {
        Ok(Vec::new())
    }

    fn reset(&mut self) {
        self.selected.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use streammux_common::{ContainerInfo, Frame, Rational, Time};

    #[test]
    fn test_filter_drops_other_kinds() {
        let mut f = TrackFilter::new(&[TrackKind::Audio]);
        let tracks = vec![
            Track::video(1, "avc1.64001f", 640, 360),
            Track::audio(2, "opus", 2, 48_000),
        ];
        let out = f
            .push(DemuxData::init(ContainerInfo::new(Rational::new(1, 1000)), tracks))
            .unwrap();
        assert_eq!(out[0].tracks.as_ref().unwrap().len(), 1);

        let frames = vec![
            Frame::new(1, Time::ZERO, Bytes::from_static(b"v")),
            Frame::new(2, Time::ZERO, Bytes::from_static(b"a")),
        ];
        let out = f.push(DemuxData::frames(frames)).unwrap();
        assert_eq!(out[0].frames.len(), 1);
        assert_eq!(out[0].frames[0].track_number, 2);
    }

    #[test]
    fn test_filter_skips_empty_output() {
        let mut f = TrackFilter::new(&[TrackKind::Audio]);
        let out = f
            .push(DemuxData::frames(vec![Frame::new(
                9,
                Time::ZERO,
                Bytes::new(),
            )]))
            .unwrap();
        assert!(out.is_empty());
    }
}
