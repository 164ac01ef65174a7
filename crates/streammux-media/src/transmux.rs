//! Transmux controller: sniff the input, pick demuxer and muxers, route frames.

use crate::error::Result;
use crate::format::{Format, FormatOptions};
use crate::pipeline::{pipe, DemuxData, Demuxer, Muxer, Node, Passthrough, Pipe, ProbeResult, TrackFilter};
use bytes::{Bytes, BytesMut};
use std::fmt;
use streammux_common::{Track, TrackKind};
use tracing::{debug, info, warn};

/// Lifecycle of a [`Transmuxer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmuxState {
    Idle,
    InputDetected,
    Initialized,
    Running,
    Flushing,
    Done,
}

/// Which tracks go to which output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(rename_all = "lowercase"))]
pub enum OutputMode {
    /// Audio tracks only.
    Audio,
    /// Video tracks only.
    Video,
    /// Audio and video in one stream.
    #[default]
    Muxed,
    /// One stream for video, one for audio.
    Split,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct TransmuxOptions {
    pub output: Format,
    pub mode: OutputMode,
    /// Give up detecting the input after buffering this many bytes.
    pub max_probe_bytes: usize,
    /// Copy the input through untouched when it already matches the output.
    pub allow_passthrough: bool,
}

impl Default for TransmuxOptions {
    fn default() -> Self {
        Self {
            output: Format::Bmff,
            mode: OutputMode::Muxed,
            max_probe_bytes: 1 << 20,
            allow_passthrough: true,
        }
    }
}

/// One output of the transmuxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputStream {
    pub kinds: Vec<TrackKind>,
    pub tracks: Vec<Track>,
    /// MIME type with codecs parameter.
    pub mimetype: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmuxEvent {
    Detected(Format),
    Initialized {
        input: Format,
        output: Format,
        passthrough: bool,
        streams: Vec<OutputStream>,
    },
    /// Encoded bytes of output stream `stream`.
    Data { stream: usize, bytes: Bytes },
    /// The input cannot be converted; the transmuxer has reset itself.
    Unsupported(String),
    Done,
}

type OutputPipe = Pipe<TrackFilter, Box<dyn Muxer>>;

enum Route {
    Passthrough(Passthrough<Bytes>),
    Transmux {
        demuxer: Box<dyn Demuxer>,
        outputs: Vec<OutputPipe>,
    },
}

/// Converts a byte stream in any detectable format into one or more output
/// streams of the configured format.
pub struct Transmuxer {
    options: TransmuxOptions,
    formats: FormatOptions,
    state: TransmuxState,
    input: Option<Format>,
    buffer: BytesMut,
    route: Option<Route>,
}

impl fmt::Debug for Transmuxer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transmuxer")
            .field("state", &self.state)
            .field("input", &self.input)
            .field("output", &self.options.output)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl Transmuxer {
    pub fn new(options: TransmuxOptions, formats: FormatOptions) -> Self {
        Self {
            options,
            formats,
            state: TransmuxState::Idle,
            input: None,
            buffer: BytesMut::new(),
            route: None,
        }
    }

    pub fn state(&self) -> TransmuxState {
        self.state
    }

    pub fn input_format(&self) -> Option<Format> {
        self.input
    }

    fn unsupported(&mut self, reason: String, out: &mut Vec<TransmuxEvent>) {
        warn!(%reason, "Cannot transmux input");
        out.push(TransmuxEvent::Unsupported(reason));
        self.reset();
    }

    fn output_kinds(&self) -> Vec<Vec<TrackKind>> {
        match self.options.mode {
            OutputMode::Audio => vec![vec![TrackKind::Audio]],
            OutputMode::Video => vec![vec![TrackKind::Video]],
            OutputMode::Muxed => vec![vec![TrackKind::Video, TrackKind::Audio]],
            OutputMode::Split => vec![vec![TrackKind::Video], vec![TrackKind::Audio]],
        }
    }

    /// Plan the output streams for the probed tracks. `Err` carries the
    /// reason the combination is unsupported.
    fn plan(&self, input: Format, probe: &ProbeResult) -> std::result::Result<(bool, Vec<OutputStream>), String> {
        let output = self.options.output;
        let mut streams = Vec::new();
        for kinds in self.output_kinds() {
            let tracks: Vec<Track> = probe
                .tracks
                .iter()
                .filter(|t| kinds.contains(&t.kind))
                .cloned()
                .collect();
            if tracks.is_empty() {
                // split mode tolerates one missing kind
                if self.options.mode == OutputMode::Split {
                    continue;
                }
                return Err(format!("no {:?} tracks in the {input} input", self.options.mode).to_lowercase());
            }
            if let Some(track) = tracks.iter().find(|t| !output.supports_codec(&t.codec)) {
                return Err(format!("codec {} cannot be written to {output}", track.codec));
            }
            let mimes = output.base_mimetypes();
            let base = if tracks.iter().any(Track::is_video) {
                mimes.video.or(mimes.audio)
            } else {
                mimes.audio.or(mimes.video)
            }
            .unwrap_or("application/octet-stream");
            let codecs: Vec<&str> = tracks.iter().map(|t| t.codec.as_str()).collect();
            streams.push(OutputStream {
                kinds,
                mimetype: format!("{base}; codecs=\"{}\"", codecs.join(",")),
                tracks,
            });
        }
        if streams.is_empty() {
            return Err(format!("no audio or video tracks in the {input} input"));
        }
        let passthrough = self.options.allow_passthrough
            && self.options.mode == OutputMode::Muxed
            && input == output
            && streams[0].tracks.len() == probe.tracks.len();
        if !passthrough && output.muxer(&self.formats).is_none() {
            return Err(format!("{output} output is not supported"));
        }
        Ok((passthrough, streams))
    }

    /// Detect and probe the buffered input, then build the route.
    fn start(&mut self, end_of_input: bool, out: &mut Vec<TransmuxEvent>) -> Result<()> {
        if self.state == TransmuxState::Idle {
            let Some(format) = Format::detect(&self.buffer) else {
                if end_of_input || self.buffer.len() >= self.options.max_probe_bytes {
                    self.unsupported("input format not recognised".to_string(), out);
                }
                return Ok(());
            };
            debug!(format = %format, "Input detected");
            self.input = Some(format);
            self.state = TransmuxState::InputDetected;
            out.push(TransmuxEvent::Detected(format));
        }
        let Some(input) = self.input else {
            return Ok(());
        };
        let complete = end_of_input || self.buffer.len() >= self.options.max_probe_bytes;
        let probed = if complete {
            input.probe_complete(&self.buffer)
        } else {
            input.probe(&self.buffer)
        };
        let Some(probe) = probed else {
            if complete {
                self.unsupported(format!("no tracks found in the {input} input"), out);
            }
            return Ok(());
        };
        let (passthrough, streams) = match self.plan(input, &probe) {
            Ok(plan) => plan,
            Err(reason) => {
                self.unsupported(reason, out);
                return Ok(());
            }
        };

        let route = if passthrough {
            Route::Passthrough(Passthrough::new())
        } else {
            let mut outputs = Vec::with_capacity(streams.len());
            for stream in &streams {
                let Some(muxer) = self.options.output.muxer(&self.formats) else {
                    return Ok(());
                };
                outputs.push(pipe(TrackFilter::new(&stream.kinds), muxer));
            }
            Route::Transmux {
                demuxer: input.demuxer(&self.formats),
                outputs,
            }
        };
        info!(
            input = %input,
            output = %self.options.output,
            passthrough,
            streams = streams.len(),
            "Transmux initialized"
        );
        self.route = Some(route);
        self.state = TransmuxState::Initialized;
        out.push(TransmuxEvent::Initialized {
            input,
            output: self.options.output,
            passthrough,
            streams,
        });
        let buffered = self.buffer.split().freeze();
        self.feed(buffered, out)?;
        self.state = TransmuxState::Running;
        Ok(())
    }

    fn route_data(outputs: &mut [OutputPipe], data: Vec<DemuxData>, out: &mut Vec<TransmuxEvent>) -> Result<()> {
        for item in data {
            for (stream, output) in outputs.iter_mut().enumerate() {
                for bytes in output.push(item.clone())? {
                    out.push(TransmuxEvent::Data { stream, bytes });
                }
            }
        }
        Ok(())
    }

    fn feed(&mut self, chunk: Bytes, out: &mut Vec<TransmuxEvent>) -> Result<()> {
        match &mut self.route {
            Some(Route::Passthrough(node)) => {
                for bytes in node.push(chunk)? {
                    if !bytes.is_empty() {
                        out.push(TransmuxEvent::Data { stream: 0, bytes });
                    }
                }
            }
            Some(Route::Transmux { demuxer, outputs }) => {
                let data = demuxer.push(chunk)?;
                Self::route_data(outputs, data, out)?;
            }
            None => {}
        }
        Ok(())
    }
}

impl Node for Transmuxer {
    type Input = Bytes;
    type Output = TransmuxEvent;

    fn push(&mut self, chunk: Bytes) -> Result<Vec<TransmuxEvent>> {
        let mut out = Vec::new();
        match self.state {
            TransmuxState::Idle | TransmuxState::InputDetected => {
                self.buffer.extend_from_slice(&chunk);
                self.start(false, &mut out)?;
            }
            TransmuxState::Initialized | TransmuxState::Running => self.feed(chunk, &mut out)?,
            TransmuxState::Flushing | TransmuxState::Done => {
                debug!(bytes = chunk.len(), "Ignoring input after end of stream");
            }
        }
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<TransmuxEvent>> {
        let mut out = Vec::new();
        if self.state == TransmuxState::Done {
            return Ok(out);
        }
        if matches!(self.state, TransmuxState::Idle | TransmuxState::InputDetected) && !self.buffer.is_empty() {
            self.start(true, &mut out)?;
        }
        self.state = TransmuxState::Flushing;
        if let Some(Route::Transmux { demuxer, outputs }) = &mut self.route {
            let data = demuxer.flush()?;
            Self::route_data(outputs, data, &mut out)?;
            for (stream, output) in outputs.iter_mut().enumerate() {
                for bytes in output.flush()? {
                    out.push(TransmuxEvent::Data { stream, bytes });
                }
            }
        }
        out.push(TransmuxEvent::Done);
        self.state = TransmuxState::Done;
        Ok(out)
    }

    fn reset(&mut self) {
        *self = Self::new(self.options.clone(), self.formats.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::adts::tests::adts_stream;
    use crate::bmff::BmffDemuxer;
    use crate::m2ts::demuxer::tests::{audio_first_file, ts_file};
    use crate::m2ts::psi::STREAM_H265;
    use crate::pipeline::Node;

    fn options(output: Format, mode: OutputMode) -> TransmuxOptions {
        TransmuxOptions {
            output,
            mode,
            ..TransmuxOptions::default()
        }
    }

    fn run(transmuxer: &mut Transmuxer, chunks: &[&[u8]]) -> Vec<TransmuxEvent> {
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(transmuxer.push(Bytes::copy_from_slice(chunk)).unwrap());
        }
        events.extend(transmuxer.flush().unwrap());
        events
    }

    fn output(events: &[TransmuxEvent], index: usize) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                TransmuxEvent::Data { stream, bytes } if *stream == index => Some(bytes.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_ts_to_fragmented_mp4() {
        let mut t = Transmuxer::new(options(Format::Bmff, OutputMode::Muxed), FormatOptions::default());
        let data = ts_file(&[]);
        let events = run(&mut t, &[&data[..100], &data[100..]]);
        assert_eq!(events[0], TransmuxEvent::Detected(Format::M2ts));
        let TransmuxEvent::Initialized { input, passthrough, streams, .. } = &events[1] else {
            panic!("expected init, got {:?}", events[1]);
        };
        assert_eq!(*input, Format::M2ts);
        assert!(!passthrough);
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].mimetype, "video/mp4; codecs=\"avc1.42c01f,mp4a.40.2\"");
        assert_eq!(events.last(), Some(&TransmuxEvent::Done));
        assert_eq!(t.state(), TransmuxState::Done);

        // the result reads back as MP4
        let mp4 = output(&events, 0);
        let mut demuxer = BmffDemuxer::new();
        let mut frames = 0;
        for d in demuxer.push(Bytes::from(mp4)).unwrap() {
            frames += d.frames.len();
        }
        for d in demuxer.flush().unwrap() {
            frames += d.frames.len();
        }
        assert_eq!(frames, 4);
    }

    #[test]
    fn test_split_mode_builds_one_stream_per_kind() {
        let mut t = Transmuxer::new(options(Format::Bmff, OutputMode::Split), FormatOptions::default());
        let events = run(&mut t, &[&ts_file(&[])]);
        let TransmuxEvent::Initialized { streams, .. } = &events[1] else {
            panic!("expected init");
        };
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].mimetype, "video/mp4; codecs=\"avc1.42c01f\"");
        assert_eq!(streams[1].mimetype, "audio/mp4; codecs=\"mp4a.40.2\"");
        assert!(!output(&events, 0).is_empty());
        assert!(!output(&events, 1).is_empty());
    }

    #[test]
    fn test_passthrough_copies_input() {
        let mut t = Transmuxer::new(options(Format::Adts, OutputMode::Muxed), FormatOptions::default());
        let data = adts_stream(3);
        let events = run(&mut t, &[&data[..20], &data[20..]]);
        let TransmuxEvent::Initialized { passthrough, .. } = &events[1] else {
            panic!("expected init");
        };
        assert!(passthrough);
        assert_eq!(output(&events, 0), data);
    }

    #[test]
    fn test_audio_mode_extracts_adts() {
        let mut t = Transmuxer::new(options(Format::Adts, OutputMode::Audio), FormatOptions::default());
        let events = run(&mut t, &[&ts_file(&[])]);
        assert_eq!(output(&events, 0), adts_stream(2));
    }

    #[test]
    fn test_unsupported_codec_resets() {
        let mut t = Transmuxer::new(options(Format::Adts, OutputMode::Muxed), FormatOptions::default());
        let events = t.push(Bytes::from(ts_file(&[]))).unwrap();
        assert!(matches!(
            events.last(),
            Some(TransmuxEvent::Unsupported(reason)) if reason.contains("avc1")
        ));
        assert_eq!(t.state(), TransmuxState::Idle);
        assert_eq!(t.input_format(), None);
    }

    #[test]
    fn test_unrecognised_input() {
        let mut t = Transmuxer::new(
            TransmuxOptions {
                max_probe_bytes: 16,
                ..TransmuxOptions::default()
            },
            FormatOptions::default(),
        );
        assert!(t.push(Bytes::from_static(b"hello")).unwrap().is_empty());
        let events = t.push(Bytes::from_static(b"this is not media")).unwrap();
        assert_eq!(
            events,
            vec![TransmuxEvent::Unsupported("input format not recognised".to_string())]
        );
    }

    #[test]
    fn test_unwritable_output() {
        let mut t = Transmuxer::new(options(Format::Ogg, OutputMode::Audio), FormatOptions::default());
        let events = run(&mut t, &[&adts_stream(2)]);
        assert!(events
            .iter()
            .any(|e| matches!(e, TransmuxEvent::Unsupported(r) if r.contains("mp4a.40.2"))));
    }

    #[test]
    fn test_empty_input_is_done() {
        let mut t = Transmuxer::new(TransmuxOptions::default(), FormatOptions::default());
        assert_eq!(t.flush().unwrap(), vec![TransmuxEvent::Done]);
        t.reset();
        assert_eq!(t.state(), TransmuxState::Idle);
    }

    #[test]
    fn test_waits_for_late_video_stream() {
        let (data, prefix) = audio_first_file();
        let mut t = Transmuxer::new(options(Format::Bmff, OutputMode::Video), FormatOptions::default());
        let events = t.push(Bytes::copy_from_slice(&data[..prefix])).unwrap();
        assert_eq!(events, vec![TransmuxEvent::Detected(Format::M2ts)]);
        assert_eq!(t.state(), TransmuxState::InputDetected);

        let mut events = t.push(Bytes::copy_from_slice(&data[prefix..])).unwrap();
        events.extend(t.flush().unwrap());
        let TransmuxEvent::Initialized { streams, .. } = &events[0] else {
            panic!("expected init, got {:?}", events[0]);
        };
        assert_eq!(streams[0].mimetype, "video/mp4; codecs=\"avc1.42c01f\"");
        assert!(!output(&events, 0).is_empty());
        assert_eq!(events.last(), Some(&TransmuxEvent::Done));
    }

    #[test]
    fn test_end_of_input_drops_unconfigured_streams() {
        // The H.265 stream never carries a parameter set.
        let data = ts_file(&[(STREAM_H265, 0x102)]);
        let mut t = Transmuxer::new(options(Format::Bmff, OutputMode::Muxed), FormatOptions::default());
        assert_eq!(
            t.push(Bytes::from(data)).unwrap(),
            vec![TransmuxEvent::Detected(Format::M2ts)]
        );
        let events = t.flush().unwrap();
        let TransmuxEvent::Initialized { streams, .. } = &events[0] else {
            panic!("expected init, got {:?}", events[0]);
        };
        assert_eq!(streams[0].tracks.len(), 2);
        assert_eq!(events.last(), Some(&TransmuxEvent::Done));
    }
}
