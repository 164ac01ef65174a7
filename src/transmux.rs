//! File-level transmuxing and probing on top of `streammux_media`.

use crate::config::Config;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use streammux_common::TrackKind;
use streammux_media::{Format, Node, OutputStream, ProbeResult, TransmuxEvent, Transmuxer};

/// What a finished transmux produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmuxSummary {
    pub input: Format,
    pub output: Format,
    pub passthrough: bool,
    /// One entry per output stream: path and bytes written.
    pub files: Vec<(PathBuf, u64)>,
}

/// Feed `reader` through `transmuxer` in `chunk_size` pushes, handing every
/// event to `on_event`. Stops at the `Done` event or a read error.
pub fn run_transmux<R, F>(
    mut reader: R,
    transmuxer: &mut Transmuxer,
    chunk_size: usize,
    mut on_event: F,
) -> Result<()>
where
    R: Read,
    F: FnMut(TransmuxEvent) -> Result<()>,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = reader.read(&mut buf).context("Failed to read input")?;
        if n == 0 {
            break;
        }
        for event in transmuxer.push(Bytes::copy_from_slice(&buf[..n]))? {
            on_event(event)?;
        }
    }
    for event in transmuxer.flush()? {
        on_event(event)?;
    }
    Ok(())
}

/// Output file for each stream: `output` itself for a single stream,
/// otherwise `output` with the stream's kind appended to the file stem.
pub fn output_paths(output: &Path, streams: &[OutputStream]) -> Vec<PathBuf> {
    if streams.len() <= 1 {
        return vec![output.to_path_buf()];
    }
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = output.extension().map(|e| e.to_string_lossy().into_owned());
    streams
        .iter()
        .enumerate()
        .map(|(i, stream)| {
            let suffix = match stream.kinds.first() {
                Some(TrackKind::Video) => "video".to_string(),
                Some(TrackKind::Audio) => "audio".to_string(),
                _ => i.to_string(),
            };
            let name = match &ext {
                Some(ext) => format!("{stem}-{suffix}.{ext}"),
                None => format!("{stem}-{suffix}"),
            };
            output.with_file_name(name)
        })
        .collect()
}

/// Default output path: the input with the output container's extension.
pub fn default_output(input: &Path, format: Format) -> PathBuf {
    input.with_extension(format.container())
}

/// Transmux the file at `input` into `output` as configured.
pub fn transmux_file(input: &Path, output: &Path, config: &Config) -> Result<TransmuxSummary> {
    if input == output {
        anyhow::bail!("Output would overwrite the input: {:?}", input);
    }
    let file = File::open(input).with_context(|| format!("Failed to open input: {:?}", input))?;

    let mut transmuxer = Transmuxer::new(config.transmux.clone(), config.format_options());
    let mut summary: Option<TransmuxSummary> = None;
    let mut writers: Vec<BufWriter<File>> = Vec::new();
    let mut done = false;

    run_transmux(file, &mut transmuxer, config.input.chunk_size, |event| {
        match event {
            TransmuxEvent::Detected(format) => {
                tracing::debug!("Detected {} input", format);
            }
            TransmuxEvent::Initialized {
                input: format,
                output: out_format,
                passthrough,
                streams,
            } => {
                let paths = output_paths(output, &streams);
                for (path, stream) in paths.iter().zip(&streams) {
                    tracing::info!("Writing {} to {:?}", stream.mimetype, path);
                    let file = File::create(path)
                        .with_context(|| format!("Failed to create output: {:?}", path))?;
                    writers.push(BufWriter::new(file));
                }
                summary = Some(TransmuxSummary {
                    input: format,
                    output: out_format,
                    passthrough,
                    files: paths.into_iter().map(|p| (p, 0)).collect(),
                });
            }
            TransmuxEvent::Data { stream, bytes } => {
                let (Some(writer), Some(summary)) = (writers.get_mut(stream), summary.as_mut()) else {
                    anyhow::bail!("Data for unknown output stream {}", stream);
                };
                writer.write_all(&bytes).context("Failed to write output")?;
                summary.files[stream].1 += bytes.len() as u64;
            }
            TransmuxEvent::Unsupported(reason) => {
                anyhow::bail!("Cannot transmux {:?}: {}", input, reason);
            }
            TransmuxEvent::Done => done = true,
        }
        Ok(())
    })?;

    for writer in &mut writers {
        writer.flush().context("Failed to write output")?;
    }

    match summary {
        Some(summary) if done => Ok(summary),
        _ => anyhow::bail!("Input ended before any output was produced: {:?}", input),
    }
}

/// Detect the format of the file at `path` and probe its tracks from the
/// first `max_bytes` bytes.
pub fn probe_file(path: &Path, max_bytes: usize) -> Result<(Format, ProbeResult)> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut data = Vec::new();
    file.take(max_bytes as u64)
        .read_to_end(&mut data)
        .with_context(|| format!("Failed to read {:?}", path))?;

    let format = Format::detect(&data)
        .with_context(|| format!("Unrecognised media format: {:?}", path))?;
    let result = format
        .probe_complete(&data)
        .with_context(|| format!("No {} tracks found in the first {} bytes", format, data.len()))?;
    Ok((format, result))
}
