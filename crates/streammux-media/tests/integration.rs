//! End-to-end conversions through the public API.

use bytes::{Bytes, BytesMut};
use streammux_common::{Time, TrackKind};
use streammux_media::audio::aac::AudioSpecificConfig;
use streammux_media::audio::{AdtsDemuxer, AdtsHeader};
use streammux_media::bmff::BmffDemuxer;
use streammux_media::ebml::EbmlDemuxer;
use streammux_media::nal::split_annex_b;
use streammux_media::{
    DemuxData, Demuxer, Format, FormatOptions, Node, OutputMode, TransmuxEvent, TransmuxOptions, Transmuxer,
};

fn adts(count: usize) -> Bytes {
    let config = AudioSpecificConfig {
        object_type: 2,
        sample_rate: 48_000,
        channel_config: 1,
    };
    let mut buf = BytesMut::new();
    for i in 0..count {
        let payload = vec![i as u8; 20 + i % 13];
        AdtsHeader::for_payload(&config, payload.len())
            .unwrap()
            .write(&mut buf);
        buf.extend_from_slice(&payload);
    }
    buf.freeze()
}

/// Push `data` in `chunk` sized pieces, then flush.
fn demux_chunked(demuxer: &mut dyn Demuxer, data: &Bytes, chunk: usize) -> Vec<DemuxData> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let end = (pos + chunk).min(data.len());
        out.extend(demuxer.push(data.slice(pos..end)).unwrap());
        pos = end;
    }
    out.extend(demuxer.flush().unwrap());
    out
}

fn frame_list(out: &[DemuxData]) -> Vec<(u32, Time, Bytes)> {
    out.iter()
        .flat_map(|d| d.frames.iter())
        .map(|f| (f.track_number, f.timestamp, f.data.clone()))
        .collect()
}

fn transmux(data: &Bytes, options: TransmuxOptions) -> Vec<TransmuxEvent> {
    let mut transmuxer = Transmuxer::new(options, FormatOptions::default());
    let mut events = transmuxer.push(data.clone()).unwrap();
    events.extend(transmuxer.flush().unwrap());
    events
}

fn stream_bytes(events: &[TransmuxEvent], index: usize) -> Bytes {
    let mut out = BytesMut::new();
    for event in events {
        if let TransmuxEvent::Data { stream, bytes } = event {
            if *stream == index {
                out.extend_from_slice(bytes);
            }
        }
    }
    out.freeze()
}

#[test]
fn annex_b_mixed_start_codes() {
    let data = Bytes::from_static(&[0, 0, 1, 0xAA, 0, 0, 0, 1, 0xBB, 0, 0, 1, 0xCC]);
    let units = split_annex_b(&data);
    assert_eq!(units, vec![
        Bytes::from_static(&[0xAA]),
        Bytes::from_static(&[0xBB]),
        Bytes::from_static(&[0xCC])
    ]);
}

#[test]
fn adts_to_webm_and_back() {
    let source = adts(60);
    let events = transmux(
        &source,
        TransmuxOptions {
            output: Format::Ebml,
            ..TransmuxOptions::default()
        },
    );
    assert_eq!(events.last(), Some(&TransmuxEvent::Done));
    let webm = stream_bytes(&events, 0);
    assert_eq!(Format::detect(&webm), Some(Format::Ebml));

    let whole = demux_chunked(&mut EbmlDemuxer::new(), &webm, webm.len());
    let tracks: Vec<_> = whole.iter().filter_map(|d| d.tracks.clone()).flatten().collect();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].codec, "mp4a.40.2");
    assert_eq!(frame_list(&whole).len(), 60);

    // splitting the input never changes the output
    for chunk in [1, 5, 64, 1000] {
        let split = demux_chunked(&mut EbmlDemuxer::new(), &webm, chunk);
        assert_eq!(frame_list(&split), frame_list(&whole), "chunk size {chunk}");
    }
}

#[test]
fn adts_to_mp4_is_chunking_invariant() {
    let source = adts(40);
    let mp4 = stream_bytes(&transmux(&source, TransmuxOptions::default()), 0);
    assert_eq!(Format::detect(&mp4), Some(Format::Bmff));

    let whole = demux_chunked(&mut BmffDemuxer::new(), &mp4, mp4.len());
    let frames = frame_list(&whole);
    assert_eq!(frames.len(), 40);

    let original = frame_list(&demux_chunked(&mut AdtsDemuxer::new(), &source, source.len()));
    let payloads: Vec<_> = frames.iter().map(|(_, _, data)| data.clone()).collect();
    let want: Vec<_> = original.iter().map(|(_, _, data)| data.clone()).collect();
    assert_eq!(payloads, want);

    for chunk in [3, 100, 777] {
        let split = demux_chunked(&mut BmffDemuxer::new(), &mp4, chunk);
        assert_eq!(frame_list(&split), frames, "chunk size {chunk}");
    }
}

#[test]
fn chained_transmux_returns_to_adts() {
    let source = adts(25);
    let mp4 = stream_bytes(&transmux(&source, TransmuxOptions::default()), 0);
    let back = stream_bytes(
        &transmux(
            &mp4,
            TransmuxOptions {
                output: Format::Adts,
                mode: OutputMode::Audio,
                ..TransmuxOptions::default()
            },
        ),
        0,
    );
    assert_eq!(back, source);
}

#[test]
fn probe_through_registry() {
    let source = adts(4);
    let format = Format::detect(&source).unwrap();
    assert_eq!(format, Format::Adts);
    let probe = format.probe(&source).unwrap();
    assert_eq!(probe.tracks[0].kind, TrackKind::Audio);
    assert_eq!(probe.tracks[0].sample_rate(), Some(48_000));
    assert_eq!(probe.tracks[0].channels(), Some(1));
}
