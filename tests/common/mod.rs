//! Shared fixtures for integration tests.

#![allow(dead_code)]

use bytes::BytesMut;
use std::path::PathBuf;
use streammux_media::audio::aac::AudioSpecificConfig;
use streammux_media::audio::AdtsHeader;
use tempfile::TempDir;

/// `count` AAC-LC frames, 44.1 kHz stereo, framed as ADTS.
pub fn adts_fixture(count: usize) -> Vec<u8> {
    let config = AudioSpecificConfig {
        object_type: 2,
        sample_rate: 44_100,
        channel_config: 2,
    };
    let mut buf = BytesMut::new();
    for i in 0..count {
        let payload = vec![(i % 251) as u8; 32 + i % 7];
        AdtsHeader::for_payload(&config, payload.len())
            .unwrap()
            .write(&mut buf);
        buf.extend_from_slice(&payload);
    }
    buf.to_vec()
}

/// Write `data` to `name` inside a fresh temporary directory.
pub fn write_fixture(name: &str, data: &[u8]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    std::fs::write(&path, data).unwrap();
    (dir, path)
}
