//! MPEG-4 AudioSpecificConfig.

use crate::error::{Error, Result};
use crate::nal::golomb::ExpGolombReader;
use bytes::Bytes;

/// Sampling frequencies by `sampling_frequency_index`.
pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// PCM samples per AAC frame.
pub const SAMPLES_PER_FRAME: u32 = 1024;

pub const AOT_AAC_LC: u8 = 2;

const ESCAPE_OBJECT_TYPE: u32 = 31;
const EXPLICIT_RATE_INDEX: u32 = 15;

pub fn sample_rate_index(rate: u32) -> Option<u8> {
    SAMPLE_RATES.iter().position(|r| *r == rate).map(|i| i as u8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sample_rate: u32,
    pub channel_config: u8,
}

impl AudioSpecificConfig {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::invalid("empty AudioSpecificConfig"));
        }
        let mut r = ExpGolombReader::new(data)?;
        let mut object_type = r.read_bits(5)?;
        if object_type == ESCAPE_OBJECT_TYPE {
            object_type = 32 + r.read_bits(6)?;
        }
        let index = r.read_bits(4)?;
        let sample_rate = if index == EXPLICIT_RATE_INDEX {
            r.read_bits(24)?
        } else {
            *SAMPLE_RATES
                .get(index as usize)
                .ok_or_else(|| Error::invalid(format!("AAC sampling frequency index {index}")))?
        };
        let channel_config = r.read_bits(4)? as u8;
        Ok(Self {
            object_type: object_type as u8,
            sample_rate,
            channel_config,
        })
    }

    /// Two-byte form (or five with an explicit rate) without extensions.
    pub fn to_bytes(&self) -> Bytes {
        let mut bits: u64 = 0;
        let mut len = 0;
        let mut put = |value: u64, n: u32| {
            bits = bits << n | value;
            len += n;
        };
        if self.object_type >= 32 {
            put(ESCAPE_OBJECT_TYPE as u64, 5);
            put((self.object_type - 32) as u64, 6);
        } else {
            put(self.object_type as u64, 5);
        }
        match sample_rate_index(self.sample_rate) {
            Some(i) => put(i as u64, 4),
            None => {
                put(EXPLICIT_RATE_INDEX as u64, 4);
                put(self.sample_rate as u64 & 0xFF_FFFF, 24);
            }
        }
        put(self.channel_config as u64, 4);
        let bytes_len = len.div_ceil(8);
        let padded = bits << (bytes_len * 8 - len);
        let out: Vec<u8> = (0..bytes_len)
            .rev()
            .map(|i| (padded >> (i * 8)) as u8)
            .collect();
        Bytes::from(out)
    }

    /// Channel count; configuration 7 is 7.1.
    pub fn channels(&self) -> u16 {
        match self.channel_config {
            7 => 8,
            n => n as u16,
        }
    }

    pub fn codec_string(&self) -> String {
        format!("mp4a.40.{}", self.object_type)
    }
}
