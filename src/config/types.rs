use serde::Deserialize;
use streammux_media::bmff::BmffMuxerOptions;
use streammux_media::ebml::EbmlMuxerOptions;
use streammux_media::nal::ElementaryOptions;
use streammux_media::{FormatOptions, TransmuxOptions};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub input: InputConfig,

    #[serde(default)]
    pub transmux: TransmuxOptions,

    #[serde(default)]
    pub ebml: EbmlMuxerOptions,

    #[serde(default)]
    pub bmff: BmffMuxerOptions,

    #[serde(default)]
    pub h26x: ElementaryOptions,
}

impl Config {
    /// Per-format options handed to demuxer and muxer factories.
    pub fn format_options(&self) -> FormatOptions {
        FormatOptions {
            ebml: self.ebml.clone(),
            bmff: self.bmff.clone(),
            h26x: self.h26x.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InputConfig {
    /// Bytes read from the input per push
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    64 * 1024
}
