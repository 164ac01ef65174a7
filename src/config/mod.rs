mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "./streammux.toml";

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config = parse_config(&content)
        .with_context(|| format!("Failed to load config file: {:?}", path))?;

    Ok(config)
}

/// Parse and validate configuration from TOML text
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Invalid TOML")?;
    validate_config(&config)?;
    Ok(config)
}

/// Load config from `custom_path`, the default location, or return defaults
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let path = Path::new(DEFAULT_CONFIG_PATH);
    if path.exists() {
        return load_config(path);
    }

    Ok(Config::default())
}

/// Validate configuration
fn validate_config(config: &Config) -> Result<()> {
    if config.input.chunk_size == 0 {
        anyhow::bail!("input.chunk_size cannot be 0");
    }

    if config.transmux.max_probe_bytes == 0 {
        anyhow::bail!("transmux.max_probe_bytes cannot be 0");
    }

    let rate = config.h26x.frame_rate;
    if rate.num() <= 0 || rate.den() <= 0 {
        anyhow::bail!("h26x.frame_rate must be positive, got {}", rate);
    }

    if config.bmff.video_timescale == 0 {
        anyhow::bail!("bmff.video_timescale cannot be 0");
    }

    if config.bmff.major_brand.len() != 4 {
        anyhow::bail!(
            "bmff.major_brand must be four characters, got {:?}",
            config.bmff.major_brand
        );
    }

    if let Some(doc_type) = &config.ebml.doc_type {
        if !matches!(doc_type.as_str(), "webm" | "matroska") {
            tracing::warn!("Unusual EBML DocType: {}", doc_type);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use streammux_common::Rational;
    use streammux_media::{Format, OutputMode};

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(parse_config("").unwrap(), Config::default());
        assert_eq!(Config::default().input.chunk_size, 64 * 1024);
    }

    #[test]
    fn test_full_config() {
        let config = parse_config(
            r#"
            [input]
            chunk_size = 4096

            [transmux]
            output = "ebml"
            mode = "split"
            allow_passthrough = false

            [ebml]
            min_cluster_duration_ms = 2000
            doc_type = "webm"

            [bmff]
            major_brand = "cmfc"

            [h26x]
            frame_rate = { num = 30000, den = 1001 }
            "#,
        )
        .unwrap();
        assert_eq!(config.input.chunk_size, 4096);
        assert_eq!(config.transmux.output, Format::Ebml);
        assert_eq!(config.transmux.mode, OutputMode::Split);
        assert!(!config.transmux.allow_passthrough);
        assert_eq!(config.transmux.max_probe_bytes, 1 << 20);
        assert_eq!(config.ebml.min_cluster_duration_ms, 2000);
        assert_eq!(config.bmff.major_brand, "cmfc");
        assert_eq!(config.bmff.video_timescale, 90_000);
        assert_eq!(config.h26x.frame_rate, Rational::new(30000, 1001));

        let options = config.format_options();
        assert_eq!(options.ebml.doc_type.as_deref(), Some("webm"));
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let err = parse_config("[input]\nchunk_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn test_rejects_bad_brand_and_rate() {
        assert!(parse_config("[bmff]\nmajor_brand = \"mp4\"\n").is_err());
        assert!(parse_config("[h26x]\nframe_rate = { num = 0, den = 1 }\n").is_err());
    }

    #[test]
    fn test_rejects_unknown_format() {
        assert!(parse_config("[transmux]\noutput = \"avi\"\n").is_err());
    }
}
