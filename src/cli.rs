use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use streammux_media::{Format, OutputMode};

#[derive(Parser)]
#[command(name = "streammux")]
#[command(author, version, about = "Incremental media demuxing and transmuxing tool")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Convert a media file into another container
    Transmux {
        /// Input file
        #[arg(required = true)]
        input: PathBuf,

        /// Output file (defaults to the input with the output extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output format, by container name or extension (overrides config)
        #[arg(short = 'f', long = "to")]
        format: Option<String>,

        /// Which tracks to write (overrides config)
        #[arg(short, long, value_enum)]
        mode: Option<ModeArg>,

        /// Always remux, even when the input already is in the output format
        #[arg(long)]
        no_passthrough: bool,
    },

    /// Detect a media file's format and list its tracks
    Probe {
        /// File to probe
        #[arg(required = true)]
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List supported formats
    Formats,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Audio,
    Video,
    Muxed,
    Split,
}

impl From<ModeArg> for OutputMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Audio => OutputMode::Audio,
            ModeArg::Video => OutputMode::Video,
            ModeArg::Muxed => OutputMode::Muxed,
            ModeArg::Split => OutputMode::Split,
        }
    }
}

/// Resolve a `--to` argument to a format.
pub fn parse_format(name: &str) -> anyhow::Result<Format> {
    Format::from_container(name).ok_or_else(|| anyhow::anyhow!("Unknown format: {}", name))
}
