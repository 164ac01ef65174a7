mod cli;

use streammux::{config, transmux};
use streammux_common::TrackKind;
use streammux_media::Format;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands, ModeArg};
use std::path::Path;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "streammux=trace,streammux_media=trace,streammux_common=debug".to_string()
        } else {
            "streammux=info,streammux_media=warn".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Transmux {
            input,
            output,
            format,
            mode,
            no_passthrough,
        } => run_transmux(
            &input,
            output.as_deref(),
            cli.config.as_deref(),
            format.as_deref(),
            mode,
            no_passthrough,
        ),
        Commands::Probe { file, json } => probe_file(&file, cli.config.as_deref(), json),
        Commands::Formats => list_formats(),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("streammux {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn run_transmux(
    input: &Path,
    output: Option<&Path>,
    config_path: Option<&Path>,
    format: Option<&str>,
    mode: Option<ModeArg>,
    no_passthrough: bool,
) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;

    // Command line overrides config
    if let Some(name) = format {
        config.transmux.output = cli::parse_format(name)?;
    }
    if let Some(mode) = mode {
        config.transmux.mode = mode.into();
    }
    if no_passthrough {
        config.transmux.allow_passthrough = false;
    }

    if !input.exists() {
        anyhow::bail!("Input file does not exist: {:?}", input);
    }

    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| transmux::default_output(input, config.transmux.output));

    tracing::info!("Transmuxing {:?} to {}", input, config.transmux.output);
    let summary = transmux::transmux_file(input, &output, &config)?;

    println!(
        "{} -> {}{}",
        summary.input,
        summary.output,
        if summary.passthrough { " (passthrough)" } else { "" }
    );
    for (path, bytes) in &summary.files {
        println!("  {} ({} bytes)", path.display(), bytes);
    }

    Ok(())
}

fn probe_file(file: &Path, config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;

    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }

    let (format, result) = transmux::probe_file(file, config.transmux.max_probe_bytes)?;

    if json {
        let value = serde_json::json!({
            "format": format.name(),
            "info": result.info,
            "tracks": result.tracks,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("File: {}", file.display());
    println!("Format: {} ({})", format, format.container());
    if let Some(duration) = result.info.duration {
        let secs = duration.seconds().to_f64();
        let whole = secs as u64;
        println!(
            "Duration: {:02}:{:02}:{:06.3}",
            whole / 3600,
            (whole / 60) % 60,
            secs % 60.0
        );
    }

    println!("\nTracks: {}", result.tracks.len());
    for track in &result.tracks {
        print!("  [{}] {:?} {}", track.number, track.kind, track.codec);
        match track.kind {
            TrackKind::Video => {
                if let Some((w, h)) = track.dimensions() {
                    print!(" {}x{}", w, h);
                }
            }
            TrackKind::Audio => {
                if let Some(channels) = track.channels() {
                    print!(" {}ch", channels);
                }
                if let Some(rate) = track.sample_rate() {
                    print!(" {} Hz", rate);
                }
            }
            _ => {}
        }
        if let Some(ref lang) = track.language {
            print!(" ({})", lang);
        }
        println!();
    }

    Ok(())
}

fn list_formats() -> Result<()> {
    let options = streammux_media::FormatOptions::default();
    for format in Format::ALL {
        let mimes = format.base_mimetypes();
        let writable = format.muxer(&options).is_some();
        println!(
            "{:<6} {:<8} {:<24} {}",
            format.name(),
            format.container(),
            mimes.video.or(mimes.audio).unwrap_or("-"),
            if writable { "read/write" } else { "read" }
        );
    }
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            config::Config::default()
        }
    };

    println!("  Chunk size: {} bytes", config.input.chunk_size);
    println!("  Output: {} ({:?})", config.transmux.output, config.transmux.mode);
    println!("  Passthrough: {}", config.transmux.allow_passthrough);
    println!("  Probe limit: {} bytes", config.transmux.max_probe_bytes);
    println!(
        "  EBML cluster: {} ms",
        config.ebml.min_cluster_duration_ms
    );
    println!("  BMFF brand: {}", config.bmff.major_brand);
    println!("  H.26x frame rate: {}", config.h26x.frame_rate);

    Ok(())
}
