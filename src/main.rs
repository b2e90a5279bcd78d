// cati (cat image): print image files through the Kitty graphics protocol
use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use cati::config::Settings;
use cati::kitty_graphics::ChunkedTransmitter;
use cati::kitty_native;
use cati::kitty_probe;
use cati::log_debug;

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Image files to send, in order
    #[arg(required_unless_present = "probe_only")]
    files: Vec<PathBuf>,

    /// Transfer parameters for the first frame of each file
    #[arg(long)]
    params: Option<String>,

    /// Base64 characters per frame
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Settings file (default: <config dir>/cati/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Only accept a reply that starts with ESC _ G i
    #[arg(long)]
    strict_marker: bool,

    /// Send without probing, for terminals that can't answer the query
    #[arg(long, conflicts_with = "probe_only")]
    skip_probe: bool,

    /// Report protocol support and exit
    #[arg(long)]
    probe_only: bool,
}

impl Args {
    fn settings(&self) -> Result<Settings> {
        let mut settings = Settings::load(self.config.as_deref())?;
        if let Some(params) = &self.params {
            settings.params = params.clone();
        }
        if let Some(chunk_size) = self.chunk_size {
            settings.chunk_size = chunk_size;
        }
        if self.strict_marker {
            settings.require_escape_prefix = true;
        }
        settings.validate()?;
        Ok(settings)
    }
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let settings = args.settings()?;
    log_debug!("[MAIN] {:?}", settings);

    match kitty_native::window_size() {
        Ok(size) => log_debug!(
            "[MAIN] rows: {}, columns: {}, width: {}px, height: {}px",
            size.rows, size.columns, size.width, size.height
        ),
        Err(e) => log_debug!("[MAIN] failed to query window size: {}", e),
    }

    if !args.skip_probe {
        let supported = kitty_probe::is_kitty_protocol_supported(&settings)
            .context("Failed to configure the terminal for probing")?;

        if supported {
            eprintln!("Terminal supports Kitty graphics protocol!");
        } else {
            eprintln!("Terminal does not support Kitty graphics protocol.");
            return Ok(ExitCode::FAILURE);
        }
    }

    if args.probe_only {
        return Ok(ExitCode::SUCCESS);
    }

    let transmitter = ChunkedTransmitter::new(settings.chunk_size);
    let mut stdout = io::stdout().lock();

    for path in &args.files {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let frames = transmitter
            .send(&mut stdout, &data, &settings.params)
            .with_context(|| format!("Failed to send {}", path.display()))?;
        log_debug!("[MAIN] {} -> {} frames", path.display(), frames);
    }

    Ok(ExitCode::SUCCESS)
}
