//! blockzip - parallel block gzip compressor.
//!
//! Cuts the input into fixed-size blocks and compresses them on all cores,
//! writing them back in their original order. Each block is stored as a
//! little-endian `i64` length followed by a headerless gzip member, so
//! decompression is parallel too.
//!
//! # Usage
//!
//! ```bash
//! # Compress into input.bin.blz
//! blockzip compress input.bin
//!
//! # Restore with 4 transformer threads
//! blockzip -j 4 decompress input.bin.blz -o restored.bin
//!
//! # Smaller blocks, best compression
//! blockzip compress input.bin --block-size 262144 -l 9
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::info;
use memmap2::{Mmap, MmapOptions};
use parallel_gzip::{process, Mode, Settings};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

mod writer;
use writer::OutputWriter;

/// Extension appended to compressed files.
const ARCHIVE_EXTENSION: &str = "blz";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Number of transformer threads (default = number of logical cores)
    #[arg(short = 'j', long, global = true)]
    jobs: Option<usize>,

    /// Capacity of the block queues; negative for unbounded
    #[arg(long, global = true, default_value_t = 64, allow_negative_numbers = true)]
    queue_size: isize,

    /// Number of blocks written between flushes
    #[arg(long, global = true, default_value_t = 16)]
    batch: usize,

    /// Hide the progress bar
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compress a file into a block archive
    Compress {
        /// Input file
        input: PathBuf,

        /// Output file (defaults to the input file with .blz appended)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Size of the blocks the input is cut into, in bytes
        #[arg(long, default_value_t = parallel_gzip::settings::DEFAULT_BLOCK_SIZE)]
        block_size: usize,

        /// Deflate level (0-9)
        #[arg(short, long, default_value_t = 6, value_parser = clap::value_parser!(u32).range(0..=9))]
        level: u32,
    },
    /// Restore a file from a block archive
    Decompress {
        /// Input archive
        input: PathBuf,

        /// Output file (defaults to the input file without .blz, or with .out appended)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Default output path for `input` in the given mode.
fn default_output(mode: Mode, input: &Path) -> PathBuf {
    match mode {
        Mode::Compress => {
            let mut name = input.as_os_str().to_owned();
            name.push(".");
            name.push(ARCHIVE_EXTENSION);
            PathBuf::from(name)
        }
        Mode::Decompress => {
            if input.extension().and_then(|e| e.to_str()) == Some(ARCHIVE_EXTENSION) {
                input.with_extension("")
            } else {
                let mut name = input.as_os_str().to_owned();
                name.push(".out");
                PathBuf::from(name)
            }
        }
    }
}

/// Maps the input file; empty files can't be mapped and yield `None`.
fn map_input(path: &Path) -> Result<Option<Mmap>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open input file {}", path.display()))?;
    let len = file
        .metadata()
        .context("Failed to read input file metadata")?
        .len();
    if len == 0 {
        return Ok(None);
    }
    let mmap = unsafe {
        MmapOptions::new()
            .map(&file)
            .context("Failed to mmap input file")?
    };
    Ok(Some(mmap))
}

fn progress_bar(len: u64, quiet: bool) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(len);
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        )
        .context("Invalid progress bar template")?,
    );
    Ok(pb)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut settings = Settings {
        max_queue_size: args.queue_size,
        max_blocks_to_write_at_once: args.batch,
        ..Settings::default()
    };
    if let Some(jobs) = args.jobs {
        settings.max_concurrency = jobs;
    }

    let (mode, input, output) = match args.command {
        Command::Compress {
            input,
            output,
            block_size,
            level,
        } => {
            settings.block_size = block_size;
            settings.compression_level = level;
            (Mode::Compress, input, output)
        }
        Command::Decompress { input, output } => (Mode::Decompress, input, output),
    };
    let output = output.unwrap_or_else(|| default_output(mode, &input));
    if output == input {
        bail!("Output file {} would overwrite the input", output.display());
    }

    let mmap = map_input(&input)?;
    let data: &[u8] = mmap.as_deref().unwrap_or_default();
    info!(
        "{:?} {} ({} bytes) -> {}",
        mode,
        input.display(),
        data.len(),
        output.display()
    );

    let mut out = OutputWriter::create(&output)?;
    let pb = progress_bar(data.len() as u64, args.quiet)?;
    let start = Instant::now();

    process(mode, pb.wrap_read(data), &mut out, &settings)?;
    out.finish()?;
    pb.finish_and_clear();

    info!("Wrote {} in {:.2?}", output.display(), start.elapsed());
    Ok(())
}
