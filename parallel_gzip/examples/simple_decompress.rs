use anyhow::{Context, Result};
use parallel_gzip::{decompress, Settings};
use std::env;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <input.blz> [output]", args[0]);
        return Ok(());
    }

    let input = File::open(&args[1]).with_context(|| format!("Failed to open {}", args[1]))?;
    let out: Box<dyn Write + Send> = if args.len() > 2 {
        Box::new(File::create(&args[2])?)
    } else {
        Box::new(io::stdout())
    };
    let mut out = BufWriter::new(out);

    decompress(BufReader::new(input), &mut out, &Settings::default())?;
    out.flush()?;

    Ok(())
}
