use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

const BUFFER_SIZE: usize = 1 << 20;

/// Buffered output file that is synced to disk on `finish`.
pub struct OutputWriter(BufWriter<File>);

impl OutputWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create output file {}", path.display()))?;
        Ok(OutputWriter(BufWriter::with_capacity(BUFFER_SIZE, file)))
    }

    pub fn finish(self) -> Result<()> {
        let file = self
            .0
            .into_inner()
            .map_err(|e| e.into_error())
            .context("Failed to flush output file")?;
        file.sync_all().context("Failed to sync output file")?;
        Ok(())
    }
}

impl Write for OutputWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
