//! Writer stage: drains the write queue in batches.

use std::io::Write;

use log::debug;

use crate::block::OutputChunk;
use crate::cancel::{CancellationToken, Timeout};
use crate::error::{Error, Result};
use crate::queue::BoundedQueue;

/// Consumes transformed chunks in order.
pub trait ChunkSink {
    fn write_chunk(&mut self, chunk: &OutputChunk) -> Result<()>;

    /// Called after every batch.
    fn flush(&mut self) -> Result<()>;

    /// Description attached to any failure of the writer stage.
    fn failure_context(&self) -> &'static str {
        "failed to write blocks"
    }
}

/// Writes decompressed chunks back to back.
pub struct PlainSink<W> {
    output: W,
}

impl<W: Write> PlainSink<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    pub fn into_inner(self) -> W {
        self.output
    }
}

impl<W: Write> ChunkSink for PlainSink<W> {
    fn write_chunk(&mut self, chunk: &OutputChunk) -> Result<()> {
        self.output
            .write_all(chunk.data())
            .map_err(|e| Error::io("failed to write block to output file", e))
    }

    fn flush(&mut self) -> Result<()> {
        self.output
            .flush()
            .map_err(|e| Error::io("failed to flush output file", e))
    }

    fn failure_context(&self) -> &'static str {
        "failed to write blocks to output file"
    }
}

/// Writes compressed chunks, each preceded by its length as a
/// little-endian `i64`.
pub struct ArchiveSink<W> {
    output: W,
}

impl<W: Write> ArchiveSink<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    pub fn into_inner(self) -> W {
        self.output
    }
}

impl<W: Write> ChunkSink for ArchiveSink<W> {
    fn write_chunk(&mut self, chunk: &OutputChunk) -> Result<()> {
        let len = i64::try_from(chunk.data().len())
            .map_err(|_| Error::InvalidState("compressed block length overflows i64"))?;
        self.output
            .write_all(&len.to_le_bytes())
            .and_then(|()| self.output.write_all(chunk.data()))
            .map_err(|e| Error::io("failed to write block to archive", e))
    }

    fn flush(&mut self) -> Result<()> {
        self.output
            .flush()
            .map_err(|e| Error::io("failed to flush archive", e))
    }

    fn failure_context(&self) -> &'static str {
        "failed to write blocks to archive"
    }
}

/// Runs the writer stage until the write queue is completed.
///
/// Takes up to `batch_size` chunks, writes them in order and flushes.
pub(crate) fn write_chunks<K: ChunkSink + ?Sized>(
    sink: &mut K,
    write: &BoundedQueue<OutputChunk>,
    batch_size: usize,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut batch = Vec::with_capacity(batch_size);
    let mut written = 0u64;

    loop {
        while batch.len() < batch_size {
            match write.try_take(Timeout::Infinite, cancel)? {
                Some(chunk) => batch.push(chunk),
                None if write.is_completed() => break,
                None => {
                    return Err(Error::InvalidState(
                        "no block to write while the write queue is not completed",
                    ))
                }
            }
        }
        if batch.is_empty() {
            break;
        }

        for chunk in batch.drain(..) {
            cancel.check()?;
            sink.write_chunk(&chunk)?;
            written += 1;
        }
        sink.flush()?;
    }

    debug!("writer finished after {} block(s)", written);
    Ok(written)
}
