//! Reader stage: slices the input into chunks and assigns their order.

use std::io::{self, Read};
use std::sync::Arc;

use log::debug;

use crate::block::{InputChunk, OutputChunk};
use crate::cancel::{CancellationToken, Timeout};
use crate::codec::GzipDecompress;
use crate::error::{Error, Result};
use crate::queue::{AddStatus, BoundedQueue};
use crate::succession::SuccessionNode;

/// Size of the little-endian length prefix in front of every archive block.
pub const LENGTH_PREFIX_LEN: usize = 8;

/// Produces chunk payloads from an input stream.
pub trait ChunkSource {
    /// Returns the next payload and its original (uncompressed) length, or
    /// `None` once the input is exhausted.
    fn next_chunk(&mut self) -> Result<Option<(Vec<u8>, u64)>>;

    /// Description attached to any failure of the reader stage.
    fn failure_context(&self) -> &'static str {
        "failed to read blocks"
    }
}

/// Reads as many bytes as fit into `buf`, stopping early only at end of input.
fn read_fully<R: Read + ?Sized>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Cuts a plain stream into fixed-size blocks; only the last may be shorter.
pub struct PlainSource<R> {
    input: R,
    block_size: usize,
}

impl<R: Read> PlainSource<R> {
    pub fn new(input: R, block_size: usize) -> Self {
        Self { input, block_size }
    }
}

impl<R: Read> ChunkSource for PlainSource<R> {
    fn next_chunk(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        let mut buf = vec![0u8; self.block_size];
        let filled = read_fully(&mut self.input, &mut buf)
            .map_err(|e| Error::io("failed to read input block", e))?;
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some((buf, filled as u64)))
    }

    fn failure_context(&self) -> &'static str {
        "failed to read blocks from input file"
    }
}

/// Reads length-prefixed compressed blocks back from an archive.
pub struct ArchiveSource<R> {
    input: R,
}

impl<R: Read> ArchiveSource<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }
}

impl<R: Read> ChunkSource for ArchiveSource<R> {
    fn next_chunk(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        let got = read_fully(&mut self.input, &mut prefix)
            .map_err(|e| Error::io("failed to read block length from archive", e))?;
        if got == 0 {
            return Ok(None);
        }
        if got < LENGTH_PREFIX_LEN {
            return Err(Error::InvalidArchive(format!(
                "truncated block length: read {} of {} bytes",
                got, LENGTH_PREFIX_LEN
            )));
        }

        let declared = i64::from_le_bytes(prefix);
        let len = u64::try_from(declared)
            .map_err(|_| Error::InvalidArchive(format!("negative block length {}", declared)))?;

        // Grow with the data actually present instead of trusting the prefix.
        let mut payload = Vec::new();
        (&mut self.input)
            .take(len)
            .read_to_end(&mut payload)
            .map_err(|e| Error::io("failed to read block from archive", e))?;
        if (payload.len() as u64) < len {
            return Err(Error::InvalidArchive(format!(
                "truncated block: read {} of {} bytes",
                payload.len(),
                len
            )));
        }

        let original_len = GzipDecompress::original_len(&payload)?;
        Ok(Some((payload, original_len)))
    }

    fn failure_context(&self) -> &'static str {
        "failed to read blocks from archive"
    }
}

/// Runs the reader stage until the source is exhausted.
///
/// Chunks are chained in read order and appended to `process`, which is
/// completed at end of input. An input without any chunk also completes
/// `write`, since no transformer will ever see a tail chunk.
pub(crate) fn read_chunks<S: ChunkSource + ?Sized>(
    source: &mut S,
    process: &BoundedQueue<InputChunk>,
    write: &BoundedQueue<OutputChunk>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut last: Option<Arc<SuccessionNode>> = None;
    let mut count = 0u64;

    loop {
        cancel.check()?;
        let Some((data, original_len)) = source.next_chunk()? else {
            break;
        };

        let chunk = InputChunk::new(data, original_len, last.as_ref());
        last = Some(Arc::clone(chunk.node()));
        match process.try_add(chunk, Timeout::Infinite, cancel)? {
            AddStatus::Added => count += 1,
            AddStatus::TimedOut(_) => {
                return Err(Error::InvalidState("unbounded wait to queue a block timed out"))
            }
        }
    }

    process.complete_adding();
    if count == 0 {
        write.complete_adding();
    }
    debug!("reader finished after {} block(s)", count);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::GzipCompress;
    use std::io::Cursor;

    fn drain<S: ChunkSource>(mut source: S) -> Result<Vec<(Vec<u8>, u64)>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = source.next_chunk()? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    /// Hands out at most `step` bytes per read call.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_plain_source_block_sizes() {
        let data = vec![7u8; 64 * 1024 * 5 / 2];
        let chunks = drain(PlainSource::new(Cursor::new(&data), 64 * 1024)).unwrap();
        let sizes: Vec<u64> = chunks.iter().map(|c| c.1).collect();
        assert_eq!(sizes, vec![65536, 65536, 32768]);
    }

    #[test]
    fn test_plain_source_fills_blocks_from_short_reads() {
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let source = PlainSource::new(Trickle { data: &data, step: 7 }, 256);
        let chunks = drain(source).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(|c| c.0.len()).collect();
        assert_eq!(sizes, vec![256, 256, 256, 232]);
        let joined: Vec<u8> = chunks.into_iter().flat_map(|c| c.0).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_plain_source_empty_input() {
        assert!(drain(PlainSource::new(io::empty(), 16)).unwrap().is_empty());
    }

    fn archive_entry(payload: &[u8]) -> Vec<u8> {
        let mut entry = (payload.len() as i64).to_le_bytes().to_vec();
        entry.extend_from_slice(payload);
        entry
    }

    #[test]
    fn test_archive_source_reads_entries() {
        let compressor = GzipCompress::default();
        let a = compressor.compress(b"first block").unwrap();
        let b = compressor.compress(b"second").unwrap();
        let mut archive = archive_entry(&a);
        archive.extend(archive_entry(&b));

        let chunks = drain(ArchiveSource::new(Cursor::new(archive))).unwrap();
        assert_eq!(chunks, vec![(a, 11), (b, 6)]);
    }

    #[test]
    fn test_archive_source_truncated_prefix() {
        let err = drain(ArchiveSource::new(Cursor::new(vec![1u8, 0, 0]))).unwrap_err();
        assert!(matches!(err, Error::InvalidArchive(_)));
    }

    #[test]
    fn test_archive_source_truncated_payload() {
        let mut archive = 100i64.to_le_bytes().to_vec();
        archive.extend_from_slice(&[0u8; 10]);
        let err = drain(ArchiveSource::new(Cursor::new(archive))).unwrap_err();
        assert!(matches!(err, Error::InvalidArchive(_)));
    }

    #[test]
    fn test_archive_source_negative_length() {
        let archive = (-5i64).to_le_bytes().to_vec();
        let err = drain(ArchiveSource::new(Cursor::new(archive))).unwrap_err();
        assert!(matches!(err, Error::InvalidArchive(_)));
    }

    #[test]
    fn test_read_chunks_chains_and_completes() {
        let process = BoundedQueue::new(8).unwrap();
        let write = BoundedQueue::new(8).unwrap();
        let cancel = CancellationToken::new();
        let mut source = PlainSource::new(Cursor::new(vec![1u8; 10]), 4);

        let count = read_chunks(&mut source, &process, &write, &cancel).unwrap();
        assert_eq!(count, 3);
        assert!(process.is_adding_completed());
        assert!(!write.is_adding_completed());

        let first = process.try_take(Timeout::Immediate, &cancel).unwrap().unwrap();
        let second = process.try_take(Timeout::Immediate, &cancel).unwrap().unwrap();
        let third = process.try_take(Timeout::Immediate, &cancel).unwrap().unwrap();
        assert!(!first.node().has_predecessor());
        assert!(second.node().has_predecessor());
        assert!(!second.node().is_tail());
        assert!(third.node().is_tail());
        assert_eq!(third.data().len(), 2);
        assert!(process.is_completed());
    }

    #[test]
    fn test_read_chunks_empty_input_completes_both_queues() {
        let process = BoundedQueue::new(2).unwrap();
        let write = BoundedQueue::new(2).unwrap();
        let cancel = CancellationToken::new();
        let mut source = PlainSource::new(io::empty(), 4);

        assert_eq!(read_chunks(&mut source, &process, &write, &cancel).unwrap(), 0);
        assert!(process.is_completed());
        assert!(write.is_completed());
    }

    #[test]
    fn test_read_chunks_stops_when_cancelled() {
        let process = BoundedQueue::new(1).unwrap();
        let write = BoundedQueue::new(1).unwrap();
        let cancel = CancellationToken::new();
        let mut source = PlainSource::new(Cursor::new(vec![0u8; 100]), 10);

        std::thread::scope(|s| {
            let reader = s.spawn(|| read_chunks(&mut source, &process, &write, &cancel));
            std::thread::sleep(std::time::Duration::from_millis(30));
            cancel.cancel();
            assert!(reader.join().unwrap().unwrap_err().is_cancelled());
        });
        assert!(!process.is_adding_completed());
    }
}
