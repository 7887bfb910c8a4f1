use std::thread;

use crate::error::{Error, Result};

/// Default size of a plain input block.
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Tuning knobs of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Capacity of both the process and the write queue. Negative means
    /// unbounded; zero is rejected.
    pub max_queue_size: isize,
    /// Number of transformer threads. Zero is treated as one.
    pub max_concurrency: usize,
    /// Size of the blocks the plain input is cut into.
    pub block_size: usize,
    /// Number of chunks the writer takes before writing and flushing.
    pub max_blocks_to_write_at_once: usize,
    /// Deflate level, 0 (store) to 9 (best).
    pub compression_level: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_queue_size: 64,
            max_concurrency: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            block_size: DEFAULT_BLOCK_SIZE,
            max_blocks_to_write_at_once: 16,
            compression_level: 6,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(Error::ZeroCapacity);
        }
        if self.block_size == 0 {
            return Err(Error::InvalidSettings("block size must be positive".into()));
        }
        if self.max_blocks_to_write_at_once == 0 {
            return Err(Error::InvalidSettings(
                "write batch size must be positive".into(),
            ));
        }
        if self.compression_level > 9 {
            return Err(Error::InvalidSettings(format!(
                "compression level {} is out of range 0-9",
                self.compression_level
            )));
        }
        Ok(())
    }

    /// Number of transformer threads to start.
    pub fn transformer_count(&self) -> usize {
        self.max_concurrency.max(1)
    }
}
