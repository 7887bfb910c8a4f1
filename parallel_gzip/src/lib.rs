//! Block-parallel gzip compression with ordered output.
//!
//! The input is cut into blocks that are compressed independently by a pool
//! of transformer threads. Each block lands in the archive as a little-endian
//! `i64` length followed by a gzip member without its 10-byte header.
//! Decompression reverses this, block by block, in parallel as well.
//!
//! ```no_run
//! use parallel_gzip::{compress, decompress, Settings};
//!
//! let settings = Settings::default();
//! let mut archive = Vec::new();
//! compress(&b"hello"[..], &mut archive, &settings)?;
//! let mut plain = Vec::new();
//! decompress(&archive[..], &mut plain, &settings)?;
//! # Ok::<(), parallel_gzip::Error>(())
//! ```

pub mod block;
pub mod cancel;
pub mod codec;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod reader;
pub mod settings;
pub mod succession;
mod transformer;
pub mod writer;

pub use block::{InputChunk, OutputChunk};
pub use cancel::{CancellationToken, Timeout};
pub use codec::{GzipCompress, GzipDecompress, Transform};
pub use error::{Error, Result};
pub use pipeline::{compress, decompress, process, process_with_cancel, run, run_with_cancel, Mode};
pub use queue::{AddStatus, BoundedQueue};
pub use reader::{ArchiveSource, ChunkSource, PlainSource};
pub use settings::Settings;
pub use succession::{Handoff, SuccessionNode};
pub use writer::{ArchiveSink, ChunkSink, PlainSink};
