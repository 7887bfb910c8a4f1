//! Orchestrator: one reader, N transformers and one writer over two bounded
//! queues, with failure handling across the three stages.

use std::fmt;
use std::io::{Read, Write};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{never, select, unbounded, Receiver, Sender};
use log::{debug, info, warn};

use crate::block::{InputChunk, OutputChunk};
use crate::cancel::CancellationToken;
use crate::codec::{GzipCompress, GzipDecompress, Transform};
use crate::error::{Error, Result};
use crate::queue::BoundedQueue;
use crate::reader::{read_chunks, ArchiveSource, ChunkSource, PlainSource};
use crate::settings::Settings;
use crate::transformer::transform_chunks;
use crate::writer::{write_chunks, ArchiveSink, ChunkSink, PlainSink};

/// Direction of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Compress,
    Decompress,
}

impl Mode {
    fn failure_context(self) -> &'static str {
        match self {
            Mode::Compress => "failed to compress",
            Mode::Decompress => "failed to decompress",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Reader,
    Transformer(usize),
    Writer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Reader => f.write_str("reader"),
            Role::Transformer(id) => write!(f, "transformer {}", id),
            Role::Writer => f.write_str("writer"),
        }
    }
}

type Report = (Role, Result<u64>);

/// Sends the stage outcome when dropped, so a panicking stage still reports.
struct Reporter {
    role: Role,
    done: Sender<Report>,
    result: Option<Result<u64>>,
}

impl Reporter {
    fn new(role: Role, done: &Sender<Report>) -> Self {
        Self {
            role,
            done: done.clone(),
            result: None,
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        let result = self
            .result
            .take()
            .unwrap_or(Err(Error::InvalidState("pipeline thread panicked")));
        let _ = self.done.send((self.role, result));
    }
}

/// Cancellation scopes of the three stages.
struct Scopes {
    reader: CancellationToken,
    transformers: CancellationToken,
    writer: CancellationToken,
}

impl Scopes {
    fn new() -> Self {
        Self {
            reader: CancellationToken::new(),
            transformers: CancellationToken::new(),
            writer: CancellationToken::new(),
        }
    }

    fn of(&self, role: Role) -> &CancellationToken {
        match role {
            Role::Reader => &self.reader,
            Role::Transformer(_) => &self.transformers,
            Role::Writer => &self.writer,
        }
    }

    fn cancel_all(&self) {
        self.reader.cancel();
        self.transformers.cancel();
        self.writer.cancel();
    }
}

/// Runs `source` through `transform` into `sink`, preserving chunk order.
pub fn run<S, T, K>(source: S, transform: &T, sink: K, settings: &Settings) -> Result<()>
where
    S: ChunkSource + Send,
    T: Transform + ?Sized,
    K: ChunkSink + Send,
{
    run_with_cancel(source, transform, sink, settings, &CancellationToken::new())
}

/// Like [`run`], but stops every stage and returns [`Error::Cancelled`]
/// once `cancel` fires (unless a stage failed on its own first).
pub fn run_with_cancel<S, T, K>(
    mut source: S,
    transform: &T,
    mut sink: K,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: ChunkSource + Send,
    T: Transform + ?Sized,
    K: ChunkSink + Send,
{
    settings.validate()?;
    cancel.check()?;
    let process = BoundedQueue::<InputChunk>::new(settings.max_queue_size)?;
    let write = BoundedQueue::<OutputChunk>::new(settings.max_queue_size)?;
    let scopes = Scopes::new();
    let transformers = settings.transformer_count();
    let batch_size = settings.max_blocks_to_write_at_once;
    let (done_tx, done_rx) = unbounded::<Report>();

    debug!(
        "starting pipeline: {} transformer(s), queue size {}, write batch {}",
        transformers, settings.max_queue_size, batch_size
    );
    let started = Instant::now();

    let outcome = thread::scope(|s| {
        let mut handles = Vec::with_capacity(transformers + 2);
        {
            let mut report = Reporter::new(Role::Reader, &done_tx);
            let (source, process, write, scope) = (&mut source, &process, &write, &scopes.reader);
            handles.push(s.spawn(move || {
                let context = source.failure_context();
                report.result = Some(
                    read_chunks(source, process, write, scope)
                        .map_err(|e| Error::stage(context, e)),
                );
            }));
        }

        for id in 0..transformers {
            let mut report = Reporter::new(Role::Transformer(id), &done_tx);
            let (process, write, scope) = (&process, &write, &scopes.transformers);
            handles.push(s.spawn(move || {
                report.result = Some(
                    transform_stage(id, transform, process, write, scope),
                );
            }));
        }

        {
            let mut report = Reporter::new(Role::Writer, &done_tx);
            let (sink, write, scope) = (&mut sink, &write, &scopes.writer);
            handles.push(s.spawn(move || {
                let context = sink.failure_context();
                report.result = Some(
                    write_chunks(sink, write, batch_size, scope)
                        .map_err(|e| Error::stage(context, e)),
                );
            }));
        }

        drop(done_tx);
        let outcome = supervise(&done_rx, transformers, &scopes, cancel);
        // A panic was already reported as that stage's failure; joining here
        // keeps the scope from re-raising it.
        for handle in handles {
            let _ = handle.join();
        }
        outcome
    });

    let elapsed = started.elapsed();
    match &outcome {
        Ok(()) => info!("pipeline finished in {:.2?}", elapsed),
        Err(err) if err.is_cancelled() => info!("pipeline cancelled after {:.2?}", elapsed),
        Err(err) => warn!("pipeline failed after {:.2?}: {}", elapsed, err),
    }
    outcome
}

fn transform_stage<T: Transform + ?Sized>(
    id: usize,
    transform: &T,
    process: &BoundedQueue<InputChunk>,
    write: &BoundedQueue<OutputChunk>,
    scope: &CancellationToken,
) -> Result<u64> {
    transform_chunks(id, transform, process, write, scope).map_err(|e| {
        if e.is_cancelled() {
            e
        } else {
            Error::stage(transform.failure_context(), e)
        }
    })
}

/// Collects every stage outcome and applies the cancellation policy:
///
/// * a reader or writer failure cancels the transformers and the other end;
/// * a transformer failure waits for the remaining transformers to stop
///   (they see the abandoned chunk) and then cancels reader and writer;
/// * an external cancellation cancels everything.
///
/// Cancellations caused by the pipeline itself are not reported as failures.
fn supervise(
    done: &Receiver<Report>,
    transformers: usize,
    scopes: &Scopes,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut remaining = transformers + 2;
    let mut running_transformers = transformers;
    let mut transformer_failed = false;
    let mut cancelled = false;
    let mut failures = Vec::new();
    let mut external = cancel.receiver().clone();

    while remaining > 0 {
        select! {
            recv(done) -> report => {
                let Ok((role, result)) = report else {
                    break;
                };
                remaining -= 1;
                if let Role::Transformer(_) = role {
                    running_transformers -= 1;
                }

                match result {
                    Ok(count) => debug!("{} done, {} block(s)", role, count),
                    Err(err) if err.is_cancelled() && scopes.of(role).is_cancelled() => {
                        debug!("{} stopped after cancellation", role);
                    }
                    Err(err) => {
                        warn!("{} failed: {}", role, err);
                        match role {
                            Role::Reader => {
                                scopes.transformers.cancel();
                                scopes.writer.cancel();
                            }
                            Role::Writer => {
                                scopes.transformers.cancel();
                                scopes.reader.cancel();
                            }
                            Role::Transformer(_) => transformer_failed = true,
                        }
                        failures.push(err);
                    }
                }

                if transformer_failed && running_transformers == 0 {
                    scopes.reader.cancel();
                    scopes.writer.cancel();
                }
            }
            recv(external) -> _ => {
                debug!("cancellation requested, stopping all stages");
                cancelled = true;
                scopes.cancel_all();
                external = never();
            }
        }
    }

    if !failures.is_empty() {
        Err(Error::Aggregate(failures))
    } else if cancelled {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Converts `input` into `output` in the given direction.
pub fn process<R, W>(mode: Mode, input: R, output: W, settings: &Settings) -> Result<()>
where
    R: Read + Send,
    W: Write + Send,
{
    process_with_cancel(mode, input, output, settings, &CancellationToken::new())
}

pub fn process_with_cancel<R, W>(
    mode: Mode,
    input: R,
    output: W,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: Read + Send,
    W: Write + Send,
{
    let result = match mode {
        Mode::Compress => run_with_cancel(
            PlainSource::new(input, settings.block_size),
            &GzipCompress::new(settings.compression_level),
            ArchiveSink::new(output),
            settings,
            cancel,
        ),
        Mode::Decompress => run_with_cancel(
            ArchiveSource::new(input),
            &GzipDecompress,
            PlainSink::new(output),
            settings,
            cancel,
        ),
    };
    result.map_err(|source| Error::Run {
        operation: mode.failure_context(),
        source: Box::new(source),
    })
}

/// Compresses a plain stream into a block archive.
pub fn compress<R, W>(input: R, output: W, settings: &Settings) -> Result<()>
where
    R: Read + Send,
    W: Write + Send,
{
    process(Mode::Compress, input, output, settings)
}

/// Restores the plain stream from a block archive.
pub fn decompress<R, W>(input: R, output: W, settings: &Settings) -> Result<()>
where
    R: Read + Send,
    W: Write + Send,
{
    process(Mode::Decompress, input, output, settings)
}
