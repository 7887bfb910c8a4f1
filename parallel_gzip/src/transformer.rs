//! Transformer stage: converts chunks concurrently and appends them to the
//! write queue in read order.

use std::sync::Arc;

use log::{debug, trace};

use crate::block::{InputChunk, OutputChunk};
use crate::cancel::{CancellationToken, Timeout};
use crate::codec::Transform;
use crate::error::{Error, Result};
use crate::queue::{AddStatus, BoundedQueue};
use crate::succession::{Handoff, SuccessionNode};

/// What happened to a chunk after it was taken from the process queue.
enum Outcome {
    Appended,
    /// An earlier chunk was abandoned, so this one is too.
    Abandoned,
}

/// Holds the succession node of the chunk in hand and abandons it when
/// dropped, including while unwinding out of a panicking transform.
/// Abandoning a node that was already signalled does nothing.
struct InHand(Arc<SuccessionNode>);

impl Drop for InHand {
    fn drop(&mut self) {
        self.0.abandon();
    }
}

/// Runs one transformer until the process queue is completed.
///
/// Whichever transformer appends the tail chunk after the reader has
/// finished completes the write queue. If the chunk in hand is not appended,
/// whether through an error, a panic or an abandoned predecessor, its node is
/// abandoned so that its successors stop waiting for it.
pub(crate) fn transform_chunks<T: Transform + ?Sized>(
    id: usize,
    transform: &T,
    process: &BoundedQueue<InputChunk>,
    write: &BoundedQueue<OutputChunk>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut last: Option<Arc<SuccessionNode>> = None;
    let mut count = 0u64;

    loop {
        let chunk = match process.try_take(Timeout::Infinite, cancel)? {
            Some(chunk) => chunk,
            None if process.is_completed() => break,
            None => {
                return Err(Error::InvalidState(
                    "no block to process while the process queue is not completed",
                ))
            }
        };

        let in_hand = InHand(Arc::clone(chunk.node()));
        match append_converted(transform, chunk, write, cancel)? {
            Outcome::Appended => {
                count += 1;
                let node = Arc::clone(&in_hand.0);
                // Adding must be seen completed before the tail flag is trusted.
                if process.is_adding_completed() && node.is_tail() {
                    write.complete_adding();
                }
                last = Some(node);
            }
            Outcome::Abandoned => {
                debug!("transformer {} stopping after an abandoned block", id);
                return Ok(count);
            }
        }
    }

    if last.as_ref().is_some_and(|node| node.is_tail()) {
        write.complete_adding();
    }
    debug!("transformer {} finished after {} block(s)", id, count);
    Ok(count)
}

fn append_converted<T: Transform + ?Sized>(
    transform: &T,
    chunk: InputChunk,
    write: &BoundedQueue<OutputChunk>,
    cancel: &CancellationToken,
) -> Result<Outcome> {
    let data = transform.transform(&chunk)?;
    trace!("transformed block: {} -> {} bytes", chunk.data().len(), data.len());
    let output = chunk.into_output(data);
    let node = Arc::clone(output.node());

    if node.wait_predecessor(cancel)? == Handoff::Abandoned {
        return Ok(Outcome::Abandoned);
    }
    match write.try_add(output, Timeout::Infinite, cancel)? {
        AddStatus::Added => {
            node.signal();
            Ok(Outcome::Appended)
        }
        AddStatus::TimedOut(_) => Err(Error::InvalidState(
            "unbounded wait to queue a block for writing timed out",
        )),
    }
}
