//! Per-chunk ordering chain.
//!
//! Every chunk gets a [`SuccessionNode`] linked to the node of the chunk read
//! just before it. A transformer may append chunk *i* to the write queue only
//! after node *i-1* has signalled, and signals node *i* right after the append.
//! Each chunk therefore waits for its immediate predecessor only, and a node
//! drops its predecessor link as soon as it is no longer needed, so the chain
//! never grows beyond the chunks currently in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};

enum Signal {
    /// Nobody has waited yet; no channel allocated.
    Idle,
    Armed {
        // Never sent on; dropping it wakes every waiter.
        _trigger: Sender<()>,
        waiter: Receiver<()>,
    },
    Fired,
    /// The chunk was taken but will never reach the write queue.
    Abandoned,
}

/// What a successor learns from waiting on its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// The predecessor was appended to the write queue (or there is none).
    Ready,
    /// The predecessor failed; the successor must not be appended either.
    Abandoned,
}

pub struct SuccessionNode {
    predecessor: Mutex<Option<Arc<SuccessionNode>>>,
    is_tail: AtomicBool,
    signal: Mutex<Signal>,
}

impl SuccessionNode {
    /// Node for the first chunk of a stream.
    pub fn first() -> Arc<Self> {
        Arc::new(Self {
            predecessor: Mutex::new(None),
            is_tail: AtomicBool::new(true),
            signal: Mutex::new(Signal::Idle),
        })
    }

    /// Node for the chunk read right after the one owning `predecessor`.
    ///
    /// The predecessor stops being the tail.
    pub fn after(predecessor: &Arc<SuccessionNode>) -> Arc<Self> {
        let node = Arc::new(Self {
            predecessor: Mutex::new(Some(Arc::clone(predecessor))),
            is_tail: AtomicBool::new(true),
            signal: Mutex::new(Signal::Idle),
        });
        predecessor.is_tail.store(false, Ordering::SeqCst);
        node
    }

    /// Builds the node following `previous`, or the first node if there is none.
    pub fn next(previous: Option<&Arc<SuccessionNode>>) -> Arc<Self> {
        match previous {
            Some(prev) => Self::after(prev),
            None => Self::first(),
        }
    }

    /// True while no successor node has been created.
    pub fn is_tail(&self) -> bool {
        self.is_tail.load(Ordering::SeqCst)
    }

    pub fn has_predecessor(&self) -> bool {
        self.predecessor.lock().is_some()
    }

    pub fn is_signalled(&self) -> bool {
        matches!(*self.signal.lock(), Signal::Fired | Signal::Abandoned)
    }

    /// Blocks until the predecessor has been handed off, or `cancel` fires.
    ///
    /// The predecessor link is dropped once its outcome is known.
    pub fn wait_predecessor(&self, cancel: &CancellationToken) -> Result<Handoff> {
        let predecessor = self.predecessor.lock().clone();
        let handoff = match predecessor {
            Some(prev) => prev.wait(cancel)?,
            None => Handoff::Ready,
        };
        self.predecessor.lock().take();
        Ok(handoff)
    }

    fn wait(&self, cancel: &CancellationToken) -> Result<Handoff> {
        let waiter = {
            let mut signal = self.signal.lock();
            match &*signal {
                Signal::Fired => return Ok(Handoff::Ready),
                Signal::Abandoned => return Ok(Handoff::Abandoned),
                Signal::Armed { waiter, .. } => waiter.clone(),
                Signal::Idle => {
                    let (trigger, waiter) = bounded(0);
                    *signal = Signal::Armed {
                        _trigger: trigger,
                        waiter: waiter.clone(),
                    };
                    waiter
                }
            }
        };

        select! {
            recv(waiter) -> _ => (),
            recv(cancel.receiver()) -> _ => return Err(Error::Cancelled),
        }

        match &*self.signal.lock() {
            Signal::Abandoned => Ok(Handoff::Abandoned),
            Signal::Fired => Ok(Handoff::Ready),
            _ => Err(Error::InvalidState("succession signal woke without firing")),
        }
    }

    /// Announces that this node's chunk is in the write queue.
    pub fn signal(&self) {
        self.settle(Signal::Fired);
    }

    /// Announces that this node's chunk will never reach the write queue.
    pub fn abandon(&self) {
        self.settle(Signal::Abandoned);
    }

    fn settle(&self, outcome: Signal) {
        self.predecessor.lock().take();
        let mut signal = self.signal.lock();
        if matches!(*signal, Signal::Fired | Signal::Abandoned) {
            return;
        }
        // Replacing `Armed` drops the trigger and wakes the waiters.
        *signal = outcome;
    }
}

impl std::fmt::Debug for SuccessionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuccessionNode")
            .field("is_tail", &self.is_tail())
            .field("has_predecessor", &self.has_predecessor())
            .field("signalled", &self.is_signalled())
            .finish()
    }
}
