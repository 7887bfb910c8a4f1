//! Cooperative cancellation and wait timeouts.
//!
//! A [`CancellationToken`] is a zero-capacity channel that never carries a
//! message. Cancelling drops the only sender, which disconnects the channel
//! and wakes every thread blocked on [`CancellationToken::receiver`] inside a
//! `select!`. This lets a blocking wait race a permit, an external
//! cancellation and an internal wake-up in one call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

struct Inner {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    waiter: Receiver<()>,
}

/// A cloneable, one-way cancellation flag that blocked threads can wait on.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (trigger, waiter) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                waiter,
            }),
        }
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        // Dropping the sender disconnects the channel for every waiter.
        drop(self.inner.trigger.lock().take());
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(Error::Cancelled)` if cancellation was requested.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Receiver that becomes ready (disconnected) once the token is cancelled.
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.inner.waiter
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// How long a blocking queue operation may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Do not block at all.
    Immediate,
    /// Block for at most the given duration.
    After(Duration),
    /// Block until the operation succeeds or is cancelled.
    Infinite,
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Timeout::Immediate
        } else {
            Timeout::After(duration)
        }
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Timeout::Infinite, Timeout::from)
    }
}
