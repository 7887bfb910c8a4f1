//! Bounded, cancellable multi-producer/multi-consumer queue with completion.
//!
//! The queue is gated by two counting semaphores: producer permits (free
//! capacity) and consumer permits (stored items). A permit count is a plain
//! atomic, paired with a one-slot nudge channel so that a blocked caller can
//! wait on a released permit, its own cancellation token and the queue's
//! internal wake-up token in a single `select!`. Neither the counters nor the
//! segmented item storage allocate up front, so the capacity costs nothing
//! until items actually occupy it.
//!
//! Completion is tracked by an atomic counter of in-flight adders whose top bit
//! is the "adding completed" flag. [`BoundedQueue::complete_adding`] sets the
//! flag with a CAS and spins until in-flight adders drain, so once it returns
//! no item can appear in the queue any more.
//!
//! Invariant for bounded queues: `count() + unused producer permits == capacity`.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use crossbeam_queue::SegQueue;

use crate::cancel::{CancellationToken, Timeout};
use crate::error::{Error, Result};

/// Top bit of the adder counter: set once adding was completed.
const ADDING_COMPLETED: u32 = 0x8000_0000;

/// Outcome of [`BoundedQueue::try_add`].
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub enum AddStatus<T> {
    Added,
    /// No capacity became free before the timeout; the item is handed back.
    TimedOut(T),
}

impl<T> AddStatus<T> {
    pub fn is_added(&self) -> bool {
        matches!(self, AddStatus::Added)
    }
}

enum Acquire {
    Acquired,
    TimedOut,
    Cancelled,
    /// The queue's own wake-up token fired.
    Woken,
}

/// A counting semaphore: an atomic count of free permits plus a nudge
/// channel that wakes one blocked acquirer per release.
struct Permits {
    available: AtomicUsize,
    limit: usize,
    nudge_tx: Sender<()>,
    nudge_rx: Receiver<()>,
}

impl Permits {
    /// `count` free permits out of at most `limit`.
    fn new(count: usize, limit: usize) -> Self {
        let (nudge_tx, nudge_rx) = bounded(1);
        Self {
            available: AtomicUsize::new(count),
            limit,
            nudge_tx,
            nudge_rx,
        }
    }

    fn try_acquire(&self) -> bool {
        self.available
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn release(&self) -> Result<()> {
        self.available
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .map_err(|_| Error::InvalidState("permit released beyond capacity"))?;
        // A full slot already guarantees a waiter will re-check the count.
        let _ = self.nudge_tx.try_send(());
        Ok(())
    }

    fn acquire(
        &self,
        timeout: Timeout,
        cancel: &CancellationToken,
        wake: &CancellationToken,
    ) -> Acquire {
        let deadline = match timeout {
            Timeout::Immediate if self.try_acquire() => return Acquire::Acquired,
            Timeout::Immediate => return Acquire::TimedOut,
            Timeout::After(duration) => Instant::now().checked_add(duration),
            Timeout::Infinite => None,
        };

        let nudge = &self.nudge_rx;
        let cancelled = cancel.receiver();
        let woken = wake.receiver();
        loop {
            if self.try_acquire() {
                // Several releases may have collapsed into one nudge; pass
                // it on while permits remain.
                if self.available.load(Ordering::SeqCst) > 0 {
                    let _ = self.nudge_tx.try_send(());
                }
                return Acquire::Acquired;
            }
            match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Acquire::TimedOut;
                    }
                    select! {
                        recv(nudge) -> _ => {}
                        recv(cancelled) -> _ => return Acquire::Cancelled,
                        recv(woken) -> _ => return Acquire::Woken,
                        default(remaining) => {}
                    }
                }
                None => select! {
                    recv(nudge) -> _ => {}
                    recv(cancelled) -> _ => return Acquire::Cancelled,
                    recv(woken) -> _ => return Acquire::Woken,
                },
            }
        }
    }
}

/// Short busy-wait used on the adder bookkeeping path.
struct Spin {
    step: u32,
}

impl Spin {
    const YIELD_AFTER: u32 = 64;

    fn new() -> Self {
        Self { step: 0 }
    }

    fn spin(&mut self) {
        if self.step < Self::YIELD_AFTER {
            std::hint::spin_loop();
            self.step += 1;
        } else {
            thread::yield_now();
        }
    }
}

/// Decrements the in-flight adder count on every exit path of an add.
struct AdderGuard<'a> {
    adders: &'a AtomicU32,
}

impl Drop for AdderGuard<'_> {
    fn drop(&mut self) {
        self.adders.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A FIFO queue with bounded capacity, timeouts, cancellation and an
/// idempotent "no more items" transition.
pub struct BoundedQueue<T> {
    items: SegQueue<T>,
    capacity: Option<usize>,
    /// `None` for unbounded queues: adding never waits for capacity.
    producer_permits: Option<Permits>,
    consumer_permits: Permits,
    adders: AtomicU32,
    /// Cancelled by `complete_adding` to wake blocked producers.
    producers_wake: CancellationToken,
    /// Cancelled once the queue is completed and empty to wake blocked consumers.
    consumers_wake: CancellationToken,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// A negative capacity makes the queue unbounded; zero is rejected.
    /// Memory is only taken by stored items, never by unused capacity.
    pub fn new(capacity: isize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        let capacity = usize::try_from(capacity).ok();
        Ok(Self {
            producer_permits: capacity.map(|cap| Permits::new(cap, cap)),
            capacity,
            ..Self::unbounded()
        })
    }

    pub fn unbounded() -> Self {
        Self {
            items: SegQueue::new(),
            capacity: None,
            producer_permits: None,
            consumer_permits: Permits::new(0, usize::MAX),
            adders: AtomicU32::new(0),
            producers_wake: CancellationToken::new(),
            consumers_wake: CancellationToken::new(),
        }
    }

    /// Maximum number of stored items, `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    /// True once `complete_adding` has run and no add is still in flight.
    pub fn is_adding_completed(&self) -> bool {
        self.adders.load(Ordering::SeqCst) == ADDING_COMPLETED
    }

    /// True once adding is completed and every item has been taken.
    pub fn is_completed(&self) -> bool {
        self.is_adding_completed() && self.count() == 0
    }

    /// Offers `item`, waiting up to `timeout` for free capacity.
    ///
    /// Fails with [`Error::AddingCompleted`] if adding was (or gets) completed
    /// and with [`Error::Cancelled`] if `cancel` fires first.
    pub fn try_add(
        &self,
        item: T,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> Result<AddStatus<T>> {
        if self.is_adding_completed() {
            return Err(Error::AddingCompleted);
        }
        cancel.check()?;

        if let Some(permits) = &self.producer_permits {
            match permits.acquire(timeout, cancel, &self.producers_wake) {
                Acquire::Acquired => {}
                Acquire::TimedOut => return Ok(AddStatus::TimedOut(item)),
                Acquire::Cancelled => return Err(Error::Cancelled),
                Acquire::Woken => return Err(Error::AddingCompleted),
            }
        }

        match self.add_holding_permit(item, cancel) {
            Ok(()) => Ok(AddStatus::Added),
            Err(err) => {
                // Nothing was stored, so the capacity goes back.
                self.release_producer_permit()?;
                Err(err)
            }
        }
    }

    fn add_holding_permit(&self, item: T, cancel: &CancellationToken) -> Result<()> {
        let _adder = self.register_adder()?;
        cancel.check()?;
        self.items.push(item);
        self.consumer_permits.release()
    }

    fn register_adder(&self) -> Result<AdderGuard<'_>> {
        let mut spin = Spin::new();
        loop {
            let observed = self.adders.load(Ordering::SeqCst);
            if observed & ADDING_COMPLETED != 0 {
                // Adding and completing concurrently is a contract violation,
                // reported only after the adders that won the race are done.
                self.wait_adders_drained();
                return Err(Error::AddingCompleted);
            }
            if observed + 1 == ADDING_COMPLETED {
                return Err(Error::InvalidState("too many concurrent adders"));
            }
            if self
                .adders
                .compare_exchange_weak(observed, observed + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(AdderGuard {
                    adders: &self.adders,
                });
            }
            spin.spin();
        }
    }

    fn wait_adders_drained(&self) {
        let mut spin = Spin::new();
        while self.adders.load(Ordering::SeqCst) & !ADDING_COMPLETED != 0 {
            spin.spin();
        }
    }

    fn release_producer_permit(&self) -> Result<()> {
        match &self.producer_permits {
            Some(permits) => permits.release(),
            None => Ok(()),
        }
    }

    /// Marks the queue as complete for adding. Idempotent and thread-safe.
    ///
    /// Returns only after every in-flight add has finished. Blocked producers
    /// are woken and fail; blocked consumers are woken if nothing is left.
    pub fn complete_adding(&self) {
        if self.is_adding_completed() {
            return;
        }

        let mut spin = Spin::new();
        loop {
            let observed = self.adders.load(Ordering::SeqCst);
            if observed & ADDING_COMPLETED != 0 {
                // Another caller won; just wait for the adders it is draining.
                self.wait_adders_drained();
                return;
            }
            if self
                .adders
                .compare_exchange_weak(
                    observed,
                    observed | ADDING_COMPLETED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                self.wait_adders_drained();
                if self.count() == 0 {
                    self.consumers_wake.cancel();
                }
                self.producers_wake.cancel();
                return;
            }
            spin.spin();
        }
    }

    /// Takes the oldest item, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `Ok(None)` on timeout and when the queue is (or becomes)
    /// completed; check [`is_completed`](Self::is_completed) to tell them
    /// apart. Fails with [`Error::Cancelled`] if `cancel` fires first.
    pub fn try_take(&self, timeout: Timeout, cancel: &CancellationToken) -> Result<Option<T>> {
        if self.is_completed() {
            return Ok(None);
        }
        cancel.check()?;

        match self
            .consumer_permits
            .acquire(timeout, cancel, &self.consumers_wake)
        {
            Acquire::Acquired => {}
            Acquire::TimedOut | Acquire::Woken => return Ok(None),
            Acquire::Cancelled => return Err(Error::Cancelled),
        }

        if cancel.is_cancelled() {
            self.consumer_permits.release()?;
            return Err(Error::Cancelled);
        }

        let result = match self.items.pop() {
            Some(item) => self.release_producer_permit().map(|()| Some(item)),
            None => {
                self.consumer_permits.release()?;
                Err(Error::InvalidState(
                    "failed to take from underlying collection",
                ))
            }
        };

        if self.is_completed() {
            self.consumers_wake.cancel();
        }
        result
    }
}
