use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::trace;
use crate::ring_buffer::{OverflowPolicy, RingBuffer};

/// A bounded queue for handing items from one thread to another, typically shared through an
///  `Arc`. It is a [RingBuffer] behind a mutex: the critical sections are a single push or pop,
///  so contention between the two sides is negligible.
///
/// Producers never block. A consumer can either poll ([ConcurrentQueue::try_dequeue]) or wait
///  for a bounded time ([ConcurrentQueue::dequeue_timeout]).
pub struct ConcurrentQueue<T> {
    buffer: Mutex<RingBuffer<T>>,
    not_empty: Condvar,
}

impl<T> ConcurrentQueue<T> {
    pub fn new(capacity: usize, overflow: OverflowPolicy) -> ConcurrentQueue<T> {
        ConcurrentQueue {
            buffer: Mutex::new(RingBuffer::new(capacity, overflow)),
            not_empty: Condvar::new(),
        }
    }

    /// Appends an item, returning it as `Err` if the queue is full and rejects new entries. With
    ///  [OverflowPolicy::Overwrite], the evicted oldest entry is returned as `Ok(Some(..))`.
    pub fn try_enqueue(&self, item: T) -> Result<Option<T>, T> {
        let result = self.lock().push(item);
        if result.is_ok() {
            self.not_empty.notify_one();
        }
        result
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.lock().try_pop()
    }

    /// Waits up to `timeout` for an item to become available
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;

        let mut buffer = self.lock();
        loop {
            if let Some(item) = buffer.try_pop() {
                return Some(item);
            }

            let now = Instant::now();
            if now >= deadline {
                trace!("dequeue timed out");
                return None;
            }

            buffer = self.not_empty
                .wait_timeout(buffer, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Drops all queued items
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// NB: ring buffer operations either complete or do nothing, so a poisoned lock still guards
    ///  a consistent buffer
    fn lock(&self) -> MutexGuard<'_, RingBuffer<T>> {
        self.buffer.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
