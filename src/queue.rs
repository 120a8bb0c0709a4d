//! The external queue-supplier interface, plus one concrete, default
//! implementation.
//!
//! [`Queue`] is deliberately narrow - `offer`/`poll`/`is_empty`/`clear`.
//! Its default implementation, [`SpscQueue`], generalizes an
//! owned-producer-half, owned-consumer-half channel split (an
//! `Acquire`/`Release` cursor handoff across a power-of-two ring buffer)
//! into a single value any single-producer caller can push into and any
//! single *drain-lock-owning* caller can pull from - observe-on never hands
//! the queue itself to two different long-lived owners the way a dedicated
//! sender/receiver split does; instead a different thread may hold the
//! drain lock at different times, which the `Acquire`/`Release` protocol
//! already accommodates without change.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::ring::RingBuffer;

/// A bounded queue with the four operations the external "queue supplier"
/// role needs: `offer`, `poll`, `is_empty`, `clear`.
pub trait Queue<T>: Send + Sync {
    /// Pushes `value`. Returns it back on failure (queue full) so the
    /// caller can decide how to react - observe-on treats this as "source
    /// misbehaved vs. prefetch" and cancels upstream.
    fn offer(&self, value: T) -> Result<(), T>;

    fn poll(&self) -> Option<T>;

    fn is_empty(&self) -> bool;

    /// Drops any buffered values without delivering them.
    fn clear(&self);

    fn capacity(&self) -> usize;
}

/// A factory that returns a bounded [`Queue`] of some implementation-chosen
/// concurrency class - typically a single-producer/single-consumer ring
/// buffer, which is exactly what [`SpscQueue`] is.
pub trait QueueFactory<T>: Send + Sync {
    fn create(&self, capacity: usize) -> Arc<dyn Queue<T>>;
}

/// The default queue factory: always returns an [`SpscQueue`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SpscQueueFactory;

impl<T: Send + 'static> QueueFactory<T> for SpscQueueFactory {
    fn create(&self, capacity: usize) -> Arc<dyn Queue<T>> {
        Arc::new(SpscQueue::new(capacity))
    }
}

/// A lock-free, single-producer single-consumer bounded queue over a
/// power-of-two ring buffer: the producer's `tail` is `Release`-stored so the
/// consumer's `Acquire`-load of it also observes the buffer write; the
/// consumer's `head` is `Release`-stored so the producer's `Acquire`-load of
/// it observes that the slot has been freed.
pub struct SpscQueue<T> {
    buffer: RingBuffer<UnsafeCell<MaybeUninit<T>>>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Sync for SpscQueue<T> {}
unsafe impl<T: Send> Send for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: RingBuffer::with_capacity(capacity),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }
}

impl<T: Send> Queue<T> for SpscQueue<T> {
    fn offer(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        // acquire-load: observe the consumer's previous release-store of `head`
        let head = self.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) >= self.buffer.capacity() {
            return Err(value);
        }

        let i = self.buffer.index(tail);
        unsafe { self.buffer.write(i, value) };
        self.tail.store(tail + 1, Ordering::Release);
        Ok(())
    }

    fn poll(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        // acquire-load: observe the producer's previous release-store of `tail`
        let tail = self.tail.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        let i = self.buffer.index(head);
        let out = unsafe { self.buffer.read(i) };
        self.head.store(head + 1, Ordering::Release);
        Some(out)
    }

    fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        head == tail
    }

    fn clear(&self) {
        while self.poll().is_some() {}
    }

    fn capacity(&self) -> usize {
        self.buffer.capacity()
    }
}

// Dropping a queue with buffered-but-unread items must still drop them by
// walking the remaining `[head, tail)` range.
impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let count = tail.wrapping_sub(head);
        for s in 0..count {
            let i = self.buffer.index(head.wrapping_add(s));
            unsafe { self.buffer.drop_in_place(i) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_and_poll_preserve_order() {
        let q: SpscQueue<i32> = SpscQueue::new(4);
        q.offer(1).unwrap();
        q.offer(2).unwrap();
        assert_eq!(q.poll(), Some(1));
        assert_eq!(q.poll(), Some(2));
        assert_eq!(q.poll(), None);
    }

    #[test]
    fn offer_fails_when_full() {
        let q: SpscQueue<i32> = SpscQueue::new(2);
        q.offer(1).unwrap();
        q.offer(2).unwrap();
        assert_eq!(q.offer(3), Err(3));
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let q: SpscQueue<i32> = SpscQueue::new(3);
        assert_eq!(q.capacity(), 4);
    }

    #[test]
    fn clear_drains_without_yielding_values() {
        let q: SpscQueue<i32> = SpscQueue::new(4);
        q.offer(1).unwrap();
        q.offer(2).unwrap();
        q.clear();
        assert!(q.is_empty());
    }

    #[test]
    fn drop_releases_buffered_items() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct DropCounter(Arc<AtomicUsize>);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        {
            let q: SpscQueue<DropCounter> = SpscQueue::new(4);
            q.offer(DropCounter(count.clone())).unwrap();
            q.offer(DropCounter(count.clone())).unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
