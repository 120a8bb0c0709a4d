//! Synchronous pull producer over a user [`Iterator`].
//!
//! [`IterableSource`] wraps a factory that yields a fresh iterator per
//! subscription and drives it under backpressure, reusing the demand
//! counter itself as the drain-loop's `wip` - the "if I was zero, I own the
//! drain" idiom collapses onto [`Demand::add`] here because
//! `request(n)` on this operator has no other re-entrancy source: the only
//! caller of the drain loop is whichever thread's `request` call finds the
//! counter at zero.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::FlowError;
use crate::protocol::demand::Demand;
use crate::protocol::fusion::{FusionMode, FusionRequest, QueueSubscription, SubscriptionHandle};
use crate::protocol::subscriber::Subscriber;
use crate::protocol::subscription::{Subscription, validate_request};

/// Builds a fresh [`Iterator`] for each subscription. Failure to produce one
/// is modelled as `Err`, not a
/// panic.
pub trait IterableFactory<T>: Send + Sync {
    type Iter: Iterator<Item = T>;

    fn make_iter(&self) -> Result<Self::Iter, FlowError>;
}

impl<T, I, F> IterableFactory<T> for F
where
    F: Fn() -> I + Send + Sync,
    I: Iterator<Item = T>,
{
    type Iter = I;

    fn make_iter(&self) -> Result<I, FlowError> {
        Ok(self())
    }
}

/// A synchronous pull producer that emits the values of a fresh iterator
/// under backpressure.
pub struct IterableSource<F> {
    factory: F,
}

impl<F> IterableSource<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<T, F> IterableSource<F>
where
    F: IterableFactory<T>,
    F::Iter: Send + 'static,
    T: Send + 'static,
{
    /// Subscribes `subscriber`, acquiring a fresh iterator and driving it
    /// under the subscriber's demand.
    pub fn subscribe<S>(&self, subscriber: S)
    where
        S: Subscriber<T> + Send + Sync + 'static,
    {
        let mut iter = match self.factory.make_iter() {
            Ok(iter) => iter,
            Err(cause) => {
                subscriber.on_subscribe(SubscriptionHandle::Plain(Box::new(EmptySubscription)));
                subscriber.on_error(cause);
                return;
            }
        };

        let has_first = iter.next();
        let Some(first) = has_first else {
            subscriber.on_subscribe(SubscriptionHandle::Plain(Box::new(EmptySubscription)));
            subscriber.on_complete();
            return;
        };

        let sub = Arc::new(IterableSubscription {
            iter: UnsafeCell::new(Some(iter)),
            pending: UnsafeCell::new(Some(first)),
            demand: Demand::new(),
            cancelled: AtomicBool::new(false),
            subscriber,
        });
        sub.subscriber
            .on_subscribe(SubscriptionHandle::Queue(Box::new(sub.clone())));
    }
}

/// The subscription handed to downstream for an [`IterableSource`].
///
/// `iter`/`pending` are only ever touched by the drain owner; `demand` and
/// `cancelled` are the only fields any other thread may touch.
struct IterableSubscription<I, T, S> {
    iter: UnsafeCell<Option<I>>,
    /// One item looked ahead of the iterator so that `hasNext`-before-`next`
    /// can be expressed without re-probing the `Iterator` API,
    /// which has no separate `has_next`.
    pending: UnsafeCell<Option<T>>,
    demand: Demand,
    cancelled: AtomicBool,
    subscriber: S,
}

// Safety: `iter`/`pending` are only accessed while holding the demand-based
// drain lock (at most one thread at a time); `demand`/`cancelled` are
// atomics.
unsafe impl<I, T, S> Sync for IterableSubscription<I, T, S>
where
    I: Send,
    T: Send,
    S: Sync,
{
}
unsafe impl<I, T, S> Send for IterableSubscription<I, T, S>
where
    I: Send,
    T: Send,
    S: Send,
{
}

impl<I, T, S> IterableSubscription<I, T, S>
where
    I: Iterator<Item = T>,
    S: Subscriber<T>,
{
    #[inline]
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Advances the lookahead by one slot. Returns `Ok(None)` at end of
    /// iteration, `Err` on a null item.
    fn advance(&self) -> Option<T> {
        let iter = unsafe { &mut *self.iter.get() };
        let pending = unsafe { &mut *self.pending.get() };
        let next = pending.take();
        if let Some(it) = iter.as_mut() {
            *pending = it.next();
            if pending.is_none() {
                *iter = None;
            }
        }
        next
    }

    fn has_pending(&self) -> bool {
        unsafe { (*self.pending.get()).is_some() }
    }

    fn drain(&self) {
        let mut e = 0u64;
        loop {
            let r = self.demand.get();
            while e != r {
                if self.is_cancelled() {
                    return;
                }
                let Some(value) = self.advance() else {
                    self.subscriber.on_complete();
                    return;
                };
                self.subscriber.on_next(value);
                e += 1;

                if self.is_cancelled() {
                    return;
                }
                if !self.has_pending() {
                    self.subscriber.on_complete();
                    return;
                }
            }

            // Write back what we've emitted and recheck, atomically, for
            // demand that arrived while we were draining.
            let remaining = self.demand.sub_and_get(e);
            e = 0;
            if remaining == 0 {
                return;
            }
        }
    }

    /// The `n == MAX` fast path: loops without per-item demand bookkeeping.
    fn drain_unbounded(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let Some(value) = self.advance() else {
                self.subscriber.on_complete();
                return;
            };
            self.subscriber.on_next(value);

            if self.is_cancelled() {
                return;
            }
            if !self.has_pending() {
                self.subscriber.on_complete();
                return;
            }
        }
    }
}

impl<I, T, S> Subscription for IterableSubscription<I, T, S>
where
    I: Iterator<Item = T> + Send,
    T: Send,
    S: Subscriber<T> + Send + Sync,
{
    fn request(&self, n: u64) {
        if let Err(cause) = validate_request(n) {
            self.subscriber.on_error(cause);
            return;
        }
        let prev = self.demand.add(n);
        if prev != 0 {
            // Another caller already owns (or is about to own) the drain.
            return;
        }
        if self.demand.is_unbounded() {
            self.drain_unbounded();
        } else {
            self.drain();
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl<I, T, S> QueueSubscription<T> for IterableSubscription<I, T, S>
where
    I: Iterator<Item = T> + Send,
    T: Send,
    S: Subscriber<T> + Send + Sync,
{
    /// Always offers `Sync` fusion: the iterable source's queue
    /// face is known-terminating - draining it to empty is completion.
    fn request_fusion(&self, requested: FusionRequest) -> FusionMode {
        if requested.sync {
            FusionMode::Sync
        } else {
            FusionMode::None
        }
    }

    fn poll(&self) -> Option<T> {
        self.advance()
    }

    fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    fn clear(&self) {
        unsafe {
            *self.iter.get() = None;
            *self.pending.get() = None;
        }
    }
}

/// A no-op subscription handed to a subscriber that is about to receive an
/// immediate terminal (empty iterator, or iterator-acquisition failure).
struct EmptySubscription;

impl Subscription for EmptySubscription {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Capture {
        values: Mutex<Vec<i32>>,
        completed: Mutex<bool>,
        error: Mutex<Option<FlowError>>,
        subscription: Mutex<Option<SubscriptionHandle<i32>>>,
    }

    impl Capture {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                values: Mutex::new(Vec::new()),
                completed: Mutex::new(false),
                error: Mutex::new(None),
                subscription: Mutex::new(None),
            })
        }
    }

    impl Subscriber<i32> for Arc<Capture> {
        fn on_subscribe(&self, subscription: SubscriptionHandle<i32>) {
            *self.subscription.lock().unwrap() = Some(subscription);
        }
        fn on_next(&self, value: i32) {
            self.values.lock().unwrap().push(value);
        }
        fn on_error(&self, cause: FlowError) {
            *self.error.lock().unwrap() = Some(cause);
        }
        fn on_complete(&self) {
            *self.completed.lock().unwrap() = true;
        }
    }

    #[test]
    fn emits_in_order_then_completes_across_multiple_requests() {
        let source = IterableSource::new(|| vec![1, 2, 3].into_iter());
        let cap = Capture::new();
        source.subscribe(cap.clone());

        let sub = cap.subscription.lock().unwrap().take().unwrap();
        sub.request(1);
        assert_eq!(*cap.values.lock().unwrap(), vec![1]);
        assert!(!*cap.completed.lock().unwrap());

        sub.request(2);
        assert_eq!(*cap.values.lock().unwrap(), vec![1, 2, 3]);
        assert!(*cap.completed.lock().unwrap());
    }

    #[test]
    fn empty_iterator_completes_immediately() {
        let source = IterableSource::new(Vec::<i32>::new);
        let cap = Capture::new();
        source.subscribe(cap.clone());
        assert!(*cap.completed.lock().unwrap());
        assert!(cap.values.lock().unwrap().is_empty());
    }

    #[test]
    fn request_zero_signals_illegal_request() {
        let source = IterableSource::new(|| vec![1].into_iter());
        let cap = Capture::new();
        source.subscribe(cap.clone());
        let sub = cap.subscription.lock().unwrap().take().unwrap();
        sub.request(0);
        assert!(matches!(
            cap.error.lock().unwrap().take(),
            Some(FlowError::IllegalRequest)
        ));
        assert!(cap.values.lock().unwrap().is_empty());
    }

    #[test]
    fn fused_poll_drains_without_callbacks() {
        let source = IterableSource::new(|| vec![1, 2].into_iter());
        let cap = Capture::new();
        source.subscribe(cap.clone());
        let handle = cap.subscription.lock().unwrap().take().unwrap();
        let queue = handle.as_queue().expect("iterable source is sync-fusable");
        assert_eq!(
            queue.request_fusion(FusionRequest::ANY),
            FusionMode::Sync
        );
        assert!(!queue.is_empty());
        assert_eq!(queue.poll(), Some(1));
        assert_eq!(queue.poll(), Some(2));
        assert_eq!(queue.poll(), None);
        assert!(queue.is_empty());
    }
}
