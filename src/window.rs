//! Splits one sequence into a sequence of bounded sub-sequences - exact,
//! sparse ("skip"), or overlapping - each exposed downstream as its own
//! tiny hot, unicast stream.
//!
//! The outer operator never runs its own drain loop: every emission is
//! pushed directly from inside the upstream's `on_next` call, which the
//! [`Subscriber`] contract already serialises for us, so there is no
//! re-entrancy to guard against on the outer side. Each inner window *does*
//! carry the usual `wip`/[`Demand`] pair, since its own subscriber drives it
//! independently on its own thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FlowError;
use crate::protocol::demand::{Demand, UNBOUNDED};
use crate::protocol::fusion::{FusionMode, FusionRequest, QueueSubscription, SubscriptionHandle};
use crate::protocol::subscriber::Subscriber;
use crate::protocol::subscription::{Subscription, validate_request};
use crate::protocol::wip::{DrainLock, Entry, ExitOutcome};

/// Shared between the outer operator and every inner window it ever opens:
/// a work counter that keeps upstream alive as long as anything is still
/// consuming a window.
struct Shared<T> {
    work: AtomicU64,
    upstream: Mutex<Option<SubscriptionHandle<T>>>,
}

impl<T> Shared<T> {
    fn release(&self) {
        if self.work.fetch_sub(1, Ordering::AcqRel) == 1
            && let Some(upstream) = self.upstream.lock().unwrap().take()
        {
            upstream.cancel();
        }
    }
}

/// One bounded sub-sequence handed downstream by the window operator. A
/// thin, cloneable handle around the actual processor, so the operator can
/// keep emitting into it after handing a copy to the outer subscriber.
pub struct Window<T> {
    inner: Arc<InnerWindow<T>>,
}

impl<T: Send + Sync + 'static> Window<T> {
    /// Subscribes to this window's own sub-sequence.
    pub fn subscribe<S>(&self, subscriber: S)
    where
        S: Subscriber<T> + Send + Sync + 'static,
    {
        self.inner.subscribe(subscriber);
    }
}

/// The per-window processor: a hot, unicast stream (exactly one subscriber
/// ever) with an internal bounded queue.
struct InnerWindow<T> {
    buffer: Mutex<VecDeque<T>>,
    done: AtomicBool,
    error: Mutex<Option<FlowError>>,
    requested: Demand,
    wip: DrainLock,
    cancelled: AtomicBool,
    released: AtomicBool,
    subscriber: Mutex<Option<Box<dyn Subscriber<T> + Send + Sync>>>,
    shared: Arc<Shared<T>>,
}

impl<T: Send + Sync + 'static> InnerWindow<T> {
    fn new(shared: Arc<Shared<T>>) -> Arc<Self> {
        shared.work.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            buffer: Mutex::new(VecDeque::new()),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            requested: Demand::new(),
            wip: DrainLock::new(),
            cancelled: AtomicBool::new(false),
            released: AtomicBool::new(false),
            subscriber: Mutex::new(None),
            shared,
        })
    }

    fn subscribe<S>(self: &Arc<Self>, subscriber: S)
    where
        S: Subscriber<T> + Send + Sync + 'static,
    {
        let mut slot = self.subscriber.lock().unwrap();
        if slot.is_some() {
            drop(slot);
            subscriber.on_subscribe(SubscriptionHandle::Plain(Box::new(NoopSubscription)));
            subscriber.on_error(FlowError::DoubleSubscription);
            return;
        }
        subscriber.on_subscribe(SubscriptionHandle::Queue(Box::new(self.clone())));
        *slot = Some(Box::new(subscriber));
        drop(slot);
        self.drain();
    }

    /// Called by the outer operator as it forwards an upstream value into
    /// this window.
    fn push(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        self.buffer.lock().unwrap().push_back(value);
        self.drain();
    }

    /// Called by the outer operator to close this window, normally or
    /// with the terminal it is itself closing with.
    fn finish(&self, cause: Option<FlowError>) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.error.lock().unwrap() = cause;
        self.drain();
    }

    fn release_once(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.shared.release();
        }
    }

    fn drain(&self) {
        if matches!(self.wip.enter(), Entry::AlreadyRunning) {
            return;
        }
        let mut missed = 1u64;
        loop {
            self.run_pass();
            match self.wip.exit(missed) {
                ExitOutcome::Done => return,
                ExitOutcome::Reenter => missed = 1,
            }
        }
    }

    fn run_pass(&self) {
        // `take` rather than holding the lock across the callbacks below,
        // since a reentrant `request`/`cancel` from inside a callback must
        // still be able to reach `self.subscriber` (it won't, here, but the
        // drain-style operators elsewhere in this crate all follow this
        // shape, so it stays consistent).
        let Some(subscriber) = self.subscriber.lock().unwrap().take() else {
            return;
        };
        let result = self.run_pass_with(&*subscriber);
        *self.subscriber.lock().unwrap() = Some(subscriber);
        if result.is_terminal {
            self.release_once();
        }
    }

    fn run_pass_with(&self, subscriber: &(dyn Subscriber<T> + Send + Sync)) -> PassResult {
        if self.cancelled.load(Ordering::Acquire) {
            return PassResult { is_terminal: false };
        }

        let r = self.requested.get();
        let mut e = 0u64;
        while e != r {
            if self.cancelled.load(Ordering::Acquire) {
                return PassResult { is_terminal: false };
            }
            let Some(value) = self.buffer.lock().unwrap().pop_front() else {
                break;
            };
            subscriber.on_next(value);
            e += 1;
        }
        if e != 0 {
            self.requested.sub(e);
        }

        if self.done.load(Ordering::Acquire) && self.buffer.lock().unwrap().is_empty() {
            match self.error.lock().unwrap().clone() {
                Some(cause) => subscriber.on_error(cause),
                None => subscriber.on_complete(),
            }
            return PassResult { is_terminal: true };
        }
        PassResult { is_terminal: false }
    }
}

struct PassResult {
    is_terminal: bool,
}

impl<T: Send + Sync + 'static> Subscription for InnerWindow<T> {
    fn request(&self, n: u64) {
        if let Err(cause) = validate_request(n) {
            if let Some(subscriber) = self.subscriber.lock().unwrap().as_ref() {
                subscriber.on_error(cause);
            }
            return;
        }
        self.requested.add(n);
        self.drain();
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.buffer.lock().unwrap().clear();
        self.release_once();
    }
}

impl<T: Send + Sync + 'static> QueueSubscription<T> for InnerWindow<T> {
    fn request_fusion(&self, requested: FusionRequest) -> FusionMode {
        if requested.async_ {
            FusionMode::Async
        } else {
            FusionMode::None
        }
    }

    fn poll(&self) -> Option<T> {
        self.buffer.lock().unwrap().pop_front()
    }

    fn is_empty(&self) -> bool {
        self.buffer.lock().unwrap().is_empty()
    }

    fn clear(&self) {
        self.buffer.lock().unwrap().clear();
    }
}

/// A no-op subscription for a window that is about to receive an immediate
/// terminal (double-subscribe).
struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

/// One active inner window plus the count of items still needed to fill it
/// (exact/skip) or to fill each concurrently open one (overlap).
enum WindowState<T> {
    /// Used for the exact (`skip == size`) and sparse (`skip > size`)
    /// regimes: at most one window is ever open at a time.
    Single {
        active: Option<(Arc<InnerWindow<T>>, u64)>,
        /// Items to drop on the floor before the next window opens
        /// (`skip - size`; always `0` for the exact regime).
        gap: u64,
    },
    /// Used for the overlapping (`skip < size`) regime: several windows are
    /// open concurrently.
    Overlap {
        actives: VecDeque<(Arc<InnerWindow<T>>, u64)>,
        /// Items remaining before the next window opens.
        until_next_start: u64,
    },
}

/// Configuration for a window split: `size` values per window, a new
/// window opened every `skip` values.
pub struct WindowSource<T> {
    size: u64,
    skip: u64,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Clone + Send + Sync + 'static> WindowSource<T> {
    pub fn new(size: u64, skip: u64) -> Self {
        assert!(size > 0, "window size must be positive");
        assert!(skip > 0, "window skip must be positive");
        Self {
            size,
            skip,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn subscribe<S>(&self, downstream: S) -> Arc<WindowInstance<T, S>>
    where
        S: Subscriber<Window<T>> + Send + Sync + 'static,
    {
        WindowInstance::new(self.size, self.skip, downstream)
    }
}

/// The live instance of a window split, bound to one outer subscriber and
/// one upstream subscription.
pub struct WindowInstance<T, S> {
    size: u64,
    skip: u64,
    downstream: S,
    state: Mutex<WindowState<T>>,
    shared: Arc<Shared<T>>,
    requested: Demand,
    first_request: AtomicBool,
    cancelled: AtomicBool,
    done: AtomicBool,
    outer_released: AtomicBool,
}

impl<T, S> WindowInstance<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: Subscriber<Window<T>> + Send + Sync + 'static,
{
    fn new(size: u64, skip: u64, downstream: S) -> Arc<Self> {
        let state = if skip < size {
            WindowState::Overlap {
                actives: VecDeque::new(),
                until_next_start: 0,
            }
        } else {
            WindowState::Single {
                active: None,
                gap: 0,
            }
        };
        let instance = Arc::new(Self {
            size,
            skip,
            downstream,
            state: Mutex::new(state),
            shared: Arc::new(Shared {
                work: AtomicU64::new(1),
                upstream: Mutex::new(None),
            }),
            requested: Demand::new(),
            first_request: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            outer_released: AtomicBool::new(false),
        });
        instance
            .downstream
            .on_subscribe(SubscriptionHandle::Plain(Box::new(instance.clone())));
        instance
    }

    fn emit_window(&self) -> Arc<InnerWindow<T>> {
        let inner = InnerWindow::new(self.shared.clone());
        self.downstream.on_next(Window {
            inner: inner.clone(),
        });
        self.requested.sub(1);
        inner
    }

    /// Forwards one upstream value, opening and closing inner windows per
    /// the regime's rule. Holds `state` locked across the
    /// (synchronous) emission of a newly opened window; upstream signals
    /// are already serialised by the `Subscriber` contract, so nothing else
    /// can be racing this call for the same instance.
    fn handle_next(&self, value: T) {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            WindowState::Single { active, gap } => {
                if active.is_none() {
                    if *gap > 0 {
                        *gap -= 1;
                        return;
                    }
                    let inner = self.emit_window();
                    *active = Some((inner, self.size));
                }
                let (inner, remaining) = active.as_mut().expect("just ensured above");
                inner.push(value);
                *remaining -= 1;
                if *remaining == 0 {
                    let (inner, _) = active.take().unwrap();
                    inner.finish(None);
                    *gap = self.skip - self.size;
                }
            }
            WindowState::Overlap {
                actives,
                until_next_start,
            } => {
                if *until_next_start == 0 {
                    let inner = self.emit_window();
                    actives.push_back((inner, self.size));
                    *until_next_start = self.skip;
                }
                *until_next_start -= 1;

                for (inner, remaining) in actives.iter_mut() {
                    inner.push(value.clone());
                    *remaining -= 1;
                }
                while matches!(actives.front(), Some((_, 0))) {
                    let (inner, _) = actives.pop_front().unwrap();
                    inner.finish(None);
                }
            }
        }
    }

    /// Closes every currently open inner window with `cause`, then tears
    /// down the shared state.
    fn terminate_actives(&self, cause: Option<&FlowError>) {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            WindowState::Single { active, .. } => {
                if let Some((inner, _)) = active.take() {
                    inner.finish(cause.cloned());
                }
            }
            WindowState::Overlap { actives, .. } => {
                for (inner, _) in actives.drain(..) {
                    inner.finish(cause.cloned());
                }
            }
        }
    }

    fn release_outer(&self) {
        if !self.outer_released.swap(true, Ordering::AcqRel) {
            self.shared.release();
        }
    }
}

impl<T, S> Subscriber<T> for WindowInstance<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: Subscriber<Window<T>> + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: SubscriptionHandle<T>) {
        *self.shared.upstream.lock().unwrap() = Some(subscription);
    }

    fn on_next(&self, value: T) {
        if self.cancelled.load(Ordering::Acquire) || self.done.load(Ordering::Acquire) {
            return;
        }
        self.handle_next(value);
    }

    fn on_error(&self, cause: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.terminate_actives(Some(&cause));
        self.downstream.on_error(cause);
        self.release_outer();
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.terminate_actives(None);
        self.downstream.on_complete();
        self.release_outer();
    }
}

impl<T, S> Subscription for WindowInstance<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: Subscriber<Window<T>> + Send + Sync + 'static,
{
    /// Translates a request for `n` outer windows into upstream demand
    /// using the credit formulas for the active regime.
    fn request(&self, n: u64) {
        if let Err(cause) = validate_request(n) {
            self.downstream.on_error(cause);
            return;
        }
        self.requested.add(n);

        if n == UNBOUNDED {
            if let Some(upstream) = self.shared.upstream.lock().unwrap().as_ref() {
                upstream.request(UNBOUNDED);
            }
            return;
        }

        let first = !self.first_request.swap(true, Ordering::AcqRel);
        let exact = self.skip == self.size;
        let overlap = self.skip < self.size;
        let credit = if exact {
            self.size.saturating_mul(n)
        } else if overlap {
            if first {
                self.size + self.skip.saturating_mul(n.saturating_sub(1))
            } else {
                self.skip.saturating_mul(n)
            }
        } else if first {
            self.size + (self.skip - self.size).saturating_mul(n.saturating_sub(1))
        } else {
            self.skip.saturating_mul(n)
        };

        if let Some(upstream) = self.shared.upstream.lock().unwrap().as_ref() {
            upstream.request(credit);
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.release_outer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSubscriber {
        values: StdMutex<Vec<i32>>,
        done: StdMutex<bool>,
    }

    impl RecordingSubscriber {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                values: StdMutex::new(Vec::new()),
                done: StdMutex::new(false),
            })
        }
    }

    impl Subscriber<i32> for Arc<RecordingSubscriber> {
        fn on_subscribe(&self, subscription: SubscriptionHandle<i32>) {
            subscription.request(UNBOUNDED);
        }
        fn on_next(&self, value: i32) {
            self.values.lock().unwrap().push(value);
        }
        fn on_error(&self, _cause: FlowError) {
            *self.done.lock().unwrap() = true;
        }
        fn on_complete(&self) {
            *self.done.lock().unwrap() = true;
        }
    }

    struct WindowCollector {
        windows: StdMutex<Vec<Arc<RecordingSubscriber>>>,
        done: StdMutex<bool>,
    }

    impl WindowCollector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                windows: StdMutex::new(Vec::new()),
                done: StdMutex::new(false),
            })
        }
    }

    impl Subscriber<Window<i32>> for Arc<WindowCollector> {
        fn on_subscribe(&self, subscription: SubscriptionHandle<Window<i32>>) {
            subscription.request(UNBOUNDED);
        }
        fn on_next(&self, window: Window<i32>) {
            let recorder = RecordingSubscriber::new();
            window.subscribe(recorder.clone());
            self.windows.lock().unwrap().push(recorder);
        }
        fn on_error(&self, _cause: FlowError) {
            *self.done.lock().unwrap() = true;
        }
        fn on_complete(&self) {
            *self.done.lock().unwrap() = true;
        }
    }

    struct NoopUpstream;
    impl Subscription for NoopUpstream {
        fn request(&self, _n: u64) {}
        fn cancel(&self) {}
    }

    fn push_all(instance: &Arc<WindowInstance<i32, Arc<WindowCollector>>>, values: &[i32]) {
        Subscriber::on_subscribe(
            &**instance,
            SubscriptionHandle::Plain(Box::new(NoopUpstream)),
        );
        for v in values {
            Subscriber::on_next(&**instance, *v);
        }
        Subscriber::on_complete(&**instance);
    }

    fn window_contents(collector: &WindowCollector) -> Vec<Vec<i32>> {
        collector
            .windows
            .lock()
            .unwrap()
            .iter()
            .map(|w| w.values.lock().unwrap().clone())
            .collect()
    }

    #[test]
    fn exact_windows_reproduce_the_upstream_sequence() {
        let source = WindowSource::<i32>::new(3, 3);
        let collector = WindowCollector::new();
        let instance = source.subscribe(collector.clone());
        push_all(&instance, &[1, 2, 3, 4, 5, 6, 7]);

        assert_eq!(
            window_contents(&collector),
            vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]
        );
        assert!(*collector.done.lock().unwrap());
    }

    struct SilentCollector;
    impl Subscriber<Window<i32>> for SilentCollector {
        fn on_subscribe(&self, _subscription: SubscriptionHandle<Window<i32>>) {}
        fn on_next(&self, _window: Window<i32>) {}
        fn on_error(&self, _cause: FlowError) {}
        fn on_complete(&self) {}
    }

    struct RecordingUpstream {
        requested: StdMutex<Vec<u64>>,
    }

    impl RecordingUpstream {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requested: StdMutex::new(Vec::new()),
            })
        }
    }

    impl Subscription for RecordingUpstream {
        fn request(&self, n: u64) {
            self.requested.lock().unwrap().push(n);
        }
        fn cancel(&self) {}
    }

    #[test]
    fn exact_regime_requests_size_times_n_on_a_single_call() {
        // A single `request(n)` with `n > 1` and never requesting again must
        // pull `size * n` upstream items for the exact regime, per spec
        // §4.5 - not the skip regime's first/subsequent split, which
        // collapses to just `size` when `skip == size`.
        let source = WindowSource::<i32>::new(3, 3);
        let instance = source.subscribe(SilentCollector);

        let upstream = RecordingUpstream::new();
        Subscriber::on_subscribe(
            &*instance,
            SubscriptionHandle::Plain(Box::new(upstream.clone())),
        );
        Subscription::request(&*instance, 4);

        assert_eq!(*upstream.requested.lock().unwrap(), vec![12]);
    }

    #[test]
    fn overlapping_windows_share_items() {
        let source = WindowSource::<i32>::new(3, 1);
        let collector = WindowCollector::new();
        let instance = source.subscribe(collector.clone());
        push_all(&instance, &[1, 2, 3, 4, 5]);

        assert_eq!(
            window_contents(&collector),
            vec![
                vec![1, 2, 3],
                vec![2, 3, 4],
                vec![3, 4, 5],
                vec![4, 5],
                vec![5],
            ]
        );
    }

    #[test]
    fn sparse_windows_drop_items_between_size_and_skip() {
        let source = WindowSource::<i32>::new(2, 3);
        let collector = WindowCollector::new();
        let instance = source.subscribe(collector.clone());
        push_all(&instance, &[1, 2, 3, 4, 5, 6, 7, 8]);

        // Windows: [1,2] (drop 3), [4,5] (drop 6), [7,8].
        assert_eq!(
            window_contents(&collector),
            vec![vec![1, 2], vec![4, 5], vec![7, 8]]
        );
    }
}
