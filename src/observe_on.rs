//! The asynchronous hand-off boundary: bridges an upstream
//! producing thread to a downstream consuming thread through a bounded
//! queue, with prefetch, limit-based replenishment, conditional delivery,
//! and delayed-error semantics.
//!
//! The drain loop below is the one place in this crate where the `wip`
//! idiom and an external
//! [`Scheduler`] meet: the lock decides who may run the loop body, and the
//! scheduler decides *when* the owner's next pass actually executes
//! relative to the calling thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

use crate::error::FlowError;
use crate::executor::{Scheduler, SchedulerFactory};
use crate::protocol::demand::{Demand, UNBOUNDED};
use crate::protocol::fusion::{FusionMode, FusionRequest, QueueSubscription, SubscriptionHandle};
use crate::protocol::hooks::{DropHook, NoopHook};
use crate::protocol::subscriber::{ConditionalSubscriber, Subscriber};
use crate::protocol::subscription::{Subscription, validate_request};
use crate::protocol::wip::{DrainLock, Entry, ExitOutcome};
use crate::queue::{Queue, QueueFactory, SpscQueueFactory};

/// Configuration for an observe-on boundary. [`subscribe`](Self::subscribe)
/// (and [`subscribe_conditional`](Self::subscribe_conditional)) wire it
/// between an upstream publisher and a downstream subscriber.
pub struct ObserveOn<T> {
    scheduler_factory: Arc<dyn SchedulerFactory>,
    queue_factory: Arc<dyn QueueFactory<T>>,
    drop_hook: Arc<dyn DropHook<T>>,
    delay_error: bool,
    prefetch: u64,
}

impl<T: Send + 'static> ObserveOn<T> {
    /// `prefetch` must be `> 0`; pass [`UNBOUNDED`] to request
    /// the upstream's entire sequence up front with no replenishment
    /// bookkeeping.
    pub fn new(scheduler_factory: Arc<dyn SchedulerFactory>, prefetch: u64, delay_error: bool) -> Self {
        assert!(prefetch > 0, "prefetch must be positive");
        Self {
            scheduler_factory,
            queue_factory: Arc::new(SpscQueueFactory),
            drop_hook: Arc::new(NoopHook),
            delay_error,
            prefetch,
        }
    }

    pub fn with_queue_factory(mut self, factory: Arc<dyn QueueFactory<T>>) -> Self {
        self.queue_factory = factory;
        self
    }

    /// Installs the side-channel diagnostics hook invoked for every value or
    /// error that arrives after this boundary has gone terminal. Absent a
    /// call to this, late signals are discarded silently (spec §6).
    pub fn with_drop_hook(mut self, hook: Arc<dyn DropHook<T>>) -> Self {
        self.drop_hook = hook;
        self
    }

    /// Wires `downstream` to receive items through this boundary. Returns
    /// the value to hand to the *upstream* publisher's `subscribe` - it is
    /// both the [`Subscriber`] upstream signals and the [`Subscription`]
    /// downstream uses to request more.
    pub fn subscribe<S>(&self, downstream: S) -> Arc<ObserveOnInlet<T>>
    where
        S: Subscriber<T> + Send + Sync + 'static,
    {
        ObserveOnInlet::new_arc(
            Box::new(Standard(downstream)),
            self.scheduler_factory.clone(),
            self.queue_factory.clone(),
            self.drop_hook.clone(),
            self.delay_error,
            self.prefetch,
        )
    }

    /// Like [`subscribe`](Self::subscribe), but `downstream` is a
    /// [`ConditionalSubscriber`]: `try_on_next` governs whether an item
    /// counts against demand, while every poll still counts against the
    /// prefetch replenishment counter regardless of filtering efficiency.
    pub fn subscribe_conditional<S>(&self, downstream: S) -> Arc<ObserveOnInlet<T>>
    where
        S: ConditionalSubscriber<T> + Send + Sync + 'static,
    {
        ObserveOnInlet::new_arc(
            Box::new(Conditional(downstream)),
            self.scheduler_factory.clone(),
            self.queue_factory.clone(),
            self.drop_hook.clone(),
            self.delay_error,
            self.prefetch,
        )
    }
}

/// Unifies the plain and conditional downstream shapes behind one interface
/// so the drain loop is written once.
trait Deliver<T>: Send + Sync {
    fn on_subscribe(&self, handle: SubscriptionHandle<T>);
    /// Returns `true` if the value was consumed (counts toward `produced`).
    fn deliver(&self, value: T) -> bool;
    fn on_error(&self, cause: FlowError);
    fn on_complete(&self);
}

struct Standard<S>(S);

impl<T, S: Subscriber<T> + Send + Sync> Deliver<T> for Standard<S> {
    fn on_subscribe(&self, handle: SubscriptionHandle<T>) {
        self.0.on_subscribe(handle)
    }
    fn deliver(&self, value: T) -> bool {
        self.0.on_next(value);
        true
    }
    fn on_error(&self, cause: FlowError) {
        self.0.on_error(cause)
    }
    fn on_complete(&self) {
        self.0.on_complete()
    }
}

struct Conditional<S>(S);

impl<T, S: ConditionalSubscriber<T> + Send + Sync> Deliver<T> for Conditional<S> {
    fn on_subscribe(&self, handle: SubscriptionHandle<T>) {
        self.0.on_subscribe(handle)
    }
    fn deliver(&self, value: T) -> bool {
        self.0.try_on_next(value)
    }
    fn on_error(&self, cause: FlowError) {
        self.0.on_error(cause)
    }
    fn on_complete(&self) {
        self.0.on_complete()
    }
}

enum Upstream<T> {
    Plain {
        subscription: SubscriptionHandle<T>,
        queue: Arc<dyn Queue<T>>,
    },
    Fused {
        subscription: Box<dyn QueueSubscription<T>>,
        /// `true` for Sync fusion: the queue is known-terminating and never
        /// replenished.
        sync: bool,
    },
}

impl<T> Upstream<T> {
    fn cancel(&self) {
        match self {
            Upstream::Plain { subscription, .. } => subscription.cancel(),
            Upstream::Fused { subscription, .. } => subscription.cancel(),
        }
    }

    fn request(&self, n: u64) {
        match self {
            Upstream::Plain { subscription, .. } => subscription.request(n),
            Upstream::Fused { subscription, .. } => subscription.request(n),
        }
    }

    fn poll(&self) -> Option<T> {
        match self {
            Upstream::Plain { queue, .. } => queue.poll(),
            Upstream::Fused { subscription, .. } => subscription.poll(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Upstream::Plain { queue, .. } => queue.is_empty(),
            Upstream::Fused { subscription, .. } => subscription.is_empty(),
        }
    }

    fn clear(&self) {
        match self {
            Upstream::Plain { queue, .. } => queue.clear(),
            Upstream::Fused { subscription, .. } => subscription.clear(),
        }
    }

    fn is_sync_fused(&self) -> bool {
        matches!(self, Upstream::Fused { sync: true, .. })
    }
}

/// Both the `Subscriber<T>` upstream signals and the `Subscription`
/// downstream uses - one value plays both roles as a single boundary
/// object.
pub struct ObserveOnInlet<T> {
    downstream: Box<dyn Deliver<T>>,
    scheduler_factory: Arc<dyn SchedulerFactory>,
    queue_factory: Arc<dyn QueueFactory<T>>,
    drop_hook: Arc<dyn DropHook<T>>,
    delay_error: bool,
    prefetch: u64,

    upstream: Mutex<Option<Upstream<T>>>,
    scheduler: Mutex<Option<Arc<dyn Scheduler>>>,

    requested: Demand,
    wip: DrainLock,
    done: AtomicBool,
    cancelled: AtomicBool,
    error: Mutex<Option<FlowError>>,

    /// Items emitted downstream since the last upstream replenishment
    /// request. Only ever touched by the current drain
    /// owner, but kept atomic since ownership changes across scheduler
    /// ticks on possibly different threads.
    consumed: AtomicU64,

    weak_self: Weak<Self>,
}

impl<T: Send + 'static> ObserveOnInlet<T> {
    fn new_arc(
        downstream: Box<dyn Deliver<T>>,
        scheduler_factory: Arc<dyn SchedulerFactory>,
        queue_factory: Arc<dyn QueueFactory<T>>,
        drop_hook: Arc<dyn DropHook<T>>,
        delay_error: bool,
        prefetch: u64,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            downstream,
            scheduler_factory,
            queue_factory,
            drop_hook,
            delay_error,
            prefetch,
            upstream: Mutex::new(None),
            scheduler: Mutex::new(None),
            requested: Demand::new(),
            wip: DrainLock::new(),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            error: Mutex::new(None),
            consumed: AtomicU64::new(0),
            weak_self: weak.clone(),
        })
    }

    #[inline]
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn self_arc(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("ObserveOnInlet is always held behind the Arc returned by ObserveOn::subscribe")
    }

    fn dispose_scheduler(&self) {
        self.scheduler.lock().unwrap().take();
    }

    /// Schedules one more run of the drain loop, or runs it directly if the
    /// `wip` lock is free and no scheduler has been obtained yet (covers
    /// `on_subscribe` ordering before the scheduler is set up).
    fn kick(&self) {
        let scheduler = self.scheduler.lock().unwrap().clone();
        match scheduler {
            Some(scheduler) => {
                let this = self.self_arc();
                scheduler.schedule(Box::new(move || this.drain()));
            }
            None => self.drain(),
        }
    }

    /// Runs the drain loop under the `wip` lock.
    fn drain(&self) {
        if matches!(self.wip.enter(), Entry::AlreadyRunning) {
            return;
        }
        trace!("observe_on: drain entry");
        let mut missed = 1u64;
        loop {
            if self.run_pass() {
                trace!("observe_on: drain terminal");
                return;
            }
            match self.wip.exit(missed) {
                ExitOutcome::Done => {
                    trace!("observe_on: drain exit");
                    return;
                }
                ExitOutcome::Reenter => missed = 1,
            }
        }
    }

    /// One pass of the emission loop. Returns `true`
    /// if a terminal or cancellation was handled and the drain should stop
    /// entirely; otherwise the pass ends because either demand or the
    /// queue ran dry, and the `wip` lock (in [`Self::drain`]) decides
    /// whether another pass is warranted.
    fn run_pass(&self) -> bool {
        let guard = self.upstream.lock().unwrap();
        let Some(upstream) = guard.as_ref() else {
            return false;
        };

        let r = self.requested.get();
        let mut e = 0u64;
        while e != r {
            if self.check_terminated(upstream, upstream.is_empty()) {
                return true;
            }
            let Some(value) = upstream.poll() else {
                break;
            };
            self.consumed.fetch_add(1, Ordering::Relaxed);
            self.maybe_replenish(upstream);
            if self.downstream.deliver(value) {
                e += 1;
            }
        }

        if e == r && self.check_terminated(upstream, upstream.is_empty()) {
            return true;
        }

        if e != 0 {
            self.requested.sub(e);
        }
        false
    }

    fn maybe_replenish(&self, upstream: &Upstream<T>) {
        if upstream.is_sync_fused() || self.prefetch == UNBOUNDED {
            return;
        }
        let limit = self.prefetch - self.prefetch / 4;
        let consumed = self.consumed.load(Ordering::Relaxed);
        if consumed >= limit {
            self.consumed.fetch_sub(consumed, Ordering::Relaxed);
            upstream.request(consumed);
        }
    }

    /// The terminal check, evaluated in priority order: cancellation first,
    /// then an immediate (non-delayed) error, then completion once the
    /// queue has actually drained empty.
    fn check_terminated(&self, upstream: &Upstream<T>, empty: bool) -> bool {
        if self.is_cancelled() {
            upstream.cancel();
            self.dispose_scheduler();
            upstream.clear();
            return true;
        }

        let done = self.done.load(Ordering::Acquire);
        if !done {
            return false;
        }

        if !self.delay_error {
            if let Some(cause) = self.error.lock().unwrap().take() {
                upstream.clear();
                debug!(%cause, "observe_on: terminating with error (delay_error=false)");
                self.downstream.on_error(cause);
                self.dispose_scheduler();
                return true;
            }
        }

        if !empty {
            return false;
        }

        self.dispose_scheduler();
        match self.error.lock().unwrap().take() {
            Some(cause) => {
                debug!(%cause, "observe_on: terminating with delayed error");
                self.downstream.on_error(cause);
            }
            None => self.downstream.on_complete(),
        }
        true
    }
}

impl<T: Send + 'static> Subscriber<T> for ObserveOnInlet<T> {
    fn on_subscribe(&self, subscription: SubscriptionHandle<T>) {
        {
            let guard = self.upstream.lock().unwrap();
            if guard.is_some() {
                // At most one subscription is ever accepted.
                subscription.cancel();
                return;
            }
        }

        *self.scheduler.lock().unwrap() = Some(self.scheduler_factory.create());

        let upstream = match subscription.into_queue() {
            Ok(queue_sub) => match queue_sub.request_fusion(FusionRequest::ANY) {
                FusionMode::Sync => {
                    self.done.store(true, Ordering::Release);
                    Upstream::Fused {
                        subscription: queue_sub,
                        sync: true,
                    }
                }
                FusionMode::Async => Upstream::Fused {
                    subscription: queue_sub,
                    sync: false,
                },
                FusionMode::None => {
                    let queue = self
                        .queue_factory
                        .create(self.prefetch.clamp(1, 1 << 20) as usize);
                    Upstream::Plain {
                        subscription: SubscriptionHandle::Queue(queue_sub),
                        queue,
                    }
                }
            },
            Err(plain) => {
                let queue = self
                    .queue_factory
                    .create(self.prefetch.clamp(1, 1 << 20) as usize);
                Upstream::Plain {
                    subscription: SubscriptionHandle::Plain(plain),
                    queue,
                }
            }
        };

        let sync_fused = upstream.is_sync_fused();
        *self.upstream.lock().unwrap() = Some(upstream);

        self.downstream
            .on_subscribe(SubscriptionHandle::Plain(Box::new(self.self_arc())));

        if !sync_fused {
            let n = if self.prefetch == UNBOUNDED {
                UNBOUNDED
            } else {
                self.prefetch
            };
            if let Some(upstream) = self.upstream.lock().unwrap().as_ref() {
                upstream.request(n);
            }
        }
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) || self.is_cancelled() {
            self.drop_hook.on_dropped_next(&value);
            return;
        }
        let rejected = {
            let guard = self.upstream.lock().unwrap();
            match guard.as_ref() {
                Some(Upstream::Plain { queue, .. }) => queue.offer(value).err(),
                // A fused upstream delivers through its own queue; a stray
                // `on_next` here is just a "something is ready" wake-up.
                _ => None,
            }
        };
        if rejected.is_some() {
            debug!("observe_on: queue full, upstream outran prefetch accounting");
            if let Some(upstream) = self.upstream.lock().unwrap().as_ref() {
                upstream.cancel();
            }
            *self.error.lock().unwrap() = Some(FlowError::QueueFull);
            self.done.store(true, Ordering::Release);
        }
        self.kick();
    }

    fn on_error(&self, cause: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            self.drop_hook.on_dropped_error(&cause);
            return;
        }
        *self.error.lock().unwrap() = Some(cause);
        self.kick();
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.kick();
    }
}

impl<T: Send + 'static> Subscription for ObserveOnInlet<T> {
    fn request(&self, n: u64) {
        if let Err(cause) = validate_request(n) {
            self.downstream.on_error(cause);
            return;
        }
        self.requested.add(n);
        self.kick();
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.kick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Immediate;
    use std::sync::Mutex;

    struct Recorder {
        values: Mutex<Vec<i32>>,
        done: Mutex<Option<Result<(), String>>>,
        upstream: Mutex<Option<SubscriptionHandle<i32>>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                values: Mutex::new(Vec::new()),
                done: Mutex::new(None),
                upstream: Mutex::new(None),
            })
        }
    }

    impl Subscriber<i32> for Arc<Recorder> {
        fn on_subscribe(&self, subscription: SubscriptionHandle<i32>) {
            subscription.request(u64::MAX);
            *self.upstream.lock().unwrap() = Some(subscription);
        }
        fn on_next(&self, value: i32) {
            self.values.lock().unwrap().push(value);
        }
        fn on_error(&self, cause: FlowError) {
            *self.done.lock().unwrap() = Some(Err(cause.to_string()));
        }
        fn on_complete(&self) {
            *self.done.lock().unwrap() = Some(Ok(()));
        }
    }

    struct NoopSub;
    impl Subscription for NoopSub {
        fn request(&self, _n: u64) {}
        fn cancel(&self) {}
    }

    /// Simulates an upstream publisher that immediately pushes all its
    /// values through `on_next` then completes, as soon as it is
    /// subscribed (a plain, non-fused source with no real `Subscription`
    /// behind it beyond request/cancel bookkeeping).
    fn push_source(inlet: &ObserveOnInlet<i32>, values: &[i32]) {
        Subscriber::on_subscribe(inlet, SubscriptionHandle::Plain(Box::new(NoopSub)));
        for v in values {
            Subscriber::on_next(inlet, *v);
        }
        Subscriber::on_complete(inlet);
    }

    #[test]
    fn delivers_upstream_sequence_in_order_then_completes() {
        let observe_on = ObserveOn::new(Arc::new(Immediate), 4, false);
        let downstream = Recorder::new();
        let inlet = observe_on.subscribe(downstream.clone());
        push_source(&inlet, &[1, 2, 3]);

        assert_eq!(*downstream.values.lock().unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            downstream.done.lock().unwrap().as_ref(),
            Some(Ok(()))
        ));
    }

    #[test]
    fn delay_error_false_drops_values_queued_after_the_error() {
        let observe_on = ObserveOn::new(Arc::new(Immediate), 4, false);
        let downstream = Recorder::new();
        let inlet = observe_on.subscribe(downstream.clone());

        struct NoopSub;
        impl Subscription for NoopSub {
            fn request(&self, _n: u64) {}
            fn cancel(&self) {}
        }
        Subscriber::on_subscribe(&*inlet, SubscriptionHandle::Plain(Box::new(NoopSub)));
        Subscriber::on_next(&*inlet, 1);
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;
        Subscriber::on_error(&*inlet, FlowError::upstream(Boom));
        Subscriber::on_next(&*inlet, 2);

        assert_eq!(*downstream.values.lock().unwrap(), vec![1]);
        assert!(matches!(
            downstream.done.lock().unwrap().as_ref(),
            Some(Err(_))
        ));
    }

    #[test]
    fn delay_error_true_emits_all_values_before_the_error() {
        let observe_on = ObserveOn::new(Arc::new(Immediate), 4, true);
        let downstream = Recorder::new();
        let inlet = observe_on.subscribe(downstream.clone());

        struct NoopSub;
        impl Subscription for NoopSub {
            fn request(&self, _n: u64) {}
            fn cancel(&self) {}
        }
        Subscriber::on_subscribe(&*inlet, SubscriptionHandle::Plain(Box::new(NoopSub)));
        Subscriber::on_next(&*inlet, 1);
        Subscriber::on_next(&*inlet, 2);
        #[derive(Debug, thiserror::Error)]
        #[error("x")]
        struct X;
        Subscriber::on_error(&*inlet, FlowError::upstream(X));

        assert_eq!(*downstream.values.lock().unwrap(), vec![1, 2]);
        assert!(matches!(
            downstream.done.lock().unwrap().as_ref(),
            Some(Err(_))
        ));
    }

    #[test]
    fn cancel_stops_further_delivery() {
        let observe_on = ObserveOn::new(Arc::new(Immediate), 4, false);
        let downstream = Recorder::new();
        let inlet = observe_on.subscribe(downstream.clone());

        struct NoopSub;
        impl Subscription for NoopSub {
            fn request(&self, _n: u64) {}
            fn cancel(&self) {}
        }
        Subscriber::on_subscribe(&*inlet, SubscriptionHandle::Plain(Box::new(NoopSub)));
        Subscriber::on_next(&*inlet, 1);
        Subscription::cancel(&*inlet);
        Subscriber::on_next(&*inlet, 2);

        assert_eq!(*downstream.values.lock().unwrap(), vec![1]);
        assert!(downstream.done.lock().unwrap().is_none());
    }

    #[test]
    fn drop_hook_observes_values_delivered_after_terminal() {
        struct Counting(Mutex<Vec<i32>>);
        impl DropHook<i32> for Counting {
            fn on_dropped_next(&self, value: &i32) {
                self.0.lock().unwrap().push(*value);
            }
        }

        let hook = Arc::new(Counting(Mutex::new(Vec::new())));
        let observe_on = ObserveOn::new(Arc::new(Immediate), 4, false).with_drop_hook(hook.clone());
        let downstream = Recorder::new();
        let inlet = observe_on.subscribe(downstream.clone());

        Subscriber::on_subscribe(&*inlet, SubscriptionHandle::Plain(Box::new(NoopSub)));
        Subscriber::on_next(&*inlet, 1);
        Subscriber::on_complete(&*inlet);
        Subscriber::on_next(&*inlet, 2);

        assert_eq!(*downstream.values.lock().unwrap(), vec![1]);
        assert_eq!(*hook.0.lock().unwrap(), vec![2]);
    }
}
