//! The hot, multicast sink: buffers either all or the last `N`
//! values and replays them to every current and future subscriber.
//!
//! The buffer itself (append-only, values cloned out per reader) is kept
//! behind a single [`Mutex`] rather than a hand-rolled lock-free
//! linked-array. `T: Clone` is required because every subscriber reads its
//! own copy out of the shared history - the same requirement
//! `tokio::sync::broadcast` places on its item type, for the same reason.
//! The subscriber list is likewise a `Mutex<ListState<T>>` rather than a
//! CAS-swapped atomic array; see DESIGN.md for the tradeoff.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

use crate::error::FlowError;
use crate::protocol::demand::{Demand, UNBOUNDED};
use crate::protocol::fusion::{FusionMode, FusionRequest, QueueSubscription, SubscriptionHandle};
use crate::protocol::hooks::{DropHook, NoopHook};
use crate::protocol::subscriber::Subscriber;
use crate::protocol::subscription::{Subscription, validate_request};
use crate::protocol::wip::{DrainLock, Entry, ExitOutcome};

/// The append-only history a [`ReplayProcessor`] publishes from.
///
/// `limit = None` is the unbounded shape; `limit = Some(n)` is the bounded shape.
struct ReplayBuffer<T> {
    limit: Option<usize>,
    /// Count of values evicted from the front (bounded mode only). Added to
    /// a position within `values` to get a subscriber's absolute index.
    dropped: u64,
    values: VecDeque<T>,
    done: bool,
    error: Option<FlowError>,
}

impl<T: Clone> ReplayBuffer<T> {
    fn unbounded() -> Self {
        Self {
            limit: None,
            dropped: 0,
            values: VecDeque::new(),
            done: false,
            error: None,
        }
    }

    fn bounded(limit: usize) -> Self {
        assert!(limit > 0, "replay limit must be positive");
        Self {
            limit: Some(limit),
            dropped: 0,
            values: VecDeque::with_capacity(limit),
            done: false,
            error: None,
        }
    }

    fn push(&mut self, value: T) {
        if let Some(limit) = self.limit
            && self.values.len() >= limit
        {
            self.values.pop_front();
            self.dropped += 1;
        }
        self.values.push_back(value);
    }

    /// One past the highest absolute index ever published.
    fn total_len(&self) -> u64 {
        self.dropped + self.values.len() as u64
    }

    /// Absolute index of the oldest value still held - what a late
    /// subscriber's cursor should start at so it sees a suffix of length
    /// `min(limit, items-so-far)`.
    fn floor(&self) -> u64 {
        self.dropped
    }

    fn get(&self, absolute_index: u64) -> Option<T> {
        if absolute_index < self.dropped {
            return None;
        }
        self.values
            .get((absolute_index - self.dropped) as usize)
            .cloned()
    }
}

/// A hot, multicast sink: every subscriber - present or future - replays
/// the buffered history from its own subscription point, then observes
/// subsequent values live.
pub struct ReplayProcessor<T> {
    buffer: Mutex<ReplayBuffer<T>>,
    subscribers: Mutex<ListState<T>>,
    next_id: AtomicU64,
    drop_hook: Mutex<Arc<dyn DropHook<T>>>,
    weak_self: Weak<Self>,
}

enum ListState<T> {
    Active(Vec<Arc<ReplaySubscription<T>>>),
    Terminated,
}

impl<T: Clone + Send + Sync + 'static> ReplayProcessor<T> {
    pub fn unbounded() -> Arc<Self> {
        Self::new(ReplayBuffer::unbounded())
    }

    pub fn bounded(limit: usize) -> Arc<Self> {
        Self::new(ReplayBuffer::bounded(limit))
    }

    fn new(buffer: ReplayBuffer<T>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            buffer: Mutex::new(buffer),
            subscribers: Mutex::new(ListState::Active(Vec::new())),
            next_id: AtomicU64::new(0),
            drop_hook: Mutex::new(Arc::new(NoopHook)),
            weak_self: weak.clone(),
        })
    }

    /// Installs the side-channel diagnostics hook invoked for every value
    /// published after this processor has already gone terminal. Absent a
    /// call to this, such late signals are discarded silently (spec §6).
    pub fn with_drop_hook(self: Arc<Self>, hook: Arc<dyn DropHook<T>>) -> Arc<Self> {
        *self.drop_hook.lock().unwrap() = hook;
        self
    }

    fn self_arc(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("ReplayProcessor is always held behind the Arc its constructors return")
    }

    /// Subscribes `subscriber`, immediately handing it a subscription and
    /// beginning replay from wherever its cursor starts.
    pub fn subscribe<S>(&self, subscriber: S)
    where
        S: Subscriber<T> + Send + Sync + 'static,
    {
        let start = {
            let buffer = self.buffer.lock().unwrap();
            buffer.floor()
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(ReplaySubscription {
            id,
            processor: self.self_arc(),
            next_index: AtomicU64::new(start),
            requested: Demand::new(),
            cancelled: AtomicBool::new(false),
            wip: DrainLock::new(),
            subscriber: Box::new(subscriber),
        });

        sub.subscriber
            .on_subscribe(SubscriptionHandle::Queue(Box::new(sub.clone())));

        let mut list = self.subscribers.lock().unwrap();
        match &mut *list {
            ListState::Active(subs) => subs.push(sub.clone()),
            ListState::Terminated => {
                // Late subscriber: the processor already went terminal.
                // Drive one final drain directly so it still sees the
                // full replay plus the terminal.
                drop(list);
                sub.drain();
                return;
            }
        }
        drop(list);

        if sub.cancelled.load(Ordering::Acquire) {
            self.remove(id);
        }
    }

    fn remove(&self, id: u64) {
        let mut list = self.subscribers.lock().unwrap();
        if let ListState::Active(subs) = &mut *list {
            subs.retain(|s| s.id != id);
        }
    }

    fn snapshot(&self) -> Vec<Arc<ReplaySubscription<T>>> {
        match &*self.subscribers.lock().unwrap() {
            ListState::Active(subs) => subs.clone(),
            ListState::Terminated => Vec::new(),
        }
    }

    fn terminate(&self) -> Vec<Arc<ReplaySubscription<T>>> {
        let mut list = self.subscribers.lock().unwrap();
        match std::mem::replace(&mut *list, ListState::Terminated) {
            ListState::Active(subs) => subs,
            ListState::Terminated => Vec::new(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Subscriber<T> for ReplayProcessor<T> {
    fn on_subscribe(&self, subscription: SubscriptionHandle<T>) {
        // The processor never back-pressures its own upstream: it buffers
        // everything, so
        // it requests everything up front.
        subscription.request(UNBOUNDED);
    }

    fn on_next(&self, value: T) {
        {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.done {
                drop(buffer);
                self.drop_hook.lock().unwrap().on_dropped_next(&value);
                return;
            }
            buffer.push(value);
        }
        for sub in self.snapshot() {
            sub.drain();
        }
    }

    fn on_error(&self, cause: FlowError) {
        {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.done {
                drop(buffer);
                trace!(%cause, "replay: dropping error arrived after terminal");
                self.drop_hook.lock().unwrap().on_dropped_error(&cause);
                return;
            }
            buffer.done = true;
            buffer.error = Some(cause);
        }
        debug!("replay: processor terminated with an error, draining subscribers");
        for sub in self.terminate() {
            sub.drain();
        }
    }

    fn on_complete(&self) {
        {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.done {
                return;
            }
            buffer.done = true;
        }
        debug!("replay: processor completed, draining subscribers");
        for sub in self.terminate() {
            sub.drain();
        }
    }
}

/// One subscriber's view into a [`ReplayProcessor`]'s buffer: its own
/// cursor, demand, and drain lock.
struct ReplaySubscription<T> {
    id: u64,
    processor: Arc<ReplayProcessor<T>>,
    /// Absolute index of the next value this subscriber has not yet seen.
    /// Touched only by whichever caller owns `wip` at a given moment (spec
    /// §5); kept atomic because ownership can move between threads.
    next_index: AtomicU64,
    requested: Demand,
    cancelled: AtomicBool,
    wip: DrainLock,
    subscriber: Box<dyn Subscriber<T> + Send + Sync>,
}

impl<T> ReplaySubscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The per-subscriber drain: replays buffered values up to
    /// `requested`, then re-checks terminal-and-empty.
    fn drain(&self) {
        if matches!(self.wip.enter(), Entry::AlreadyRunning) {
            return;
        }
        trace!(id = self.id, "replay: subscriber drain entry");
        let mut missed = 1u64;
        loop {
            self.run_pass();
            match self.wip.exit(missed) {
                ExitOutcome::Done => {
                    trace!(id = self.id, "replay: subscriber drain exit");
                    return;
                }
                ExitOutcome::Reenter => missed = 1,
            }
        }
    }

    /// One pass: emits buffered values up to outstanding demand, then checks
    /// once for terminal-and-caught-up. Does *not* loop internally waiting
    /// for more buffered values to show up - `drain`'s `wip` loop is what
    /// re-enters this when a concurrent `on_next`/`request` adds more work,
    /// exactly as in the other drain-style operators in this crate.
    fn run_pass(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }

        let r = self.requested.get();
        let mut e = 0u64;
        while e != r {
            if self.cancelled.load(Ordering::Acquire) {
                return;
            }
            let value = {
                let buffer = self.processor.buffer.lock().unwrap();
                // A cursor that fell behind the buffer's eviction floor
                // (the subscriber deferred its first `request` past
                // intervening `on_next` evictions) is simply placed at the
                // current head, per spec's "placed at the current head"
                // bounded-replay rule.
                let index = self.next_index.load(Ordering::Relaxed).max(buffer.floor());
                match buffer.get(index) {
                    Some(value) => {
                        self.next_index.store(index + 1, Ordering::Relaxed);
                        Some(value)
                    }
                    None => None,
                }
            };
            let Some(value) = value else {
                break;
            };
            self.subscriber.on_next(value);
            e += 1;
        }

        let (done, nothing_more) = {
            let buffer = self.processor.buffer.lock().unwrap();
            let index = self.next_index.load(Ordering::Relaxed).max(buffer.floor());
            (buffer.done, index >= buffer.total_len())
        };
        if done && nothing_more {
            self.deliver_terminal();
            return;
        }

        if e != 0 {
            self.requested.sub(e);
        }
    }

    fn deliver_terminal(&self) {
        let cause = self.processor.buffer.lock().unwrap().error.clone();
        match cause {
            Some(cause) => self.subscriber.on_error(cause),
            None => self.subscriber.on_complete(),
        }
    }
}

impl<T> Subscription for ReplaySubscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        if let Err(cause) = validate_request(n) {
            self.subscriber.on_error(cause);
            return;
        }
        self.requested.add(n);
        self.drain();
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.processor.remove(self.id);
    }
}

impl<T> QueueSubscription<T> for ReplaySubscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Offers Async fusion only: the processor is hot - a subscriber can
    /// never know the sequence is "known-terminating" the way a Sync source
    /// can. Fused draining pulls through this very `poll`, with
    /// [`is_done`](Self::is_done) exposed separately for the terminal check
    /// - see DESIGN.md for why that's an inherent method rather than part
    /// of the general `QueueSubscription` contract.
    fn request_fusion(&self, requested: FusionRequest) -> FusionMode {
        if requested.async_ {
            FusionMode::Async
        } else {
            FusionMode::None
        }
    }

    fn poll(&self) -> Option<T> {
        let buffer = self.processor.buffer.lock().unwrap();
        let index = self.next_index.load(Ordering::Relaxed).max(buffer.floor());
        let value = buffer.get(index);
        if value.is_some() {
            self.next_index.store(index + 1, Ordering::Relaxed);
        }
        value
    }

    fn is_empty(&self) -> bool {
        let buffer = self.processor.buffer.lock().unwrap();
        let index = self.next_index.load(Ordering::Relaxed).max(buffer.floor());
        index >= buffer.total_len()
    }

    fn clear(&self) {
        self.cancel();
    }
}

impl<T> ReplaySubscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Whether the processor has gone terminal and this subscriber has
    /// drained everything buffered before it - the fused-face counterpart
    /// to the non-fused drain's terminal check.
    pub fn is_done(&self) -> bool {
        let buffer = self.processor.buffer.lock().unwrap();
        let index = self.next_index.load(Ordering::Relaxed).max(buffer.floor());
        buffer.done && index >= buffer.total_len()
    }
}
