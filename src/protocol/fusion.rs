use std::sync::Arc;

use crate::protocol::subscription::Subscription;

/// Fusion negotiation modes.
///
/// `Sync` fusion means the queue is known-terminating: draining it to empty
/// is equivalent to completion, and no `done` flag is needed. `Async`
/// fusion means completion is signalled separately through the normal
/// `on_complete`/`on_error` path while the queue is drained opportunistically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionMode {
    None,
    Sync,
    Async,
}

/// A bitmask of the fusion modes a caller is willing to accept, passed to
/// [`QueueSubscription::request_fusion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusionRequest {
    pub sync: bool,
    pub async_: bool,
}

impl FusionRequest {
    pub const ANY: Self = Self {
        sync: true,
        async_: true,
    };
    pub const SYNC_ONLY: Self = Self {
        sync: true,
        async_: false,
    };

    #[inline]
    pub fn accepts(&self, mode: FusionMode) -> bool {
        match mode {
            FusionMode::None => true,
            FusionMode::Sync => self.sync,
            FusionMode::Async => self.async_,
        }
    }
}

/// A [`Subscription`] that additionally exposes a pull-queue face.
///
/// This is the negotiated "fast path" that lets two adjacent operators
/// bypass a per-item callback and drain each other's queue directly.
/// `poll` returns `None` for "nothing available right now", which in
/// `Async` mode is not the same as completion - callers must consult the
/// separate `done`/terminal signal for that.
pub trait QueueSubscription<T>: Subscription {
    /// Negotiates a fusion mode. Returns `FusionMode::None` if this
    /// subscription does not support fusion or none of the requested modes
    /// are offered.
    fn request_fusion(&self, requested: FusionRequest) -> FusionMode;

    /// Pulls one value, if any is ready. Must not block.
    fn poll(&self) -> Option<T>;

    fn is_empty(&self) -> bool;

    /// Drops any buffered values without delivering them (used on cancel).
    fn clear(&self);
}

impl<T, S: QueueSubscription<T> + ?Sized> QueueSubscription<T> for Arc<S> {
    fn request_fusion(&self, requested: FusionRequest) -> FusionMode {
        (**self).request_fusion(requested)
    }

    fn poll(&self) -> Option<T> {
        (**self).poll()
    }

    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }

    fn clear(&self) {
        (**self).clear()
    }
}

/// What an upstream hands downstream at `on_subscribe` time: either a plain [`Subscription`], or one that
/// additionally offers the fused pull-queue face. The receiving operator
/// inspects [`as_queue`](Self::as_queue) and calls `request_fusion` if it
/// wants the fast path; otherwise it only ever uses `request`/`cancel`.
///
/// This exists because negotiating fusion from an arbitrary
/// `Box<dyn Subscription>` would require a downcast that trait objects
/// don't support without `Any`; carrying the capability in the handle type
/// itself is the idiomatic alternative.
pub enum SubscriptionHandle<T> {
    Plain(Box<dyn Subscription>),
    Queue(Box<dyn QueueSubscription<T>>),
}

impl<T> SubscriptionHandle<T> {
    pub fn request(&self, n: u64) {
        match self {
            SubscriptionHandle::Plain(s) => s.request(n),
            SubscriptionHandle::Queue(s) => s.request(n),
        }
    }

    pub fn cancel(&self) {
        match self {
            SubscriptionHandle::Plain(s) => s.cancel(),
            SubscriptionHandle::Queue(s) => s.cancel(),
        }
    }

    pub fn as_queue(&self) -> Option<&dyn QueueSubscription<T>> {
        match self {
            SubscriptionHandle::Queue(s) => Some(s.as_ref()),
            SubscriptionHandle::Plain(_) => None,
        }
    }

    /// Consumes the handle, splitting it into the fused queue face or
    /// handing the plain subscription back unchanged.
    pub fn into_queue(self) -> Result<Box<dyn QueueSubscription<T>>, Box<dyn Subscription>> {
        match self {
            SubscriptionHandle::Queue(s) => Ok(s),
            SubscriptionHandle::Plain(s) => Err(s),
        }
    }
}
