use std::error::Error as StdError;
use std::sync::Arc;

/// The unified error type delivered through [`Subscriber::on_error`](crate::protocol::Subscriber::on_error).
///
/// Covers the protocol-violation and user-callback-failure error kinds.
/// Fatal causes (out-of-memory, thread interruption) are deliberately not
/// represented here: they are re-raised to the runtime after best-effort
/// cleanup rather than delivered as a normal terminal signal, so they
/// surface as a resumed panic, not a `FlowError` (see DESIGN.md).
///
/// The wrapped cause is held behind an [`Arc`] rather than a `Box` so the
/// whole error is `Clone` - multicast points (`replay`) need to hand the
/// same terminal cause to several subscribers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlowError {
    /// `request(n)` was called with `n <= 0`.
    #[error("request(n) called with a non-positive n")]
    IllegalRequest,

    /// A null item was delivered from an iterator, a queue, or upstream.
    #[error("a null item was delivered on the non-fused path")]
    NullItem,

    /// A subscriber's upstream-facing slot already held a subscription when
    /// a second `on_subscribe` arrived. The new
    /// subscription is cancelled; the original is left untouched.
    #[error("a second subscription was offered to an already-subscribed consumer")]
    DoubleSubscription,

    /// `Q.offer` failed: the upstream source emitted more than `prefetch`
    /// items without being asked to.
    #[error("internal queue rejected a value: upstream outran its prefetch")]
    QueueFull,

    /// The user-supplied iterator, queue, or predicate raised an error.
    #[error("upstream callback failed: {0}")]
    UpstreamFailed(#[source] Arc<dyn StdError + Send + Sync>),
}

impl FlowError {
    /// Wraps an arbitrary user-callback failure.
    pub fn upstream<E>(cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        FlowError::UpstreamFailed(Arc::new(cause))
    }
}
