use crate::error::FlowError;
use crate::protocol::fusion::SubscriptionHandle;

/// A consumer of four signals, always in this order: exactly one
/// [`subscribe`](Subscriber::on_subscribe), then zero or more
/// [`next`](Subscriber::on_next) strictly bounded by outstanding demand, then
/// at most one terminal.
///
/// Implementors must not perform blocking I/O from these callbacks; the core
/// never blocks, and the contract above only holds if subscribers don't
/// either.
pub trait Subscriber<T> {
    /// Delivered exactly once, before any `on_next`. The handle may or may
    /// not offer the fused queue face - see
    /// [`SubscriptionHandle::as_queue`].
    fn on_subscribe(&self, subscription: SubscriptionHandle<T>);

    /// Delivered zero or more times, never after a terminal, never more
    /// often than outstanding demand allows.
    fn on_next(&self, value: T);

    /// At most one of `on_error`/`on_complete` is delivered, and never both.
    fn on_error(&self, cause: FlowError);

    /// See `on_error`.
    fn on_complete(&self);
}

/// A [`Subscriber`] that can additionally accept-or-reject an item without
/// it counting against demand.
///
/// `try_on_next` returning `false` means "not consumed, do not decrement
/// demand for this item" - the caller (typically an operator's drain loop)
/// is expected to poll the next item and try again rather than treat this as
/// an error.
pub trait ConditionalSubscriber<T>: Subscriber<T> {
    /// Returns `true` if the value was consumed.
    fn try_on_next(&self, value: T) -> bool;
}
