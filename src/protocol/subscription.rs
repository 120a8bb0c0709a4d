use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::FlowError;
use crate::protocol::demand::Demand;

/// The handle a producer hands to its consumer.
///
/// `cancel` is idempotent and observable from any thread:
/// implementations must make the first call the only one that has effect.
pub trait Subscription: Send + Sync {
    /// `n <= 0` is a protocol violation and must not be
    /// forwarded to this method - callers validate with
    /// [`validate_request`] first and signal `on_error` themselves.
    fn request(&self, n: u64);

    fn cancel(&self);
}

/// Every operator in this crate hands its subscriber a shared `Arc` to its
/// own subscription state (so the operator can keep its own handle while
/// downstream holds one too); this blanket impl lets that `Arc` be passed
/// anywhere a `Box<dyn Subscription>` is expected without each operator
/// re-wrapping it.
impl<S: Subscription + ?Sized> Subscription for Arc<S> {
    fn request(&self, n: u64) {
        (**self).request(n)
    }

    fn cancel(&self) {
        (**self).cancel()
    }
}

/// `request(n)` with `n == 0` is a protocol violation:
/// the operator must signal `error(IllegalArgumentException)`-equivalent and
/// must not count the call towards demand.
#[inline]
pub fn validate_request(n: u64) -> Result<(), FlowError> {
    if n == 0 {
        Err(FlowError::IllegalRequest)
    } else {
        Ok(())
    }
}

/// The demand-counter-plus-cancellation-flag pair every concrete
/// subscription in this crate is built from. Not itself a [`Subscription`]
/// impl (concrete subscriptions wrap this and add their own `request`
/// forwarding, e.g. translating outer demand into upstream demand for
/// window), but it is the one piece worth sharing rather than
/// re-implementing per operator.
#[derive(Debug, Default)]
pub struct DemandState {
    pub demand: Demand,
    cancelled: CachePadded<AtomicBool>,
}

impl DemandState {
    pub fn new() -> Self {
        Self {
            demand: Demand::new(),
            cancelled: CachePadded::new(AtomicBool::new(false)),
        }
    }

    /// Idempotent: returns `true` only the first time this call observes
    /// the flag transition from unset to set, so callers can run
    /// cancellation side effects exactly once.
    #[inline]
    pub fn cancel(&self) -> bool {
        self.cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_zero_is_a_violation() {
        assert!(matches!(
            validate_request(0),
            Err(FlowError::IllegalRequest)
        ));
        assert!(validate_request(1).is_ok());
    }

    #[test]
    fn cancel_is_idempotent() {
        let s = DemandState::new();
        assert!(!s.is_cancelled());
        assert!(s.cancel());
        assert!(s.is_cancelled());
        assert!(!s.cancel());
        assert!(s.is_cancelled());
    }
}
