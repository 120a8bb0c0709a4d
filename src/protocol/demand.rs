use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Demand is a saturating 64-bit counter: the number of items downstream has
/// asked for but not yet received.
///
/// `u64::MAX` is the sentinel for "unbounded" (spec: `request(Long.MAX_VALUE)`
/// in the source protocol). Once a counter reaches `u64::MAX` it can never be
/// distinguished from "unbounded minus a few", so every producer-side
/// decrement first checks for the sentinel and leaves it untouched.
pub const UNBOUNDED: u64 = u64::MAX;

/// A saturating demand counter shared between a [`Subscription`](crate::protocol::subscription::Subscription)
/// and its producer.
#[derive(Debug, Default)]
pub struct Demand(CachePadded<AtomicU64>);

impl Demand {
    pub fn new() -> Self {
        Self(CachePadded::new(AtomicU64::new(0)))
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.get() == UNBOUNDED
    }

    /// Adds `n` with saturating semantics, capped at [`UNBOUNDED`].
    ///
    /// Returns the value *before* this add, which callers use to implement
    /// the "if I was zero, I own the drain" idiom.
    #[inline]
    pub fn add(&self, n: u64) -> u64 {
        loop {
            let prev = self.0.load(Ordering::Acquire);
            if prev == UNBOUNDED {
                return prev;
            }
            let next = prev.saturating_add(n).min(UNBOUNDED);
            if self
                .0
                .compare_exchange(prev, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return prev;
            }
        }
    }

    /// Subtracts `n` (the number of items just emitted) unless demand is
    /// unbounded, in which case it is left untouched. Never goes negative:
    /// callers never emit more than they observed as outstanding demand, so
    /// `n` is always `<= get()` at the call site under the single-drain-owner
    /// invariant.
    #[inline]
    pub fn sub(&self, n: u64) {
        if n == 0 {
            return;
        }
        let prev = self.0.load(Ordering::Acquire);
        if prev == UNBOUNDED {
            return;
        }
        self.0.fetch_sub(n, Ordering::AcqRel);
    }

    /// Directly sets the counter. Used by a drain loop writing back the
    /// `produced` count it tracked locally.
    #[inline]
    pub fn set(&self, n: u64) {
        self.0.store(n, Ordering::Release);
    }

    /// Atomically subtracts `n` and returns the value *after* the subtraction,
    /// left untouched (and sentinel returned) if unbounded.
    ///
    /// This is the one primitive that lets a drain loop safely decide "is
    /// there still demand I haven't consumed" without racing a concurrent
    /// [`add`](Self::add): the subtract and the re-read are the same atomic
    /// op, so if the result is zero, no interleaved `add` call could have
    /// been lost - a later `add` that observes `prev == 0` is guaranteed to
    /// be the first one after this drain pass truly ran dry.
    #[inline]
    pub fn sub_and_get(&self, n: u64) -> u64 {
        if n == 0 {
            return self.get();
        }
        loop {
            let prev = self.0.load(Ordering::Acquire);
            if prev == UNBOUNDED {
                return UNBOUNDED;
            }
            let next = prev.saturating_sub(n);
            if self
                .0
                .compare_exchange(prev, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturates_at_unbounded() {
        let d = Demand::new();
        d.add(UNBOUNDED - 1);
        let prev = d.add(10);
        assert_eq!(prev, UNBOUNDED - 1);
        assert_eq!(d.get(), UNBOUNDED);
    }

    #[test]
    fn unbounded_is_sticky() {
        let d = Demand::new();
        d.add(UNBOUNDED);
        d.add(5);
        assert_eq!(d.get(), UNBOUNDED);
        d.sub(3);
        assert_eq!(d.get(), UNBOUNDED);
    }

    #[test]
    fn add_returns_pre_addition_value() {
        let d = Demand::new();
        assert_eq!(d.add(3), 0);
        assert_eq!(d.add(2), 3);
        assert_eq!(d.get(), 5);
    }

    #[test]
    fn sub_decrements() {
        let d = Demand::new();
        d.add(10);
        d.sub(4);
        assert_eq!(d.get(), 6);
    }

    #[test]
    fn sub_and_get_returns_post_subtraction_value() {
        let d = Demand::new();
        d.add(5);
        assert_eq!(d.sub_and_get(5), 0);
        d.add(3);
        assert_eq!(d.sub_and_get(1), 2);
    }

    #[test]
    fn sub_and_get_is_noop_when_unbounded() {
        let d = Demand::new();
        d.add(UNBOUNDED);
        assert_eq!(d.sub_and_get(100), UNBOUNDED);
    }
}
