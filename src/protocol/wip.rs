use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// The `wip` ("work in progress") re-entrancy idiom shared by every
/// drain-style component.
///
/// A caller that wants to run a drain loop performs `enter()`. If it gets
/// back `Entered`, it owns the loop for as long as `exit(missed)` keeps
/// returning `Reenter` - another thread incremented `wip` while it was
/// draining, so it must loop again using the value it just wrote back as
/// the new "missed" baseline. `Exit` means the loop is done: no other
/// caller showed up while this one was running.
///
/// This gives strict serialization of emissions without a blocking lock:
/// at most one thread is ever inside the drain loop's body at a time, and
/// every other thread that calls `enter()` while draining is in progress
/// just bumps the counter and returns, trusting the current owner to
/// observe it.
#[derive(Debug, Default)]
pub struct DrainLock(CachePadded<AtomicU64>);

#[derive(Debug, PartialEq, Eq)]
pub enum Entry {
    /// The caller is the sole owner of the drain loop.
    Entered,
    /// Another caller already owns the drain loop; it will observe this
    /// caller's increment and loop again. Nothing to do here.
    AlreadyRunning,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ExitOutcome {
    /// No further work arrived while draining; the loop may stop.
    Done,
    /// Further work arrived while draining (observable: the counter did not
    /// settle at zero); the owner must loop again.
    Reenter,
}

impl DrainLock {
    pub fn new() -> Self {
        Self(CachePadded::new(AtomicU64::new(0)))
    }

    /// `prev = wip.getAndIncrement()`; `prev == 0` means this caller owns
    /// the loop.
    #[inline]
    pub fn enter(&self) -> Entry {
        let prev = self.0.fetch_add(1, Ordering::SeqCst);
        if prev == 0 {
            Entry::Entered
        } else {
            Entry::AlreadyRunning
        }
    }

    /// `wip.addAndGet(-missed)`; if the result is zero the owner stops,
    /// otherwise it must restart its pass. `missed` is the value the owner
    /// loaded at the start of the pass it is now concluding (normally `1`
    /// the first time through, more if re-entrant increments landed while it
    /// was working).
    #[inline]
    pub fn exit(&self, missed: u64) -> ExitOutcome {
        if self.0.fetch_sub(missed, Ordering::SeqCst) == missed {
            ExitOutcome::Done
        } else {
            ExitOutcome::Reenter
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_entrant_owns_and_exits() {
        let lock = DrainLock::new();
        assert_eq!(lock.enter(), Entry::Entered);
        assert_eq!(lock.exit(1), ExitOutcome::Done);
    }

    #[test]
    fn reentrant_increment_forces_another_pass() {
        let lock = DrainLock::new();
        assert_eq!(lock.enter(), Entry::Entered);
        // Someone else shows up mid-drain.
        assert_eq!(lock.enter(), Entry::AlreadyRunning);
        // Owner's first pass concludes; it must loop again.
        assert_eq!(lock.exit(1), ExitOutcome::Reenter);
        // Second pass concludes with nothing new arriving.
        assert_eq!(lock.exit(1), ExitOutcome::Done);
    }
}
