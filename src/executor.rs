//! The external scheduler abstraction thread-pool implementations are
//! assumed to provide, used by [`observe_on`](crate::observe_on) to run its
//! drain loop.
//!
//! A [`Scheduler`] is a single-slot task acceptor: the operator may call
//! `schedule` any number of times over its lifetime, each call scheduling
//! one more run of the drain loop "somewhere, later". A
//! [`SchedulerFactory`] hands out one `Scheduler` per subscription; the
//! operator uses it once (for the lifetime of that subscription) and drops
//! it on termination, releasing whatever resources the factory's
//! implementation holds.

use std::sync::Arc;

/// A unit of work the scheduler runs on its own time. Never blocks on I/O -
/// the core itself never blocks on I/O.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync {
    /// Schedules `task` to run "somewhere, later." May be called any number
    /// of times; each call is an independent scheduling request.
    fn schedule(&self, task: Task);
}

pub trait SchedulerFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Scheduler>;
}

/// Runs every task synchronously on the calling thread, the instant it is
/// scheduled. No re-entrancy protection of its own - callers relying on the
/// `wip` drain lock to serialize get that protection from the
/// lock, not from this scheduler.
#[derive(Debug, Default, Clone, Copy)]
pub struct Immediate;

impl Scheduler for Immediate {
    fn schedule(&self, task: Task) {
        task();
    }
}

impl SchedulerFactory for Immediate {
    fn create(&self) -> Arc<dyn Scheduler> {
        Arc::new(Immediate)
    }
}

#[cfg(feature = "tokio-executor")]
pub mod tokio_executor {
    use super::*;
    use tokio::runtime::Handle;

    /// Spawns every scheduled task onto a `tokio::runtime::Handle`.
    #[derive(Clone)]
    pub struct TokioScheduler {
        handle: Handle,
    }

    impl TokioScheduler {
        pub fn new(handle: Handle) -> Self {
            Self { handle }
        }
    }

    impl Scheduler for TokioScheduler {
        fn schedule(&self, task: Task) {
            self.handle.spawn_blocking(task);
        }
    }

    #[derive(Clone)]
    pub struct TokioExecutor {
        handle: Handle,
    }

    impl TokioExecutor {
        pub fn new(handle: Handle) -> Self {
            Self { handle }
        }

        pub fn current() -> Self {
            Self {
                handle: Handle::current(),
            }
        }
    }

    impl SchedulerFactory for TokioExecutor {
        fn create(&self) -> Arc<dyn Scheduler> {
            Arc::new(TokioScheduler::new(self.handle.clone()))
        }
    }
}

#[cfg(feature = "tokio-executor")]
pub use tokio_executor::{TokioExecutor, TokioScheduler};
