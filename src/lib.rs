//! `tributary` is a demand-driven reactive-streams core: a small protocol
//! of `Subscriber`/`Subscription`/`QueueSubscription` roles,
//! plus four operators built on it.
//!
//! - [`iterable`] - a synchronous pull producer over a user [`Iterator`].
//! - [`observe_on`] - an asynchronous hand-off boundary between a producing
//!   and a consuming thread, with prefetch and fusion.
//! - [`replay`] - a multicast processor that buffers and replays history to
//!   every subscriber.
//! - [`window`] - an operator that splits one sequence into bounded,
//!   independently-consumable sub-sequences.
//!
//! [`protocol`] defines the shared contract; [`error`] is the unified
//! terminal-error type; [`executor`] and [`queue`] are the external
//! scheduler/queue abstractions `observe_on` is built against.

pub mod error;
pub mod executor;
pub mod iterable;
pub mod observe_on;
pub mod protocol;
pub mod queue;
pub mod replay;
mod ring;
#[cfg(feature = "async")]
pub mod stream;
pub mod window;

pub use error::FlowError;
pub use iterable::{IterableFactory, IterableSource};
pub use observe_on::ObserveOn;
pub use protocol::{
    ConditionalSubscriber, Demand, DropHook, FusionMode, FusionRequest, NoopHook,
    QueueSubscription, Subscriber, Subscription, SubscriptionHandle, UNBOUNDED,
};
pub use queue::{Queue, QueueFactory, SpscQueueFactory};
pub use replay::ReplayProcessor;
#[cfg(feature = "async")]
pub use stream::{StreamSubscriber, SubscriberStream};
pub use window::{Window, WindowSource};
