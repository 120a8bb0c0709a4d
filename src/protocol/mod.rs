//! The shared contract every operator in this crate obeys.
//!
//! - [`demand`] - the saturating 64-bit demand counter and the "unbounded"
//!   sentinel.
//! - [`wip`] - the `wip`-counter drain-loop re-entrancy idiom shared by
//!   every drain-style component.
//! - [`subscriber`] / [`subscription`] - the `Subscriber`/`Subscription`
//!   trait pair and the demand-plus-cancellation state every concrete
//!   subscription composes.
//! - [`fusion`] - the queue-subscription capability negotiation.
//! - [`hooks`] - optional diagnostics for post-terminal signals.
//!
//! Five rules bind every operator built on top of this module:
//! request validation, null prohibition, at-most-one subscription,
//! cancellation idempotence, and terminal finality. None of those rules are
//! enforced here mechanically - they are properties the concrete operators
//! (`iterable`, `observe_on`, `replay`, `window`) must uphold using the
//! primitives this module provides.

pub mod demand;
pub mod fusion;
pub mod hooks;
pub mod subscriber;
pub mod subscription;
pub mod wip;

pub use demand::{Demand, UNBOUNDED};
pub use fusion::{FusionMode, FusionRequest, QueueSubscription, SubscriptionHandle};
pub use hooks::{DropHook, NoopHook};
pub use subscriber::{ConditionalSubscriber, Subscriber};
pub use subscription::{DemandState, Subscription, validate_request};
pub use wip::{DrainLock, Entry, ExitOutcome};
