//! Bridges a [`Subscriber`]-driven source into a [`futures::Stream`] for
//! ergonomic downstream consumption by async code that would rather `.next()`
//! than implement `Subscriber` itself.
//!
//! [`SubscriberStream::new`] hands back a paired [`StreamSubscriber`] -
//! subscribe that to any source in this crate, then poll the stream. Demand
//! is requested in batches of [`REQUEST_BATCH`] and replenished once half of
//! a batch has been consumed, the same prefetch-and-replenish shape
//! `observe_on` uses, so a slow downstream `.next()` caller still applies
//! real backpressure upstream rather than requesting unbounded.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use futures::task::AtomicWaker;

use crate::error::FlowError;
use crate::protocol::fusion::SubscriptionHandle;
use crate::protocol::subscriber::Subscriber;

const REQUEST_BATCH: u64 = 256;

struct Inner<T> {
    buffer: Mutex<VecDeque<T>>,
    error: Mutex<Option<FlowError>>,
    done: AtomicBool,
    waker: AtomicWaker,
    subscription: Mutex<Option<SubscriptionHandle<T>>>,
}

/// The [`Subscriber`] half of the bridge: hand this to a source's
/// `subscribe` method.
pub struct StreamSubscriber<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Subscriber<T> for StreamSubscriber<T> {
    fn on_subscribe(&self, subscription: SubscriptionHandle<T>) {
        subscription.request(REQUEST_BATCH);
        *self.inner.subscription.lock().unwrap() = Some(subscription);
    }

    fn on_next(&self, value: T) {
        self.inner.buffer.lock().unwrap().push_back(value);
        self.inner.waker.wake();
    }

    fn on_error(&self, cause: FlowError) {
        *self.inner.error.lock().unwrap() = Some(cause);
        self.inner.done.store(true, Ordering::Release);
        self.inner.waker.wake();
    }

    fn on_complete(&self) {
        self.inner.done.store(true, Ordering::Release);
        self.inner.waker.wake();
    }
}

/// The [`Stream`] half of the bridge: yields `Ok(value)` per item, at most
/// one `Err(cause)` as its last item, or simply ends on a clean completion.
pub struct SubscriberStream<T> {
    inner: Arc<Inner<T>>,
    consumed_since_replenish: u64,
}

impl<T> SubscriberStream<T> {
    pub fn new() -> (Self, StreamSubscriber<T>) {
        let inner = Arc::new(Inner {
            buffer: Mutex::new(VecDeque::new()),
            error: Mutex::new(None),
            done: AtomicBool::new(false),
            waker: AtomicWaker::new(),
            subscription: Mutex::new(None),
        });
        (
            Self {
                inner: inner.clone(),
                consumed_since_replenish: 0,
            },
            StreamSubscriber { inner },
        )
    }

    fn replenish_if_due(&mut self) {
        self.consumed_since_replenish += 1;
        if self.consumed_since_replenish < REQUEST_BATCH - REQUEST_BATCH / 4 {
            return;
        }
        if let Some(subscription) = self.inner.subscription.lock().unwrap().as_ref() {
            subscription.request(self.consumed_since_replenish);
        }
        self.consumed_since_replenish = 0;
    }
}

impl<T: Unpin> Stream for SubscriberStream<T> {
    type Item = Result<T, FlowError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.inner.waker.register(cx.waker());

        if let Some(value) = this.inner.buffer.lock().unwrap().pop_front() {
            this.replenish_if_due();
            return Poll::Ready(Some(Ok(value)));
        }

        if this.inner.done.load(Ordering::Acquire) {
            return match this.inner.error.lock().unwrap().take() {
                Some(cause) => Poll::Ready(Some(Err(cause))),
                None => Poll::Ready(None),
            };
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterable::IterableSource;
    use futures::StreamExt;

    #[tokio::test]
    async fn yields_every_item_then_ends() {
        let (stream, subscriber) = SubscriberStream::new();
        let source = IterableSource::new(|| vec![1, 2, 3].into_iter());
        source.subscribe(subscriber);

        let items: Vec<_> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn surfaces_the_terminal_error_as_the_last_item() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        let (stream, subscriber) = SubscriberStream::new();
        let processor = crate::replay::ReplayProcessor::<i32>::unbounded();
        processor.subscribe(subscriber);
        processor.on_next(1);
        processor.on_error(FlowError::upstream(Boom));

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].as_ref().is_ok());
        assert!(items[1].as_ref().is_err());
    }
}
