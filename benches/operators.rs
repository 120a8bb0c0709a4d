use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tributary::executor::Immediate;
use tributary::protocol::{Subscriber, SubscriptionHandle, UNBOUNDED};
use tributary::{FlowError, IterableSource, ObserveOn, ReplayProcessor, Window, WindowSource};

struct Counter(AtomicU64);

impl Counter {
    fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(0)))
    }
}

impl Subscriber<i64> for Arc<Counter> {
    fn on_subscribe(&self, subscription: SubscriptionHandle<i64>) {
        subscription.request(UNBOUNDED);
    }
    fn on_next(&self, _value: i64) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
    fn on_error(&self, _cause: FlowError) {}
    fn on_complete(&self) {}
}

fn bench_iterable(c: &mut Criterion) {
    c.bench_function("iterable/1e5 unbounded drain", |b| {
        b.iter(|| {
            let source = IterableSource::new(|| (0..100_000i64));
            let counter = Counter::new();
            source.subscribe(counter.clone());
            black_box(counter.0.load(Ordering::Relaxed));
        });
    });
}

fn bench_observe_on(c: &mut Criterion) {
    c.bench_function("observe_on/1e4 hand-off", |b| {
        b.iter(|| {
            let observe_on = ObserveOn::new(Arc::new(Immediate), 256, false);
            let counter = Counter::new();
            let inlet = observe_on.subscribe(counter.clone());

            struct NoopSub;
            impl tributary::protocol::Subscription for NoopSub {
                fn request(&self, _n: u64) {}
                fn cancel(&self) {}
            }
            Subscriber::on_subscribe(&*inlet, SubscriptionHandle::Plain(Box::new(NoopSub)));
            for v in 0..10_000i64 {
                Subscriber::on_next(&*inlet, v);
            }
            Subscriber::on_complete(&*inlet);
            black_box(counter.0.load(Ordering::Relaxed));
        });
    });
}

fn bench_replay(c: &mut Criterion) {
    c.bench_function("replay/1e3 values to 8 subscribers", |b| {
        b.iter(|| {
            let processor = ReplayProcessor::<i64>::unbounded();
            let counters: Vec<_> = (0..8)
                .map(|_| {
                    let counter = Counter::new();
                    processor.subscribe(counter.clone());
                    counter
                })
                .collect();
            for v in 0..1_000i64 {
                processor.on_next(v);
            }
            processor.on_complete();
            black_box(counters.iter().map(|c| c.0.load(Ordering::Relaxed)).sum::<u64>());
        });
    });
}

struct WindowCounter(Arc<Counter>);

impl Subscriber<Window<i64>> for WindowCounter {
    fn on_subscribe(&self, subscription: SubscriptionHandle<Window<i64>>) {
        subscription.request(UNBOUNDED);
    }
    fn on_next(&self, window: Window<i64>) {
        window.subscribe(self.0.clone());
    }
    fn on_error(&self, _cause: FlowError) {}
    fn on_complete(&self) {}
}

fn bench_window(c: &mut Criterion) {
    c.bench_function("window/1e4 values, size=100 skip=50", |b| {
        b.iter(|| {
            let source = WindowSource::<i64>::new(100, 50);
            let counter = Counter::new();
            let instance = source.subscribe(WindowCounter(counter.clone()));

            struct NoopSub;
            impl tributary::protocol::Subscription for NoopSub {
                fn request(&self, _n: u64) {}
                fn cancel(&self) {}
            }
            Subscriber::on_subscribe(&*instance, SubscriptionHandle::Plain(Box::new(NoopSub)));
            for v in 0..10_000i64 {
                Subscriber::on_next(&*instance, v);
            }
            Subscriber::on_complete(&*instance);
            black_box(counter.0.load(Ordering::Relaxed));
        });
    });
}

criterion_group!(
    benches,
    bench_iterable,
    bench_observe_on,
    bench_replay,
    bench_window
);
criterion_main!(benches);
