use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use evloop::{EventLoop, LoopConfig, RunMode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn bench_loop(threads: usize) -> EventLoop {
    EventLoop::with_config(&LoopConfig::default().with_threadpool_size(threads)).unwrap()
}

fn bench_work_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("work_round_trip");

    for batch in [1u64, 64, 1024] {
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::new("queue_work_then", batch), &batch, |b, &batch| {
            let mut lp = bench_loop(4);
            let total = Arc::new(AtomicU64::new(0));
            b.iter(|| {
                for n in 0..batch {
                    let t = total.clone();
                    lp.queue_work_then(
                        move || black_box(n) * 2,
                        move |value| {
                            t.fetch_add(value, Ordering::Relaxed);
                        },
                    );
                }
                lp.run(RunMode::Default);
            });
            lp.close().unwrap();
        });
    }

    group.finish();
}

fn bench_async_send(c: &mut Criterion) {
    let mut group = c.benchmark_group("async_send");

    for batch in [1u64, 64, 1024] {
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::new("notifier", batch), &batch, |b, &batch| {
            let mut lp = bench_loop(1);
            let notifier = lp.notifier();
            let hits = Arc::new(AtomicU64::new(0));
            b.iter(|| {
                for _ in 0..batch {
                    let h = hits.clone();
                    notifier
                        .send(move || {
                            h.fetch_add(1, Ordering::Relaxed);
                        })
                        .unwrap();
                }
                lp.run(RunMode::Default);
            });
            lp.close().unwrap();
        });
    }

    group.finish();
}

fn bench_zero_timeout(c: &mut Criterion) {
    c.bench_function("set_timeout_zero", |b| {
        let mut lp = bench_loop(1);
        let hits = Arc::new(AtomicU64::new(0));
        b.iter(|| {
            let h = hits.clone();
            lp.set_timeout(0, move || {
                h.fetch_add(1, Ordering::Relaxed);
            });
            lp.run(RunMode::Default);
        });
        lp.close().unwrap();
    });
}

criterion_group!(benches, bench_work_round_trip, bench_async_send, bench_zero_timeout);
criterion_main!(benches);
