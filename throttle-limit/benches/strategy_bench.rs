use std::sync::Arc;
use std::sync::Barrier;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;

use throttle_limit::ConcurrencyOptions;
use throttle_limit::Limiter;
use throttle_limit::MemoryStore;
use throttle_limit::Strategy;
use throttle_limit::ThresholdOptions;
use throttle_limit::ThrottleOptions;

// A check followed by a release, as one fetched and finished job would do
fn admit_and_finish(strategy: &Strategy, jid: &str) {
    if black_box(strategy.check(jid, &[])).is_ok() {
        let _ = strategy.finalize(jid, &[]);
    }
}

fn bench_single_strategy(group_name: &str, c: &mut Criterion, strategy: Arc<Strategy>) {
    let mut group = c.benchmark_group(group_name);

    group.bench_function("single-threaded", |b| {
        b.iter(|| admit_and_finish(black_box(strategy.as_ref()), "jid"))
    });

    group.finish();
}

fn bench_parallel_strategy(group_name: &str, c: &mut Criterion, strategy: Arc<Strategy>) {
    let mut group = c.benchmark_group(group_name);

    for threads in [2, 4, 8].iter() {
        let num_threads = *threads;
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}-threads", num_threads)),
            &num_threads,
            |b, &n| {
                b.iter_custom(|iters| {
                    let barrier = Arc::new(Barrier::new(n + 1));
                    let mut handles = Vec::with_capacity(n);

                    for t in 0..n {
                        let s = Arc::clone(&strategy);
                        let bar = Arc::clone(&barrier);
                        let iters_per_thread = iters / n as u64;
                        let jid = format!("jid-{t}");

                        handles.push(thread::spawn(move || {
                            bar.wait(); // Wait for the start signal
                            for _ in 0..iters_per_thread {
                                admit_and_finish(&s, &jid);
                            }
                        }));
                    }

                    // Synchronize the start across all threads
                    barrier.wait();
                    let start = Instant::now();

                    for handle in handles {
                        let _ = handle.join();
                    }

                    start.elapsed()
                });
            },
        );
    }
    group.finish();
}

fn run_all_benches(c: &mut Criterion) {
    let limit = 1_000_000;
    let period = Duration::from_secs(60);
    let store = Arc::new(MemoryStore::new());

    let concurrency = Arc::new(Strategy::new(
        "Concurrency",
        &ThrottleOptions::new().with_concurrency(ConcurrencyOptions::new(limit)),
        store.clone(),
    ));
    let threshold = Arc::new(Strategy::new(
        "Threshold",
        &ThrottleOptions::new().with_threshold(ThresholdOptions::new(limit, period)),
        store.clone(),
    ));
    let all = Arc::new(Strategy::new(
        "All",
        &ThrottleOptions::new()
            .with_concurrency(ConcurrencyOptions::new(limit))
            .with_threshold(ThresholdOptions::new(limit, period)),
        store,
    ));

    bench_single_strategy("Concurrency", c, Arc::clone(&concurrency));
    bench_parallel_strategy("Concurrency", c, concurrency);

    bench_single_strategy("Threshold", c, Arc::clone(&threshold));
    bench_parallel_strategy("Threshold", c, threshold);

    bench_single_strategy("All", c, Arc::clone(&all));
    bench_parallel_strategy("All", c, all);
}

criterion_group!(benches, run_all_benches);
criterion_main!(benches);
