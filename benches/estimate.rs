#![forbid(unsafe_code)]

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spillway::{SizeEstimator, SizeTracker, TrackerOptions};

const LENGTHS: [usize; 4] = [100, 400, 10_000, 1_000_000];

fn strings(len: usize) -> Vec<String> {
    (0..len).map(|i| format!("element-{i}")).collect()
}

fn estimate_sequences(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimate/sequence");
    group.sample_size(20);
    let estimator = SizeEstimator::default();
    for len in LENGTHS {
        let values = strings(len);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("strings", len), &values, |b, values| {
            b.iter(|| estimator.estimate(black_box(values)).expect("estimate"));
        });
    }
    group.finish();
}

fn tracker_appends(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimate/tracker");
    group.sample_size(10);
    let estimator = Arc::new(SizeEstimator::default());
    for len in [1_000usize, 100_000] {
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("append", len), &len, |b, &len| {
            b.iter(|| {
                let mut tracker =
                    SizeTracker::new(Arc::clone(&estimator), &TrackerOptions::default())
                        .expect("tracker");
                for i in 0..len {
                    tracker.append(format!("element-{i}")).expect("append");
                }
                tracker.estimate_size()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, estimate_sequences, tracker_appends);
criterion_main!(benches);
