// SPDX-License-Identifier: MIT
//
// Broker dispatch and pool allocate/free benchmarks.
//
// Run with:
//   cargo bench --bench dispatch
//
// Groups:
//   pool_alloc_free  — FixedPool<BLOCK> allocate immediately followed by free
//   broker_dispatch  — publish + process through a Callback subscriber
//                      fanned out over a growing subscriber count

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use pub_sub::{Broker, Deadline, FixedPool, Pool, Subscriber};

fn bench_pool_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_alloc_free");
    let pool: FixedPool<64> = FixedPool::new(256);

    group.bench_function("alloc_then_free", |b| {
        b.iter(|| {
            let block = pool.allocate(Deadline::NoWait).expect("pool exhausted");
            black_box(&block);
            pool.free(block);
        });
    });
    group.finish();
}

fn bench_broker_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("broker_dispatch");

    for subscriber_count in [1usize, 4, 16] {
        group.bench_with_input(
            BenchmarkId::from_parameter(subscriber_count),
            &subscriber_count,
            |b, &count| {
                let broker: Arc<Broker<1>> = Broker::new();
                let pool: Arc<dyn Pool> = Arc::new(FixedPool::<32>::new(count + 1));
                let alloc_id = broker.registry().register(pool).unwrap();

                let subs: Vec<_> = (0..count)
                    .map(|_| {
                        let sub = Subscriber::callback(10);
                        sub.subscribe(3);
                        sub.set_handler(Box::new(|_, _| {}));
                        broker.attach(&sub);
                        sub
                    })
                    .collect();
                black_box(&subs);

                b.iter(|| {
                    let handle = broker.new_msg(alloc_id, 3, 0u32, Deadline::NoWait).unwrap();
                    broker.publish(handle.into());
                    broker.process();
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_pool_alloc_free, bench_broker_dispatch);
criterion_main!(benches);
