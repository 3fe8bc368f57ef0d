use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use cachet_engine::{
    CacheKey, CachePort, ChannelNotifier, EngineConfig, Freshness, InMemoryCache, Job,
    ProgressObserver, RequestEngine, StaticNetwork,
};

type BenchEngine = RequestEngine<Arc<InMemoryCache>, Arc<ChannelNotifier>>;

fn engine(workers: usize) -> BenchEngine {
    RequestEngine::new(
        EngineConfig::default()
            .with_worker_threads(workers)
            .with_thread_name("cachet-bench"),
        InMemoryCache::arc(),
        ChannelNotifier::arc(),
        Arc::new(StaticNetwork::online()),
    )
    .expect("engine")
}

/// Submit `count` jobs and wait for all terminal notifications.
fn run_batch(engine: &BenchEngine, count: usize, cached: bool) {
    let sub = engine.notifier().subscribe();
    for n in 0..count {
        let job = Job::new(move |_: &ProgressObserver| Ok(n as u64));
        let job = if cached {
            job.with_cache_key(CacheKey::new(format!("k{}", n % 64)).expect("key"))
                .with_freshness(Freshness::AlwaysValid)
        } else {
            job
        };
        engine.submit(Arc::new(job));
    }

    let mut remaining = count;
    while remaining > 0 {
        match sub.recv_timeout(Duration::from_secs(10)) {
            Ok(n) if n.event.is_terminal() => remaining -= 1,
            Ok(_) => {}
            Err(_) => panic!("batch did not complete"),
        }
    }
}

fn bench_cache_hit_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_cache_hit");

    for workers in [1usize, 4] {
        let engine = engine(workers);
        for n in 0..64u64 {
            let key = CacheKey::new(format!("k{n}")).expect("key");
            engine.cache().save(&n, &key).expect("warm cache");
        }

        group.throughput(Throughput::Elements(256));
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            b.iter(|| run_batch(black_box(&engine), 256, true));
        });
        engine.stop();
    }

    group.finish();
}

fn bench_fetch_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_fetch");

    for workers in [1usize, 4] {
        let engine = engine(workers);
        group.throughput(Throughput::Elements(256));
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            b.iter(|| run_batch(black_box(&engine), 256, false));
        });
        engine.stop();
    }

    group.finish();
}

criterion_group!(benches, bench_cache_hit_path, bench_fetch_path);
criterion_main!(benches);
