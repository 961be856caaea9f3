//! Throughput Benchmark for TideKV
//!
//! Measures command execution through `Keyspace::execute` under various
//! workloads, with and without the append-only log.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tidekv::config::{Config, FsyncPolicy};
use tidekv::persistence::Persister;
use tidekv::storage::Keyspace;

fn cmd(parts: &[&[u8]]) -> Vec<Bytes> {
    parts.iter().map(|p| Bytes::copy_from_slice(p)).collect()
}

fn keyspace() -> Keyspace {
    Keyspace::new(&Config::default())
}

/// Benchmark SET through the command table
fn bench_set(c: &mut Criterion) {
    let ks = keyspace();

    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i);
            ks.execute(0, &cmd(&[b"SET", key.as_bytes(), b"small_value"])).unwrap();
            i += 1;
        });
    });

    group.bench_function("set_medium", |b| {
        let mut i = 0u64;
        let value = "x".repeat(1024);
        b.iter(|| {
            let key = format!("key:{}", i);
            ks.execute(0, &cmd(&[b"SET", key.as_bytes(), value.as_bytes()])).unwrap();
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark GET operations
fn bench_get(c: &mut Criterion) {
    let ks = keyspace();
    for i in 0..100_000 {
        let key = format!("key:{}", i);
        let value = format!("value:{}", i);
        ks.execute(0, &cmd(&[b"SET", key.as_bytes(), value.as_bytes()])).unwrap();
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            black_box(ks.execute(0, &cmd(&[b"GET", key.as_bytes()])).unwrap());
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("missing:{}", i);
            black_box(ks.execute(0, &cmd(&[b"GET", key.as_bytes()])).unwrap());
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark SET with the append-only log attached
fn bench_logged_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("logged_set");
    group.throughput(Throughput::Elements(1));

    for policy in [FsyncPolicy::No, FsyncPolicy::EverySec] {
        let dir = TempDir::new().unwrap();
        let config = Config {
            dir: dir.path().to_path_buf(),
            appendonly: true,
            appendfsync: policy,
            ..Config::default()
        };
        let ks = Keyspace::new(&config);
        let persister = Persister::open(&config).unwrap();
        ks.attach_persister(Arc::clone(&persister));

        group.bench_function(policy.as_str(), |b| {
            let mut i = 0u64;
            b.iter(|| {
                let key = format!("key:{}", i % 10_000);
                ks.execute(0, &cmd(&[b"SET", key.as_bytes(), b"value"])).unwrap();
                i += 1;
            });
        });

        persister.close();
    }

    group.finish();
}

/// Benchmark concurrent access from several threads
fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_mixed", |b| {
        b.iter(|| {
            let ks = Arc::new(keyspace());
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let ks = Arc::clone(&ks);
                    thread::spawn(move || {
                        for i in 0..10_000 {
                            let key = format!("key:{}:{}", t, i);
                            ks.execute(0, &cmd(&[b"SET", key.as_bytes(), b"value"])).unwrap();
                            ks.execute(0, &cmd(&[b"GET", key.as_bytes()])).unwrap();
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(ks.key_count());
        });
    });

    group.finish();
}

/// Benchmark deadline scheduling
fn bench_expiry(c: &mut Criterion) {
    let ks = keyspace();
    for i in 0..10_000 {
        let key = format!("expire:{}", i);
        ks.execute(0, &cmd(&[b"SET", key.as_bytes(), b"value"])).unwrap();
    }

    let mut group = c.benchmark_group("expiry");
    group.throughput(Throughput::Elements(1));

    group.bench_function("expire_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("expire:{}", i % 10_000);
            ks.execute(0, &cmd(&[b"EXPIRE", key.as_bytes(), b"3600"])).unwrap();
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark collection writes
fn bench_collections(c: &mut Criterion) {
    let ks = keyspace();

    let mut group = c.benchmark_group("collections");
    group.throughput(Throughput::Elements(1));

    group.bench_function("rpush", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("list:{}", i % 100);
            ks.execute(0, &cmd(&[b"RPUSH", key.as_bytes(), b"item"])).unwrap();
            i += 1;
        });
    });

    group.bench_function("zadd", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let member = format!("m:{}", i % 10_000);
            let score = (i % 1000).to_string();
            ks.execute(0, &cmd(&[b"ZADD", b"board", score.as_bytes(), member.as_bytes()]))
                .unwrap();
            i += 1;
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_set,
    bench_get,
    bench_logged_set,
    bench_concurrent,
    bench_expiry,
    bench_collections,
);

criterion_main!(benches);
