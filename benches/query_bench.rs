//! Benchmarks for local reads of collector stores

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dta_collector::store::{key_checksum, probe_sequence, KeyValueSlot, Slot};
use dta_collector::transport::RegionMetadata;
use dta_collector::{
    AddressableSlotStore, CircularAppendLog, Fabric, HashKeyValueStore, LoopbackFabric, RemotePeer,
    StoreConfig,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn ready<S: AddressableSlotStore + 'static>(fabric: &LoopbackFabric, store: &Arc<S>) -> (RemotePeer, RegionMetadata) {
    let handle = Arc::clone(store).spawn_initiate().unwrap();
    let peer = fabric.connect_timeout(store.port(), TIMEOUT).unwrap();
    let metadata = peer.recv_metadata(TIMEOUT).unwrap();
    handle.join().unwrap().unwrap();
    (peer, metadata)
}

fn config(name: &str, port: u16, capacity: u64) -> StoreConfig {
    StoreConfig::builder()
        .name(name)
        .port(port)
        .capacity(capacity)
        .standard_pages()
        .build()
}

fn keyvalue_benchmarks(c: &mut Criterion) {
    const CAPACITY: u64 = 1 << 16;
    const KEYS: u32 = 10_000;

    let fabric = LoopbackFabric::new();
    let shared: Arc<dyn Fabric> = Arc::new(fabric.clone());
    let store = Arc::new(HashKeyValueStore::new(config("bench-kv", 1337, CAPACITY), shared).unwrap());
    let (peer, metadata) = ready(&fabric, &store);

    for key in 0..KEYS {
        let slot = KeyValueSlot {
            checksum: key_checksum(key),
            value: key + 1,
        };
        for index in probe_sequence(key, 4, CAPACITY) {
            peer.write_slot(&metadata, index, KeyValueSlot::SIZE, &slot.to_words()[..KeyValueSlot::WORDS])
                .unwrap();
        }
    }

    let mut group = c.benchmark_group("keyvalue_query");
    group.throughput(Throughput::Elements(1));
    for redundancy in [1u8, 2, 4] {
        group.bench_with_input(BenchmarkId::new("hit", redundancy), &redundancy, |b, &r| {
            let mut key = 0u32;
            b.iter(|| {
                key = (key + 1) % KEYS;
                black_box(store.query(black_box(key), r).unwrap())
            })
        });
    }
    group.bench_function("miss", |b| {
        let mut key = KEYS;
        b.iter(|| {
            key = key.wrapping_add(1).max(KEYS);
            black_box(store.query(black_box(key), 4).unwrap())
        })
    });
    group.finish();

    c.bench_function("keyvalue_benchmark_queries_4_threads", |b| {
        b.iter(|| black_box(store.benchmark_queries(4, u64::from(KEYS), 4).unwrap()))
    });
}

fn append_benchmarks(c: &mut Criterion) {
    let fabric = LoopbackFabric::new();
    let shared: Arc<dyn Fabric> = Arc::new(fabric.clone());
    let log = Arc::new(CircularAppendLog::new(config("bench-list", 1338, 1 << 16), shared).unwrap());
    let (_peer, _metadata) = ready(&fabric, &log);

    let mut group = c.benchmark_group("append_pull");
    group.throughput(Throughput::Elements(1));
    group.bench_function("shared_cursor", |b| b.iter(|| black_box(log.pull().unwrap())));
    group.bench_function("private_cursor", |b| {
        let mut cursor = log.cursor().unwrap();
        b.iter(|| black_box(cursor.pull()))
    });
    group.finish();
}

criterion_group!(benches, keyvalue_benchmarks, append_benchmarks);
criterion_main!(benches);
