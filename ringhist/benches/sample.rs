//! Microbenchmarks for the sample and fetch paths.
//!
//! Run with: `cargo bench -p ringhist -- sample`

#![allow(missing_docs, clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ringhist::backend::{FileBackend, MemoryBackend};
use ringhist::codec;
use ringhist::query;
use ringhist::schema::SeriesDefinition;
use ringhist::series::Series;
use ringhist::store::SeriesStore;
use tempfile::tempdir;

const T0: u64 = 1_700_006_400;
const STEP: u64 = 60;

/// A collection-style definition with `count` gauges and the default archives.
fn definition(count: usize) -> (SeriesDefinition, Vec<String>) {
    let gauges: Vec<String> = (0..count).map(|i| format!("metric_{i}")).collect();
    let def = SeriesDefinition::for_collection(&[] as &[String], &gauges, STEP, T0);
    (def, gauges)
}

fn bench_series_sample(c: &mut Criterion) {
    let mut group = c.benchmark_group("sample/datasource_count");

    for count in [1, 10, 30] {
        let (def, names) = definition(count);
        let mut series = Series::create("bench", def).unwrap();
        let mut ts = T0;

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                ts += STEP;
                let values = names.iter().enumerate().map(|(i, n)| (n.as_str(), i as f64));
                series.sample(black_box(ts), values).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_store_sample(c: &mut Criterion) {
    let (def, names) = definition(10);

    let memory = SeriesStore::new(Arc::new(MemoryBackend::new()));
    memory.create("bench", def.clone()).unwrap();
    let mut ts = T0;
    c.bench_function("sample/store_write_through_memory", |b| {
        b.iter(|| {
            ts += STEP;
            let values = names.iter().map(|n| (n.as_str(), 42.5));
            memory.sample("bench", black_box(ts), values).unwrap();
        });
    });

    let dir = tempdir().unwrap();
    let file = SeriesStore::new(Arc::new(FileBackend::open(dir.path()).unwrap()));
    file.create("bench", def.clone()).unwrap();
    let mut ts = T0;
    c.bench_function("sample/store_write_through_file", |b| {
        b.iter(|| {
            ts += STEP;
            let values = names.iter().map(|n| (n.as_str(), 42.5));
            file.sample("bench", black_box(ts), values).unwrap();
        });
    });

    let write_back = SeriesStore::new(Arc::new(MemoryBackend::new())).with_sync_period(3600);
    write_back.create("bench", def).unwrap();
    let mut ts = T0;
    c.bench_function("sample/store_write_back", |b| {
        b.iter(|| {
            ts += STEP;
            let values = names.iter().map(|n| (n.as_str(), 42.5));
            write_back.sample("bench", black_box(ts), values).unwrap();
        });
    });
}

fn bench_codec(c: &mut Criterion) {
    let (def, names) = definition(10);
    let mut series = Series::create("bench", def).unwrap();
    for i in 1..=1000 {
        let values = names.iter().map(|n| (n.as_str(), f64::from(i)));
        series.sample(T0 + u64::from(i) * STEP, values).unwrap();
    }
    let bytes = codec::encode(&series);

    c.bench_function("codec/encode", |b| b.iter(|| codec::encode(black_box(&series))));
    c.bench_function("codec/decode", |b| {
        b.iter(|| codec::decode(black_box(&bytes)).unwrap());
    });
}

fn bench_fetch(c: &mut Criterion) {
    let (def, names) = definition(10);
    let mut series = Series::create("bench", def).unwrap();
    for i in 1..=1000 {
        let values = names.iter().map(|n| (n.as_str(), f64::from(i)));
        series.sample(T0 + u64::from(i) * STEP, values).unwrap();
    }

    c.bench_function("fetch/all_archives", |b| {
        b.iter(|| query::fetch_series(black_box(&series), &[] as &[&str], None).unwrap());
    });
}

criterion_group!(
    benches,
    bench_series_sample,
    bench_store_sample,
    bench_codec,
    bench_fetch,
);
criterion_main!(benches);
