
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use tempfile::TempDir;
use tsindex::{
    CompactionConfig, Compactor, IndexFile, LogFile, LogFileConfig, SeriesFile, Tags,
};

use std::sync::Arc;

fn make_log(dir: &std::path::Path, sync_on_append: bool) -> LogFile {
    let cfg = LogFileConfig {
        sync_on_append,
        ..LogFileConfig::default()
    };
    let lf = LogFile::new(
        Arc::new(SeriesFile::in_memory()),
        dir.join("0001.tsl"),
        cfg,
    );
    lf.open().expect("log open");
    lf
}

fn load(lf: &LogFile, ops: &[datasets::SeriesOp], batch: usize) {
    for chunk in ops.chunks(batch) {
        let names: Vec<&str> = chunk.iter().map(|op| op.measurement.as_str()).collect();
        let tags: Vec<Tags> = chunk.iter().map(|op| op.tags.clone()).collect();
        lf.add_series_list(&names, &tags).unwrap();
    }
}

fn bench_log_ingest(c: &mut Criterion) {
    let ops = datasets::generate_series(datasets::DEFAULT_SEED, 20_000, 64, 3, 16);

    #[derive(Debug)]
    struct Fixture {
        _dir: TempDir,
        log: LogFile,
    }

    let mut group = c.benchmark_group("log_ingest");
    group.sample_size(10);

    for batch in [1usize, 100, 1000] {
        group.bench_function(format!("ingest_20k_batch_{}", batch), |b| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().expect("tempdir");
                    let log = make_log(dir.path(), false);
                    Fixture { _dir: dir, log }
                },
                |fx| {
                    load(&fx.log, black_box(&ops), batch);
                    fx.log.flush().unwrap();
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_compaction(c: &mut Criterion) {
    let ops = datasets::generate_series(datasets::DEFAULT_SEED, 50_000, 256, 3, 32);
    let dir = TempDir::new().expect("tempdir");
    let lf = make_log(dir.path(), false);
    load(&lf, &ops, 1000);

    let mut group = c.benchmark_group("compaction");
    group.sample_size(10);

    for concurrency in [1usize, 4] {
        group.bench_function(format!("compact_50k_c{}", concurrency), |b| {
            b.iter(|| {
                let mut buf = Vec::new();
                lf.compact_to(&mut buf, 4096, black_box(concurrency), None)
                    .unwrap();
                buf.len()
            })
        });
    }

    // Second level: merge an index file with a fresh log segment.
    let mut buf = Vec::new();
    lf.compact_to(&mut buf, 4096, 4, None).unwrap();
    let mut base = IndexFile::new();
    base.unmarshal_binary(buf).unwrap();
    let extra = datasets::generate_series(datasets::DEFAULT_SEED ^ 1, 5_000, 256, 3, 32);
    let dir2 = TempDir::new().expect("tempdir");
    let lf2 = make_log(dir2.path(), false);
    load(&lf2, &extra, 1000);

    group.bench_function("merge_index_and_log", |b| {
        b.iter(|| {
            let mut compactor = Compactor::new(CompactionConfig {
                concurrency: 4,
                ..CompactionConfig::default()
            })
            .unwrap();
            compactor.add_index_file(&base).unwrap();
            compactor.add_log_file(&lf2).unwrap();
            let mut out = Vec::new();
            compactor.compact_to(&mut out, None).unwrap()
        })
    });

    group.finish();
}

fn bench_index_lookups(c: &mut Criterion) {
    let ops = datasets::generate_series(datasets::DEFAULT_SEED, 50_000, 256, 3, 32);
    let dir = TempDir::new().expect("tempdir");
    let lf = make_log(dir.path(), false);
    load(&lf, &ops, 1000);

    let path = dir.path().join("0001.tsi");
    let compactor = {
        let mut c = Compactor::new(CompactionConfig::default()).unwrap();
        c.add_log_file(&lf).unwrap();
        c
    };
    compactor.compact_to_path(&path, None).unwrap();
    let index = IndexFile::open_path(&path).unwrap();

    let mut group = c.benchmark_group("index_lookup");
    group.bench_function("measurement_exists_hit", |b| {
        b.iter(|| index.measurement_exists(black_box(b"m128")).unwrap())
    });
    // Absent names are mostly answered by the bloom filter.
    group.bench_function("measurement_exists_miss", |b| {
        b.iter(|| index.measurement_exists(black_box(b"nope")).unwrap())
    });
    group.bench_function("tag_values_scan", |b| {
        b.iter(|| index.tag_values(black_box(b"m7"), black_box(b"k0")).unwrap().count())
    });
    group.bench_function("series_ids_for_tag_value", |b| {
        b.iter(|| {
            index
                .series_ids_for_tag_value(black_box(b"m7"), black_box(b"k1"), black_box(b"v3"))
                .unwrap()
                .count()
        })
    });
    group.bench_function("series_key_resolve", |b| {
        b.iter(|| index.series_key(black_box(25_000)).unwrap())
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_log_ingest,
    bench_compaction,
    bench_index_lookups
);
criterion_main!(benches);
