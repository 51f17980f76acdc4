//! Performance benchmarks for BucketSync
//!
//! Run with: cargo bench

use bucketsync::core::CancelFlag;
use bucketsync::fs::{hash_file, LocalTreeDigestPipeline, ScanConfig};
use bucketsync::hash::{MultipartDigest, COMMON_PART_SIZES};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::fs::File;
use std::io::Write;
use tempfile::TempDir;

/// Create a test file of the specified size
fn create_test_file(dir: &std::path::Path, name: &str, size: usize) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = File::create(&path).unwrap();

    let chunk_size = 64 * 1024;
    let chunk: Vec<u8> = (0..chunk_size).map(|i| (i % 256) as u8).collect();
    let mut remaining = size;

    while remaining > 0 {
        let to_write = remaining.min(chunk_size);
        file.write_all(&chunk[..to_write]).unwrap();
        remaining -= to_write;
    }

    path
}

fn bench_digest_candidates(c: &mut Criterion) {
    let mut group = c.benchmark_group("multipart_digest");

    let data_size = 32 * 1024 * 1024;
    let data: Vec<u8> = (0..data_size).map(|i| (i % 251) as u8).collect();
    group.throughput(Throughput::Bytes(data_size as u64));

    let candidates: [(&str, fn() -> MultipartDigest); 3] = [
        ("single_part", MultipartDigest::single_part),
        ("default", MultipartDigest::new),
        ("extra_64m", || MultipartDigest::with_extra_part_sizes(&[64 * 1024 * 1024])),
    ];
    for (name, make) in candidates {
        group.bench_with_input(BenchmarkId::new("update", name), &data, |b, data| {
            b.iter(|| {
                let mut digest = make();
                for chunk in data.chunks(256 * 1024) {
                    digest.update(chunk);
                }
                digest.finish();
                black_box(digest.checksums().count())
            });
        });
    }

    group.finish();
}

fn bench_hash_file(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_file");
    let dir = TempDir::new().unwrap();

    for size in [1024 * 1024, COMMON_PART_SIZES[1] as usize + 1] {
        let path = create_test_file(dir.path(), &format!("f{}", size), size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(humansize::format_size(size as u64, humansize::BINARY)),
            &path,
            |b, path| {
                let cancel = CancelFlag::new();
                b.iter(|| {
                    black_box(hash_file(path, MultipartDigest::new(), 256 * 1024, &cancel, |_| {}).unwrap())
                });
            },
        );
    }

    group.finish();
}

fn bench_tree_scan(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();

    for i in 0..10 {
        let subdir = dir.path().join(format!("subdir_{}", i));
        std::fs::create_dir_all(&subdir).unwrap();

        for j in 0..100 {
            create_test_file(&subdir, &format!("file_{}.txt", j), 1024);
        }
    }

    let runtime = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("scan_1000_files", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let pipeline = LocalTreeDigestPipeline::new(ScanConfig::default());
                let mut tree = pipeline.start(dir.path(), CancelFlag::new());
                let mut count = 0;
                while let Some(record) = tree.next().await {
                    record.unwrap();
                    count += 1;
                }
                black_box(count)
            })
        });
    });
}

criterion_group!(benches, bench_digest_candidates, bench_hash_file, bench_tree_scan);
criterion_main!(benches);
