use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::NamedTempFile;

use stratadb::storage::buffer::BufferPoolManager;

fn bench_new_page(c: &mut Criterion) {
    let file = NamedTempFile::new().unwrap();
    let pool = Arc::new(BufferPoolManager::new(64, 2, file.path()).unwrap());

    c.bench_function("bpm_new_page_unpin", |b| {
        b.iter(|| {
            let (_, page_id) = pool.new_page().unwrap();
            pool.unpin_page(black_box(page_id), false).unwrap();
        })
    });
}

fn bench_fetch_hot_page(c: &mut Criterion) {
    let file = NamedTempFile::new().unwrap();
    let pool = Arc::new(BufferPoolManager::new(64, 2, file.path()).unwrap());
    let (_, page_id) = pool.new_page().unwrap();
    pool.unpin_page(page_id, false).unwrap();

    c.bench_function("bpm_fetch_cached", |b| {
        b.iter(|| {
            let page = pool.fetch_page(black_box(page_id)).unwrap();
            black_box(page.read().page_id);
            pool.unpin_page(page_id, false).unwrap();
        })
    });
}

fn bench_fetch_with_eviction(c: &mut Criterion) {
    let file = NamedTempFile::new().unwrap();
    let pool = Arc::new(BufferPoolManager::new(8, 2, file.path()).unwrap());

    // Materialize more pages than frames so fetches churn the replacer
    let mut page_ids = Vec::new();
    for _ in 0..64 {
        let (_, page_id) = pool.new_page().unwrap();
        pool.unpin_page(page_id, true).unwrap();
        page_ids.push(page_id);
    }

    let mut i = 0;
    c.bench_function("bpm_fetch_evicting", |b| {
        b.iter(|| {
            let page_id = page_ids[i % page_ids.len()];
            i += 7;
            let page = pool.fetch_page(black_box(page_id)).unwrap();
            black_box(page.read().page_id);
            pool.unpin_page(page_id, false).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_new_page,
    bench_fetch_hot_page,
    bench_fetch_with_eviction
);
criterion_main!(benches);
