use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mdcsr_engine::kernel::{spmv, spmv_batch};
use mdcsr_engine::model::{synthetic_model, ModelConfig};
use mdcsr_engine::{EngineConfig, EngineContext, ModelFile, PrimeTable, Session, SparseMatrix};

fn pseudo_random(n: usize, seed: u32) -> Vec<f32> {
    let mut s = seed;
    (0..n)
        .map(|_| {
            s = s.wrapping_mul(1103515245).wrapping_add(12345);
            ((s >> 16) & 0xFFFF) as f32 / 65535.0 * 2.0 - 1.0
        })
        .collect()
}

/// Dense matrix with roughly `density` of its entries kept.
fn sparse_matrix(rows: usize, cols: usize, density: f32, primes: &PrimeTable) -> SparseMatrix<'static> {
    let keep = pseudo_random(rows * cols, 7);
    let vals = pseudo_random(rows * cols, 11);
    let dense: Vec<f32> = keep
        .iter()
        .zip(&vals)
        .map(|(&k, &v)| if (k + 1.0) / 2.0 < density { v } else { 0.0 })
        .collect();
    SparseMatrix::encode_dense(&dense, rows, cols, primes, 0.0).unwrap()
}

fn bench_spmv(c: &mut Criterion) {
    let primes = PrimeTable::generate(256).unwrap();
    let ctx = EngineContext::new(EngineConfig::cpu().with_prime_table_len(256)).unwrap();
    let mut group = c.benchmark_group("spmv");

    for (dim, density) in [(256, 0.5), (1024, 0.5), (1024, 0.1), (4096, 0.1)] {
        let m = sparse_matrix(dim, dim, density, &primes);
        let x = pseudo_random(dim, 3);
        let label = format!("{dim}x{dim}@{density}");
        group.bench_with_input(BenchmarkId::new("cpu", &label), &x, |b, x| {
            b.iter(|| ctx.install(|| spmv(&primes, &m, black_box(x)).unwrap()));
        });
    }
    group.finish();
}

fn bench_spmv_batch(c: &mut Criterion) {
    let primes = PrimeTable::generate(256).unwrap();
    let ctx = EngineContext::new(EngineConfig::cpu().with_prime_table_len(256)).unwrap();
    let m = sparse_matrix(1024, 1024, 0.2, &primes);
    let mut group = c.benchmark_group("spmv_batch");

    for batch in [1, 4, 16] {
        let xs = pseudo_random(1024 * batch, 5);
        group.bench_with_input(BenchmarkId::new("batch", batch), &xs, |b, xs| {
            b.iter(|| ctx.install(|| spmv_batch(&primes, &m, black_box(xs), batch).unwrap()));
        });
    }
    group.finish();
}

fn bench_decode_step(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.mdcs");
    let cfg = ModelConfig {
        n_layers: 4,
        dim: 128,
        hidden_dim: 384,
        n_heads: 4,
        head_dim: 32,
        vocab_size: 512,
        max_seq_len: 256,
        ..ModelConfig::tiny()
    };
    synthetic_model(&path, &cfg, 1).unwrap();
    let ctx = Arc::new(EngineContext::new(EngineConfig::cpu()).unwrap());
    let model = Arc::new(ModelFile::load(&path, &ctx).unwrap());
    let fresh = || {
        let mut s = Session::new(Arc::clone(&ctx), Arc::clone(&model)).unwrap();
        s.warm_up().unwrap();
        s
    };
    let mut session = fresh();

    c.bench_function("decode_step", |b| {
        b.iter(|| {
            if session.position() == session.capacity() {
                session = fresh();
            }
            black_box(session.generate_step(1).unwrap().len())
        })
    });
}

criterion_group!(benches, bench_spmv, bench_spmv_batch, bench_decode_step);
criterion_main!(benches);
