// =============================================================================
// kernel/tests.rs — SpMV correctness against the dense reconstruction
// =============================================================================

use std::sync::Arc;

use proptest::prelude::*;

use super::*;
use crate::error::EngineError;
use crate::primes::PrimeTable;
use crate::sparse::SparseMatrix;

fn dense_matvec(dense: &[f32], rows: usize, cols: usize, x: &[f32]) -> Vec<f32> {
    (0..rows)
        .map(|r| (0..cols).map(|c| dense[r * cols + c] * x[c]).sum())
        .collect()
}

fn close(a: f32, b: f32) -> bool {
    (a - b).abs() <= 1e-4 * (1.0 + b.abs())
}

#[test]
fn test_single_entry_row() {
    // 1×3, one entry at column 0, value 1, code → 2, scale 1.
    let primes = PrimeTable::generate(4).unwrap();
    let m = SparseMatrix::new(1, 3, vec![1i8], vec![0u16], vec![0u32, 1], vec![0u16], vec![1.0f32], &primes)
        .unwrap();
    let y = spmv(&primes, &m, &[1.0, 0.0, 0.0]).unwrap();
    assert_eq!(y, vec![2.0]);
}

#[test]
fn test_all_rows_empty() {
    let primes = PrimeTable::generate(4).unwrap();
    let m = SparseMatrix::empty(5, 7);
    let y = spmv(&primes, &m, &[1.5; 7]).unwrap();
    assert_eq!(y, vec![0.0; 5]);
}

#[test]
fn test_input_length_mismatch() {
    let primes = PrimeTable::generate(4).unwrap();
    let m = SparseMatrix::empty(2, 3);
    let err = spmv(&primes, &m, &[1.0; 4]).unwrap_err();
    assert!(matches!(err, EngineError::Shape { expected: 3, got: 4, .. }));
}

#[test]
fn test_batch_matches_single() {
    let primes = PrimeTable::generate(32).unwrap();
    let (rows, cols, batch) = (9, 13, 4);
    let dense: Vec<f32> = (0..rows * cols)
        .map(|i| if i % 4 == 1 { ((i * 7) as f32 * 0.11).cos() } else { 0.0 })
        .collect();
    let m = SparseMatrix::encode_dense(&dense, rows, cols, &primes, 0.0).unwrap();
    let xs: Vec<f32> = (0..batch * cols).map(|i| (i as f32 * 0.3).sin()).collect();

    let ys = spmv_batch(&primes, &m, &xs, batch).unwrap();
    assert_eq!(ys.len(), batch * rows);
    for b in 0..batch {
        let single = spmv(&primes, &m, &xs[b * cols..(b + 1) * cols]).unwrap();
        for r in 0..rows {
            assert!(close(ys[b * rows + r], single[r]), "b={b} r={r}");
        }
    }
}

#[test]
fn test_cpu_backend_runs_queued_jobs() {
    let primes = Arc::new(PrimeTable::generate(16).unwrap());
    let backend = CpuBackend::new(primes.clone(), 1);
    let a = SparseMatrix::encode_dense(&[1.0, 0.0, 0.0, 2.0], 2, 2, &primes, 0.0).unwrap();
    let b = SparseMatrix::encode_dense(&[0.0, 3.0], 1, 2, &primes, 0.0).unwrap();
    let x = [1.0f32, 1.0];
    let mut ya = vec![0.0f32; 2];
    let mut yb = vec![0.0f32; 1];
    {
        let mut jobs = [SpmvJob::new(&a, &x, &mut ya), SpmvJob::new(&b, &x, &mut yb).keyed(7)];
        backend.run(&mut jobs).unwrap();
    }
    assert!(close(ya[0], 1.0) && close(ya[1], 2.0), "{ya:?}");
    assert!(close(yb[0], 3.0), "{yb:?}");
}

#[test]
fn test_cpu_backend_rejects_bad_output_len() {
    let primes = Arc::new(PrimeTable::generate(4).unwrap());
    let backend = CpuBackend::new(primes, 1);
    let m = SparseMatrix::empty(3, 2);
    let x = [0.0f32; 2];
    let mut y = vec![0.0f32; 2];
    let mut jobs = [SpmvJob::new(&m, &x, &mut y)];
    assert!(matches!(backend.run(&mut jobs), Err(EngineError::Shape { .. })));
}

#[test]
fn test_runs_inside_dedicated_pool() {
    let primes = PrimeTable::generate(16).unwrap();
    let dense: Vec<f32> = (0..64 * 8).map(|i| (i % 5) as f32 - 2.0).collect();
    let m = SparseMatrix::encode_dense(&dense, 64, 8, &primes, 0.0).unwrap();
    let x = vec![0.5f32; 8];
    let pool = rayon::ThreadPoolBuilder::new().num_threads(3).build().unwrap();
    let a = pool.install(|| spmv(&primes, &m, &x)).unwrap();
    let b = spmv(&primes, &m, &x).unwrap();
    assert_eq!(a, b);
}

fn sparse_dense() -> impl Strategy<Value = (usize, usize, Vec<f32>, Vec<f32>)> {
    (1usize..24, 1usize..40).prop_flat_map(|(rows, cols)| {
        (
            Just(rows),
            Just(cols),
            prop::collection::vec(
                prop_oneof![3 => Just(0.0f32), 2 => -1.0f32..1.0],
                rows * cols,
            ),
            prop::collection::vec(-2.0f32..2.0, cols),
        )
    })
}

proptest! {
    #[test]
    fn prop_spmv_matches_dense((rows, cols, dense, x) in sparse_dense()) {
        let primes = PrimeTable::generate(64).unwrap();
        let m = SparseMatrix::encode_dense(&dense, rows, cols, &primes, 0.0).unwrap();
        let reference = dense_matvec(&m.to_dense(&primes), rows, cols, &x);
        let y = spmv(&primes, &m, &x).unwrap();
        for (a, b) in y.iter().zip(&reference) {
            prop_assert!(close(*a, *b), "{} vs {}", a, b);
        }
    }
}
