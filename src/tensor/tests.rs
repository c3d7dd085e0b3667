// =============================================================================
// tensor/tests.rs — Dense kernels against straightforward references
// =============================================================================

use proptest::prelude::*;

use super::*;
use crate::error::EngineError;
use crate::kv_cache::{KvCache, KvView};

fn close(a: &[f32], b: &[f32], tol: f32) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= tol * (1.0 + y.abs()))
}

/// Deterministic pseudo-random fill.
fn fill(n: usize, seed: u32) -> Vec<f32> {
    let mut s = seed;
    (0..n)
        .map(|_| {
            s = s.wrapping_mul(1103515245).wrapping_add(12345);
            ((s >> 16) & 0xFFFF) as f32 / 65535.0 * 2.0 - 1.0
        })
        .collect()
}

/// Cache with `n` committed positions for a single (layer, head).
fn cache_with(n: usize, capacity: usize, head_dim: usize) -> KvCache {
    let mut kv = KvCache::new(1, 1, head_dim, capacity).unwrap();
    for p in 0..n {
        let k = fill(head_dim, p as u32 * 2 + 1);
        let v = fill(head_dim, p as u32 * 2 + 2);
        kv.write(0, 0, p, &k, &v).unwrap();
        kv.commit();
    }
    kv
}

#[test]
fn test_attention_matches_reference_over_lengths() {
    let head_dim = 16;
    let capacity = 64;
    let q = fill(head_dim, 999);
    for n in [0usize, 1, 10, capacity] {
        let kv = cache_with(n, capacity, head_dim);
        let view = kv.read_range(0, 0, 0, n).unwrap();
        let mut out = vec![7.0f32; head_dim];
        let attended = streaming_attention(&q, &view, &mut out).unwrap();
        match reference_attention(&q, &view) {
            None => {
                assert!(!attended, "n = {n}");
                assert!(out.iter().all(|&v| v == 7.0), "empty history touched output");
            }
            Some(expected) => {
                assert!(attended);
                assert!(close(&out, &expected, 1e-5), "n = {n}: {out:?} vs {expected:?}");
            }
        }
    }
}

#[test]
fn test_single_position_returns_its_value() {
    let kv = cache_with(1, 4, 8);
    let view = kv.read_range(0, 0, 0, 1).unwrap();
    let mut out = vec![0.0; 8];
    streaming_attention(&fill(8, 5), &view, &mut out).unwrap();
    assert!(close(&out, view.value(0), 1e-6));
}

#[test]
fn test_large_scores_do_not_overflow() {
    let hd = 4;
    let keys: Vec<f32> = [1000.0, 0.0, 0.0, 0.0, 999.0, 0.0, 0.0, 0.0].to_vec();
    let values: Vec<f32> = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0].to_vec();
    let view = KvView::new(&keys, &values, hd).unwrap();
    let q = [1.0, 0.0, 0.0, 0.0];
    let mut out = vec![0.0; hd];
    streaming_attention(&q, &view, &mut out).unwrap();
    let expected = reference_attention(&q, &view).unwrap();
    assert!(close(&out, &expected, 1e-5));
    assert!(out.iter().all(|v| v.is_finite()));
}

#[test]
fn test_non_finite_score_is_numeric_error() {
    let keys = vec![f32::NAN; 4];
    let values = vec![1.0; 4];
    let view = KvView::new(&keys, &values, 4).unwrap();
    let mut out = vec![0.0; 4];
    let err = streaming_attention(&[1.0; 4], &view, &mut out).unwrap_err();
    assert!(matches!(err, EngineError::Numeric(_)));
}

#[test]
fn test_attention_shape_checks() {
    let kv = cache_with(2, 4, 4);
    let view = kv.read_range(0, 0, 0, 2).unwrap();
    let mut out = vec![0.0; 4];
    assert!(matches!(
        streaming_attention(&[0.0; 3], &view, &mut out),
        Err(EngineError::Shape { .. })
    ));
    let mut short = vec![0.0; 2];
    assert!(matches!(
        streaming_attention(&[0.0; 4], &view, &mut short),
        Err(EngineError::Shape { .. })
    ));
}

#[test]
fn test_rmsnorm_unit_rms() {
    let x = fill(37, 3);
    let w = vec![1.0; 37];
    let mut out = vec![0.0; 37];
    rmsnorm(&mut out, &x, &w, 1e-6);
    let rms = (out.iter().map(|v| v * v).sum::<f32>() / 37.0).sqrt();
    assert!((rms - 1.0).abs() < 1e-3, "rms {rms}");
}

#[test]
fn test_rmsnorm_zero_input_stays_finite() {
    let mut out = vec![1.0; 8];
    rmsnorm(&mut out, &[0.0; 8], &[2.0; 8], 1e-5);
    assert!(out.iter().all(|&v| v == 0.0));
}

#[test]
fn test_swiglu_and_silu() {
    assert_eq!(silu(0.0), 0.0);
    assert!((silu(10.0) - 10.0).abs() < 1e-3);
    let mut g = vec![0.0, 1.0, -1.0];
    swiglu(&mut g, &[5.0, 2.0, 2.0]);
    assert_eq!(g[0], 0.0);
    assert!((g[1] - 2.0 * silu(1.0)).abs() < 1e-6);
    assert!(g[2] < 0.0);
}

#[test]
fn test_rope_position_zero_is_identity() {
    let table = RopeTable::new(8, 4, 10000.0).unwrap();
    let orig = fill(16, 11);
    let mut x = orig.clone();
    table.apply(&mut x, 0).unwrap();
    assert!(close(&x, &orig, 1e-7));
}

#[test]
fn test_rope_preserves_pair_norms() {
    let table = RopeTable::new(8, 16, 10000.0).unwrap();
    let orig = fill(8, 21);
    let mut x = orig.clone();
    table.apply(&mut x, 13).unwrap();
    for (a, b) in x.chunks(2).zip(orig.chunks(2)) {
        let na = a[0] * a[0] + a[1] * a[1];
        let nb = b[0] * b[0] + b[1] * b[1];
        assert!((na - nb).abs() < 1e-5);
    }
    assert!(!close(&x, &orig, 1e-3));
}

#[test]
fn test_rope_bounds() {
    let table = RopeTable::new(4, 2, 10000.0).unwrap();
    let mut x = vec![0.0; 4];
    assert!(matches!(table.apply(&mut x, 2), Err(EngineError::Index { .. })));
    let mut odd = vec![0.0; 6];
    assert!(matches!(table.apply(&mut odd, 0), Err(EngineError::Shape { .. })));
    assert!(RopeTable::new(3, 2, 10000.0).is_err());
}

#[test]
fn test_argmax() {
    assert_eq!(argmax(&[]), None);
    assert_eq!(argmax(&[0.1, 0.9, 0.9, -1.0]), Some(1));
    assert_eq!(argmax(&[f32::NAN, -2.0]), Some(1));
}

proptest! {
    #[test]
    fn prop_dot_matches_naive(v in prop::collection::vec(-10.0f32..10.0, 0..100)) {
        let w: Vec<f32> = v.iter().rev().cloned().collect();
        let naive: f64 = v.iter().zip(&w).map(|(a, b)| *a as f64 * *b as f64).sum();
        let got = dot(&v, &w) as f64;
        prop_assert!((got - naive).abs() <= 1e-3 * (1.0 + naive.abs()));
    }

    #[test]
    fn prop_attention_matches_reference(
        n in 1usize..40,
        seed in any::<u32>(),
    ) {
        let hd = 8;
        let keys = fill(n * hd, seed);
        let values = fill(n * hd, seed.wrapping_add(1));
        let view = KvView::new(&keys, &values, hd).unwrap();
        let q = fill(hd, seed.wrapping_add(2));
        let mut out = vec![0.0; hd];
        prop_assert!(streaming_attention(&q, &view, &mut out).unwrap());
        let expected = reference_attention(&q, &view).unwrap();
        prop_assert!(close(&out, &expected, 1e-5));
    }
}
