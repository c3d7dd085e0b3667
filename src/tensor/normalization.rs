// =============================================================================
// tensor/normalization.rs — RMSNorm
// =============================================================================

/// `out[i] = x[i] / rms(x) * weight[i]`, with `eps` inside the square root.
pub fn rmsnorm(out: &mut [f32], x: &[f32], weight: &[f32], eps: f32) {
    let dim = x.len();
    assert_eq!(out.len(), dim, "rmsnorm output length");
    assert_eq!(weight.len(), dim, "rmsnorm weight length");
    if dim == 0 {
        return;
    }

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            // SAFETY: lengths checked above; AVX2 presence checked at runtime.
            unsafe { rmsnorm_avx2(out, x, weight, eps) };
            return;
        }
    }
    rmsnorm_scalar(out, x, weight, eps);
}

/// Accumulates in f64 so long rows do not lose the small terms.
fn rmsnorm_scalar(out: &mut [f32], x: &[f32], weight: &[f32], eps: f32) {
    let mean_sq = x.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>() / x.len() as f64;
    let inv_rms = (1.0 / (mean_sq + eps as f64).sqrt()) as f32;
    for ((o, &v), &w) in out.iter_mut().zip(x).zip(weight) {
        *o = v * inv_rms * w;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn rmsnorm_avx2(out: &mut [f32], x: &[f32], weight: &[f32], eps: f32) {
    use std::arch::x86_64::*;
    let dim = x.len();
    let chunks = dim / 8;

    let mut acc = _mm256_setzero_ps();
    for c in 0..chunks {
        let v = _mm256_loadu_ps(x.as_ptr().add(c * 8));
        acc = _mm256_add_ps(acc, _mm256_mul_ps(v, v));
    }
    let mut ss = super::dot::hsum256(acc) as f64;
    for &v in &x[chunks * 8..] {
        ss += (v as f64) * (v as f64);
    }

    let inv_rms = (1.0 / (ss / dim as f64 + eps as f64).sqrt()) as f32;
    let inv = _mm256_set1_ps(inv_rms);
    for c in 0..chunks {
        let xv = _mm256_loadu_ps(x.as_ptr().add(c * 8));
        let wv = _mm256_loadu_ps(weight.as_ptr().add(c * 8));
        _mm256_storeu_ps(
            out.as_mut_ptr().add(c * 8),
            _mm256_mul_ps(_mm256_mul_ps(xv, inv), wv),
        );
    }
    for i in chunks * 8..dim {
        out[i] = x[i] * inv_rms * weight[i];
    }
}
