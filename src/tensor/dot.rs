// =============================================================================
// tensor/dot.rs — f32 dot product
// =============================================================================

/// Dot product over the common prefix of `a` and `b`.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let (a, b) = (&a[..len], &b[..len]);

    #[cfg(target_arch = "x86_64")]
    {
        if len >= 16 && is_x86_feature_detected!("avx2") {
            // SAFETY: both slices hold exactly `len` elements.
            return unsafe { dot_avx2(a, b) };
        }
    }
    dot_scalar(a, b)
}

/// Four independent accumulators so the adds can pipeline.
#[inline(always)]
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0f32; 4];
    let mut ca = a.chunks_exact(4);
    let mut cb = b.chunks_exact(4);
    for (x, y) in (&mut ca).zip(&mut cb) {
        acc[0] += x[0] * y[0];
        acc[1] += x[1] * y[1];
        acc[2] += x[2] * y[2];
        acc[3] += x[3] * y[3];
    }
    for (x, y) in ca.remainder().iter().zip(cb.remainder()) {
        acc[0] += x * y;
    }
    (acc[0] + acc[1]) + (acc[2] + acc[3])
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;
    let len = a.len();
    let chunks = len / 8;
    let mut acc0 = _mm256_setzero_ps();
    let mut acc1 = _mm256_setzero_ps();

    let mut c = 0;
    while c + 1 < chunks {
        let base = c * 8;
        acc0 = _mm256_add_ps(
            acc0,
            _mm256_mul_ps(
                _mm256_loadu_ps(a.as_ptr().add(base)),
                _mm256_loadu_ps(b.as_ptr().add(base)),
            ),
        );
        acc1 = _mm256_add_ps(
            acc1,
            _mm256_mul_ps(
                _mm256_loadu_ps(a.as_ptr().add(base + 8)),
                _mm256_loadu_ps(b.as_ptr().add(base + 8)),
            ),
        );
        c += 2;
    }
    if c < chunks {
        let base = c * 8;
        acc0 = _mm256_add_ps(
            acc0,
            _mm256_mul_ps(
                _mm256_loadu_ps(a.as_ptr().add(base)),
                _mm256_loadu_ps(b.as_ptr().add(base)),
            ),
        );
    }

    let mut sum = hsum256(_mm256_add_ps(acc0, acc1));
    for i in chunks * 8..len {
        sum += a[i] * b[i];
    }
    sum
}

/// Horizontal sum of the eight lanes.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
pub(super) unsafe fn hsum256(v: std::arch::x86_64::__m256) -> f32 {
    use std::arch::x86_64::*;
    let hi = _mm256_extractf128_ps(v, 1);
    let lo = _mm256_castps256_ps128(v);
    let sum4 = _mm_add_ps(lo, hi);
    let sum2 = _mm_add_ps(sum4, _mm_movehl_ps(sum4, sum4));
    let sum1 = _mm_add_ss(sum2, _mm_shuffle_ps(sum2, sum2, 1));
    _mm_cvtss_f32(sum1)
}

/// `acc[i] = acc[i] * keep + w * v[i]`, the running update of attention.
#[inline]
pub fn scale_add(acc: &mut [f32], keep: f32, w: f32, v: &[f32]) {
    for (a, &x) in acc.iter_mut().zip(v) {
        *a = *a * keep + w * x;
    }
}
