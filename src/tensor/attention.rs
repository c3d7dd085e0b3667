// =============================================================================
// tensor/attention.rs — Streaming-softmax attention for one query
// =============================================================================
//
// One pass over the history with a running maximum m, running denominator s
// and running weighted sum a:
//
//   score = q·k_t / sqrt(head_dim)
//   m'    = max(m, score)
//   s     = s · e^(m - m') + e^(score - m')
//   a     = a · e^(m - m') + e^(score - m') · v_t
//
// and the result is a / s. The score vector is never materialised, so the
// working set is O(head_dim) regardless of history length.
// =============================================================================

use crate::error::{EngineError, Result};
use crate::kv_cache::KvView;

use super::dot::{dot, scale_add};

/// Attend `q` over `history` and write the result into `out`.
///
/// Empty history returns `Ok(false)` and leaves `out` untouched: the caller
/// keeps its own projection. A non-finite score or an underflowed
/// denominator is a numeric error.
pub fn streaming_attention(q: &[f32], history: &KvView<'_>, out: &mut [f32]) -> Result<bool> {
    let hd = history.head_dim();
    if q.len() != hd {
        return Err(EngineError::shape("attention query", hd, q.len()));
    }
    if out.len() != hd {
        return Err(EngineError::shape("attention output", hd, out.len()));
    }
    if history.is_empty() {
        return Ok(false);
    }

    let inv_sqrt_d = 1.0 / (hd as f32).sqrt();
    let mut m = f32::NEG_INFINITY;
    let mut s = 0.0f32;
    out.fill(0.0);

    for t in 0..history.len() {
        let score = dot(q, history.key(t)) * inv_sqrt_d;
        if !score.is_finite() {
            return Err(EngineError::Numeric(format!(
                "attention score {score} at history position {t}"
            )));
        }
        let m_new = m.max(score);
        // e^(-inf) = 0 on the first row, which clears nothing since a = 0.
        let keep = (m - m_new).exp();
        let p = (score - m_new).exp();
        s = s * keep + p;
        scale_add(out, keep, p, history.value(t));
        m = m_new;
    }

    if !(s.is_finite() && s > 0.0) {
        return Err(EngineError::Numeric(format!(
            "attention denominator {s} over {} positions",
            history.len()
        )));
    }
    let inv_s = 1.0 / s;
    for o in out.iter_mut() {
        *o *= inv_s;
        if !o.is_finite() {
            return Err(EngineError::Numeric("non-finite attention output".into()));
        }
    }
    Ok(true)
}

/// Two-pass attention with an explicit score vector. Test oracle for
/// `streaming_attention`.
#[cfg(test)]
pub(crate) fn reference_attention(q: &[f32], history: &KvView<'_>) -> Option<Vec<f32>> {
    let hd = history.head_dim();
    if history.is_empty() {
        return None;
    }
    let scale = 1.0 / (hd as f64).sqrt();
    let scores: Vec<f64> = (0..history.len())
        .map(|t| {
            q.iter()
                .zip(history.key(t))
                .map(|(&a, &b)| a as f64 * b as f64)
                .sum::<f64>()
                * scale
        })
        .collect();
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let weights: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = weights.iter().sum();

    let mut out = vec![0.0f64; hd];
    for (t, w) in weights.iter().enumerate() {
        for (o, &v) in out.iter_mut().zip(history.value(t)) {
            *o += w / total * v as f64;
        }
    }
    Some(out.into_iter().map(|v| v as f32).collect())
}
