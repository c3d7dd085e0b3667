// =============================================================================
// sparse/encode.rs — Dense f32 → MdCSR encoder
// =============================================================================
//
// The real conversion pipeline lives outside this crate. This encoder exists
// so tests, benches and synthetic models can produce valid files:
//
//   1. Drop entries with |w| <= threshold.
//   2. Per-row scale s = max|w| / (127 * primes[0]), so code 0 with |q| = 127
//      always reaches the row maximum.
//   3. For every kept entry pick the (code, q) pair among the first
//      ENCODE_SEARCH_CODES primes minimising |q * p_code * s - w|.
//   4. Column gaps wider than u16 are bridged with zero-valued filler entries.
// =============================================================================

use crate::error::{EngineError, Result};
use crate::primes::PrimeTable;

use super::matrix::SparseMatrix;

/// How many leading primes the encoder tries per entry.
pub const ENCODE_SEARCH_CODES: usize = 8;

impl SparseMatrix<'static> {
    /// Encode a dense row-major `[rows × cols]` matrix.
    pub fn encode_dense(
        dense: &[f32],
        rows: usize,
        cols: usize,
        primes: &PrimeTable,
        threshold: f32,
    ) -> Result<Self> {
        if dense.len() != rows * cols {
            return Err(EngineError::shape("dense matrix", rows * cols, dense.len()));
        }
        if let Some(bad) = dense.iter().find(|v| !v.is_finite()) {
            return Err(EngineError::Numeric(format!("cannot encode non-finite weight {bad}")));
        }

        let pv = primes.values();
        let n_codes = ENCODE_SEARCH_CODES.min(pv.len());

        let mut values = Vec::new();
        let mut deltas = Vec::new();
        let mut codes = Vec::new();
        let mut row_pointers = Vec::with_capacity(rows + 1);
        let mut scales = Vec::with_capacity(rows);
        row_pointers.push(0u32);

        for r in 0..rows {
            let row = &dense[r * cols..(r + 1) * cols];
            let abs_max = row
                .iter()
                .filter(|v| v.abs() > threshold)
                .map(|v| v.abs())
                .fold(0.0f32, f32::max);
            let scale = if abs_max > 0.0 { abs_max / (127.0 * pv[0]) } else { 1.0 };
            scales.push(scale);

            let mut prev = 0usize;
            for (c, &w) in row.iter().enumerate() {
                if w.abs() <= threshold {
                    continue;
                }
                let Some((code, q)) = best_code(w, scale, &pv[..n_codes]) else {
                    continue;
                };

                let mut gap = c - prev;
                while gap > u16::MAX as usize {
                    values.push(0i8);
                    deltas.push(u16::MAX);
                    codes.push(0u16);
                    gap -= u16::MAX as usize;
                }
                values.push(q);
                deltas.push(gap as u16);
                codes.push(code as u16);
                prev = c;
            }
            let nnz = u32::try_from(values.len())
                .map_err(|_| EngineError::Format("more than u32::MAX entries".into()))?;
            row_pointers.push(nnz);
        }

        SparseMatrix::new(rows, cols, values, deltas, row_pointers, codes, scales, primes)
    }
}

fn best_code(w: f32, scale: f32, pv: &[f32]) -> Option<(usize, i8)> {
    let mut best: Option<(usize, i8, f32)> = None;
    for (code, &p) in pv.iter().enumerate() {
        let step = p * scale;
        let q = (w / step).round().clamp(-127.0, 127.0);
        if q == 0.0 {
            continue;
        }
        let err = (q * step - w).abs();
        if best.map_or(true, |(_, _, e)| err < e) {
            best = Some((code, q as i8, err));
        }
    }
    best.map(|(c, q, _)| (c, q))
}
