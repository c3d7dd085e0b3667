// =============================================================================
// kernel/cpu.rs — Row-parallel SpMV on the rayon pool
// =============================================================================
//
// Callers that want the engine's thread pool wrap calls in
// `EngineContext::install`; otherwise rayon's global pool is used.
// =============================================================================

use std::sync::Arc;

use rayon::prelude::*;

use crate::error::{EngineError, Result};
use crate::primes::PrimeTable;
use crate::sparse::SparseMatrix;

use super::{check_job, SpmvBackend, SpmvJob};

/// Default rayon split granularity when no config is at hand.
const DEFAULT_MIN_ROWS: usize = 16;

/// `y = M · x`, freshly allocated.
pub fn spmv(primes: &PrimeTable, m: &SparseMatrix<'_>, x: &[f32]) -> Result<Vec<f32>> {
    let mut out = vec![0.0f32; m.rows()];
    spmv_into(primes, m, x, &mut out, DEFAULT_MIN_ROWS)?;
    Ok(out)
}

/// `out = M · x` into a caller-owned buffer.
pub fn spmv_into(
    primes: &PrimeTable,
    m: &SparseMatrix<'_>,
    x: &[f32],
    out: &mut [f32],
    min_rows_per_task: usize,
) -> Result<()> {
    if x.len() != m.cols() {
        return Err(EngineError::shape("spmv input", m.cols(), x.len()));
    }
    if out.len() != m.rows() {
        return Err(EngineError::shape("spmv output", m.rows(), out.len()));
    }
    let pv = primes.values();
    out.par_iter_mut()
        .with_min_len(min_rows_per_task.max(1))
        .enumerate()
        .for_each(|(r, y)| *y = row_dot(pv, m, r, x));
    Ok(())
}

/// Batched form: `xs` is `[batch × cols]`, result is `[batch × rows]`.
/// Every row is decoded once and applied to all batch vectors.
pub fn spmv_batch(
    primes: &PrimeTable,
    m: &SparseMatrix<'_>,
    xs: &[f32],
    batch: usize,
) -> Result<Vec<f32>> {
    let (rows, cols) = (m.rows(), m.cols());
    if xs.len() != batch * cols {
        return Err(EngineError::shape("spmv batch input", batch * cols, xs.len()));
    }
    let pv = primes.values();

    // Row-major over output rows so the decode work parallelises; transpose
    // into [batch × rows] afterwards.
    let mut by_row = vec![0.0f32; rows * batch];
    if batch > 0 {
        by_row
            .par_chunks_mut(batch)
            .with_min_len(DEFAULT_MIN_ROWS)
            .enumerate()
            .for_each(|(r, acc)| {
                m.for_each_in_row(pv, r, |c, w| {
                    for (b, a) in acc.iter_mut().enumerate() {
                        *a += w * xs[b * cols + c];
                    }
                });
            });
    }

    let mut out = vec![0.0f32; batch * rows];
    for r in 0..rows {
        for b in 0..batch {
            out[b * rows + r] = by_row[r * batch + b];
        }
    }
    Ok(out)
}

/// Decoded row `r` of `m` dotted with `x`.
#[inline(always)]
pub(crate) fn row_dot(pv: &[f32], m: &SparseMatrix<'_>, r: usize, x: &[f32]) -> f32 {
    let mut acc = 0.0f32;
    // Indexing `x[c]` panics on a column that escaped validation; never clamp.
    m.for_each_in_row(pv, r, |c, w| acc += w * x[c]);
    acc
}

// ---------------------------------------------------------------------------
// CpuBackend
// ---------------------------------------------------------------------------

pub struct CpuBackend {
    primes: Arc<PrimeTable>,
    min_rows_per_task: usize,
}

impl CpuBackend {
    pub fn new(primes: Arc<PrimeTable>, min_rows_per_task: usize) -> Self {
        Self {
            primes,
            min_rows_per_task,
        }
    }

    pub(crate) fn primes(&self) -> &PrimeTable {
        &self.primes
    }

    pub(crate) fn min_rows(&self) -> usize {
        self.min_rows_per_task.max(1)
    }
}

impl SpmvBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn run(&self, jobs: &mut [SpmvJob<'_>]) -> Result<()> {
        for job in jobs.iter() {
            check_job(job)?;
        }
        for job in jobs.iter_mut() {
            spmv_into(&self.primes, job.matrix, job.x, job.out, self.min_rows_per_task)?;
        }
        Ok(())
    }
}
