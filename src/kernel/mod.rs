// =============================================================================
// kernel/ — Sparse matrix-vector product (SpMV) over MdCSR
// =============================================================================
//
//   y[r] = Σ_{i ∈ row r}  values[i] * primes[codes[i]] * scales[r] * x[col_i]
//
// Each output row depends only on its own entries, so rows are independent
// units of work. The CPU path splits rows across the rayon pool; the wgpu
// path (`crate::accel`) assigns one invocation per row.
//
// `SpmvBackend` runs standalone products; several jobs that read the same
// input are submitted together so a device backend encodes them into one
// submission and syncs once. The fused dispatcher drives whole layers
// through `engine::LayerBackend`, which builds on this trait.
// =============================================================================

mod cpu;

#[cfg(test)]
mod tests;

pub use cpu::{spmv, spmv_batch, spmv_into, CpuBackend};
pub(crate) use cpu::row_dot;

use crate::error::Result;
use crate::sparse::SparseMatrix;

/// One queued product `out = matrix · x`.
pub struct SpmvJob<'j> {
    /// Stable identity of the matrix for device-side buffer caching.
    /// `None` means upload-per-call.
    pub cache_key: Option<u64>,
    pub matrix: &'j SparseMatrix<'j>,
    pub x: &'j [f32],
    pub out: &'j mut [f32],
}

impl<'j> SpmvJob<'j> {
    pub fn new(matrix: &'j SparseMatrix<'j>, x: &'j [f32], out: &'j mut [f32]) -> Self {
        Self {
            cache_key: None,
            matrix,
            x,
            out,
        }
    }

    pub fn keyed(mut self, key: u64) -> Self {
        self.cache_key = Some(key);
        self
    }
}

pub trait SpmvBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run every job. Outputs are complete when this returns.
    fn run(&self, jobs: &mut [SpmvJob<'_>]) -> Result<()>;
}

/// Check the lengths a job must satisfy before any backend touches it.
pub(crate) fn check_job(job: &SpmvJob<'_>) -> Result<()> {
    use crate::error::EngineError;
    if job.x.len() != job.matrix.cols() {
        return Err(EngineError::shape("spmv input", job.matrix.cols(), job.x.len()));
    }
    if job.out.len() != job.matrix.rows() {
        return Err(EngineError::shape("spmv output", job.matrix.rows(), job.out.len()));
    }
    Ok(())
}
