// =============================================================================
// accel/ — wgpu accelerator (feature "gpu")
// =============================================================================
//
// Runs standalone SpMV jobs (`SpmvBackend`) and whole transformer layers
// (`LayerBackend`) on the device. Without the feature, `Accelerator::new`
// always fails with a `Device` error and the engine stays on the CPU backend.
// =============================================================================

#[cfg(feature = "gpu")]
mod device;
#[cfg(feature = "gpu")]
mod layer;
#[cfg(feature = "gpu")]
mod spmv;


#[cfg(feature = "gpu")]
pub(crate) use layer::LayerWorkspace;
#[cfg(feature = "gpu")]
pub use spmv::MAX_SHARED_PRIMES;

#[cfg(not(feature = "gpu"))]
use crate::error::EngineError;
use crate::engine::{LayerBackend, LayerStep};
use crate::error::Result;
#[cfg(feature = "gpu")]
use crate::kernel::check_job;
use crate::kernel::{SpmvBackend, SpmvJob};
use crate::primes::PrimeTable;
use crate::sparse::SparseMatrix;

#[cfg(feature = "gpu")]
pub struct Accelerator {
    pipeline: spmv::SpmvPipeline,
    layers: layer::LayerPipelines,
}

#[cfg(feature = "gpu")]
impl Accelerator {
    /// Open the default adapter and build the pipelines for `primes`.
    pub fn new(primes: &PrimeTable) -> Result<Self> {
        let gpu = device::GpuDevice::open()?;
        let pipeline = spmv::SpmvPipeline::new(gpu, primes)?;
        let layers = layer::LayerPipelines::new(pipeline.gpu())?;
        tracing::info!(
            adapter = pipeline.adapter_name(),
            primes = primes.len(),
            "[accel] pipelines ready"
        );
        Ok(Self { pipeline, layers })
    }

    pub fn adapter_name(&self) -> &str {
        self.pipeline.adapter_name()
    }

    /// Number of sparse tensors whose buffers are resident on the device.
    pub fn cached_matrices(&self) -> usize {
        self.pipeline.cached_matrices()
    }

    /// Release every device buffer cached for model `id`.
    pub fn evict_model(&self, id: u64) -> usize {
        self.pipeline.evict_model(id)
    }

    /// `xs` is `[batch × cols]`; the result is `[batch × rows]`.
    pub fn spmv_batch(
        &self,
        m: &SparseMatrix<'_>,
        cache_key: Option<u64>,
        xs: &[f32],
        batch: usize,
    ) -> Result<Vec<f32>> {
        let job = spmv::DeviceJob {
            matrix: m,
            cache_key,
            x: xs,
            batch,
        };
        let mut out = self.pipeline.dispatch(std::slice::from_ref(&job))?;
        Ok(out.pop().unwrap_or_default())
    }
}

#[cfg(feature = "gpu")]
impl SpmvBackend for Accelerator {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn run(&self, jobs: &mut [SpmvJob<'_>]) -> Result<()> {
        for job in jobs.iter() {
            check_job(job)?;
        }
        let device_jobs: Vec<spmv::DeviceJob<'_>> = jobs
            .iter()
            .map(|j| spmv::DeviceJob {
                matrix: j.matrix,
                cache_key: j.cache_key,
                x: j.x,
                batch: 1,
            })
            .collect();
        let results = self.pipeline.dispatch(&device_jobs)?;
        for (job, y) in jobs.iter_mut().zip(results) {
            if !y.is_empty() {
                job.out.copy_from_slice(&y);
            }
        }
        Ok(())
    }
}

#[cfg(feature = "gpu")]
impl LayerBackend for Accelerator {
    fn forward_layer(&self, step: LayerStep<'_>) -> Result<()> {
        layer::forward_layer(&self.pipeline, &self.layers, step)
    }
}

// ---------------------------------------------------------------------------
// Built without "gpu"
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpu"))]
pub struct Accelerator {
    never: std::convert::Infallible,
}

#[cfg(not(feature = "gpu"))]
impl Accelerator {
    pub fn new(_primes: &PrimeTable) -> Result<Self> {
        Err(EngineError::Device(
            "accelerator support not compiled in (enable the \"gpu\" feature)".into(),
        ))
    }

    pub fn adapter_name(&self) -> &str {
        match self.never {}
    }

    pub fn cached_matrices(&self) -> usize {
        match self.never {}
    }

    pub fn evict_model(&self, _id: u64) -> usize {
        match self.never {}
    }

    pub fn spmv_batch(
        &self,
        _m: &SparseMatrix<'_>,
        _cache_key: Option<u64>,
        _xs: &[f32],
        _batch: usize,
    ) -> Result<Vec<f32>> {
        match self.never {}
    }
}

#[cfg(not(feature = "gpu"))]
impl SpmvBackend for Accelerator {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn run(&self, _jobs: &mut [SpmvJob<'_>]) -> Result<()> {
        match self.never {}
    }
}

#[cfg(not(feature = "gpu"))]
impl LayerBackend for Accelerator {
    fn forward_layer(&self, _step: LayerStep<'_>) -> Result<()> {
        match self.never {}
    }
}

#[cfg(all(test, not(feature = "gpu")))]
mod tests {
    use super::*;

    #[test]
    fn test_without_feature_is_device_error() {
        let primes = PrimeTable::generate(8).unwrap();
        let err = Accelerator::new(&primes).err().unwrap();
        assert!(matches!(err, EngineError::Device(_)));
        assert!(err.is_recoverable());
    }
}
