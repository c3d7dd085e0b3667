// =============================================================================
// context.rs — EngineContext: shared read-only state, passed explicitly
// =============================================================================
//
// Holds what every model and session needs but nothing should own globally:
//
//   - the PrimeTable (built once, shared via Arc)
//   - a persistent rayon pool, allocated up front and reused by every
//     dispatch so no thread is spawned on the token path
//   - the compiled accelerator pipeline, if one was requested and found
//   - the EngineConfig it was built from
//
// A context outlives the models loaded against it; sessions hold an Arc.
// =============================================================================

use std::sync::Arc;

use tracing::{info, warn};

use crate::accel::Accelerator;
use crate::config::{BackendKind, EngineConfig};
use crate::error::{EngineError, Result};
use crate::kernel::CpuBackend;
use crate::primes::PrimeTable;

pub struct EngineContext {
    primes: Arc<PrimeTable>,
    pool: rayon::ThreadPool,
    accel: Option<Arc<Accelerator>>,
    config: EngineConfig,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let primes = Arc::new(PrimeTable::generate(config.prime_table_len)?);

        let mut builder =
            rayon::ThreadPoolBuilder::new().thread_name(|i| format!("mdcsr-worker-{i}"));
        if let Some(n) = config.num_threads {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| EngineError::Config(format!("thread pool: {e}")))?;

        let accel = match config.backend {
            BackendKind::Cpu => None,
            BackendKind::Gpu => Some(Arc::new(Accelerator::new(&primes)?)),
            BackendKind::Auto => match Accelerator::new(&primes) {
                Ok(a) => Some(Arc::new(a)),
                Err(e) => {
                    warn!(error = %e, "[context] accelerator unavailable, using cpu");
                    None
                }
            },
        };

        info!(
            primes = primes.len(),
            threads = pool.current_num_threads(),
            accelerator = accel.is_some(),
            "[context] engine context ready"
        );

        Ok(Self {
            primes,
            pool,
            accel,
            config,
        })
    }

    /// CPU-only context with default settings.
    pub fn cpu() -> Result<Self> {
        Self::new(EngineConfig::cpu())
    }

    pub fn primes(&self) -> &Arc<PrimeTable> {
        &self.primes
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn accelerator(&self) -> Option<&Arc<Accelerator>> {
        self.accel.as_ref()
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `f` on this context's worker pool. Every rayon parallel iterator
    /// inside `f` uses these workers.
    pub fn install<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(f)
    }

    pub fn cpu_backend(&self) -> CpuBackend {
        CpuBackend::new(Arc::clone(&self.primes), self.config.min_rows_per_task)
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("primes", &self.primes.len())
            .field("threads", &self.pool.current_num_threads())
            .field("accelerator", &self.accel.is_some())
            .finish()
    }
}
