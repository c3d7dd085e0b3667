// =============================================================================
// model/synthetic.rs — Deterministic small models for tests and benches
// =============================================================================
//
// Weights come from a seeded LCG, roughly half of them zeroed, scaled by
// 1/sqrt(fan_in) so activations stay O(1) through the layers. Norm vectors
// are all ones. Same seed and config give byte-identical files.
// =============================================================================

use std::path::Path;

use crate::error::Result;
use crate::primes::PrimeTable;
use crate::sparse::SparseMatrix;

use super::config::ModelConfig;
use super::directory::TensorKind;
use super::writer::ModelWriter;

/// Fraction of generated weights forced to zero.
const SPARSITY: f32 = 0.5;

struct Lcg(u64);

impl Lcg {
    /// Uniform in [0, 1].
    fn next_unit(&mut self) -> f32 {
        self.0 = self.0.wrapping_mul(1103515245).wrapping_add(12345);
        ((self.0 >> 16) & 0xFFFF) as f32 / 65535.0
    }
}

fn random_sparse(
    rng: &mut Lcg,
    rows: usize,
    cols: usize,
    primes: &PrimeTable,
) -> Result<SparseMatrix<'static>> {
    let amp = 1.0 / (cols as f32).sqrt();
    let dense: Vec<f32> = (0..rows * cols)
        .map(|_| {
            let keep = rng.next_unit() >= SPARSITY;
            let v = (rng.next_unit() * 2.0 - 1.0) * amp;
            if keep { v } else { 0.0 }
        })
        .collect();
    SparseMatrix::encode_dense(&dense, rows, cols, primes, 0.0)
}

/// Build the writer for a synthetic model without touching the filesystem.
pub fn synthetic_writer(cfg: &ModelConfig, seed: u64) -> Result<ModelWriter> {
    let primes = PrimeTable::generate(cfg.prime_codes)?;
    let mut rng = Lcg(seed);
    let mut w = ModelWriter::new(cfg.clone());

    let (rows, cols) = TensorKind::Embedding.expected_shape(cfg);
    w.add_sparse(None, TensorKind::Embedding, random_sparse(&mut rng, rows, cols, &primes)?)?;

    for l in 0..cfg.n_layers {
        for kind in TensorKind::PER_LAYER {
            let (rows, cols) = kind.expected_shape(cfg);
            if kind.is_dense() {
                w.add_dense(Some(l), kind, vec![1.0; rows])?;
            } else {
                w.add_sparse(Some(l), kind, random_sparse(&mut rng, rows, cols, &primes)?)?;
            }
        }
    }

    w.add_dense(None, TensorKind::FinalNorm, vec![1.0; cfg.dim])?;
    let (rows, cols) = TensorKind::Output.expected_shape(cfg);
    w.add_sparse(None, TensorKind::Output, random_sparse(&mut rng, rows, cols, &primes)?)?;
    Ok(w)
}

pub fn synthetic_model_bytes(cfg: &ModelConfig, seed: u64) -> Result<Vec<u8>> {
    synthetic_writer(cfg, seed)?.to_bytes()
}

/// Write a synthetic model file to `path`.
pub fn synthetic_model(path: &Path, cfg: &ModelConfig, seed: u64) -> Result<()> {
    synthetic_writer(cfg, seed)?.write(path)?;
    tracing::info!(
        path = %path.display(),
        layers = cfg.n_layers,
        dim = cfg.dim,
        params_m = cfg.param_count() as f64 / 1e6,
        "[model] created synthetic model"
    );
    Ok(())
}
