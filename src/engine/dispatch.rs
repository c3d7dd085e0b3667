// =============================================================================
// engine/dispatch.rs — Decode step: embedding, fused layers, output head
// =============================================================================
//
// One decode step for token t at position p:
//
//   x = embedding[t]
//   for each layer:
//     forward_layer(x, p)                   (one backend dispatch)
//   logits = Output · rmsnorm(x, final_norm)
//
// Layers run strictly in order. Parallelism lives inside a dispatch: rows in
// the sparse projections, heads in attention.
// =============================================================================

use crate::error::{EngineError, Result};
use crate::kernel::SpmvJob;
use crate::kv_cache::KvCache;
use crate::model::{ModelFile, TensorKind};
use crate::tensor::{rmsnorm, RopeTable};

use super::layer::{LayerBackend, LayerStep};
use super::scratch::Scratch;

pub(crate) const DISPATCHES_PER_LAYER: usize = 1;

/// Work done by one step, folded into the session stats.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct StepCounters {
    pub layers: usize,
    pub dispatches: usize,
}

pub(crate) struct Dispatcher<'a> {
    pub model: &'a ModelFile,
    pub backend: &'a dyn LayerBackend,
    pub rope: &'a RopeTable,
}

fn check_finite(v: &[f32], what: &str) -> Result<()> {
    match v.iter().position(|x| !x.is_finite()) {
        None => Ok(()),
        Some(i) => Err(EngineError::Numeric(format!("{what}[{i}] = {}", v[i]))),
    }
}

impl Dispatcher<'_> {
    /// Run every layer for `token` at `pos` and leave logits in `s.logits`.
    /// K/V rows for `pos` are staged in `kv`; the caller commits or rolls back.
    pub fn forward(
        &self,
        s: &mut Scratch,
        kv: &mut KvCache,
        token: usize,
        pos: usize,
    ) -> Result<StepCounters> {
        let cfg = self.model.config();
        let mut counters = StepCounters::default();

        self.model
            .embedding()?
            .decode_row(self.model.primes(), token, &mut s.x)?;

        for l in 0..cfg.n_layers {
            let w = self.model.get_layer(l)?;
            self.backend.forward_layer(LayerStep {
                model: self.model,
                weights: &w,
                rope: self.rope,
                pos,
                kv: &mut *kv,
                scratch: &mut *s,
            })?;
            check_finite(&s.x, "residual stream").map_err(|e| match e {
                EngineError::Numeric(m) => EngineError::Numeric(format!("layer {l}: {m}")),
                other => other,
            })?;
            counters.layers += 1;
            counters.dispatches += DISPATCHES_PER_LAYER;
        }

        rmsnorm(&mut s.xb, &s.x, self.model.final_norm()?, cfg.norm_eps);
        let output = self.model.output()?;
        let key = self.model.cache_key(None, TensorKind::Output);
        self.backend
            .run(&mut [SpmvJob::new(&output, &s.xb, &mut s.logits).keyed(key)])?;
        counters.dispatches += 1;
        check_finite(&s.logits, "logits")?;
        Ok(counters)
    }
}
