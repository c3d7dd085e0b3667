// =============================================================================
// engine/session.rs — Decode session: state machine, cache ownership, fallback
// =============================================================================
//
//   Uninitialized ──warm_up──▶ Warmed ──generate_step──▶ Generating ─┐
//                                                           ▲        │
//                                                           └─step───┘
//
//   any state ──close / fatal device error──▶ Closed
//
// A session owns its KV-Cache and scratch buffers; `&mut self` on every step
// keeps it single-writer. The model and context are shared via `Arc`.
// There is no way back to `Warmed`: once the cache is full, start a new
// session over the same model.
//
// Error policy per step:
//   - rejected before any state changes: closed session, bad token id,
//     cache at capacity (ContextFull)
//   - failure mid-step: staged K/V rows are rolled back, position unchanged
//   - device failure: retried once on the CPU when `cpu_fallback` is set,
//     otherwise the session closes
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::kernel::{CpuBackend, SpmvBackend};
use crate::kv_cache::KvCache;
use crate::model::ModelFile;
use crate::tensor::{argmax, RopeTable};

use super::dispatch::{Dispatcher, StepCounters};
use super::layer::LayerBackend;
use super::scratch::Scratch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Warmed,
    Generating,
    Closed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// Committed decode steps.
    pub tokens: u64,
    pub layers_evaluated: u64,
    pub accel_dispatches: u64,
    pub cpu_dispatches: u64,
    /// Device failures that were absorbed by switching to the CPU.
    pub fallbacks: u64,
    /// Steps that returned an error after touching the cache.
    pub failed_steps: u64,
}

/// Picks the next token from a logit vector.
pub trait Sampler {
    fn sample(&mut self, logits: &[f32]) -> usize;
}

impl<F: FnMut(&[f32]) -> usize> Sampler for F {
    fn sample(&mut self, logits: &[f32]) -> usize {
        self(logits)
    }
}

/// Highest logit wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct Greedy;

impl Sampler for Greedy {
    fn sample(&mut self, logits: &[f32]) -> usize {
        argmax(logits).unwrap_or(0)
    }
}

/// Buffers that exist from warm-up until close.
struct Runtime {
    scratch: Scratch,
    kv: KvCache,
    rope: RopeTable,
}

pub struct Session {
    ctx: Arc<EngineContext>,
    model: Arc<ModelFile>,
    state: SessionState,
    capacity: usize,
    runtime: Option<Runtime>,
    cpu: CpuBackend,
    accel: Option<Arc<dyn LayerBackend>>,
    use_accel: bool,
    stats: SessionStats,
}

impl Session {
    pub fn new(ctx: Arc<EngineContext>, model: Arc<ModelFile>) -> Result<Self> {
        let cfg = model.config();
        if ctx.primes().len() < cfg.prime_codes {
            return Err(EngineError::Config(format!(
                "model needs {} prime codes, context table has {}",
                cfg.prime_codes,
                ctx.primes().len()
            )));
        }
        let capacity = match ctx.config().max_seq_len {
            Some(n) if n > cfg.max_seq_len => {
                return Err(EngineError::Config(format!(
                    "max_seq_len {n} exceeds the model's {}",
                    cfg.max_seq_len
                )))
            }
            Some(n) => n,
            None => cfg.max_seq_len,
        };

        let accel = ctx
            .accelerator()
            .map(|a| Arc::clone(a) as Arc<dyn LayerBackend>);
        Ok(Self {
            cpu: ctx.cpu_backend(),
            use_accel: accel.is_some(),
            accel,
            ctx,
            model,
            state: SessionState::Uninitialized,
            capacity,
            runtime: None,
            stats: SessionStats::default(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn model(&self) -> &Arc<ModelFile> {
        &self.model
    }

    /// Maximum number of positions this session can decode.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Committed positions so far.
    pub fn position(&self) -> usize {
        self.runtime.as_ref().map_or(0, |rt| rt.kv.position())
    }

    pub fn kv_cache(&self) -> Option<&KvCache> {
        self.runtime.as_ref().map(|rt| &rt.kv)
    }

    /// Name of the backend the next step will run on.
    pub fn backend_name(&self) -> &'static str {
        self.active_backend().name()
    }

    fn active_backend(&self) -> &dyn LayerBackend {
        match (&self.accel, self.use_accel) {
            (Some(a), true) => &**a,
            _ => &self.cpu,
        }
    }

    /// Run steps on `backend` as if it were the context's accelerator.
    #[cfg(test)]
    pub(crate) fn with_device_backend(mut self, backend: Arc<dyn LayerBackend>) -> Self {
        self.accel = Some(backend);
        self.use_accel = true;
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(EngineError::SessionClosed);
        }
        Ok(())
    }

    /// Allocate scratch, KV-Cache and RoPE tables and optionally page in the
    /// weights. A no-op once warmed.
    pub fn warm_up(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.runtime.is_some() {
            return Ok(());
        }
        let cfg = self.model.config();
        let scratch = Scratch::new(cfg);
        let kv = KvCache::new(cfg.n_layers, cfg.n_heads, cfg.head_dim, self.capacity)?;
        let rope = RopeTable::new(cfg.head_dim, self.capacity, cfg.rope_theta)?;

        if self.ctx.config().prefetch {
            for l in 0..cfg.n_layers {
                if let Err(e) = self.model.prefetch_layer(l) {
                    warn!(layer = l, error = %e, "[session] prefetch hint failed");
                }
            }
        }

        debug!(
            capacity = self.capacity,
            backend = self.active_backend().name(),
            kv_mb = kv.memory_bytes() as f64 / 1e6,
            scratch_kb = scratch.memory_bytes() as f64 / 1e3,
            "[session] warmed up"
        );
        self.runtime = Some(Runtime { scratch, kv, rope });
        self.state = SessionState::Warmed;
        Ok(())
    }

    /// Decode one token and return the logits for the next one.
    pub fn generate_step(&mut self, token: usize) -> Result<&[f32]> {
        self.ensure_open()?;
        if self.state == SessionState::Uninitialized {
            self.warm_up()?;
        }
        let vocab = self.model.config().vocab_size;
        if token >= vocab {
            return Err(EngineError::index("token", token, vocab));
        }
        let pos = self.position();
        if pos >= self.capacity {
            return Err(EngineError::ContextFull {
                capacity: self.capacity,
            });
        }

        let mut outcome = self.run_step(self.use_accel, token, pos);
        if let Err(EngineError::Device(msg)) = &outcome {
            if self.use_accel && self.ctx.config().cpu_fallback {
                warn!(error = %msg, position = pos, "[session] device failed, falling back to cpu");
                self.use_accel = false;
                self.stats.fallbacks += 1;
                outcome = self.run_step(false, token, pos);
            } else {
                warn!(error = %msg, position = pos, "[session] device failed, closing session");
                let err = EngineError::Device(msg.clone());
                self.close();
                return Err(err);
            }
        }

        match outcome {
            Ok(()) => {
                self.state = SessionState::Generating;
                match &self.runtime {
                    Some(rt) => Ok(&rt.scratch.logits),
                    None => Err(EngineError::SessionClosed),
                }
            }
            Err(e) => {
                self.stats.failed_steps += 1;
                Err(e)
            }
        }
    }

    /// One forward pass. Commits the staged K/V rows on success and rolls
    /// them back on failure.
    fn run_step(&mut self, on_accel: bool, token: usize, pos: usize) -> Result<()> {
        let Some(rt) = self.runtime.as_mut() else {
            return Err(EngineError::SessionClosed);
        };
        let backend: &dyn LayerBackend = match (&self.accel, on_accel) {
            (Some(a), true) => &**a,
            _ => &self.cpu,
        };
        let Runtime { scratch, kv, rope } = rt;
        let dispatcher = Dispatcher {
            model: &self.model,
            backend,
            rope: &*rope,
        };

        let result: Result<StepCounters> = self
            .ctx
            .install(|| dispatcher.forward(scratch, kv, token, pos));

        match result {
            Ok(c) => {
                kv.commit();
                self.stats.tokens += 1;
                self.stats.layers_evaluated += c.layers as u64;
                if on_accel && self.accel.is_some() {
                    self.stats.accel_dispatches += c.dispatches as u64;
                } else {
                    self.stats.cpu_dispatches += c.dispatches as u64;
                }
                Ok(())
            }
            Err(e) => {
                kv.rollback();
                Err(e)
            }
        }
    }

    /// Feed `prompt`, then sample up to `max_new` tokens. `cancel` is polled
    /// before every step; a step already running is never interrupted.
    ///
    /// On cancellation every finished step stays committed and the session
    /// remains usable.
    pub fn generate(
        &mut self,
        prompt: &[usize],
        max_new: usize,
        sampler: &mut dyn Sampler,
        cancel: &AtomicBool,
    ) -> Result<Vec<usize>> {
        self.ensure_open()?;
        if prompt.is_empty() {
            return Err(EngineError::shape("prompt tokens", 1, 0));
        }

        let mut next = 0;
        for &t in prompt {
            if cancel.load(Ordering::Relaxed) {
                return Err(EngineError::Cancelled);
            }
            next = sampler.sample(self.generate_step(t)?);
        }

        let mut out = Vec::with_capacity(max_new);
        while out.len() < max_new {
            out.push(next);
            if out.len() == max_new {
                break;
            }
            if cancel.load(Ordering::Relaxed) {
                return Err(EngineError::Cancelled);
            }
            next = sampler.sample(self.generate_step(next)?);
        }
        info!(
            prompt = prompt.len(),
            generated = out.len(),
            position = self.position(),
            "[session] generation finished"
        );
        Ok(out)
    }

    /// Release buffers. Every later call fails with `SessionClosed`.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.runtime = None;
        self.state = SessionState::Closed;
        debug!(
            tokens = self.stats.tokens,
            fallbacks = self.stats.fallbacks,
            "[session] closed"
        );
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("position", &self.position())
            .field("capacity", &self.capacity)
            .field("backend", &self.active_backend().name())
            .finish()
    }
}
