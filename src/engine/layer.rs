// =============================================================================
// engine/layer.rs — One transformer layer as a single backend dispatch
// =============================================================================
//
//   xb  = rmsnorm(x, attn_norm)
//   q,k,v = Wq·xb, Wk·xb, Wv·xb
//   rope(q, p), rope(k, p)
//   kv[layer, h, p] = k_h, v_h            (staged, committed by the session)
//   att_h = attend(q_h, kv[layer, h, 0..=p])
//   x  += Wo·att
//   xb  = rmsnorm(x, ffn_norm)
//   x  += W_down·swiglu(W_gate·xb, W_up·xb)
//
// A backend runs all of it in one go: the CPU inside one rayon region, the
// accelerator as one command buffer with one submit and one readback.
// =============================================================================

use rayon::prelude::*;

use crate::error::Result;
use crate::kernel::{row_dot, CpuBackend, SpmvBackend};
use crate::kv_cache::KvCache;
use crate::model::{LayerWeights, ModelFile};
use crate::tensor::{rmsnorm, streaming_attention, swiglu, RopeTable};

use super::scratch::Scratch;

/// Everything one layer reads and writes. The layer's input and output is
/// `scratch.x`; its K/V rows for `pos` end up staged in `kv`.
pub(crate) struct LayerStep<'s> {
    pub model: &'s ModelFile,
    pub weights: &'s LayerWeights<'s>,
    pub rope: &'s RopeTable,
    pub pos: usize,
    pub kv: &'s mut KvCache,
    pub scratch: &'s mut Scratch,
}

/// A backend the dispatcher can hand a whole layer to.
pub(crate) trait LayerBackend: SpmvBackend {
    fn forward_layer(&self, step: LayerStep<'_>) -> Result<()>;
}

impl LayerBackend for CpuBackend {
    fn forward_layer(&self, step: LayerStep<'_>) -> Result<()> {
        let LayerStep {
            model,
            weights: w,
            rope,
            pos,
            kv,
            scratch: s,
        } = step;
        let cfg = model.config();
        let (dim, hd, eps) = (cfg.dim, cfg.head_dim, cfg.norm_eps);
        let layer = w.index;
        let pv = self.primes().values();
        let min_rows = self.min_rows();

        // ─── attention ───
        rmsnorm(&mut s.xb, &s.x, w.attn_norm, eps);
        let qkv_weights = [&w.wq, &w.wk, &w.wv];
        let xb = &s.xb;
        s.qkv
            .par_iter_mut()
            .with_min_len(min_rows)
            .enumerate()
            .for_each(|(i, y)| *y = row_dot(pv, qkv_weights[i / dim], i % dim, xb));

        let (q, kv_rows) = s.qkv.split_at_mut(dim);
        let (k, v) = kv_rows.split_at_mut(dim);
        rope.apply(q, pos)?;
        rope.apply(k, pos)?;
        for (h, (kh, vh)) in k.chunks_exact(hd).zip(v.chunks_exact(hd)).enumerate() {
            kv.write(layer, h, pos, kh, vh)?;
        }

        // A head with no history keeps its own value projection.
        s.att_out.copy_from_slice(v);
        let history: &KvCache = kv;
        let q: &[f32] = q;
        s.att_out
            .par_chunks_mut(hd)
            .enumerate()
            .try_for_each(|(h, out)| -> Result<()> {
                let view = history.read_range(layer, h, 0, pos + 1)?;
                streaming_attention(&q[h * hd..(h + 1) * hd], &view, out)?;
                Ok(())
            })?;

        let att = &s.att_out;
        s.x.par_iter_mut()
            .with_min_len(min_rows)
            .enumerate()
            .for_each(|(r, x)| *x += row_dot(pv, &w.wo, r, att));

        // ─── gated feed-forward ───
        rmsnorm(&mut s.xb, &s.x, w.ffn_norm, eps);
        let xb = &s.xb;
        s.hb.par_iter_mut()
            .zip(s.hb2.par_iter_mut())
            .with_min_len(min_rows)
            .enumerate()
            .for_each(|(r, (g, u))| {
                *g = row_dot(pv, &w.w_gate, r, xb);
                *u = row_dot(pv, &w.w_up, r, xb);
            });
        swiglu(&mut s.hb, &s.hb2);

        let hb = &s.hb;
        s.x.par_iter_mut()
            .with_min_len(min_rows)
            .enumerate()
            .for_each(|(r, x)| *x += row_dot(pv, &w.w_down, r, hb));
        Ok(())
    }
}
