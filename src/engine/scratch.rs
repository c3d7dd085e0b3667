// =============================================================================
// engine/scratch.rs — Per-session activation buffers
// =============================================================================
//
// Allocated once at warm-up and reused by every step; the token path never
// allocates. The device workspace is created by the accelerator on the first
// layer it runs for this session.
// =============================================================================

use crate::model::ModelConfig;

pub(crate) struct Scratch {
    /// Residual stream [dim]
    pub x: Vec<f32>,
    /// Normalised input to the current sub-block [dim]
    pub xb: Vec<f32>,
    /// q, k and v back to back [3 × dim]
    pub qkv: Vec<f32>,
    /// Concatenated head outputs [dim]
    pub att_out: Vec<f32>,
    /// Gate and up activations [hidden_dim]
    pub hb: Vec<f32>,
    pub hb2: Vec<f32>,
    pub logits: Vec<f32>,
    #[cfg(feature = "gpu")]
    pub device: Option<crate::accel::LayerWorkspace>,
}

impl Scratch {
    pub fn new(cfg: &ModelConfig) -> Self {
        let dim = cfg.dim;
        let hidden = cfg.hidden_dim;
        Self {
            x: vec![0.0; dim],
            xb: vec![0.0; dim],
            qkv: vec![0.0; 3 * dim],
            att_out: vec![0.0; dim],
            hb: vec![0.0; hidden],
            hb2: vec![0.0; hidden],
            logits: vec![0.0; cfg.vocab_size],
            #[cfg(feature = "gpu")]
            device: None,
        }
    }

    pub fn memory_bytes(&self) -> usize {
        (self.x.len()
            + self.xb.len()
            + self.qkv.len()
            + self.att_out.len()
            + self.hb.len()
            + self.hb2.len()
            + self.logits.len())
            * std::mem::size_of::<f32>()
    }
}
