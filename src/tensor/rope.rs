// =============================================================================
// tensor/rope.rs — Rotary Position Embedding
// =============================================================================
//
// Pairs are adjacent lanes (2i, 2i+1) inside each head. The angle for pair
// i at position p is p / theta^(2i / head_dim). cos/sin are tabulated once
// per session for every position the cache can hold.
// =============================================================================

use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct RopeTable {
    head_dim: usize,
    max_pos: usize,
    /// [max_pos][head_dim / 2]
    cos: Vec<f32>,
    sin: Vec<f32>,
}

impl RopeTable {
    pub fn new(head_dim: usize, max_pos: usize, theta: f32) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(EngineError::Config(format!(
                "rope head_dim must be even and non-zero, got {head_dim}"
            )));
        }
        if !(theta.is_finite() && theta > 0.0) {
            return Err(EngineError::Config(format!("rope theta must be > 0, got {theta}")));
        }
        let half = head_dim / 2;
        let mut cos = Vec::with_capacity(max_pos * half);
        let mut sin = Vec::with_capacity(max_pos * half);
        for p in 0..max_pos {
            for i in 0..half {
                let freq = 1.0 / (theta as f64).powf((2 * i) as f64 / head_dim as f64);
                let angle = p as f64 * freq;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }
        Ok(Self {
            head_dim,
            max_pos,
            cos,
            sin,
        })
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn max_pos(&self) -> usize {
        self.max_pos
    }

    /// Cosine table, `[max_pos][head_dim / 2]`.
    #[cfg(feature = "gpu")]
    pub(crate) fn cos_table(&self) -> &[f32] {
        &self.cos
    }

    #[cfg(feature = "gpu")]
    pub(crate) fn sin_table(&self) -> &[f32] {
        &self.sin
    }

    /// Rotate every head of `x` (length a multiple of `head_dim`) in place.
    pub fn apply(&self, x: &mut [f32], pos: usize) -> Result<()> {
        if pos >= self.max_pos {
            return Err(EngineError::index("rope position", pos, self.max_pos));
        }
        if x.len() % self.head_dim != 0 {
            return Err(EngineError::shape(
                "rope input",
                x.len().div_ceil(self.head_dim) * self.head_dim,
                x.len(),
            ));
        }
        let half = self.head_dim / 2;
        let cos = &self.cos[pos * half..(pos + 1) * half];
        let sin = &self.sin[pos * half..(pos + 1) * half];
        for head in x.chunks_exact_mut(self.head_dim) {
            for (pair, (&c, &s)) in head.chunks_exact_mut(2).zip(cos.iter().zip(sin)) {
                let (a, b) = (pair[0], pair[1]);
                pair[0] = a * c - b * s;
                pair[1] = a * s + b * c;
            }
        }
        Ok(())
    }
}
