// =============================================================================
// model/config.rs — Runtime model configuration
// =============================================================================

use super::constants::{DEFAULT_NORM_EPS, DEFAULT_ROPE_THETA, MAGIC, VERSION};
use super::header::FileHeader;

/// Runtime copy of the header values, in usize where the code indexes with them.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub n_layers: usize,
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_heads: usize,
    pub head_dim: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub prime_codes: usize,
    pub rope_theta: f32,
    pub norm_eps: f32,
}

impl ModelConfig {
    pub fn from_header(h: &FileHeader) -> Self {
        let dim = h.dim as usize;
        let n_heads = h.n_heads as usize;
        Self {
            n_layers: h.n_layers as usize,
            dim,
            hidden_dim: h.hidden_dim as usize,
            n_heads,
            head_dim: dim / n_heads.max(1),
            vocab_size: h.vocab_size as usize,
            max_seq_len: h.max_seq_len as usize,
            prime_codes: h.prime_codes as usize,
            rope_theta: h.rope_theta,
            norm_eps: h.norm_eps,
        }
    }

    /// Small shape for tests and demos.
    pub fn tiny() -> Self {
        Self {
            n_layers: 2,
            dim: 32,
            hidden_dim: 64,
            n_heads: 4,
            head_dim: 8,
            vocab_size: 64,
            max_seq_len: 32,
            prime_codes: 64,
            rope_theta: DEFAULT_ROPE_THETA,
            norm_eps: DEFAULT_NORM_EPS,
        }
    }

    pub(crate) fn to_header(&self, n_tensors: u32, directory_offset: u64) -> FileHeader {
        FileHeader {
            magic: MAGIC,
            version: VERSION,
            n_layers: self.n_layers as u32,
            dim: self.dim as u32,
            hidden_dim: self.hidden_dim as u32,
            n_heads: self.n_heads as u32,
            vocab_size: self.vocab_size as u32,
            max_seq_len: self.max_seq_len as u32,
            prime_codes: self.prime_codes as u32,
            n_tensors,
            rope_theta: self.rope_theta,
            norm_eps: self.norm_eps,
            directory_offset,
        }
    }

    /// Dense-equivalent parameter count (what the file would hold uncompressed).
    pub fn param_count(&self) -> usize {
        let dim = self.dim;
        let hidden = self.hidden_dim;
        let embed = self.vocab_size * dim;
        let per_layer = 4 * dim * dim + 3 * dim * hidden + 2 * dim;
        embed + self.n_layers * per_layer + dim + self.vocab_size * dim
    }

    /// Floats held by one session's KV-Cache at full capacity.
    pub fn kv_floats(&self, capacity: usize) -> usize {
        2 * self.n_layers * self.n_heads * capacity * self.head_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let cfg = ModelConfig::tiny();
        let h = cfg.to_header(21, 128);
        assert!(h.validate().is_ok());
        assert_eq!(ModelConfig::from_header(&h), cfg);
    }

    #[test]
    fn test_param_count() {
        let cfg = ModelConfig::tiny();
        // embed + out: 2*64*32, per layer: 4*32*32 + 3*32*64 + 64
        let expected = 2 * 64 * 32 + 2 * (4 * 32 * 32 + 3 * 32 * 64 + 64) + 32;
        assert_eq!(cfg.param_count(), expected);
        assert_eq!(cfg.kv_floats(10), 2 * 2 * 4 * 10 * 8);
    }
}
