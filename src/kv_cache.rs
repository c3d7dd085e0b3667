// =============================================================================
// kv_cache.rs — Per-session key/value history
// =============================================================================
//
// Layout: keys and values in two flat buffers, [layer][head][pos][head_dim].
// One head's history is therefore a contiguous run, which is what attention
// streams over.
//
// Positions are written in two phases:
//   - a step writes position `cursor` for every (layer, head): staged
//   - `commit` makes it visible as history and advances the cursor
//   - `rollback` forgets whatever the step staged
//
// The cache is a hard ceiling. A write at `capacity` is `ContextFull`; the
// cursor never wraps. Reads past what a (layer, head) has staged are index
// errors, never zeros.
// =============================================================================

use crate::error::{EngineError, Result};

/// Borrowed history of one (layer, head): `len` rows of `head_dim` each.
#[derive(Debug, Clone, Copy)]
pub struct KvView<'a> {
    keys: &'a [f32],
    values: &'a [f32],
    head_dim: usize,
}

impl<'a> KvView<'a> {
    pub fn new(keys: &'a [f32], values: &'a [f32], head_dim: usize) -> Result<Self> {
        if head_dim == 0 || keys.len() % head_dim != 0 {
            return Err(EngineError::shape("kv view keys", head_dim, keys.len()));
        }
        if values.len() != keys.len() {
            return Err(EngineError::shape("kv view values", keys.len(), values.len()));
        }
        Ok(Self {
            keys,
            values,
            head_dim,
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len() / self.head_dim
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Every key row back to back, `len × head_dim`.
    pub fn keys(&self) -> &'a [f32] {
        self.keys
    }

    pub fn values(&self) -> &'a [f32] {
        self.values
    }

    #[inline]
    pub fn key(&self, t: usize) -> &'a [f32] {
        &self.keys[t * self.head_dim..(t + 1) * self.head_dim]
    }

    #[inline]
    pub fn value(&self, t: usize) -> &'a [f32] {
        &self.values[t * self.head_dim..(t + 1) * self.head_dim]
    }
}

#[derive(Clone)]
pub struct KvCache {
    n_layers: usize,
    n_heads: usize,
    head_dim: usize,
    capacity: usize,
    keys: Vec<f32>,
    values: Vec<f32>,
    /// Per (layer, head): number of positions readable, committed or staged.
    staged: Vec<usize>,
    /// Committed positions.
    cursor: usize,
}

impl KvCache {
    pub fn new(n_layers: usize, n_heads: usize, head_dim: usize, capacity: usize) -> Result<Self> {
        if n_layers == 0 || n_heads == 0 || head_dim == 0 || capacity == 0 {
            return Err(EngineError::Config(format!(
                "kv cache dimensions must be non-zero: layers={n_layers} heads={n_heads} \
                 head_dim={head_dim} capacity={capacity}"
            )));
        }
        let floats = n_layers
            .checked_mul(n_heads)
            .and_then(|v| v.checked_mul(capacity))
            .and_then(|v| v.checked_mul(head_dim))
            .ok_or_else(|| EngineError::Config("kv cache size overflows usize".into()))?;

        let alloc = |what: &str| {
            let mut v: Vec<f32> = Vec::new();
            v.try_reserve_exact(floats).map_err(|e| {
                EngineError::Config(format!("cannot allocate kv {what} ({floats} floats): {e}"))
            })?;
            v.resize(floats, 0.0);
            Ok::<_, EngineError>(v)
        };

        let cache = Self {
            n_layers,
            n_heads,
            head_dim,
            capacity,
            keys: alloc("keys")?,
            values: alloc("values")?,
            staged: vec![0; n_layers * n_heads],
            cursor: 0,
        };
        tracing::debug!(
            layers = n_layers,
            heads = n_heads,
            head_dim,
            capacity,
            mb = cache.memory_bytes() as f64 / 1e6,
            "[kv] allocated"
        );
        Ok(cache)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of committed positions.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    pub fn is_full(&self) -> bool {
        self.cursor >= self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.cursor
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn memory_bytes(&self) -> usize {
        (self.keys.len() + self.values.len()) * std::mem::size_of::<f32>()
    }

    fn slot(&self, layer: usize, head: usize) -> Result<usize> {
        if layer >= self.n_layers {
            return Err(EngineError::index("kv layer", layer, self.n_layers));
        }
        if head >= self.n_heads {
            return Err(EngineError::index("kv head", head, self.n_heads));
        }
        Ok(layer * self.n_heads + head)
    }

    fn row_base(&self, slot: usize) -> usize {
        slot * self.capacity * self.head_dim
    }

    /// Store one position of one head. Only the open position (`cursor`)
    /// is writable; committed rows are immutable so `rollback` can always
    /// restore them.
    pub fn write(&mut self, layer: usize, head: usize, pos: usize, k: &[f32], v: &[f32]) -> Result<()> {
        let slot = self.slot(layer, head)?;
        if pos >= self.capacity {
            return Err(EngineError::ContextFull {
                capacity: self.capacity,
            });
        }
        if pos > self.cursor {
            return Err(EngineError::index("kv write position", pos, self.cursor + 1));
        }
        if pos < self.cursor {
            return Err(EngineError::index("kv write position (committed)", pos, self.cursor));
        }
        if k.len() != self.head_dim {
            return Err(EngineError::shape("kv key", self.head_dim, k.len()));
        }
        if v.len() != self.head_dim {
            return Err(EngineError::shape("kv value", self.head_dim, v.len()));
        }
        let at = self.row_base(slot) + pos * self.head_dim;
        self.keys[at..at + self.head_dim].copy_from_slice(k);
        self.values[at..at + self.head_dim].copy_from_slice(v);
        self.staged[slot] = self.staged[slot].max(pos + 1);
        Ok(())
    }

    /// History rows `[start, end)` of one head.
    pub fn read_range(&self, layer: usize, head: usize, start: usize, end: usize) -> Result<KvView<'_>> {
        let slot = self.slot(layer, head)?;
        let written = self.staged[slot];
        if end > written {
            return Err(EngineError::index("kv read position", end, written + 1));
        }
        if start > end {
            return Err(EngineError::index("kv read start", start, end + 1));
        }
        let base = self.row_base(slot);
        let (lo, hi) = (base + start * self.head_dim, base + end * self.head_dim);
        Ok(KvView {
            keys: &self.keys[lo..hi],
            values: &self.values[lo..hi],
            head_dim: self.head_dim,
        })
    }

    /// Advance past the staged position if every (layer, head) wrote it;
    /// otherwise the partial writes are dropped. Returns the new position.
    pub fn commit(&mut self) -> usize {
        let next = self.cursor + 1;
        if self.staged.iter().all(|&s| s >= next) {
            self.cursor = next;
        } else {
            tracing::warn!(position = self.cursor, "[kv] incomplete step discarded at commit");
        }
        self.staged.fill(self.cursor);
        self.cursor
    }

    /// Forget everything staged since the last commit.
    pub fn rollback(&mut self) {
        self.staged.fill(self.cursor);
    }

}

impl std::fmt::Debug for KvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCache")
            .field("layers", &self.n_layers)
            .field("heads", &self.n_heads)
            .field("head_dim", &self.head_dim)
            .field("position", &self.cursor)
            .field("capacity", &self.capacity)
            .finish()
    }
}
