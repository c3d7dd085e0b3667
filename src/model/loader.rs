// =============================================================================
// model/loader.rs — Memory-mapped model file with zero-copy tensor views
// =============================================================================
//
// Load order:
//   1. open + mmap (Io)
//   2. header: magic and version before anything else (Format)
//   3. prime table coverage against the context (Config)
//   4. directory: ranges, alignment, shapes, completeness (Format)
//   5. every sparse tensor validated once (Format/Numeric); manifold codes
//      must stay below the header's `prime_codes`, whatever table the
//      context happens to hold
//
// A failure at any step drops the mapping; no partial model escapes. After
// that, `get_layer` only re-borrows slices of the mapping: no copy, no
// re-validation. Views are lifetime-bound to the `ModelFile`; dropping it
// unmaps the file.
// =============================================================================

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use memmap2::Mmap;
use tracing::{debug, info};

use crate::accel::Accelerator;
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::primes::PrimeTable;
use crate::sparse::SparseMatrix;

use super::config::ModelConfig;
use super::directory::{DirEntry, Directory, TensorKind, TensorRanges};
use super::header::FileHeader;
use super::prefetch;

/// Weights of one transformer layer, borrowed from the mapping.
#[derive(Debug, Clone)]
pub struct LayerWeights<'m> {
    pub index: usize,
    pub attn_norm: &'m [f32],
    pub wq: SparseMatrix<'m>,
    pub wk: SparseMatrix<'m>,
    pub wv: SparseMatrix<'m>,
    pub wo: SparseMatrix<'m>,
    pub ffn_norm: &'m [f32],
    pub w_gate: SparseMatrix<'m>,
    pub w_up: SparseMatrix<'m>,
    pub w_down: SparseMatrix<'m>,
}

pub struct ModelFile {
    id: u64,
    mmap: Mmap,
    path: PathBuf,
    header: FileHeader,
    config: ModelConfig,
    directory: Directory,
    primes: Arc<PrimeTable>,
    /// Where this model's device buffers live, released on drop.
    accel: Option<Weak<Accelerator>>,
}

/// Distinguishes models loaded into the same context in device buffer caches.
static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(1);

fn tag_tensor(e: EngineError, entry: &DirEntry) -> EngineError {
    let tag = |msg: String| format!("{:?} (layer {}): {msg}", entry.kind, entry.layer);
    match e {
        EngineError::Format(msg) => EngineError::Format(tag(msg)),
        EngineError::Numeric(msg) => EngineError::Numeric(tag(msg)),
        other => other,
    }
}

fn view<'a, T: bytemuck::Pod>(
    data: &'a [u8],
    range: &std::ops::Range<usize>,
    what: &str,
) -> Result<&'a [T]> {
    bytemuck::try_cast_slice(&data[range.clone()])
        .map_err(|e| EngineError::Format(format!("{what} at {range:?}: {e:?}")))
}

impl ModelFile {
    pub fn load(path: &Path, ctx: &EngineContext) -> Result<Self> {
        let io_err = |e| EngineError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        let file = File::open(path).map_err(io_err)?;
        // SAFETY: the file is mapped read-only; the format is immutable once
        // written and the mapping lives as long as every view handed out.
        let mmap = unsafe { Mmap::map(&file) }.map_err(io_err)?;

        let header = FileHeader::from_bytes(&mmap)?;
        header.validate()?;

        let primes = Arc::clone(ctx.primes());
        if primes.len() < header.prime_codes as usize {
            return Err(EngineError::Config(format!(
                "model needs {} prime codes, context table has {}",
                header.prime_codes,
                primes.len()
            )));
        }

        let config = ModelConfig::from_header(&header);
        let directory =
            Directory::parse(&mmap, header.directory_offset, header.n_tensors, &config)?;
        debug!(
            tensors = directory.len(),
            directory_offset = header.directory_offset,
            "[model] directory parsed"
        );

        let mut nnz_total = 0usize;
        for (entry, ranges) in directory.iter() {
            match ranges {
                TensorRanges::Dense(r) => {
                    let v: &[f32] = view(&mmap, r, "dense vector")?;
                    if let Some(bad) = v.iter().find(|x| !x.is_finite()) {
                        return Err(EngineError::Numeric(format!(
                            "{:?} (layer {}) holds non-finite value {bad}",
                            entry.kind, entry.layer
                        )));
                    }
                }
                TensorRanges::Sparse { .. } => {
                    let m = Self::checked_view(&mmap, entry, ranges, header.prime_codes as usize)
                        .map_err(|e| tag_tensor(e, entry))?;
                    nnz_total += m.nnz();
                }
            }
        }

        info!(
            path = %path.display(),
            layers = config.n_layers,
            dim = config.dim,
            heads = config.n_heads,
            vocab = config.vocab_size,
            nnz = nnz_total,
            mapped_mb = mmap.len() as f64 / 1e6,
            "[model] loaded"
        );

        Ok(Self {
            id: NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed),
            mmap,
            path: path.to_path_buf(),
            header,
            config,
            directory,
            primes,
            accel: ctx.accelerator().map(Arc::downgrade),
        })
    }

    fn checked_view<'a>(
        data: &'a [u8],
        entry: &DirEntry,
        ranges: &TensorRanges,
        code_limit: usize,
    ) -> Result<SparseMatrix<'a>> {
        let TensorRanges::Sparse {
            values,
            deltas,
            row_ptr,
            codes,
            scales,
        } = ranges
        else {
            return Err(EngineError::Format(format!("{:?} is not sparse", entry.kind)));
        };
        SparseMatrix::with_code_limit(
            entry.rows as usize,
            entry.cols as usize,
            view::<i8>(data, values, "values")?,
            view::<u16>(data, deltas, "delta_indices")?,
            view::<u32>(data, row_ptr, "row_pointers")?,
            view::<u16>(data, codes, "manifold_indices")?,
            view::<f32>(data, scales, "scales")?,
            code_limit,
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn primes(&self) -> &Arc<PrimeTable> {
        &self.primes
    }

    pub fn layer_count(&self) -> usize {
        self.config.n_layers
    }

    pub fn file_len(&self) -> usize {
        self.mmap.len()
    }

    /// Zero-copy view of a validated sparse tensor.
    pub fn sparse(&self, layer: Option<usize>, kind: TensorKind) -> Result<SparseMatrix<'_>> {
        let (entry, ranges) = self.lookup(layer, kind)?;
        let TensorRanges::Sparse {
            values,
            deltas,
            row_ptr,
            codes,
            scales,
        } = ranges
        else {
            return Err(EngineError::Format(format!("{kind:?} is not sparse")));
        };
        let data: &[u8] = &self.mmap;
        Ok(SparseMatrix::from_validated(
            entry.rows as usize,
            entry.cols as usize,
            view(data, values, "values")?,
            view(data, deltas, "delta_indices")?,
            view(data, row_ptr, "row_pointers")?,
            view(data, codes, "manifold_indices")?,
            view(data, scales, "scales")?,
        ))
    }

    /// Zero-copy view of a dense vector (norm weights).
    pub fn dense(&self, layer: Option<usize>, kind: TensorKind) -> Result<&[f32]> {
        let (_, ranges) = self.lookup(layer, kind)?;
        match ranges {
            TensorRanges::Dense(r) => view(&self.mmap, r, "dense vector"),
            TensorRanges::Sparse { .. } => {
                Err(EngineError::Format(format!("{kind:?} is not dense")))
            }
        }
    }

    fn lookup(&self, layer: Option<usize>, kind: TensorKind) -> Result<(&DirEntry, &TensorRanges)> {
        if let Some(l) = layer {
            if l >= self.config.n_layers {
                return Err(EngineError::index("layer", l, self.config.n_layers));
            }
        }
        self.directory
            .get(layer, kind)
            .ok_or_else(|| EngineError::Format(format!("no {kind:?} tensor for layer {layer:?}")))
    }

    pub fn get_layer(&self, idx: usize) -> Result<LayerWeights<'_>> {
        if idx >= self.config.n_layers {
            return Err(EngineError::index("layer", idx, self.config.n_layers));
        }
        let l = Some(idx);
        Ok(LayerWeights {
            index: idx,
            attn_norm: self.dense(l, TensorKind::AttnNorm)?,
            wq: self.sparse(l, TensorKind::Wq)?,
            wk: self.sparse(l, TensorKind::Wk)?,
            wv: self.sparse(l, TensorKind::Wv)?,
            wo: self.sparse(l, TensorKind::Wo)?,
            ffn_norm: self.dense(l, TensorKind::FfnNorm)?,
            w_gate: self.sparse(l, TensorKind::WGate)?,
            w_up: self.sparse(l, TensorKind::WUp)?,
            w_down: self.sparse(l, TensorKind::WDown)?,
        })
    }

    pub fn embedding(&self) -> Result<SparseMatrix<'_>> {
        self.sparse(None, TensorKind::Embedding)
    }

    pub fn final_norm(&self) -> Result<&[f32]> {
        self.dense(None, TensorKind::FinalNorm)
    }

    pub fn output(&self) -> Result<SparseMatrix<'_>> {
        self.sparse(None, TensorKind::Output)
    }

    /// Hint the kernel to page in one layer's payload.
    pub fn prefetch_layer(&self, idx: usize) -> Result<()> {
        if idx >= self.config.n_layers {
            return Err(EngineError::index("layer", idx, self.config.n_layers));
        }
        let Some(span) = self.directory.layer_span(idx) else {
            return Ok(());
        };
        prefetch::prefetch_range(&self.mmap, span).map_err(|e| EngineError::Io {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Process-wide identity of this loaded model.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stable per-tensor identity, used to key device-side buffer caches.
    /// Unique across every model loaded in this process.
    pub fn cache_key(&self, layer: Option<usize>, kind: TensorKind) -> u64 {
        let l = layer.map_or(u32::MAX as u64, |l| l as u64 & 0xFFFF_FFFF);
        (self.id << 40) | (l << 8) | kind as u64
    }
}

/// Model id a `cache_key` was minted by.
pub fn cache_key_owner(key: u64) -> u64 {
    key >> 40
}

impl Drop for ModelFile {
    fn drop(&mut self) {
        if let Some(accel) = self.accel.as_ref().and_then(Weak::upgrade) {
            let released = accel.evict_model(self.id);
            debug!(model = self.id, released, "[model] device buffers released");
        }
    }
}

impl std::fmt::Debug for ModelFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelFile")
            .field("path", &self.path)
            .field("config", &self.config)
            .field("tensors", &self.directory.len())
            .field("bytes", &self.mmap.len())
            .finish()
    }
}
