// =============================================================================
// model/writer.rs — Serialise a model into the MdCSR file format
// =============================================================================
//
// Layout written:
//
//   [header 128 B][directory n × 64 B][arrays, each 16-byte aligned]
//
// Arrays follow directory order; within a sparse tensor the order is
// values, deltas, row_ptr, codes, scales.
// =============================================================================

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::{EngineError, Result};
use crate::sparse::SparseMatrix;

use super::config::ModelConfig;
use super::constants::{ARRAY_ALIGN, DIR_ENTRY_SIZE, GLOBAL_LAYER, HEADER_SIZE};
use super::directory::{DirEntry, TensorKind};

enum Payload {
    Sparse(SparseMatrix<'static>),
    Dense(Vec<f32>),
}

struct Pending {
    layer: u32,
    kind: TensorKind,
    payload: Payload,
}

pub struct ModelWriter {
    config: ModelConfig,
    tensors: Vec<Pending>,
}

fn align_up(n: usize) -> usize {
    n.div_ceil(ARRAY_ALIGN) * ARRAY_ALIGN
}

impl ModelWriter {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            tensors: Vec::new(),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn layer_key(&self, layer: Option<usize>, kind: TensorKind) -> Result<u32> {
        match layer {
            None if kind.is_global() => Ok(GLOBAL_LAYER),
            Some(l) if !kind.is_global() && l < self.config.n_layers => Ok(l as u32),
            Some(l) if !kind.is_global() => Err(EngineError::index("layer", l, self.config.n_layers)),
            _ => Err(EngineError::Format(format!(
                "tensor {kind:?} cannot be stored at layer {layer:?}"
            ))),
        }
    }

    pub fn add_sparse(
        &mut self,
        layer: Option<usize>,
        kind: TensorKind,
        m: SparseMatrix<'_>,
    ) -> Result<&mut Self> {
        if kind.is_dense() {
            return Err(EngineError::Format(format!("{kind:?} is a dense tensor")));
        }
        let (rows, cols) = kind.expected_shape(&self.config);
        if m.rows() != rows {
            return Err(EngineError::shape("tensor rows", rows, m.rows()));
        }
        if m.cols() != cols {
            return Err(EngineError::shape("tensor cols", cols, m.cols()));
        }
        if let Some(code) = m.max_code() {
            if code as usize >= self.config.prime_codes {
                return Err(EngineError::Format(format!(
                    "{kind:?} uses manifold code {code}, file declares {} prime codes",
                    self.config.prime_codes
                )));
            }
        }
        let layer = self.layer_key(layer, kind)?;
        self.tensors.push(Pending {
            layer,
            kind,
            payload: Payload::Sparse(m.into_owned()),
        });
        Ok(self)
    }

    pub fn add_dense(&mut self, layer: Option<usize>, kind: TensorKind, v: Vec<f32>) -> Result<&mut Self> {
        if !kind.is_dense() {
            return Err(EngineError::Format(format!("{kind:?} is a sparse tensor")));
        }
        let (rows, _) = kind.expected_shape(&self.config);
        if v.len() != rows {
            return Err(EngineError::shape("dense tensor", rows, v.len()));
        }
        let layer = self.layer_key(layer, kind)?;
        self.tensors.push(Pending {
            layer,
            kind,
            payload: Payload::Dense(v),
        });
        Ok(self)
    }

    /// Serialise to an in-memory image of the file.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let n = self.tensors.len();
        let n_tensors =
            u32::try_from(n).map_err(|_| EngineError::Format("too many tensors".into()))?;
        let dir_offset = HEADER_SIZE;
        let mut cursor = align_up(dir_offset + n * DIR_ENTRY_SIZE);

        // Pass 1: assign offsets.
        let mut entries = Vec::with_capacity(n);
        for t in &self.tensors {
            let (rows, cols, nnz) = match &t.payload {
                Payload::Sparse(m) => (m.rows(), m.cols(), m.nnz()),
                Payload::Dense(v) => (v.len(), 1, 0),
            };
            let to_u32 = |v: usize| {
                u32::try_from(v).map_err(|_| EngineError::Format(format!("{v} exceeds u32")))
            };
            let mut e = DirEntry {
                layer: t.layer,
                kind: t.kind,
                rows: to_u32(rows)?,
                cols: to_u32(cols)?,
                nnz: to_u32(nnz)?,
                offsets: [0; 5],
            };
            let lens = e.array_lengths();
            let used = if t.kind.is_dense() { 1 } else { 5 };
            for i in 0..used {
                e.offsets[i] = cursor as u64;
                cursor = align_up(cursor + lens[i]);
            }
            entries.push(e);
        }

        // Pass 2: fill.
        let mut buf = vec![0u8; cursor];
        self.config
            .to_header(n_tensors, dir_offset as u64)
            .write_to(&mut buf);
        for (i, (e, t)) in entries.iter().zip(&self.tensors).enumerate() {
            let at = dir_offset + i * DIR_ENTRY_SIZE;
            e.write_to(&mut buf[at..at + DIR_ENTRY_SIZE]);

            let mut put = |slot: usize, bytes: &[u8]| {
                let off = e.offsets[slot] as usize;
                buf[off..off + bytes.len()].copy_from_slice(bytes);
            };
            match &t.payload {
                Payload::Dense(v) => put(0, bytemuck::cast_slice(v)),
                Payload::Sparse(m) => {
                    put(0, bytemuck::cast_slice(m.values()));
                    put(1, bytemuck::cast_slice(m.delta_indices()));
                    put(2, bytemuck::cast_slice(m.row_pointers()));
                    put(3, bytemuck::cast_slice(m.manifold_indices()));
                    put(4, bytemuck::cast_slice(m.scales()));
                }
            }
        }
        Ok(buf)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        let io_err = |e| EngineError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        let mut file = File::create(path).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        tracing::debug!(
            path = %path.display(),
            bytes = bytes.len(),
            tensors = self.tensors.len(),
            "[model] wrote model file"
        );
        Ok(())
    }
}
