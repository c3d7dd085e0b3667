// =============================================================================
// model/directory.rs — Tensor directory: where every array lives in the file
// =============================================================================
//
// Each entry is 64 bytes:
//
//   off  field        type
//     0  layer        u32   u32::MAX for embedding / final norm / output
//     4  kind         u32   TensorKind
//     8  rows         u32
//    12  cols         u32   1 for dense vectors
//    16  nnz          u32   0 for dense vectors
//    20  pad          u32
//    24  values       u64   (dense: f32 data)
//    32  deltas       u64
//    40  row_ptr      u64
//    48  codes        u64
//    56  scales       u64
//
// Parsing checks ranges, alignment, shapes and completeness. The contents of
// the sparse arrays are checked later by `SparseMatrix::new`.
// =============================================================================

use std::collections::HashMap;
use std::ops::Range;

use crate::error::{EngineError, Result};

use super::config::ModelConfig;
use super::constants::{ARRAY_ALIGN, DIR_ENTRY_SIZE, GLOBAL_LAYER};
use super::header::{read_u32_le, read_u64_le, write_u32_le, write_u64_le};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TensorKind {
    Embedding = 0,
    AttnNorm = 1,
    Wq = 2,
    Wk = 3,
    Wv = 4,
    Wo = 5,
    FfnNorm = 6,
    WGate = 7,
    WUp = 8,
    WDown = 9,
    FinalNorm = 10,
    Output = 11,
}

impl TensorKind {
    /// Tensors every layer must carry.
    pub const PER_LAYER: [TensorKind; 9] = [
        TensorKind::AttnNorm,
        TensorKind::Wq,
        TensorKind::Wk,
        TensorKind::Wv,
        TensorKind::Wo,
        TensorKind::FfnNorm,
        TensorKind::WGate,
        TensorKind::WUp,
        TensorKind::WDown,
    ];

    pub const GLOBAL: [TensorKind; 3] =
        [TensorKind::Embedding, TensorKind::FinalNorm, TensorKind::Output];

    pub fn from_u32(v: u32) -> Option<Self> {
        use TensorKind::*;
        Some(match v {
            0 => Embedding,
            1 => AttnNorm,
            2 => Wq,
            3 => Wk,
            4 => Wv,
            5 => Wo,
            6 => FfnNorm,
            7 => WGate,
            8 => WUp,
            9 => WDown,
            10 => FinalNorm,
            11 => Output,
            _ => return None,
        })
    }

    pub fn is_dense(self) -> bool {
        matches!(
            self,
            TensorKind::AttnNorm | TensorKind::FfnNorm | TensorKind::FinalNorm
        )
    }

    pub fn is_global(self) -> bool {
        Self::GLOBAL.contains(&self)
    }

    /// `(rows, cols)` this kind must have for the given model shape.
    pub fn expected_shape(self, cfg: &ModelConfig) -> (usize, usize) {
        use TensorKind::*;
        match self {
            Embedding | Output => (cfg.vocab_size, cfg.dim),
            AttnNorm | FfnNorm | FinalNorm => (cfg.dim, 1),
            Wq | Wk | Wv | Wo => (cfg.dim, cfg.dim),
            WGate | WUp => (cfg.hidden_dim, cfg.dim),
            WDown => (cfg.dim, cfg.hidden_dim),
        }
    }
}

/// Byte ranges of one tensor's arrays inside the file.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorRanges {
    Dense(Range<usize>),
    Sparse {
        values: Range<usize>,
        deltas: Range<usize>,
        row_ptr: Range<usize>,
        codes: Range<usize>,
        scales: Range<usize>,
    },
}

impl TensorRanges {
    /// Smallest range covering every array of the tensor.
    pub fn span(&self) -> Range<usize> {
        match self {
            TensorRanges::Dense(r) => r.clone(),
            TensorRanges::Sparse {
                values,
                deltas,
                row_ptr,
                codes,
                scales,
            } => {
                let all = [values, deltas, row_ptr, codes, scales];
                let start = all.iter().map(|r| r.start).min().unwrap_or(0);
                let end = all.iter().map(|r| r.end).max().unwrap_or(0);
                start..end
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub layer: u32,
    pub kind: TensorKind,
    pub rows: u32,
    pub cols: u32,
    pub nnz: u32,
    /// values, deltas, row_ptr, codes, scales
    pub offsets: [u64; 5],
}

impl DirEntry {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let raw_kind = read_u32_le(data, 4);
        let kind = TensorKind::from_u32(raw_kind)
            .ok_or_else(|| EngineError::Format(format!("unknown tensor kind {raw_kind}")))?;
        let mut offsets = [0u64; 5];
        for (i, o) in offsets.iter_mut().enumerate() {
            *o = read_u64_le(data, 24 + i * 8);
        }
        Ok(Self {
            layer: read_u32_le(data, 0),
            kind,
            rows: read_u32_le(data, 8),
            cols: read_u32_le(data, 12),
            nnz: read_u32_le(data, 16),
            offsets,
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[..DIR_ENTRY_SIZE].fill(0);
        write_u32_le(buf, 0, self.layer);
        write_u32_le(buf, 4, self.kind as u32);
        write_u32_le(buf, 8, self.rows);
        write_u32_le(buf, 12, self.cols);
        write_u32_le(buf, 16, self.nnz);
        for (i, &o) in self.offsets.iter().enumerate() {
            write_u64_le(buf, 24 + i * 8, o);
        }
    }

    pub fn layer_index(&self) -> Option<usize> {
        (self.layer != GLOBAL_LAYER).then_some(self.layer as usize)
    }

    /// Byte lengths of the five arrays (dense: only the first is used).
    pub fn array_lengths(&self) -> [usize; 5] {
        let rows = self.rows as usize;
        let nnz = self.nnz as usize;
        if self.kind.is_dense() {
            [rows * 4, 0, 0, 0, 0]
        } else {
            [nnz, nnz * 2, (rows + 1) * 4, nnz * 2, rows * 4]
        }
    }

    /// Checked byte ranges; every array must be aligned and inside `file_len`.
    pub fn ranges(&self, file_len: usize) -> Result<TensorRanges> {
        let lens = self.array_lengths();
        let used = if self.kind.is_dense() { 1 } else { 5 };
        let mut out: [Range<usize>; 5] = Default::default();
        for i in 0..used {
            let start = usize::try_from(self.offsets[i]).map_err(|_| self.bad("offset overflow"))?;
            if start % ARRAY_ALIGN != 0 {
                return Err(self.bad(&format!("array {i} at {start} is not {ARRAY_ALIGN}-byte aligned")));
            }
            let end = start
                .checked_add(lens[i])
                .filter(|&e| e <= file_len)
                .ok_or_else(|| self.bad(&format!("array {i} runs past end of file ({file_len} bytes)")))?;
            out[i] = start..end;
        }
        let [values, deltas, row_ptr, codes, scales] = out;
        Ok(if self.kind.is_dense() {
            TensorRanges::Dense(values)
        } else {
            TensorRanges::Sparse {
                values,
                deltas,
                row_ptr,
                codes,
                scales,
            }
        })
    }

    fn bad(&self, msg: &str) -> EngineError {
        EngineError::Format(format!("tensor {:?} (layer {}): {msg}", self.kind, self.layer))
    }
}

#[derive(Debug, Clone)]
pub struct Directory {
    entries: Vec<DirEntry>,
    ranges: Vec<TensorRanges>,
    index: HashMap<(u32, TensorKind), usize>,
}

impl Directory {
    pub fn parse(data: &[u8], directory_offset: u64, n_tensors: u32, cfg: &ModelConfig) -> Result<Self> {
        let n = n_tensors as usize;
        let start = usize::try_from(directory_offset)
            .map_err(|_| EngineError::Format("directory offset overflow".into()))?;
        let end = n
            .checked_mul(DIR_ENTRY_SIZE)
            .and_then(|len| start.checked_add(len))
            .filter(|&e| e <= data.len())
            .ok_or_else(|| {
                EngineError::Format(format!(
                    "directory of {n} entries at {start} runs past end of file"
                ))
            })?;

        let mut entries = Vec::with_capacity(n);
        let mut ranges = Vec::with_capacity(n);
        let mut index = HashMap::with_capacity(n);
        for chunk in data[start..end].chunks_exact(DIR_ENTRY_SIZE) {
            let e = DirEntry::from_bytes(chunk)?;

            match e.layer_index() {
                None if !e.kind.is_global() => {
                    return Err(e.bad("per-layer tensor stored as global"));
                }
                Some(_) if e.kind.is_global() => {
                    return Err(e.bad("global tensor stored inside a layer"));
                }
                Some(l) if l >= cfg.n_layers => {
                    return Err(e.bad(&format!("layer out of range for {} layers", cfg.n_layers)));
                }
                _ => {}
            }

            let expected = e.kind.expected_shape(cfg);
            if (e.rows as usize, e.cols as usize) != expected {
                return Err(e.bad(&format!(
                    "shape {}x{} != expected {}x{}",
                    e.rows, e.cols, expected.0, expected.1
                )));
            }
            if e.kind.is_dense() && e.nnz != 0 {
                return Err(e.bad("dense vector with nnz != 0"));
            }

            ranges.push(e.ranges(data.len())?);
            if index.insert((e.layer, e.kind), entries.len()).is_some() {
                return Err(e.bad("duplicate directory entry"));
            }
            entries.push(e);
        }

        let dir = Self {
            entries,
            ranges,
            index,
        };
        dir.check_complete(cfg.n_layers)?;
        Ok(dir)
    }

    fn check_complete(&self, n_layers: usize) -> Result<()> {
        for kind in TensorKind::GLOBAL {
            if !self.index.contains_key(&(GLOBAL_LAYER, kind)) {
                return Err(EngineError::Format(format!("missing global tensor {kind:?}")));
            }
        }
        for l in 0..n_layers as u32 {
            for kind in TensorKind::PER_LAYER {
                if !self.index.contains_key(&(l, kind)) {
                    return Err(EngineError::Format(format!("layer {l}: missing tensor {kind:?}")));
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DirEntry, &TensorRanges)> {
        self.entries.iter().zip(&self.ranges)
    }

    /// `layer == None` addresses the global tensors.
    pub fn get(&self, layer: Option<usize>, kind: TensorKind) -> Option<(&DirEntry, &TensorRanges)> {
        let key = layer.map_or(GLOBAL_LAYER, |l| l as u32);
        self.index
            .get(&(key, kind))
            .map(|&i| (&self.entries[i], &self.ranges[i]))
    }

    /// Byte span covering every array of one layer.
    pub fn layer_span(&self, layer: usize) -> Option<Range<usize>> {
        let spans: Vec<Range<usize>> = TensorKind::PER_LAYER
            .iter()
            .filter_map(|&k| self.get(Some(layer), k))
            .map(|(_, r)| r.span())
            .collect();
        let start = spans.iter().map(|r| r.start).min()?;
        let end = spans.iter().map(|r| r.end).max()?;
        Some(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: TensorKind, layer: u32, rows: u32, cols: u32) -> DirEntry {
        DirEntry {
            layer,
            kind,
            rows,
            cols,
            nnz: 0,
            offsets: [0; 5],
        }
    }

    #[test]
    fn test_kind_codes_round_trip() {
        for v in 0..12 {
            assert_eq!(TensorKind::from_u32(v).unwrap() as u32, v);
        }
        assert!(TensorKind::from_u32(12).is_none());
    }

    #[test]
    fn test_entry_bytes_round_trip() {
        let mut e = entry(TensorKind::WDown, 3, 32, 64);
        e.nnz = 17;
        e.offsets = [16, 32, 48, 64, 80];
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        e.write_to(&mut buf);
        assert_eq!(DirEntry::from_bytes(&buf).unwrap(), e);
    }

    #[test]
    fn test_ranges_reject_misalignment_and_overrun() {
        let mut e = entry(TensorKind::AttnNorm, 0, 8, 1);
        e.offsets[0] = 20;
        assert!(matches!(e.ranges(1024), Err(EngineError::Format(_))));
        e.offsets[0] = 1008;
        assert!(matches!(e.ranges(1024), Err(EngineError::Format(_))));
        e.offsets[0] = 992;
        assert_eq!(e.ranges(1024).unwrap(), TensorRanges::Dense(992..1024));
    }

    #[test]
    fn test_sparse_lengths() {
        let mut e = entry(TensorKind::Wq, 0, 4, 4);
        e.nnz = 6;
        assert_eq!(e.array_lengths(), [6, 12, 20, 12, 16]);
    }

    #[test]
    fn test_expected_shapes() {
        let cfg = ModelConfig::tiny();
        assert_eq!(TensorKind::WGate.expected_shape(&cfg), (64, 32));
        assert_eq!(TensorKind::WDown.expected_shape(&cfg), (32, 64));
        assert_eq!(TensorKind::Output.expected_shape(&cfg), (64, 32));
        assert_eq!(TensorKind::FinalNorm.expected_shape(&cfg), (32, 1));
    }
}
