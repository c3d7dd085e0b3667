// =============================================================================
// sparse/matrix.rs — MdCSR sparse matrix (owned or borrowed from the mmap)
// =============================================================================
//
// Layout for a [rows × cols] matrix with nnz stored entries:
//
//   values[nnz]            i8   quantized magnitude
//   delta_indices[nnz]     u16  column gap from the previous entry in the row
//                               (first entry of a row: gap from column 0)
//   row_pointers[rows+1]   u32  entry range of row r = [rp[r], rp[r+1])
//   manifold_indices[nnz]  u16  code into the PrimeTable
//   scales[rows]           f32  per-row scale, always > 0
//
// Decoded weight:  values[i] * primes[manifold_indices[i]] * scales[r]
//
// A `SparseMatrix` can only be built through `new`, which checks every
// structural invariant once. The kernels rely on that and skip per-entry
// bounds reasoning on the hot path.
// =============================================================================

use std::borrow::Cow;
use std::fmt;
use std::ops::Range;

use crate::error::{EngineError, Result};
use crate::primes::PrimeTable;

#[derive(Clone)]
pub struct SparseMatrix<'a> {
    rows: usize,
    cols: usize,
    values: Cow<'a, [i8]>,
    delta_indices: Cow<'a, [u16]>,
    row_pointers: Cow<'a, [u32]>,
    manifold_indices: Cow<'a, [u16]>,
    scales: Cow<'a, [f32]>,
}

impl<'a> SparseMatrix<'a> {
    /// Build and validate. Structural violations are `Format` errors; a
    /// non-positive or non-finite scale is a `Numeric` error.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rows: usize,
        cols: usize,
        values: impl Into<Cow<'a, [i8]>>,
        delta_indices: impl Into<Cow<'a, [u16]>>,
        row_pointers: impl Into<Cow<'a, [u32]>>,
        manifold_indices: impl Into<Cow<'a, [u16]>>,
        scales: impl Into<Cow<'a, [f32]>>,
        primes: &PrimeTable,
    ) -> Result<Self> {
        Self::with_code_limit(
            rows,
            cols,
            values,
            delta_indices,
            row_pointers,
            manifold_indices,
            scales,
            primes.len(),
        )
    }

    /// Same checks as `new`, but every manifold code must be below
    /// `code_limit` rather than the length of a particular table. The loader
    /// passes the file's declared `prime_codes` here.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn with_code_limit(
        rows: usize,
        cols: usize,
        values: impl Into<Cow<'a, [i8]>>,
        delta_indices: impl Into<Cow<'a, [u16]>>,
        row_pointers: impl Into<Cow<'a, [u32]>>,
        manifold_indices: impl Into<Cow<'a, [u16]>>,
        scales: impl Into<Cow<'a, [f32]>>,
        code_limit: usize,
    ) -> Result<Self> {
        let m = Self {
            rows,
            cols,
            values: values.into(),
            delta_indices: delta_indices.into(),
            row_pointers: row_pointers.into(),
            manifold_indices: manifold_indices.into(),
            scales: scales.into(),
        };
        m.validate(code_limit)?;
        Ok(m)
    }

    /// Largest manifold code stored, if any.
    pub fn max_code(&self) -> Option<u16> {
        self.manifold_indices.iter().copied().max()
    }

    /// Rebuild a view over arrays that already passed `new` once (the loader
    /// validates every tensor at load time and re-borrows on demand).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_validated(
        rows: usize,
        cols: usize,
        values: &'a [i8],
        delta_indices: &'a [u16],
        row_pointers: &'a [u32],
        manifold_indices: &'a [u16],
        scales: &'a [f32],
    ) -> Self {
        let m = Self {
            rows,
            cols,
            values: Cow::Borrowed(values),
            delta_indices: Cow::Borrowed(delta_indices),
            row_pointers: Cow::Borrowed(row_pointers),
            manifold_indices: Cow::Borrowed(manifold_indices),
            scales: Cow::Borrowed(scales),
        };
        debug_assert!(m.validate(usize::MAX).is_ok());
        m
    }

    /// A matrix with no stored entries (every row empty, unit scales).
    pub fn empty(rows: usize, cols: usize) -> SparseMatrix<'static> {
        SparseMatrix {
            rows,
            cols,
            values: Cow::Owned(Vec::new()),
            delta_indices: Cow::Owned(Vec::new()),
            row_pointers: Cow::Owned(vec![0; rows + 1]),
            manifold_indices: Cow::Owned(Vec::new()),
            scales: Cow::Owned(vec![1.0; rows]),
        }
    }

    fn validate(&self, table_len: usize) -> Result<()> {
        let nnz = self.values.len();
        if self.delta_indices.len() != nnz || self.manifold_indices.len() != nnz {
            return Err(EngineError::Format(format!(
                "entry arrays disagree: values={} deltas={} codes={}",
                nnz,
                self.delta_indices.len(),
                self.manifold_indices.len()
            )));
        }
        if self.row_pointers.len() != self.rows + 1 {
            return Err(EngineError::Format(format!(
                "row_pointers has {} entries, expected {}",
                self.row_pointers.len(),
                self.rows + 1
            )));
        }
        if self.scales.len() != self.rows {
            return Err(EngineError::Format(format!(
                "scales has {} entries, expected {}",
                self.scales.len(),
                self.rows
            )));
        }
        if self.row_pointers[0] != 0 || self.row_pointers[self.rows] as usize != nnz {
            return Err(EngineError::Format(format!(
                "row_pointers must span [0, {nnz}], got [{}, {}]",
                self.row_pointers[0], self.row_pointers[self.rows]
            )));
        }

        if let Some(r) = self.row_pointers.windows(2).position(|w| w[1] < w[0]) {
            return Err(EngineError::Format(format!(
                "row_pointers decrease at row {r}: {} > {}",
                self.row_pointers[r],
                self.row_pointers[r + 1]
            )));
        }

        for r in 0..self.rows {
            let (start, end) = (self.row_pointers[r] as usize, self.row_pointers[r + 1] as usize);
            let mut col = 0usize;
            for i in start..end {
                let delta = self.delta_indices[i] as usize;
                if i > start && delta == 0 {
                    return Err(EngineError::Format(format!(
                        "row {r}: repeated column {col} at entry {i}"
                    )));
                }
                col += delta;
                if col >= self.cols {
                    return Err(EngineError::Format(format!(
                        "row {r}: column {col} out of range for width {}",
                        self.cols
                    )));
                }
                let code = self.manifold_indices[i] as usize;
                if code >= table_len {
                    return Err(EngineError::Format(format!(
                        "row {r}: manifold code {code} exceeds table of {table_len}"
                    )));
                }
            }

            let s = self.scales[r];
            if !(s.is_finite() && s > 0.0) {
                return Err(EngineError::Numeric(format!("row {r}: scale {s} is not > 0")));
            }
        }
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[i8] {
        &self.values
    }

    pub fn delta_indices(&self) -> &[u16] {
        &self.delta_indices
    }

    pub fn row_pointers(&self) -> &[u32] {
        &self.row_pointers
    }

    pub fn manifold_indices(&self) -> &[u16] {
        &self.manifold_indices
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    /// True when every array still points into the backing mmap.
    pub fn is_borrowed(&self) -> bool {
        matches!(self.values, Cow::Borrowed(_))
            && matches!(self.delta_indices, Cow::Borrowed(_))
            && matches!(self.row_pointers, Cow::Borrowed(_))
            && matches!(self.manifold_indices, Cow::Borrowed(_))
            && matches!(self.scales, Cow::Borrowed(_))
    }

    #[inline(always)]
    pub fn row_range(&self, r: usize) -> Range<usize> {
        self.row_pointers[r] as usize..self.row_pointers[r + 1] as usize
    }

    /// Walk row `r`, yielding `(column, decoded weight)` in column order.
    /// `prime_values` must be the table this matrix was validated against.
    #[inline(always)]
    pub fn for_each_in_row(&self, prime_values: &[f32], r: usize, mut f: impl FnMut(usize, f32)) {
        let scale = self.scales[r];
        let mut col = 0usize;
        for i in self.row_range(r) {
            col += self.delta_indices[i] as usize;
            debug_assert!(col < self.cols, "column escaped load-time validation");
            let w = self.values[i] as f32 * prime_values[self.manifold_indices[i] as usize] * scale;
            f(col, w);
        }
    }

    /// Reconstruct the dense row-major matrix. O(nnz + rows*cols); meant for
    /// verification, not the decode path.
    pub fn to_dense(&self, primes: &PrimeTable) -> Vec<f32> {
        let mut dense = vec![0.0f32; self.rows * self.cols];
        let pv = primes.values();
        for r in 0..self.rows {
            let row = &mut dense[r * self.cols..(r + 1) * self.cols];
            self.for_each_in_row(pv, r, |c, w| row[c] = w);
        }
        dense
    }

    /// Decode a single row into `out` (length `cols`). Used for embedding lookup.
    pub fn decode_row(&self, primes: &PrimeTable, r: usize, out: &mut [f32]) -> Result<()> {
        if r >= self.rows {
            return Err(EngineError::index("row", r, self.rows));
        }
        if out.len() != self.cols {
            return Err(EngineError::shape("decoded row", self.cols, out.len()));
        }
        out.fill(0.0);
        self.for_each_in_row(primes.values(), r, |c, w| out[c] = w);
        Ok(())
    }

    pub fn into_owned(self) -> SparseMatrix<'static> {
        SparseMatrix {
            rows: self.rows,
            cols: self.cols,
            values: Cow::Owned(self.values.into_owned()),
            delta_indices: Cow::Owned(self.delta_indices.into_owned()),
            row_pointers: Cow::Owned(self.row_pointers.into_owned()),
            manifold_indices: Cow::Owned(self.manifold_indices.into_owned()),
            scales: Cow::Owned(self.scales.into_owned()),
        }
    }
}

impl fmt::Debug for SparseMatrix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SparseMatrix({}x{}, nnz={}, borrowed={})",
            self.rows,
            self.cols,
            self.nnz(),
            self.is_borrowed()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primes() -> PrimeTable {
        PrimeTable::generate(16).unwrap()
    }

    /// 2×4: row 0 has columns 1 and 3, row 1 has column 0.
    fn small() -> SparseMatrix<'static> {
        SparseMatrix::new(
            2,
            4,
            vec![1i8, -2, 3],
            vec![1u16, 2, 0],
            vec![0u32, 2, 3],
            vec![0u16, 1, 2],
            vec![0.5f32, 2.0],
            &primes(),
        )
        .unwrap()
    }

    #[test]
    fn test_to_dense_decodes_with_primes_and_scales() {
        let m = small();
        let d = m.to_dense(&primes());
        // row 0: col1 = 1*2*0.5, col3 = -2*3*0.5
        assert_eq!(&d[0..4], &[0.0, 1.0, 0.0, -3.0]);
        // row 1: col0 = 3*5*2
        assert_eq!(&d[4..8], &[30.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_to_dense_idempotent() {
        let m = small();
        let p = primes();
        let a = m.to_dense(&p);
        let b = m.to_dense(&p);
        assert_eq!(
            a.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            b.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_decode_row_matches_dense() {
        let m = small();
        let p = primes();
        let dense = m.to_dense(&p);
        let mut row = vec![9.0f32; 4];
        m.decode_row(&p, 1, &mut row).unwrap();
        assert_eq!(&row[..], &dense[4..8]);
        assert!(matches!(
            m.decode_row(&p, 2, &mut row),
            Err(EngineError::Index { .. })
        ));
    }

    #[test]
    fn test_rejects_column_past_width() {
        let err = SparseMatrix::new(
            1, 3, vec![1i8, 1], vec![1u16, 2], vec![0u32, 2], vec![0u16, 0], vec![1.0f32],
            &primes(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Format(_)), "{err}");
    }

    #[test]
    fn test_rejects_repeated_column() {
        let err = SparseMatrix::new(
            1, 3, vec![1i8, 1], vec![1u16, 0], vec![0u32, 2], vec![0u16, 0], vec![1.0f32],
            &primes(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Format(_)));
    }

    #[test]
    fn test_rejects_decreasing_row_pointers() {
        let err = SparseMatrix::new(
            2, 3, vec![1i8, 1], vec![0u16, 0], vec![0u32, 2, 1], vec![0u16, 0],
            vec![1.0f32, 1.0], &primes(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Format(_)));
    }

    #[test]
    fn test_rejects_code_outside_table() {
        let err = SparseMatrix::new(
            1, 3, vec![1i8], vec![0u16], vec![0u32, 1], vec![16u16], vec![1.0f32], &primes(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Format(_)));
    }

    #[test]
    fn test_code_limit_tighter_than_table() {
        // Code 5 exists in the 16-entry table but not under a limit of 4.
        let build = |limit| {
            SparseMatrix::with_code_limit(
                1, 3, vec![1i8], vec![0u16], vec![0u32, 1], vec![5u16], vec![1.0f32], limit,
            )
        };
        assert!(matches!(build(4), Err(EngineError::Format(_))));
        assert_eq!(build(6).unwrap().max_code(), Some(5));
    }

    #[test]
    fn test_non_positive_scale_is_numeric() {
        for bad in [0.0f32, -1.0, f32::NAN, f32::INFINITY] {
            let err = SparseMatrix::new(
                1, 3, vec![1i8], vec![0u16], vec![0u32, 1], vec![0u16], vec![bad], &primes(),
            )
            .unwrap_err();
            assert!(matches!(err, EngineError::Numeric(_)), "scale {bad}: {err}");
        }
    }

    #[test]
    fn test_empty_matrix() {
        let m = SparseMatrix::empty(3, 5);
        assert_eq!(m.nnz(), 0);
        assert!(m.to_dense(&primes()).iter().all(|&v| v == 0.0));
    }
}
