//! Index sets over vector and matrix blocks.
//!
//! [`BlockIndices`] is a canonical list of [`Segment`]s selecting scattered
//! rows (or columns) of a dense vector or matrix. [`MatrixBlocks`] pairs a
//! row set with a column set. Two projection semantics are provided:
//!
//! - **keep** — a dense slice holding only the selected entries;
//! - **full** — a slice of the ambient shape with zeros elsewhere.
//!
//! Both directions exist: gathers produce owned slices, scatters write a
//! slice back into the selected positions of a larger target.

use nalgebra::{DMatrix, DVector};

use crate::segment::{self, Segment};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A canonical set of row (or column) indices, stored as sorted disjoint
/// maximal segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BlockIndices {
    segments: Vec<Segment>,
}

impl BlockIndices {
    /// The empty selection.
    #[must_use]
    pub const fn new() -> Self {
        Self { segments: Vec::new() }
    }

    /// A selection covering the single range `[start, start + len)`.
    #[must_use]
    pub fn range(start: usize, len: usize) -> Self {
        Self::from_segments(vec![Segment::new(start, len)])
    }

    /// Build a selection from arbitrary segments, canonicalizing them.
    #[must_use]
    pub fn from_segments(mut segments: Vec<Segment>) -> Self {
        segment::sort(&mut segments);
        segment::shrink(&mut segments);
        Self { segments }
    }

    /// Add a range to the selection, keeping the canonical form.
    pub fn add_range(&mut self, start: usize, len: usize) {
        self.segments.push(Segment::new(start, len));
        segment::sort(&mut self.segments);
        segment::shrink(&mut self.segments);
    }

    /// The canonical segments of the selection.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of selected indices.
    #[must_use]
    pub fn nb_indices(&self) -> usize {
        segment::cardinal(&self.segments)
    }

    /// Whether no index is selected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether `index` is selected.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        let i = self.segments.partition_point(|s| s.end() <= index);
        self.segments.get(i).is_some_and(|s| s.contains(index))
    }

    /// Iterate over the selected indices in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.segments.iter().flat_map(|s| s.start..s.end())
    }

    /// The relative complement of this selection and another.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        Self {
            segments: segment::difference_sets(&self.segments, &other.segments),
        }
    }

    /// Gather the selected entries of `v` into a dense vector
    /// (keep semantics).
    #[must_use]
    pub fn keep_vector(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(self.nb_indices());
        self.keep_vector_into(v, &mut out);
        out
    }

    /// Gather the selected entries of `v` into a pre-sized dense vector.
    pub fn keep_vector_into(&self, v: &DVector<f64>, out: &mut DVector<f64>) {
        debug_assert_eq!(out.len(), self.nb_indices());
        let mut row = 0;
        for s in &self.segments {
            out.rows_mut(row, s.len).copy_from(&v.rows(s.start, s.len));
            row += s.len;
        }
    }

    /// Project `v` onto the selection with the ambient shape preserved:
    /// deselected entries are zero (full semantics).
    #[must_use]
    pub fn full_vector(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(v.len());
        for s in &self.segments {
            out.rows_mut(s.start, s.len).copy_from(&v.rows(s.start, s.len));
        }
        out
    }

    /// Scatter a dense slice back into the selected entries of `out`.
    /// Deselected entries of `out` are left untouched.
    pub fn scatter_vector(&self, small: &DVector<f64>, out: &mut DVector<f64>) {
        debug_assert_eq!(small.len(), self.nb_indices());
        let mut row = 0;
        for s in &self.segments {
            out.rows_mut(s.start, s.len).copy_from(&small.rows(row, s.len));
            row += s.len;
        }
    }

    /// Gather the selected rows of `m` (all columns kept).
    #[must_use]
    pub fn keep_rows(&self, m: &DMatrix<f64>) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(self.nb_indices(), m.ncols());
        let mut row = 0;
        for s in &self.segments {
            out.rows_mut(row, s.len).copy_from(&m.rows(s.start, s.len));
            row += s.len;
        }
        out
    }

    /// Gather the selected columns of `m` (all rows kept).
    #[must_use]
    pub fn keep_cols(&self, m: &DMatrix<f64>) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(m.nrows(), self.nb_indices());
        let mut col = 0;
        for s in &self.segments {
            out.columns_mut(col, s.len)
                .copy_from(&m.columns(s.start, s.len));
            col += s.len;
        }
        out
    }
}

impl<'a> IntoIterator for &'a BlockIndices {
    type Item = usize;
    type IntoIter = Box<dyn Iterator<Item = usize> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// A matrix view selector: a row set paired with a column set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MatrixBlocks {
    /// Selected rows.
    pub rows: BlockIndices,
    /// Selected columns.
    pub cols: BlockIndices,
}

impl MatrixBlocks {
    /// Build a selector from row and column sets.
    #[must_use]
    pub const fn new(rows: BlockIndices, cols: BlockIndices) -> Self {
        Self { rows, cols }
    }

    /// Gather the selected rows × columns of `m` into a dense sub-matrix
    /// (keep semantics).
    #[must_use]
    pub fn keep(&self, m: &DMatrix<f64>) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(self.rows.nb_indices(), self.cols.nb_indices());
        self.keep_into(m, &mut out);
        out
    }

    /// Gather the selected rows × columns of `m` into a pre-sized dense
    /// sub-matrix.
    pub fn keep_into(&self, m: &DMatrix<f64>, out: &mut DMatrix<f64>) {
        debug_assert_eq!(out.nrows(), self.rows.nb_indices());
        debug_assert_eq!(out.ncols(), self.cols.nb_indices());
        let mut row = 0;
        for rs in self.rows.segments() {
            let mut col = 0;
            for cs in self.cols.segments() {
                out.view_mut((row, col), (rs.len, cs.len))
                    .copy_from(&m.view((rs.start, cs.start), (rs.len, cs.len)));
                col += cs.len;
            }
            row += rs.len;
        }
    }

    /// Project `m` onto the selection with the ambient shape preserved:
    /// deselected entries are zero (full semantics).
    #[must_use]
    pub fn full(&self, m: &DMatrix<f64>) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(m.nrows(), m.ncols());
        for rs in self.rows.segments() {
            for cs in self.cols.segments() {
                out.view_mut((rs.start, cs.start), (rs.len, cs.len))
                    .copy_from(&m.view((rs.start, cs.start), (rs.len, cs.len)));
            }
        }
        out
    }

    /// Scatter a dense sub-matrix back into the selected rows × columns of
    /// `out`. Deselected entries of `out` are left untouched.
    pub fn scatter(&self, small: &DMatrix<f64>, out: &mut DMatrix<f64>) {
        debug_assert_eq!(small.nrows(), self.rows.nb_indices());
        debug_assert_eq!(small.ncols(), self.cols.nb_indices());
        let mut row = 0;
        for rs in self.rows.segments() {
            let mut col = 0;
            for cs in self.cols.segments() {
                out.view_mut((rs.start, cs.start), (rs.len, cs.len))
                    .copy_from(&small.view((row, col), (rs.len, cs.len)));
                col += cs.len;
            }
            row += rs.len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indices(pairs: &[(usize, usize)]) -> BlockIndices {
        BlockIndices::from_segments(pairs.iter().map(|&(s, l)| Segment::new(s, l)).collect())
    }

    #[test]
    fn construction_canonicalizes() {
        let b = indices(&[(4, 2), (0, 3), (2, 3), (9, 0)]);
        assert_eq!(b.segments(), &[Segment::new(0, 6)]);
        assert_eq!(b.nb_indices(), 6);
    }

    #[test]
    fn contains_and_iter() {
        let b = indices(&[(1, 2), (5, 1)]);
        assert!(b.contains(1));
        assert!(b.contains(2));
        assert!(!b.contains(3));
        assert!(b.contains(5));
        assert!(!b.contains(6));
        assert_eq!(b.iter().collect::<Vec<_>>(), vec![1, 2, 5]);
    }

    #[test]
    fn vector_gather_scatter_round_trip() {
        let b = indices(&[(0, 2), (4, 2)]);
        let v = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let kept = b.keep_vector(&v);
        assert_eq!(kept, DVector::from_vec(vec![1.0, 2.0, 5.0, 6.0]));

        let mut out = DVector::zeros(6);
        b.scatter_vector(&kept, &mut out);
        assert_eq!(out, DVector::from_vec(vec![1.0, 2.0, 0.0, 0.0, 5.0, 6.0]));
        assert_eq!(out, b.full_vector(&v));
    }

    #[test]
    fn matrix_keep_selects_rows_and_cols() {
        let m = DMatrix::from_row_slice(
            3,
            4,
            &[
                1.0, 2.0, 3.0, 4.0, //
                5.0, 6.0, 7.0, 8.0, //
                9.0, 10.0, 11.0, 12.0,
            ],
        );
        let sel = MatrixBlocks::new(indices(&[(0, 1), (2, 1)]), indices(&[(1, 2)]));
        let kept = sel.keep(&m);
        assert_eq!(kept, DMatrix::from_row_slice(2, 2, &[2.0, 3.0, 10.0, 11.0]));

        let full = sel.full(&m);
        assert_eq!(full[(0, 1)], 2.0);
        assert_eq!(full[(2, 2)], 11.0);
        assert_eq!(full[(1, 1)], 0.0);
        assert_eq!(full[(0, 0)], 0.0);

        let mut target = DMatrix::zeros(3, 4);
        sel.scatter(&kept, &mut target);
        assert_eq!(target, full);
    }

    #[test]
    fn difference_of_index_sets() {
        let a = indices(&[(0, 6)]);
        let b = indices(&[(2, 2)]);
        assert_eq!(a.difference(&b), indices(&[(0, 2), (4, 2)]));
    }
}
