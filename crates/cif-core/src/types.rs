//! Common data types for density composition

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Train/eval flag carried by every density in a composition.
///
/// Besides being the per-instance state, a `Mode` is also passed explicitly into
/// [`Density::evaluate_objective_in`](crate::Density::evaluate_objective_in) to select
/// the code path of a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Training code path: running statistics are updated.
    #[default]
    Train,
    /// Evaluation code path: running statistics are read only.
    Eval,
}

impl Mode {
    /// `true` for [`Mode::Train`].
    pub fn is_train(self) -> bool {
        matches!(self, Mode::Train)
    }
}

/// Dense row-major batch of examples, shape `[n_rows, n_cols]`.
///
/// The leading dimension is the example count. Every density returns one objective value
/// per row. Deserialization goes through [`Batch::from_flat`], so a decoded batch always
/// has a consistent shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBatch")]
pub struct Batch {
    n_rows: usize,
    n_cols: usize,
    data: Vec<f64>,
}

#[derive(Deserialize)]
struct RawBatch {
    n_rows: usize,
    n_cols: usize,
    data: Vec<f64>,
}

impl TryFrom<RawBatch> for Batch {
    type Error = Error;

    fn try_from(raw: RawBatch) -> Result<Self> {
        Batch::from_flat(raw.n_rows, raw.n_cols, raw.data)
    }
}

impl Batch {
    /// Create a batch from row-major flat data.
    pub fn from_flat(n_rows: usize, n_cols: usize, data: Vec<f64>) -> Result<Self> {
        let expected = n_rows.checked_mul(n_cols).ok_or_else(|| {
            Error::ContractViolation(format!("batch shape {n_rows}x{n_cols} overflows"))
        })?;
        if data.len() != expected {
            return Err(Error::ContractViolation(format!(
                "batch data length mismatch: expected {n_rows}x{n_cols}={expected}, got {}",
                data.len()
            )));
        }
        Ok(Self { n_rows, n_cols, data })
    }

    /// Create a batch from explicit rows. All rows must have the same length.
    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R]) -> Result<Self> {
        let n_cols = rows.first().map(|r| r.as_ref().len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * n_cols);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != n_cols {
                return Err(Error::ContractViolation(format!(
                    "ragged batch: row {i} has {} columns, expected {n_cols}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self { n_rows: rows.len(), n_cols, data })
    }

    /// All-zero batch.
    pub fn zeros(n_rows: usize, n_cols: usize) -> Self {
        Self { n_rows, n_cols, data: vec![0.0; n_rows * n_cols] }
    }

    /// Number of examples.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Number of features per example.
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// `true` when the batch holds no examples.
    pub fn is_empty(&self) -> bool {
        self.n_rows == 0
    }

    /// Flat row-major view.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Mutable flat row-major view.
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Row `i`. Panics if `i >= n_rows`.
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n_cols..(i + 1) * self.n_cols]
    }

    /// Iterator over rows.
    pub fn rows(&self) -> impl Iterator<Item = &[f64]> + '_ {
        (0..self.n_rows).map(move |i| self.row(i))
    }

    /// Copy of a contiguous range of rows.
    pub fn slice_rows(&self, range: Range<usize>) -> Result<Batch> {
        if range.start > range.end || range.end > self.n_rows {
            return Err(Error::ContractViolation(format!(
                "row range {}..{} out of bounds for batch with {} rows",
                range.start, range.end, self.n_rows
            )));
        }
        let data = self.data[range.start * self.n_cols..range.end * self.n_cols].to_vec();
        Ok(Batch { n_rows: range.len(), n_cols: self.n_cols, data })
    }

    /// Copy of the rows at `indices`, in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> Result<Batch> {
        let mut data = Vec::with_capacity(indices.len() * self.n_cols);
        for &i in indices {
            if i >= self.n_rows {
                return Err(Error::ContractViolation(format!(
                    "row index {i} out of bounds for batch with {} rows",
                    self.n_rows
                )));
            }
            data.extend_from_slice(self.row(i));
        }
        Ok(Batch { n_rows: indices.len(), n_cols: self.n_cols, data })
    }

    /// Overwrite the rows starting at `start` with the contents of `chunk`.
    pub fn write_rows(&mut self, start: usize, chunk: &Batch) -> Result<()> {
        let end = start.checked_add(chunk.n_rows);
        if chunk.n_cols != self.n_cols || end.is_none_or(|end| end > self.n_rows) {
            return Err(Error::ContractViolation(format!(
                "cannot write {}x{} chunk at row {start} into {}x{} batch",
                chunk.n_rows, chunk.n_cols, self.n_rows, self.n_cols
            )));
        }
        let offset = start * self.n_cols;
        self.data[offset..offset + chunk.data.len()].copy_from_slice(&chunk.data);
        Ok(())
    }

    /// Stack batches along the example dimension, e.g. to collect generated samples drawn
    /// in several calls.
    ///
    /// Empty parts are skipped when checking column agreement, so zero-row chunks never
    /// cause a mismatch.
    pub fn concat_rows(parts: &[Batch]) -> Result<Batch> {
        let n_cols =
            parts.iter().find(|p| !p.is_empty()).or(parts.first()).map_or(0, |p| p.n_cols);
        let n_rows = parts.iter().map(|p| p.n_rows).sum();
        let mut data = Vec::with_capacity(n_rows * n_cols);
        for part in parts.iter().filter(|p| !p.is_empty()) {
            if part.n_cols != n_cols {
                return Err(Error::ContractViolation(format!(
                    "cannot concatenate batches with {} and {} columns",
                    n_cols, part.n_cols
                )));
            }
            data.extend_from_slice(&part.data);
        }
        Ok(Batch { n_rows, n_cols, data })
    }

    /// Ensure the batch has `n_cols` features.
    pub fn expect_cols(&self, n_cols: usize) -> Result<()> {
        if self.n_cols != n_cols {
            return Err(Error::ContractViolation(format!(
                "expected batch with {n_cols} columns, got {}",
                self.n_cols
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rows_and_access() {
        let b = Batch::from_rows(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]).unwrap();
        assert_eq!(b.n_rows(), 3);
        assert_eq!(b.n_cols(), 2);
        assert_eq!(b.row(1), &[3.0, 4.0]);
        assert_eq!(b.rows().count(), 3);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let rows: Vec<Vec<f64>> = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(matches!(Batch::from_rows(rows.as_slice()), Err(Error::ContractViolation(_))));
    }

    #[test]
    fn test_from_flat_length_mismatch() {
        assert!(Batch::from_flat(2, 2, vec![0.0; 3]).is_err());
        assert!(Batch::from_flat(0, 7, vec![]).is_ok());
    }

    #[test]
    fn test_from_flat_shape_overflow() {
        assert!(matches!(
            Batch::from_flat(usize::MAX, 2, vec![]),
            Err(Error::ContractViolation(_))
        ));
    }

    #[test]
    fn test_write_rows_start_overflow() {
        let mut target = Batch::zeros(2, 1);
        let chunk = Batch::zeros(1, 1);
        assert!(matches!(
            target.write_rows(usize::MAX, &chunk),
            Err(Error::ContractViolation(_))
        ));
    }

    #[test]
    fn test_deserialize_checks_shape() {
        let b: Batch =
            serde_json::from_str(r#"{"n_rows": 2, "n_cols": 2, "data": [1.0, 2.0, 3.0, 4.0]}"#)
                .unwrap();
        assert_eq!(b.row(1), &[3.0, 4.0]);
        assert_eq!(serde_json::from_str::<Batch>(&serde_json::to_string(&b).unwrap()).unwrap(), b);

        let bad = serde_json::from_str::<Batch>(r#"{"n_rows": 3, "n_cols": 2, "data": [1.0]}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_slice_write_concat() {
        let b = Batch::from_rows(&[[1.0], [2.0], [3.0], [4.0], [5.0]]).unwrap();
        let head = b.slice_rows(0..3).unwrap();
        let tail = b.slice_rows(3..5).unwrap();
        let empty = b.slice_rows(5..5).unwrap();
        assert_eq!(head.as_slice(), &[1.0, 2.0, 3.0]);
        assert!(empty.is_empty());

        let joined = Batch::concat_rows(&[head, empty, tail.clone()]).unwrap();
        assert_eq!(joined, b);

        let mut target = Batch::zeros(5, 1);
        target.write_rows(3, &tail).unwrap();
        assert_eq!(target.as_slice(), &[0.0, 0.0, 0.0, 4.0, 5.0]);
        assert!(target.write_rows(4, &tail).is_err());
    }

    #[test]
    fn test_select_rows() {
        let b = Batch::from_rows(&[[1.0, 1.5], [2.0, 2.5], [3.0, 3.5]]).unwrap();
        let s = b.select_rows(&[2, 0]).unwrap();
        assert_eq!(s.as_slice(), &[3.0, 3.5, 1.0, 1.5]);
        assert!(b.select_rows(&[3]).is_err());
    }

    #[test]
    fn test_mode_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Mode::Eval).unwrap(), "\"eval\"");
        assert_eq!(Mode::default(), Mode::Train);
    }
}
