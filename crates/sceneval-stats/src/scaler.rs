//! Column standardization fitted on reference features
//!
//! Query samples are scaled with the reference mean and spread before any
//! distance is computed.

use nalgebra::{DMatrix, DVector};

/// Per-column standardization (`(x − mean) / std`).
///
/// Standard deviations are population statistics. Columns with zero spread keep
/// a scale of 1 so they are only centered.
///
/// ```
/// use nalgebra::DMatrix;
/// use sceneval_stats::scaler::StandardScaler;
///
/// let data = DMatrix::from_row_slice(3, 2, &[1.0, 10.0, 2.0, 10.0, 3.0, 10.0]);
/// let scaler = StandardScaler::fit(&data);
/// let scaled = scaler.transform(&data);
/// assert!(scaled[(1, 0)].abs() < 1e-12);
/// assert!(scaled[(0, 1)].abs() < 1e-12);
/// ```
#[derive(Debug, Clone)]
pub struct StandardScaler {
    mean: DVector<f64>,
    scale: DVector<f64>,
}

impl StandardScaler {
    #[expect(clippy::cast_precision_loss)]
    #[must_use]
    pub fn fit(data: &DMatrix<f64>) -> Self {
        let n = data.nrows().max(1) as f64;
        let mean = DVector::from_iterator(
            data.ncols(),
            data.column_iter().map(|col| col.sum() / n),
        );
        let scale = DVector::from_iterator(
            data.ncols(),
            data.column_iter().zip(mean.iter()).map(|(col, m)| {
                let var = col.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
                let std = var.sqrt();
                if std > f64::EPSILON { std } else { 1.0 }
            }),
        );
        Self { mean, scale }
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    #[must_use]
    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    #[must_use]
    pub fn scale(&self) -> &DVector<f64> {
        &self.scale
    }

    /// Scales a single sample. The sample length must equal [`Self::dim`].
    #[must_use]
    pub fn transform_row(&self, row: &DVector<f64>) -> DVector<f64> {
        assert_eq!(row.len(), self.dim(), "sample dimension mismatch");
        (row - &self.mean).component_div(&self.scale)
    }

    /// Scales every row of `data`.
    #[must_use]
    pub fn transform(&self, data: &DMatrix<f64>) -> DMatrix<f64> {
        assert_eq!(data.ncols(), self.dim(), "sample dimension mismatch");
        let mut scaled = data.clone();
        for mut row in scaled.row_iter_mut() {
            for (j, value) in row.iter_mut().enumerate() {
                *value = (*value - self.mean[j]) / self.scale[j];
            }
        }
        scaled
    }
}
