//! Gaussian reference model and Mahalanobis distance
//!
//! A [`GaussianModel`] summarizes a reference feature matrix (rows are samples,
//! columns are feature dimensions) by its empirical mean and covariance. The
//! Mahalanobis distance of a query vector `x` is
//!
//! ```text
//! d(x) = sqrt((x − μ)ᵀ Σ⁻¹ (x − μ))
//! ```
//!
//! Encoder features are often rank-deficient (more dimensions than
//! independent samples), so `Σ` is regularized with `1e-6 × I` before
//! inversion.

use nalgebra::{DMatrix, DVector};

/// Diagonal term added to the covariance before inversion.
pub const COVARIANCE_REGULARIZATION: f64 = 1e-6;

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum MahalanobisError {
    #[display("reference matrix has no feature columns")]
    EmptyFeatures,
    #[display("at least 2 reference samples are required, got {count}")]
    TooFewSamples { count: usize },
    #[display("reference features contain NaN or infinite values")]
    NonFiniteFeatures,
    #[display("covariance matrix is singular even after regularization")]
    SingularCovariance,
    #[display("query has {actual} dimensions, model expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Empirical mean and (regularized) covariance of a reference feature matrix.
#[derive(Debug, Clone)]
pub struct GaussianModel {
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
    inv_covariance: DMatrix<f64>,
}

impl GaussianModel {
    /// Fits the model with the default regularization.
    pub fn fit(reference: &DMatrix<f64>) -> Result<Self, MahalanobisError> {
        Self::fit_with_regularization(reference, COVARIANCE_REGULARIZATION)
    }

    /// Fits the model, adding `regularization × I` to the sample covariance
    /// (normalized by `n − 1`).
    #[expect(clippy::cast_precision_loss)]
    pub fn fit_with_regularization(
        reference: &DMatrix<f64>,
        regularization: f64,
    ) -> Result<Self, MahalanobisError> {
        let (n, dim) = reference.shape();
        if dim == 0 {
            return Err(MahalanobisError::EmptyFeatures);
        }
        if n < 2 {
            return Err(MahalanobisError::TooFewSamples { count: n });
        }
        if reference.iter().any(|v| !v.is_finite()) {
            return Err(MahalanobisError::NonFiniteFeatures);
        }

        let mean = reference.row_mean().transpose();
        let mut centered = reference.clone();
        for mut row in centered.row_iter_mut() {
            for (j, value) in row.iter_mut().enumerate() {
                *value -= mean[j];
            }
        }
        let mut covariance = (centered.transpose() * &centered) / (n as f64 - 1.0);
        for i in 0..dim {
            covariance[(i, i)] += regularization;
        }

        let inv_covariance = match covariance.clone().cholesky() {
            Some(cholesky) => cholesky.inverse(),
            None => covariance
                .clone()
                .try_inverse()
                .ok_or(MahalanobisError::SingularCovariance)?,
        };
        if inv_covariance.iter().any(|v| !v.is_finite()) {
            return Err(MahalanobisError::SingularCovariance);
        }

        Ok(Self {
            mean,
            covariance,
            inv_covariance,
        })
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
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    #[must_use]
    pub fn inv_covariance(&self) -> &DMatrix<f64> {
        &self.inv_covariance
    }

    /// The quadratic form `(x − μ)ᵀ Σ⁻¹ (x − μ)`.
    pub fn squared_distance(&self, sample: &DVector<f64>) -> Result<f64, MahalanobisError> {
        if sample.len() != self.dim() {
            return Err(MahalanobisError::DimensionMismatch {
                expected: self.dim(),
                actual: sample.len(),
            });
        }
        let diff = sample - &self.mean;
        Ok(diff.dot(&(&self.inv_covariance * &diff)))
    }

    /// Mahalanobis distance of `sample` to the reference mean.
    ///
    /// Rounding can make the quadratic form slightly negative for samples at
    /// the mean; it is clamped to zero. A sample with NaN or infinite values
    /// yields NaN or infinity, never zero.
    pub fn distance(&self, sample: &DVector<f64>) -> Result<f64, MahalanobisError> {
        let squared = self.squared_distance(sample)?;
        if squared < 0.0 {
            return Ok(0.0);
        }
        Ok(squared.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            5,
            3,
            &[
                1.0, 0.5, -1.0, //
                2.0, 1.5, 0.0, //
                0.0, -0.5, 1.0, //
                1.5, 2.0, 0.5, //
                -1.0, 0.0, -0.5,
            ],
        )
    }

    #[test]
    fn test_distance_of_mean_is_zero() {
        let model = GaussianModel::fit(&reference()).unwrap();
        let d = model.distance(model.mean()).unwrap();
        assert!(d.abs() < 1e-9);
    }

    #[test]
    fn test_identity_covariance_reduces_to_euclidean() {
        // Four points at (±1, ±1) have covariance (4/3)·I.
        let data = DMatrix::from_row_slice(4, 2, &[1.0, 1.0, 1.0, -1.0, -1.0, 1.0, -1.0, -1.0]);
        let model = GaussianModel::fit_with_regularization(&data, 0.0).unwrap();
        let query = DVector::from_vec(vec![2.0, 0.0]);
        let expected = (4.0_f64 * 0.75).sqrt();
        assert!((model.distance(&query).unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_rank_deficient_reference_is_regularized() {
        // Second column duplicates the first: singular without regularization.
        let data = DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        let model = GaussianModel::fit(&data).unwrap();
        assert!(model.distance(&DVector::from_vec(vec![2.0, 2.0])).unwrap() < 1e-6);
        assert!(model.distance(&DVector::from_vec(vec![2.0, 3.0])).unwrap() > 100.0);
    }

    #[test]
    fn test_too_few_samples() {
        let data = DMatrix::from_row_slice(1, 2, &[1.0, 2.0]);
        assert!(matches!(
            GaussianModel::fit(&data),
            Err(MahalanobisError::TooFewSamples { count: 1 })
        ));
    }

    #[test]
    fn test_dimension_mismatch() {
        let model = GaussianModel::fit(&reference()).unwrap();
        let result = model.distance(&DVector::from_vec(vec![0.0, 0.0]));
        assert!(matches!(
            result,
            Err(MahalanobisError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_non_finite_query_is_not_zero() {
        let model = GaussianModel::fit(&reference()).unwrap();
        let d = model
            .distance(&DVector::from_vec(vec![f64::NAN, 0.0, 0.0]))
            .unwrap();
        assert!(d.is_nan());
        let d = model
            .distance(&DVector::from_vec(vec![f64::INFINITY, 0.0, 0.0]))
            .unwrap();
        assert!(!d.is_finite());
    }

    #[test]
    fn test_non_finite_reference() {
        let mut data = reference();
        data[(0, 0)] = f64::NAN;
        assert!(matches!(
            GaussianModel::fit(&data),
            Err(MahalanobisError::NonFiniteFeatures)
        ));
    }
}
