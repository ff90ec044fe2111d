//! Feature-space OOD analysis
//!
//! Reference ego embeddings (typically from training scenarios) are
//! standardized and summarized by a Gaussian model, optionally also by a
//! Gaussian mixture. Query scenarios are scaled with the reference statistics
//! and scored by Mahalanobis distance (larger is more unusual) and mixture
//! log-likelihood (smaller is more unusual).

use nalgebra::{DMatrix, DVector};
use sceneval_stats::{
    mahalanobis::{GaussianModel, MahalanobisError},
    mixture::{GaussianMixture, MixtureConfig, MixtureError},
    scaler::StandardScaler,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::encoder::{self, EncoderError, ScenarioFeatures};

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum OodError {
    #[display("Failed to build feature rows")]
    Features { source: EncoderError },
    #[display("Failed to fit Gaussian model")]
    Gaussian { source: MahalanobisError },
    #[display("Failed to fit Gaussian mixture")]
    Mixture { source: MixtureError },
    #[display("Query has {actual} dimensions, reference has {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl From<EncoderError> for OodError {
    fn from(source: EncoderError) -> Self {
        OodError::Features { source }
    }
}

/// Scores of every ego row of one scenario.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioDistance {
    pub scenario: String,
    pub distances: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_likelihoods: Option<Vec<f64>>,
}

/// Reference matrix of the ego rows of every array of every scenario.
pub fn reference_matrix(scenarios: &[ScenarioFeatures]) -> Result<DMatrix<f64>, OodError> {
    let blocks = scenarios
        .iter()
        .map(ScenarioFeatures::ego_rows)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(encoder::to_dmatrix(&encoder::stack_rows(&blocks)?))
}

fn has_non_finite<'a>(values: impl IntoIterator<Item = &'a f64>) -> bool {
    values.into_iter().any(|v| !v.is_finite())
}

#[derive(Debug, Clone)]
pub struct FeatureOodAnalyzer {
    scaler: StandardScaler,
    gaussian: GaussianModel,
    mixture: Option<GaussianMixture>,
}

impl FeatureOodAnalyzer {
    /// Fits the scaler and Gaussian model on `reference` rows, plus a mixture
    /// when `mixture` is given.
    pub fn fit(
        reference: &DMatrix<f64>,
        mixture: Option<&MixtureConfig>,
    ) -> Result<Self, OodError> {
        debug!(
            "reference {}x{}, non-finite values: {}",
            reference.nrows(),
            reference.ncols(),
            has_non_finite(reference.iter())
        );
        let scaler = StandardScaler::fit(reference);
        let scaled = scaler.transform(reference);
        let gaussian =
            GaussianModel::fit(&scaled).map_err(|source| OodError::Gaussian { source })?;
        debug!(
            "covariance non-finite: {}, inverse non-finite: {}",
            has_non_finite(gaussian.covariance().iter()),
            has_non_finite(gaussian.inv_covariance().iter())
        );
        let mixture = mixture
            .map(|config| GaussianMixture::fit(&scaled, config))
            .transpose()
            .map_err(|source| OodError::Mixture { source })?;
        if let Some(mixture) = &mixture
            && !mixture.converged()
        {
            warn!(
                "Gaussian mixture did not converge after {} iterations",
                mixture.n_iter()
            );
        }
        Ok(Self {
            scaler,
            gaussian,
            mixture,
        })
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.scaler.dim()
    }

    #[must_use]
    pub fn mixture(&self) -> Option<&GaussianMixture> {
        self.mixture.as_ref()
    }

    fn scale(&self, query: &DVector<f64>) -> Result<DVector<f64>, OodError> {
        if query.len() != self.dim() {
            return Err(OodError::DimensionMismatch {
                expected: self.dim(),
                actual: query.len(),
            });
        }
        Ok(self.scaler.transform_row(query))
    }

    /// Mahalanobis distance of `query` from the reference distribution.
    ///
    /// NaN when `query` holds NaN values.
    pub fn mahalanobis(&self, query: &DVector<f64>) -> Result<f64, OodError> {
        let scaled = self.scale(query)?;
        self.gaussian
            .distance(&scaled)
            .map_err(|source| OodError::Gaussian { source })
    }

    /// Log-likelihood of `query` under the mixture, if one was fitted.
    pub fn mixture_log_likelihood(&self, query: &DVector<f64>) -> Result<Option<f64>, OodError> {
        let Some(mixture) = &self.mixture else {
            return Ok(None);
        };
        let scaled = self.scale(query)?;
        mixture
            .score_sample(&scaled)
            .map(Some)
            .map_err(|source| OodError::Mixture { source })
    }

    /// Scores every ego row of every scenario.
    ///
    /// Rows with NaN or infinite features keep their non-finite scores and
    /// are reported with a warning.
    pub fn score_scenarios(
        &self,
        scenarios: &[ScenarioFeatures],
    ) -> Result<Vec<ScenarioDistance>, OodError> {
        scenarios
            .iter()
            .map(|scenario| -> Result<ScenarioDistance, OodError> {
                let rows = encoder::to_dmatrix(&scenario.ego_rows()?);
                let mut distances = vec![];
                let mut log_likelihoods = self.mixture.as_ref().map(|_| vec![]);
                let mut non_finite_rows = 0;
                for row in rows.row_iter() {
                    let query = row.transpose();
                    if has_non_finite(query.iter()) {
                        non_finite_rows += 1;
                    }
                    distances.push(self.mahalanobis(&query)?);
                    if let Some(values) = &mut log_likelihoods
                        && let Some(value) = self.mixture_log_likelihood(&query)?
                    {
                        values.push(value);
                    }
                }
                if non_finite_rows > 0 {
                    warn!(
                        "{}: {non_finite_rows} of {} rows have non-finite features",
                        scenario.name,
                        rows.nrows()
                    );
                }
                Ok(ScenarioDistance {
                    scenario: scenario.name.clone(),
                    distances,
                    log_likelihoods,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;

    /// Ego rows spread around the origin in 2-D.
    fn reference() -> DMatrix<f64> {
        let mut values = vec![];
        for i in 0..30 {
            let t = f64::from(i);
            values.extend_from_slice(&[(t * 0.7).sin(), (t * 1.3).cos() + 0.1 * t.sin()]);
        }
        DMatrix::from_row_slice(30, 2, &values)
    }

    fn scenario(name: &str, ego: [f64; 2]) -> ScenarioFeatures {
        let array = Array3::from_shape_fn((1, 2, 2), |(_, t, d)| if t == 0 { ego[d] } else { 0.0 });
        ScenarioFeatures {
            name: name.to_owned(),
            arrays: vec![("encoding".to_owned(), array.into_dyn())],
        }
    }

    #[test]
    fn test_outlier_is_farther() {
        let analyzer = FeatureOodAnalyzer::fit(&reference(), None).unwrap();
        let center = analyzer
            .mahalanobis(&DVector::from_vec(vec![0.0, 0.0]))
            .unwrap();
        let far = analyzer
            .mahalanobis(&DVector::from_vec(vec![10.0, -10.0]))
            .unwrap();
        assert!(far > center);
        assert!(analyzer.mixture().is_none());
        assert_eq!(
            analyzer
                .mixture_log_likelihood(&DVector::from_vec(vec![0.0, 0.0]))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_reference_mean_has_zero_distance() {
        let data = reference();
        let mean = DVector::from_iterator(2, data.column_iter().map(|c| c.mean()));
        let analyzer = FeatureOodAnalyzer::fit(&data, None).unwrap();
        assert!(analyzer.mahalanobis(&mean).unwrap() < 1e-9);
    }

    #[test]
    fn test_dimension_mismatch() {
        let analyzer = FeatureOodAnalyzer::fit(&reference(), None).unwrap();
        assert!(matches!(
            analyzer.mahalanobis(&DVector::from_vec(vec![0.0])),
            Err(OodError::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_score_scenarios_with_mixture() {
        let config = MixtureConfig {
            n_components: 1,
            ..MixtureConfig::default()
        };
        let analyzer = FeatureOodAnalyzer::fit(&reference(), Some(&config)).unwrap();
        let scores = analyzer
            .score_scenarios(&[scenario("near", [0.0, 0.2]), scenario("far", [8.0, 8.0])])
            .unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].scenario, "near");
        assert_eq!(scores[0].distances.len(), 1);
        assert!(scores[1].distances[0] > scores[0].distances[0]);
        let near = scores[0].log_likelihoods.as_ref().unwrap()[0];
        let far = scores[1].log_likelihoods.as_ref().unwrap()[0];
        assert!(near > far);
    }

    #[test]
    fn test_non_finite_query_is_not_in_distribution() {
        let analyzer = FeatureOodAnalyzer::fit(&reference(), None).unwrap();
        assert!(
            analyzer
                .mahalanobis(&DVector::from_vec(vec![f64::NAN, 0.0]))
                .unwrap()
                .is_nan()
        );
        let scores = analyzer
            .score_scenarios(&[scenario("broken", [f64::NAN, 0.0]), scenario("ok", [0.0, 0.0])])
            .unwrap();
        assert!(scores[0].distances[0].is_nan());
        assert!(scores[1].distances[0].is_finite());
    }

    #[test]
    fn test_reference_matrix() {
        let matrix = reference_matrix(&[scenario("a", [1.0, 2.0]), scenario("b", [3.0, 4.0])])
            .unwrap();
        assert_eq!(matrix, DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]));
        assert!(matches!(
            reference_matrix(&[]),
            Err(OodError::Features {
                source: EncoderError::Empty
            })
        ));
    }
}
