//! Full-covariance Gaussian mixture model fitted by expectation-maximization
//!
//! Used as an alternative density model for encoder features: a sample that
//! has low log-likelihood under a mixture fitted to in-distribution features is
//! a candidate out-of-distribution scenario.
//!
//! Initialization runs a few rounds of k-means from randomly chosen samples.
//! The random generator is seeded from [`MixtureConfig::seed`], so fitting is
//! reproducible.

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector};
use rand::SeedableRng as _;
use rand_pcg::Pcg64Mcg;

use crate::score::log_sum_exp;

const KMEANS_ITERATIONS: usize = 10;

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum MixtureError {
    #[display("mixture needs at least one component")]
    ZeroComponents,
    #[display("{count} samples are not enough to fit {components} components")]
    TooFewSamples { count: usize, components: usize },
    #[display("data has no feature columns")]
    EmptyFeatures,
    #[display("data contains NaN or infinite values")]
    NonFiniteData,
    #[display("covariance of component {component} is not positive definite")]
    SingularCovariance { component: usize },
    #[display("sample has {actual} dimensions, model expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Fitting parameters. Defaults follow the common EM conventions
/// (2 components, `reg_covar = 1e-6`, 100 iterations, tolerance `1e-3`).
#[derive(Debug, Clone)]
pub struct MixtureConfig {
    pub n_components: usize,
    pub reg_covar: f64,
    pub max_iter: usize,
    pub tol: f64,
    pub seed: u64,
}

impl Default for MixtureConfig {
    fn default() -> Self {
        Self {
            n_components: 2,
            reg_covar: 1e-6,
            max_iter: 100,
            tol: 1e-3,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Component {
    mean: DVector<f64>,
    inv_covariance: DMatrix<f64>,
    log_det: f64,
}

impl Component {
    fn log_density(&self, sample: &DVector<f64>) -> f64 {
        #[expect(clippy::cast_precision_loss)]
        let dim = sample.len() as f64;
        let diff = sample - &self.mean;
        let maha = diff.dot(&(&self.inv_covariance * &diff));
        -0.5 * (dim * (2.0 * PI).ln() + self.log_det + maha)
    }
}

/// A fitted Gaussian mixture.
#[derive(Debug, Clone)]
pub struct GaussianMixture {
    weights: Vec<f64>,
    components: Vec<Component>,
    converged: bool,
    n_iter: usize,
    lower_bound: f64,
}

impl GaussianMixture {
    /// Fits a mixture to the rows of `data`.
    pub fn fit(data: &DMatrix<f64>, config: &MixtureConfig) -> Result<Self, MixtureError> {
        let (n, dim) = data.shape();
        let k = config.n_components;
        if k == 0 {
            return Err(MixtureError::ZeroComponents);
        }
        if dim == 0 {
            return Err(MixtureError::EmptyFeatures);
        }
        if n < k.max(2) {
            return Err(MixtureError::TooFewSamples {
                count: n,
                components: k,
            });
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(MixtureError::NonFiniteData);
        }

        let samples = data
            .row_iter()
            .map(|row| row.transpose())
            .collect::<Vec<DVector<f64>>>();

        let labels = kmeans_labels(&samples, k, config.seed);
        let mut resp = DMatrix::<f64>::zeros(n, k);
        for (i, label) in labels.iter().enumerate() {
            resp[(i, *label)] = 1.0;
        }

        let mut model = Self::m_step(&samples, &resp, config.reg_covar)?;
        let mut lower_bound = f64::NEG_INFINITY;
        for iter in 1..=config.max_iter {
            let (log_likelihood, next_resp) = model.e_step(&samples);
            model = Self::m_step(&samples, &next_resp, config.reg_covar)?;
            model.n_iter = iter;
            let change = log_likelihood - lower_bound;
            lower_bound = log_likelihood;
            if change.abs() < config.tol {
                model.converged = true;
                break;
            }
        }
        model.lower_bound = lower_bound;

        Ok(model)
    }

    #[expect(clippy::cast_precision_loss)]
    fn m_step(
        samples: &[DVector<f64>],
        resp: &DMatrix<f64>,
        reg_covar: f64,
    ) -> Result<Self, MixtureError> {
        let n = samples.len();
        let dim = samples[0].len();
        let mut weights = vec![];
        let mut components = vec![];
        for c in 0..resp.ncols() {
            let nk = resp.column(c).sum() + 10.0 * f64::EPSILON;
            let mut mean = DVector::<f64>::zeros(dim);
            for (i, sample) in samples.iter().enumerate() {
                mean += sample * resp[(i, c)];
            }
            mean /= nk;

            let mut covariance = DMatrix::<f64>::zeros(dim, dim);
            for (i, sample) in samples.iter().enumerate() {
                let diff = sample - &mean;
                covariance += (&diff * diff.transpose()) * resp[(i, c)];
            }
            covariance /= nk;
            for d in 0..dim {
                covariance[(d, d)] += reg_covar;
            }

            let cholesky = covariance
                .cholesky()
                .ok_or(MixtureError::SingularCovariance { component: c })?;
            let log_det = 2.0 * cholesky.l().diagonal().iter().map(|v| v.ln()).sum::<f64>();
            let inv_covariance = cholesky.inverse();

            weights.push(nk / n as f64);
            components.push(Component {
                mean,
                inv_covariance,
                log_det,
            });
        }
        Ok(Self {
            weights,
            components,
            converged: false,
            n_iter: 0,
            lower_bound: f64::NEG_INFINITY,
        })
    }

    /// Returns the mean log-likelihood and the responsibility matrix.
    #[expect(clippy::cast_precision_loss)]
    fn e_step(&self, samples: &[DVector<f64>]) -> (f64, DMatrix<f64>) {
        let k = self.components.len();
        let mut resp = DMatrix::<f64>::zeros(samples.len(), k);
        let mut total = 0.0;
        for (i, sample) in samples.iter().enumerate() {
            let weighted = self.weighted_log_prob(sample);
            let norm = log_sum_exp(&weighted);
            total += norm;
            for (c, lp) in weighted.iter().enumerate() {
                resp[(i, c)] = (lp - norm).exp();
            }
        }
        (total / samples.len() as f64, resp)
    }

    fn weighted_log_prob(&self, sample: &DVector<f64>) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.components)
            .map(|(w, component)| w.ln() + component.log_density(sample))
            .collect()
    }

    fn check_dim(&self, sample: &DVector<f64>) -> Result<(), MixtureError> {
        let expected = self.dim();
        if sample.len() == expected {
            Ok(())
        } else {
            Err(MixtureError::DimensionMismatch {
                expected,
                actual: sample.len(),
            })
        }
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.components[0].mean.len()
    }

    #[must_use]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn means(&self) -> impl Iterator<Item = &DVector<f64>> + '_ {
        self.components.iter().map(|c| &c.mean)
    }

    #[must_use]
    pub fn converged(&self) -> bool {
        self.converged
    }

    #[must_use]
    pub fn n_iter(&self) -> usize {
        self.n_iter
    }

    /// Mean log-likelihood of the training data at the last iteration.
    #[must_use]
    pub fn lower_bound(&self) -> f64 {
        self.lower_bound
    }

    /// Log density of one sample under the mixture.
    pub fn score_sample(&self, sample: &DVector<f64>) -> Result<f64, MixtureError> {
        self.check_dim(sample)?;
        Ok(log_sum_exp(&self.weighted_log_prob(sample)))
    }

    /// Log density of every row of `data`.
    pub fn score_samples(&self, data: &DMatrix<f64>) -> Result<Vec<f64>, MixtureError> {
        data.row_iter()
            .map(|row| self.score_sample(&row.transpose()))
            .collect()
    }

    /// Index of the most likely component for every row of `data`.
    pub fn predict(&self, data: &DMatrix<f64>) -> Result<Vec<usize>, MixtureError> {
        data.row_iter()
            .map(|row| {
                let sample = row.transpose();
                self.check_dim(&sample)?;
                let weighted = self.weighted_log_prob(&sample);
                Ok(weighted
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map_or(0, |(c, _)| c))
            })
            .collect()
    }
}

fn kmeans_labels(samples: &[DVector<f64>], k: usize, seed: u64) -> Vec<usize> {
    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let mut centers = rand::seq::index::sample(&mut rng, samples.len(), k)
        .into_iter()
        .map(|i| samples[i].clone())
        .collect::<Vec<_>>();
    let mut labels = vec![0; samples.len()];

    for _ in 0..KMEANS_ITERATIONS {
        for (label, sample) in labels.iter_mut().zip(samples) {
            *label = centers
                .iter()
                .enumerate()
                .map(|(c, center)| (c, (sample - center).norm_squared()))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map_or(0, |(c, _)| c);
        }
        for (c, center) in centers.iter_mut().enumerate() {
            let members = samples
                .iter()
                .zip(&labels)
                .filter(|(_, label)| **label == c)
                .map(|(sample, _)| sample)
                .collect::<Vec<_>>();
            // Empty clusters keep their previous center
            if members.is_empty() {
                continue;
            }
            let mut sum = DVector::<f64>::zeros(center.len());
            for member in &members {
                sum += *member;
            }
            #[expect(clippy::cast_precision_loss)]
            let count = members.len() as f64;
            *center = sum / count;
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_clusters() -> DMatrix<f64> {
        let mut rows = vec![];
        for i in 0..20 {
            let t = f64::from(i) * 0.05;
            rows.extend_from_slice(&[t, 1.0 - t]);
            rows.extend_from_slice(&[10.0 + t, 10.0 + t * 0.5]);
        }
        DMatrix::from_row_slice(40, 2, &rows)
    }

    #[test]
    fn test_separates_two_clusters() {
        let data = two_clusters();
        let gmm = GaussianMixture::fit(&data, &MixtureConfig::default()).unwrap();
        let labels = gmm.predict(&data).unwrap();
        // rows alternate between the two clusters
        let first = labels[0];
        let second = labels[1];
        assert_ne!(first, second);
        for (i, label) in labels.iter().enumerate() {
            let expected = if i % 2 == 0 { first } else { second };
            assert_eq!(*label, expected, "row {i}");
        }
        let total_weight = gmm.weights().iter().sum::<f64>();
        assert!((total_weight - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_outlier_scores_lower() {
        let data = two_clusters();
        let gmm = GaussianMixture::fit(&data, &MixtureConfig::default()).unwrap();
        let inlier = gmm.score_sample(&DVector::from_vec(vec![0.5, 0.5])).unwrap();
        let outlier = gmm
            .score_sample(&DVector::from_vec(vec![-40.0, 60.0]))
            .unwrap();
        assert!(inlier > outlier);
    }

    #[test]
    fn test_fit_is_reproducible() {
        let data = two_clusters();
        let config = MixtureConfig::default();
        let a = GaussianMixture::fit(&data, &config).unwrap();
        let b = GaussianMixture::fit(&data, &config).unwrap();
        assert_eq!(a.score_samples(&data).unwrap(), b.score_samples(&data).unwrap());
    }

    #[test]
    fn test_too_few_samples() {
        let data = DMatrix::from_row_slice(1, 2, &[0.0, 1.0]);
        assert!(matches!(
            GaussianMixture::fit(&data, &MixtureConfig::default()),
            Err(MixtureError::TooFewSamples { .. })
        ));
    }
}
