//! Statistical building blocks for scenario evaluation.
//!
//! This crate provides the numeric side of the `sceneval` tools:
//!
//! - **Descriptive statistics**: mean, median, population variance and standard deviation
//! - **Percentiles**: nearest-rank percentile lookup
//! - **Histogram generation**: frequency distributions for text rendering
//! - **Comprehensive statistics**: descriptive statistics, percentiles and a histogram together
//! - **OOD scores**: scalar reductions of raw model outputs (energy, MSP, entropy, ...)
//! - **Standard scaling**: per-column standardization of feature matrices
//! - **Mahalanobis distance**: covariance-normalized distance to a reference distribution
//! - **Gaussian mixture**: full-covariance mixture model fitted by EM
//!
//! # Modules
//!
//! - [`descriptive`]: Descriptive statistics for summarizing datasets
//! - [`percentiles`]: Percentile computation and storage
//! - [`histogram`]: Histogram construction for visualizing data distributions
//! - [`comprehensive`]: Comprehensive statistical analysis combining multiple measures
//! - [`score`]: OOD score formulas over raw model outputs
//! - [`scaler`]: Standard scaling of feature matrices
//! - [`mahalanobis`]: Gaussian reference model and Mahalanobis distance
//! - [`mixture`]: Gaussian mixture model
//!
//! # Examples
//!
//! ## Computing descriptive statistics
//!
//! ```
//! use sceneval_stats::descriptive::DescriptiveStats;
//!
//! let values = [1.0, 2.0, 3.0, 4.0, 5.0];
//! let stats = DescriptiveStats::new(values).unwrap();
//! assert_eq!(stats.mean, 3.0);
//! ```
//!
//! ## Computing an energy score
//!
//! ```
//! use sceneval_stats::score::ScoreKind;
//!
//! let logits = [2.0, 2.0, 2.0, 2.0];
//! let energy = ScoreKind::Energy.compute(&logits);
//! assert!((energy - (2.0 + 4.0_f64.ln())).abs() < 1e-12);
//! ```
//!
//! ## Measuring Mahalanobis distance
//!
//! ```
//! use nalgebra::DMatrix;
//! use sceneval_stats::mahalanobis::GaussianModel;
//!
//! let reference = DMatrix::from_row_slice(4, 2, &[
//!     1.0, 2.0,
//!     2.0, 1.0,
//!     3.0, 4.0,
//!     4.0, 3.0,
//! ]);
//! let model = GaussianModel::fit(&reference).unwrap();
//! let d = model.distance(model.mean()).unwrap();
//! assert!(d.abs() < 1e-9);
//! ```

pub mod comprehensive;
pub mod descriptive;
pub mod histogram;
pub mod mahalanobis;
pub mod mixture;
pub mod percentiles;
pub mod scaler;
pub mod score;
