//! Out-of-distribution scores over raw model outputs
//!
//! Each formula reduces one array of raw model outputs (typically logits) to a
//! single scalar. Formulas never look at other arrays, so a table of outputs can
//! be scored row by row in any order.
//!
//! | kind | formula |
//! |---|---|
//! | `energy` | `ln Σ exp(x)` |
//! | `msp` | `max(softmax(x))` |
//! | `mean` | `mean(x)` |
//! | `exp-mean` | `ln mean(exp(x))` |
//! | `variance` | `var(x)` (population) |
//! | `mean-plus-variance` | `mean(x) + var(x)` |
//! | `max-minus-mean` | `max(x) − mean(x)` |
//! | `entropy` | `−Σ p ln p` with `p = x / Σ x` |
//!
//! Empty arrays score NaN.

use std::{fmt, str::FromStr};

/// Error returned when a score kind name is not recognized.
#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("unknown score kind '{name}' (expected one of: {})", ScoreKind::NAMES.join(", "))]
pub struct ParseScoreKindError {
    name: String,
}

/// Selects the scalar reduction applied to each output array.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScoreKind {
    #[default]
    Energy,
    Msp,
    Mean,
    ExpMean,
    Variance,
    MeanPlusVariance,
    MaxMinusMean,
    Entropy,
}

impl ScoreKind {
    pub const ALL: [ScoreKind; 8] = [
        ScoreKind::Energy,
        ScoreKind::Msp,
        ScoreKind::Mean,
        ScoreKind::ExpMean,
        ScoreKind::Variance,
        ScoreKind::MeanPlusVariance,
        ScoreKind::MaxMinusMean,
        ScoreKind::Entropy,
    ];

    const NAMES: [&'static str; 8] = [
        "energy",
        "msp",
        "mean",
        "exp-mean",
        "variance",
        "mean-plus-variance",
        "max-minus-mean",
        "entropy",
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ScoreKind::Energy => "energy",
            ScoreKind::Msp => "msp",
            ScoreKind::Mean => "mean",
            ScoreKind::ExpMean => "exp-mean",
            ScoreKind::Variance => "variance",
            ScoreKind::MeanPlusVariance => "mean-plus-variance",
            ScoreKind::MaxMinusMean => "max-minus-mean",
            ScoreKind::Entropy => "entropy",
        }
    }

    /// Reduces one array of raw outputs to a scalar score.
    #[must_use]
    pub fn compute(self, values: &[f64]) -> f64 {
        match self {
            ScoreKind::Energy => log_sum_exp(values),
            ScoreKind::Msp => max_softmax(values),
            ScoreKind::Mean => mean(values),
            ScoreKind::ExpMean => log_mean_exp(values),
            ScoreKind::Variance => variance(values),
            ScoreKind::MeanPlusVariance => mean(values) + variance(values),
            ScoreKind::MaxMinusMean => max(values) - mean(values),
            ScoreKind::Entropy => entropy(values),
        }
    }
}

impl fmt::Display for ScoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.as_str(), f)
    }
}

impl FromStr for ScoreKind {
    type Err = ParseScoreKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        ScoreKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| ParseScoreKindError { name: s.to_owned() })
    }
}

fn max(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

/// `ln Σ exp(x)`, shifted by the maximum so large logits do not overflow.
///
/// ```
/// use sceneval_stats::score::log_sum_exp;
///
/// let value = log_sum_exp(&[1000.0, 1000.0]);
/// assert!((value - (1000.0 + 2.0_f64.ln())).abs() < 1e-9);
/// ```
#[must_use]
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let m = max(values);
    if !m.is_finite() {
        return m;
    }
    let sum = values.iter().map(|v| (v - m).exp()).sum::<f64>();
    m + sum.ln()
}

/// `ln mean(exp(x))`.
#[expect(clippy::cast_precision_loss)]
#[must_use]
pub fn log_mean_exp(values: &[f64]) -> f64 {
    log_sum_exp(values) - (values.len() as f64).ln()
}

/// Numerically stable softmax. Returns an empty vector for empty input.
#[must_use]
pub fn softmax(values: &[f64]) -> Vec<f64> {
    let m = max(values);
    let exps = values.iter().map(|v| (v - m).exp()).collect::<Vec<_>>();
    let sum = exps.iter().sum::<f64>();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Maximum softmax probability.
#[must_use]
pub fn max_softmax(values: &[f64]) -> f64 {
    max(&softmax(values))
}

#[expect(clippy::cast_precision_loss)]
#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance (divides by `n`).
#[expect(clippy::cast_precision_loss)]
#[must_use]
pub fn variance(values: &[f64]) -> f64 {
    let m = mean(values);
    if m.is_nan() {
        return f64::NAN;
    }
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

/// Shannon entropy of `values` treated as unnormalized probabilities.
///
/// Returns NaN if any value is negative or the values do not sum to a
/// positive number.
///
/// ```
/// use sceneval_stats::score::entropy;
///
/// let uniform = entropy(&[1.0, 1.0, 1.0, 1.0]);
/// assert!((uniform - 4.0_f64.ln()).abs() < 1e-12);
/// assert!(entropy(&[1.0, -1.0]).is_nan());
/// ```
#[must_use]
pub fn entropy(values: &[f64]) -> f64 {
    if values.iter().any(|v| *v < 0.0 || v.is_nan()) {
        return f64::NAN;
    }
    let sum = values.iter().sum::<f64>();
    if sum <= 0.0 || !sum.is_finite() {
        return f64::NAN;
    }
    -values
        .iter()
        .map(|v| v / sum)
        .filter(|p| *p > 0.0)
        .map(|p| p * p.ln())
        .sum::<f64>()
}

/// Aggregate statistics of the per-array scores within one row.
///
/// Matches the `ood_score_avg/max/min/std/var` columns; standard deviation
/// and variance are population statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreSummary {
    pub avg: f64,
    pub max: f64,
    pub min: f64,
    pub std: f64,
    pub var: f64,
}

impl ScoreSummary {
    /// Returns `None` for an empty score list.
    ///
    /// ```
    /// use sceneval_stats::score::ScoreSummary;
    ///
    /// let summary = ScoreSummary::from_scores(&[1.0, 3.0]).unwrap();
    /// assert_eq!(summary.avg, 2.0);
    /// assert_eq!(summary.max, 3.0);
    /// assert_eq!(summary.min, 1.0);
    /// assert_eq!(summary.var, 1.0);
    /// assert_eq!(summary.std, 1.0);
    /// ```
    #[must_use]
    pub fn from_scores(scores: &[f64]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }
        let avg = mean(scores);
        let var = variance(scores);
        Some(Self {
            avg,
            max: max(scores),
            min: scores.iter().copied().fold(f64::INFINITY, f64::min),
            std: var.sqrt(),
            var,
        })
    }
}
