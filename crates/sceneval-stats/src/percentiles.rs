/// Values of a score distribution at a fixed set of percentile points.
///
/// Points are kept in request order. Lookups match a point within
/// `f64::EPSILON`, so ask for the same literals that were used to build it.
///
/// ```
/// use sceneval_stats::percentiles::Percentiles;
///
/// let scores = [0.2, 0.4, 0.1, 0.9, 0.3, 0.5, 0.8, 0.6, 0.7, 1.0];
/// let p = Percentiles::new(&scores, &[5.0, 50.0, 95.0]);
///
/// assert_eq!(p.get(5.0), Some(0.1));
/// assert_eq!(p.get(50.0), Some(0.6));
/// assert_eq!(p.get(95.0), Some(1.0));
/// ```
#[derive(Debug, Clone)]
pub struct Percentiles {
    points: Vec<(f64, f64)>,
}

impl Percentiles {
    /// `sorted_values` must be ascending.
    #[must_use]
    pub fn from_sorted(sorted_values: &[f64], percentile_points: &[f64]) -> Self {
        assert!(
            sorted_values.is_sorted_by(|a, b| a <= b),
            "percentiles need ascending input"
        );
        Self {
            points: percentile_points
                .iter()
                .map(|&point| (point, compute_percentile(sorted_values, point)))
                .collect(),
        }
    }

    /// NaN values are ignored.
    #[must_use]
    pub fn new(values: &[f64], percentile_points: &[f64]) -> Self {
        let mut sorted = values
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .collect::<Vec<_>>();
        sorted.sort_by(f64::total_cmp);
        Self::from_sorted(&sorted, percentile_points)
    }

    /// Value at `percentile`, or `None` if that point was not requested.
    #[must_use]
    pub fn get(&self, percentile: f64) -> Option<f64> {
        self.points
            .iter()
            .find_map(|&(point, value)| ((point - percentile).abs() < f64::EPSILON).then_some(value))
    }

    /// `(percentile, value)` pairs in request order.
    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.points.iter().copied()
    }
}

/// Nearest-rank percentile: index `floor(n * p / 100)`, clamped to the last
/// element. NaN for empty input.
#[expect(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss
)]
#[must_use]
pub fn compute_percentile(sorted_values: &[f64], percentile: f64) -> f64 {
    let Some(last) = sorted_values.len().checked_sub(1) else {
        return f64::NAN;
    };
    let rank = (sorted_values.len() as f64 * percentile / 100.0) as usize;
    sorted_values[rank.min(last)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_nan() {
        assert!(compute_percentile(&[], 50.0).is_nan());
        assert!(Percentiles::new(&[], &[50.0]).get(50.0).unwrap().is_nan());
    }

    #[test]
    fn test_bounds_clamp() {
        let values = [1.0, 2.0, 3.0];
        assert_eq!(compute_percentile(&values, 0.0), 1.0);
        assert_eq!(compute_percentile(&values, 100.0), 3.0);
        assert_eq!(compute_percentile(&values, 150.0), 3.0);
    }

    #[test]
    fn test_request_order_is_kept() {
        let p = Percentiles::new(&[3.0, 1.0, 2.0, 4.0], &[75.0, 25.0]);
        assert_eq!(p.iter().collect::<Vec<_>>(), vec![(75.0, 4.0), (25.0, 2.0)]);
        assert_eq!(p.get(10.0), None);
    }

    #[test]
    fn test_nan_values_are_ignored() {
        let p = Percentiles::new(&[f64::NAN, 2.0, 1.0, f64::NAN, 3.0], &[0.0, 100.0]);
        assert_eq!(p.get(0.0), Some(1.0));
        assert_eq!(p.get(100.0), Some(3.0));
    }
}
