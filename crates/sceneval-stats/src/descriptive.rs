/// Summary of a batch of scores or distances.
///
/// `variance` and `std_dev` divide by `n`, the same convention as the
/// `ood_score_std` / `ood_score_var` row aggregates.
///
/// ```
/// # use sceneval_stats::descriptive::DescriptiveStats;
/// let distances = [5.0, 2.0, 4.0, 1.0, 3.0];
/// let summary = DescriptiveStats::new(distances).unwrap();
/// assert_eq!((summary.min, summary.max), (1.0, 5.0));
/// assert_eq!(summary.mean, 3.0);
/// assert_eq!(summary.median, 3.0);
/// assert_eq!(summary.variance, 2.0);
/// ```
#[derive(Debug, Clone)]
pub struct DescriptiveStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Midpoint of the two middle values when `count` is even.
    pub median: f64,
    pub variance: f64,
    pub std_dev: f64,
}

impl DescriptiveStats {
    /// NaN values are ignored. `None` when nothing is left.
    #[must_use]
    pub fn new<I>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut sorted = values.into_iter().filter(|v| !v.is_nan()).collect::<Vec<_>>();
        sorted.sort_by(f64::total_cmp);
        Self::from_sorted(&sorted)
    }

    /// Same as [`DescriptiveStats::new`] for input that is already ascending.
    #[expect(clippy::cast_precision_loss)]
    #[must_use]
    pub fn from_sorted(sorted_values: &[f64]) -> Option<Self> {
        assert!(
            sorted_values.is_sorted_by(|a, b| a <= b),
            "summary needs ascending input"
        );
        let (&min, &max) = (sorted_values.first()?, sorted_values.last()?);
        let count = sorted_values.len();
        let mid = count / 2;
        let median = if count % 2 == 1 {
            sorted_values[mid]
        } else {
            f64::midpoint(sorted_values[mid - 1], sorted_values[mid])
        };
        let n = count as f64;
        let mean = sorted_values.iter().sum::<f64>() / n;
        let variance = sorted_values
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / n;
        Some(Self {
            count,
            min,
            max,
            mean,
            median,
            variance,
            std_dev: variance.sqrt(),
        })
    }
}
