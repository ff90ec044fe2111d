use crate::{descriptive::DescriptiveStats, histogram::Histogram, percentiles::Percentiles};

/// Summary, percentiles and histogram of one score column.
///
/// ```
/// use sceneval_stats::comprehensive::ComprehensiveStats;
///
/// let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
/// let stats = ComprehensiveStats::new(values, &[25.0, 50.0, 75.0], 5).unwrap();
///
/// assert_eq!(stats.stats.mean, 5.5);
/// assert_eq!(stats.percentiles.get(50.0), Some(6.0));
/// ```
#[derive(Debug, Clone)]
pub struct ComprehensiveStats {
    pub stats: DescriptiveStats,
    pub percentiles: Percentiles,
    /// P5-P95 histogram with open outer bins.
    pub histogram: Histogram,
}

impl ComprehensiveStats {
    /// NaN scores (e.g. entropy of invalid outputs) are dropped first.
    /// `None` if nothing remains.
    #[must_use]
    pub fn new<I>(values: I, percentile_points: &[f64], hist_num_bins: usize) -> Option<Self>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut sorted = values
            .into_iter()
            .filter(|v| !v.is_nan())
            .collect::<Vec<_>>();
        sorted.sort_by(f64::total_cmp);
        Self::from_sorted(&sorted, percentile_points, hist_num_bins)
    }

    #[must_use]
    pub fn from_sorted(
        sorted_values: &[f64],
        percentile_points: &[f64],
        hist_num_bins: usize,
    ) -> Option<Self> {
        let stats = DescriptiveStats::from_sorted(sorted_values)?;
        let percentiles = Percentiles::from_sorted(sorted_values, percentile_points);
        let histogram = Histogram::from_sorted(sorted_values, hist_num_bins);

        Some(Self {
            stats,
            percentiles,
            histogram,
        })
    }
}
