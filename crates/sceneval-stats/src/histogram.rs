use std::ops::Range;

use crate::percentiles;

/// A histogram representation of a dataset's distribution.
///
/// [`Histogram::new`] uses percentile-based binning (P5-P95) for the main bins so
/// that a few extreme scores do not flatten the rest of the distribution, with
/// dedicated underflow/overflow bins for the tails. [`Histogram::with_bounds`]
/// builds plain equal-width bins over explicit bounds, which is what you want when
/// two groups must be drawn on the same axis.
#[derive(Debug, Clone)]
pub struct Histogram {
    /// The bins comprising the histogram, in ascending order.
    pub bins: Vec<HistogramBin>,
}

/// A single bin in a histogram.
#[derive(Debug, Clone)]
pub struct HistogramBin {
    /// The range of values covered by this bin (inclusive start, exclusive end).
    pub range: Range<f64>,
    /// The number of values that fall within this bin.
    pub count: u64,
}

impl Histogram {
    /// Creates a histogram from unsorted values. NaN values are dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// # use sceneval_stats::histogram::Histogram;
    /// let values = [5.0, 2.0, 8.0, 1.0, 9.0, 3.0, 7.0, 4.0, 6.0, 10.0];
    /// let histogram = Histogram::new(values, 5);
    /// let total: u64 = histogram.bins.iter().map(|b| b.count).sum();
    /// assert_eq!(total, 10);
    /// ```
    #[must_use]
    pub fn new<I>(values: I, num_bins: usize) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let mut sorted = values.into_iter().filter(|v| !v.is_nan()).collect::<Vec<_>>();
        sorted.sort_by(f64::total_cmp);
        Self::from_sorted(&sorted, num_bins)
    }

    /// Creates a histogram from pre-sorted values.
    ///
    /// # Panics
    ///
    /// Panics if `sorted_values` is not sorted in ascending order.
    #[expect(
        clippy::cast_precision_loss,
        clippy::cast_sign_loss,
        clippy::cast_possible_truncation
    )]
    #[must_use]
    pub fn from_sorted(sorted_values: &[f64], num_bins: usize) -> Self {
        assert!(
            sorted_values.is_sorted_by(|a, b| a <= b),
            "values must be sorted in ascending order"
        );

        let (Some(&hard_min), Some(&hard_max)) = (sorted_values.first(), sorted_values.last())
        else {
            return Self { bins: vec![] };
        };
        if num_bins == 0 {
            return Self { bins: vec![] };
        }

        let soft_min = percentiles::compute_percentile(sorted_values, 5.0);
        let soft_max = percentiles::compute_percentile(sorted_values, 95.0);
        let mut bin_width = (soft_max - soft_min) / num_bins as f64;
        if bin_width < f64::EPSILON {
            // Distribution concentrated at a single value
            bin_width = 1.0;
        }
        let main_end = soft_min + bin_width * num_bins as f64;

        let has_underflow = hard_min < soft_min;
        let has_overflow = hard_max > main_end;

        let mut bins = vec![];
        if has_underflow {
            bins.push(HistogramBin {
                range: hard_min..soft_min,
                count: 0,
            });
        }
        for bin_idx in 0..num_bins {
            let start = soft_min + bin_idx as f64 * bin_width;
            let mut end = soft_min + (bin_idx + 1) as f64 * bin_width;
            if bin_idx == num_bins - 1 {
                end = end.next_up();
            }
            bins.push(HistogramBin {
                range: start..end,
                count: 0,
            });
        }
        if has_overflow {
            bins.push(HistogramBin {
                range: main_end.next_up()..hard_max.next_up(),
                count: 0,
            });
        }

        let offset = usize::from(has_underflow);
        for &val in sorted_values {
            let idx = if val < soft_min {
                0
            } else if val > main_end {
                num_bins + offset
            } else {
                let pos = ((val - soft_min) / bin_width).floor() as usize;
                pos.min(num_bins - 1) + offset
            };
            bins[idx].count += 1;
        }

        Self { bins }
    }

    /// Creates a histogram of equal-width bins spanning `min..=max`.
    ///
    /// Values outside the bounds are clamped into the first or last bin.
    ///
    /// ```
    /// # use sceneval_stats::histogram::Histogram;
    /// let histogram = Histogram::with_bounds([0.0, 0.5, 1.0, 1.5, 2.0], 2, 0.0, 2.0);
    /// assert_eq!(histogram.bins.len(), 2);
    /// assert_eq!(histogram.bins[0].count, 2);
    /// assert_eq!(histogram.bins[1].count, 3);
    /// ```
    #[expect(
        clippy::cast_precision_loss,
        clippy::cast_sign_loss,
        clippy::cast_possible_truncation
    )]
    #[must_use]
    pub fn with_bounds<I>(values: I, num_bins: usize, min: f64, max: f64) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        if num_bins == 0 {
            return Self { bins: vec![] };
        }
        let mut bin_width = (max - min) / num_bins as f64;
        if bin_width < f64::EPSILON {
            bin_width = 1.0;
        }
        let mut bins = (0..num_bins)
            .map(|bin_idx| HistogramBin {
                range: (min + bin_idx as f64 * bin_width)..(min + (bin_idx + 1) as f64 * bin_width),
                count: 0,
            })
            .collect::<Vec<_>>();
        for val in values {
            if val.is_nan() {
                continue;
            }
            let pos = ((val - min) / bin_width).floor();
            let idx = if pos < 0.0 {
                0
            } else {
                (pos as usize).min(num_bins - 1)
            };
            bins[idx].count += 1;
        }
        Self { bins }
    }

    /// Total number of values counted across all bins.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.bins.iter().map(|b| b.count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_values() {
        let histogram = Histogram::new(std::iter::empty(), 10);
        assert!(histogram.bins.is_empty());
    }

    #[test]
    fn test_all_same_value() {
        let histogram = Histogram::new(vec![3.0; 20], 4);
        assert_eq!(histogram.total(), 20);
        assert_eq!(histogram.bins[0].count, 20);
    }

    #[test]
    fn test_outliers_go_to_tail_bins() {
        let mut values = (0..100).map(f64::from).collect::<Vec<_>>();
        values.push(-1000.0);
        values.push(1000.0);
        let histogram = Histogram::new(values, 10);
        assert_eq!(histogram.total(), 102);
        assert!(histogram.bins.first().unwrap().range.start <= -1000.0);
        assert!(histogram.bins.last().unwrap().range.end > 1000.0);
    }

    #[test]
    fn test_nan_values_are_dropped() {
        let histogram = Histogram::new([1.0, f64::NAN, 2.0, 3.0], 3);
        assert_eq!(histogram.total(), 3);
    }

    #[test]
    fn test_with_bounds_clamps_out_of_range() {
        let histogram = Histogram::with_bounds([-5.0, 0.1, 0.9, 5.0, f64::NAN], 2, 0.0, 1.0);
        assert_eq!(histogram.bins[0].count, 2);
        assert_eq!(histogram.bins[1].count, 2);
    }
}
