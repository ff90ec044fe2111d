//! Scenario type counts
//!
//! [`ScenarioTypeCounts`] maps a scenario type name to the number of scenarios
//! of that type. Counts are built from log databases ([`crate::db`]), cache
//! trees ([`crate::cache`]) or count files, and merge by summation, so the
//! order in which sources are aggregated never changes the result.
//!
//! The module also contains the policies applied to counts:
//!
//! - [`ScenarioTypeCounts::resample_targets`]: how many extra scenarios each
//!   under-represented type needs to reach a threshold
//! - [`CountBands`]: grouping of types into contiguous count ranges
//! - [`ScenarioTypeCounts::top_share`]: the most frequent types covering a
//!   fraction of all scenarios
//! - [`SplitComparison`]: type overlap and size of a train and a test split
//!
//! # File Format
//!
//! Count files are flat YAML mappings:
//!
//! ```yaml
//! following_lane_with_lead: 3702
//! stopping_at_crosswalk: 812
//! ```

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    fs::File,
    io::{self, BufReader, BufWriter, Write as _},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Upper bounds of the default count bands: `0-500`, `501-1000`, `1001-10000`, `10001+`.
pub const DEFAULT_BAND_UPPER_BOUNDS: [u64; 3] = [500, 1000, 10000];

/// Default cumulative share used by [`ScenarioTypeCounts::top_share`].
pub const DEFAULT_TOP_SHARE: f64 = 0.9;

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum CountsError {
    #[display("Failed to open count file {}", path.display())]
    Open { path: PathBuf, source: io::Error },
    #[display("Failed to create count file {}", path.display())]
    Create { path: PathBuf, source: io::Error },
    #[display("Failed to parse count file {}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[display("Failed to write count file {}", path.display())]
    Write {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[display("Failed to flush count file {}", path.display())]
    Flush { path: PathBuf, source: io::Error },
    #[display("Band upper bounds must be strictly increasing, got {bounds:?}")]
    UnorderedBands { bounds: Vec<u64> },
}

/// Occurrence count per scenario type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScenarioTypeCounts {
    counts: BTreeMap<String, u64>,
}

impl ScenarioTypeCounts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `count` scenarios of `scenario_type`.
    pub fn add<S>(&mut self, scenario_type: S, count: u64)
    where
        S: Into<String>,
    {
        *self.counts.entry(scenario_type.into()).or_default() += count;
    }

    /// Adds every count of `other` into `self`.
    pub fn merge(&mut self, other: &ScenarioTypeCounts) {
        for (scenario_type, count) in &other.counts {
            self.add(scenario_type.clone(), *count);
        }
    }

    /// Count of `scenario_type`, zero when absent.
    #[must_use]
    pub fn get(&self, scenario_type: &str) -> u64 {
        self.counts.get(scenario_type).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn contains(&self, scenario_type: &str) -> bool {
        self.counts.contains_key(scenario_type)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Iterates in scenario type order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.counts.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn scenario_types(&self) -> impl Iterator<Item = &str> + '_ {
        self.counts.keys().map(String::as_str)
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Entries sorted by count (descending), ties broken by name.
    #[must_use]
    pub fn sorted_by_count(&self) -> Vec<(&str, u64)> {
        let mut entries = self.iter().collect::<Vec<_>>();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries
    }

    /// Number of additional scenarios each type needs to reach `threshold`.
    ///
    /// Only types whose count is strictly below `threshold` are included.
    ///
    /// ```
    /// use sceneval_data::counts::ScenarioTypeCounts;
    ///
    /// let counts = [("A", 200), ("B", 900), ("C", 5000)]
    ///     .into_iter()
    ///     .collect::<ScenarioTypeCounts>();
    /// let targets = counts.resample_targets(1000);
    /// assert_eq!(targets.get("A"), Some(&800));
    /// assert_eq!(targets.get("B"), Some(&100));
    /// assert!(!targets.contains_key("C"));
    /// ```
    #[must_use]
    pub fn resample_targets(&self, threshold: u64) -> BTreeMap<String, u64> {
        self.counts
            .iter()
            .filter(|(_, count)| **count < threshold)
            .map(|(scenario_type, count)| (scenario_type.clone(), threshold - count))
            .collect()
    }

    /// Compares the types of this count set with the types listed in a
    /// scenario filter.
    #[must_use]
    pub fn diff_types<S>(&self, filter_types: &[S]) -> TypeDiff
    where
        S: AsRef<str>,
    {
        let filter = filter_types
            .iter()
            .map(|s| s.as_ref().to_owned())
            .collect::<BTreeSet<_>>();
        let counted = self.counts.keys().cloned().collect::<BTreeSet<_>>();
        TypeDiff {
            in_filter_only: filter.difference(&counted).cloned().collect(),
            in_counts_only: counted.difference(&filter).cloned().collect(),
        }
    }

    /// The most frequent types whose cumulative share of the total does not
    /// exceed `fraction`.
    #[must_use]
    pub fn top_share(&self, fraction: f64) -> TopShare {
        let total = self.total();
        let mut cumulative = 0;
        let mut entries = vec![];
        if total == 0 {
            return TopShare { entries, total: 0 };
        }
        for (scenario_type, count) in self.sorted_by_count() {
            cumulative += count;
            #[expect(clippy::cast_precision_loss)]
            let share = cumulative as f64 / total as f64;
            if share > fraction {
                break;
            }
            entries.push((scenario_type.to_owned(), count));
        }
        let total = entries.iter().map(|(_, c)| c).sum();
        TopShare { entries, total }
    }

    /// Share of the total per type, sorted by count.
    #[must_use]
    pub fn proportions(&self) -> Vec<(&str, u64, f64)> {
        let total = self.total();
        self.sorted_by_count()
            .into_iter()
            .map(|(scenario_type, count)| {
                #[expect(clippy::cast_precision_loss)]
                let share = if total == 0 {
                    0.0
                } else {
                    count as f64 / total as f64
                };
                (scenario_type, count, share)
            })
            .collect()
    }

    pub fn load_yaml<P>(path: P) -> Result<Self, CountsError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| CountsError::Open {
            path: path.to_owned(),
            source,
        })?;
        let counts =
            serde_yaml::from_reader(BufReader::new(file)).map_err(|source| CountsError::Parse {
                path: path.to_owned(),
                source,
            })?;
        Ok(Self { counts })
    }

    pub fn save_yaml<P>(&self, path: P) -> Result<(), CountsError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| CountsError::Create {
            path: path.to_owned(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        serde_yaml::to_writer(&mut writer, &self.counts).map_err(|source| CountsError::Write {
            path: path.to_owned(),
            source,
        })?;
        writer.flush().map_err(|source| CountsError::Flush {
            path: path.to_owned(),
            source,
        })?;
        Ok(())
    }
}

impl<S> FromIterator<(S, u64)> for ScenarioTypeCounts
where
    S: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        let mut counts = Self::new();
        counts.extend(iter);
        counts
    }
}

impl<S> Extend<(S, u64)> for ScenarioTypeCounts
where
    S: Into<String>,
{
    fn extend<I: IntoIterator<Item = (S, u64)>>(&mut self, iter: I) {
        for (scenario_type, count) in iter {
            self.add(scenario_type, count);
        }
    }
}

/// Result of [`ScenarioTypeCounts::diff_types`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeDiff {
    /// Types listed in the filter that have no count.
    pub in_filter_only: BTreeSet<String>,
    /// Types with a count that the filter does not list.
    pub in_counts_only: BTreeSet<String>,
}

/// Result of [`ScenarioTypeCounts::top_share`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopShare {
    pub entries: Vec<(String, u64)>,
    pub total: u64,
}

/// Inclusive count range. `upper == None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountBand {
    pub lower: u64,
    pub upper: Option<u64>,
}

impl CountBand {
    #[must_use]
    pub fn contains(&self, count: u64) -> bool {
        count >= self.lower && self.upper.is_none_or(|upper| count <= upper)
    }
}

impl fmt::Display for CountBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upper {
            Some(upper) => write!(f, "{}-{}", self.lower, upper),
            None => write!(f, "{}+", self.lower),
        }
    }
}

/// Contiguous, non-overlapping count bands starting at zero and ending with an
/// unbounded band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountBands {
    bands: Vec<CountBand>,
}

impl Default for CountBands {
    fn default() -> Self {
        Self::from_sorted_bounds(&DEFAULT_BAND_UPPER_BOUNDS)
    }
}

impl CountBands {
    /// Builds bands from strictly increasing inclusive upper bounds.
    ///
    /// `[500, 1000]` gives `0-500`, `501-1000`, `1001+`. A last bound of
    /// `u64::MAX` already covers every count, so no open band follows it.
    pub fn new(upper_bounds: &[u64]) -> Result<Self, CountsError> {
        if upper_bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(CountsError::UnorderedBands {
                bounds: upper_bounds.to_vec(),
            });
        }
        Ok(Self::from_sorted_bounds(upper_bounds))
    }

    fn from_sorted_bounds(upper_bounds: &[u64]) -> Self {
        let mut bands = vec![];
        let mut lower = 0;
        for &upper in upper_bounds {
            bands.push(CountBand {
                lower,
                upper: Some(upper),
            });
            let Some(next) = upper.checked_add(1) else {
                return Self { bands };
            };
            lower = next;
        }
        bands.push(CountBand { lower, upper: None });
        Self { bands }
    }

    #[must_use]
    pub fn bands(&self) -> &[CountBand] {
        &self.bands
    }

    /// Index of the band holding `count`.
    #[must_use]
    pub fn band_index(&self, count: u64) -> usize {
        self.bands
            .iter()
            .position(|band| band.contains(count))
            .unwrap_or(self.bands.len() - 1)
    }

    /// Groups the types of `counts` by band. Every band is present, possibly
    /// empty; types within a band are sorted by count.
    #[must_use]
    pub fn categorize<'a>(
        &self,
        counts: &'a ScenarioTypeCounts,
    ) -> Vec<(CountBand, Vec<(&'a str, u64)>)> {
        let mut groups = self
            .bands
            .iter()
            .map(|band| (*band, vec![]))
            .collect::<Vec<_>>();
        for (scenario_type, count) in counts.sorted_by_count() {
            groups[self.band_index(count)].1.push((scenario_type, count));
        }
        groups
    }
}

/// Overlap and relative size of a train and a test split.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitComparison {
    pub common: BTreeSet<String>,
    pub train_only: BTreeSet<String>,
    pub test_only: BTreeSet<String>,
    pub train_total: u64,
    pub test_total: u64,
}

impl SplitComparison {
    #[must_use]
    pub fn new(train: &ScenarioTypeCounts, test: &ScenarioTypeCounts) -> Self {
        let train_types = train
            .scenario_types()
            .map(str::to_owned)
            .collect::<BTreeSet<_>>();
        let test_types = test
            .scenario_types()
            .map(str::to_owned)
            .collect::<BTreeSet<_>>();
        Self {
            common: train_types.intersection(&test_types).cloned().collect(),
            train_only: train_types.difference(&test_types).cloned().collect(),
            test_only: test_types.difference(&train_types).cloned().collect(),
            train_total: train.total(),
            test_total: test.total(),
        }
    }

    #[must_use]
    pub fn train_share(&self) -> f64 {
        share(self.train_total, self.train_total + self.test_total)
    }

    #[must_use]
    pub fn test_share(&self) -> f64 {
        share(self.test_total, self.train_total + self.test_total)
    }
}

#[expect(clippy::cast_precision_loss)]
fn share(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}
