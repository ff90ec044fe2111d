//! Scenario counts derived from feature cache trees
//!
//! Planners cache preprocessed scenarios on disk, and the scenario type can be
//! recovered from the cache layout alone:
//!
//! ```text
//! Nested (planTF)                       Flat (Gameformer)
//! cache_dir/                            cache_dir/
//! └─ <log_name>/                        ├─ <scenario_type>_<token>.npz
//!    └─ <scenario_type>/                └─ ...
//!       └─ <scenario_token>/
//! ```
//!
//! In the nested layout only directories count, at every level. In the flat
//! layout the token is the trailing hexadecimal segment of the file stem and
//! everything before the last `_` is the scenario type; file names that do not
//! follow this pattern are logged and skipped.
//!
//! Cache runs also write metadata CSV files listing every cached file path;
//! [`count_from_metadata_csv`] extracts the scenario type from a fixed path
//! component of those entries.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Serialize;
use tracing::warn;
use walkdir::WalkDir;

use crate::counts::ScenarioTypeCounts;

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum CacheError {
    #[display("Failed to walk cache directory {}", root.display())]
    Walk {
        root: PathBuf,
        source: walkdir::Error,
    },
    #[display("Failed to read CSV file {}", path.display())]
    Csv { path: PathBuf, source: csv::Error },
    #[display("Column '{column}' not found in {}", path.display())]
    MissingColumn {
        path: PathBuf,
        column: String,
    },
    #[display(
        "Path component {index} is out of range in row {row} of {}: '{value}'",
        path.display()
    )]
    ComponentOutOfRange {
        path: PathBuf,
        row: usize,
        index: usize,
        value: String,
    },
    #[display("Unknown cache layout '{name}' (expected 'nested' or 'flat')")]
    UnknownLayout { name: String },
}

/// Directory convention of a cache tree.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheLayout {
    /// `root/log_name/scenario_type/scenario_token/`
    #[default]
    Nested,
    /// `root/<scenario_type>_<token>.<ext>`
    Flat,
}

impl fmt::Display for CacheLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheLayout::Nested => f.write_str("nested"),
            CacheLayout::Flat => f.write_str("flat"),
        }
    }
}

impl FromStr for CacheLayout {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nested" => Ok(CacheLayout::Nested),
            "flat" => Ok(CacheLayout::Flat),
            _ => Err(CacheError::UnknownLayout { name: s.to_owned() }),
        }
    }
}

/// One cached scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedScenario {
    /// Log the scenario was cached from. Unknown in the flat layout.
    pub log_name: Option<String>,
    pub scenario_type: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct CacheCounter {
    root: PathBuf,
    layout: CacheLayout,
}

impl CacheCounter {
    pub fn new<P>(root: P, layout: CacheLayout) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            root: root.into(),
            layout,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn layout(&self) -> CacheLayout {
        self.layout
    }

    fn entries_at_depth(&self, depth: usize) -> Result<Vec<walkdir::DirEntry>, CacheError> {
        WalkDir::new(&self.root)
            .min_depth(depth)
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| CacheError::Walk {
                root: self.root.clone(),
                source,
            })
    }

    /// Names of the directories directly under the cache root.
    pub fn log_names(&self) -> Result<Vec<String>, CacheError> {
        Ok(self
            .entries_at_depth(1)?
            .into_iter()
            .filter(|entry| entry.file_type().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect())
    }

    /// Every cached scenario, in file name order.
    pub fn scenario_tokens(&self) -> Result<Vec<CachedScenario>, CacheError> {
        match self.layout {
            CacheLayout::Nested => self.nested_scenarios(),
            CacheLayout::Flat => self.flat_scenarios(),
        }
    }

    pub fn scenario_type_counts(&self) -> Result<ScenarioTypeCounts, CacheError> {
        Ok(self
            .scenario_tokens()?
            .into_iter()
            .map(|scenario| (scenario.scenario_type, 1))
            .collect())
    }

    fn nested_scenarios(&self) -> Result<Vec<CachedScenario>, CacheError> {
        // walkdir only descends into directories, so both parents are directories
        Ok(self
            .entries_at_depth(3)?
            .into_iter()
            .filter(|entry| entry.file_type().is_dir())
            .filter_map(|entry| {
                let path = entry.path();
                let scenario_type_dir = path.parent()?;
                let log_dir = scenario_type_dir.parent()?;
                Some(CachedScenario {
                    log_name: Some(log_dir.file_name()?.to_string_lossy().into_owned()),
                    scenario_type: scenario_type_dir.file_name()?.to_string_lossy().into_owned(),
                    token: entry.file_name().to_string_lossy().into_owned(),
                })
            })
            .collect())
    }

    fn flat_scenarios(&self) -> Result<Vec<CachedScenario>, CacheError> {
        let mut scenarios = vec![];
        for entry in self.entries_at_depth(1)? {
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            match parse_flat_file_name(&file_name) {
                Some((scenario_type, token)) => scenarios.push(CachedScenario {
                    log_name: None,
                    scenario_type: scenario_type.to_owned(),
                    token: token.to_owned(),
                }),
                None => warn!("Skipping malformed cache file name: {file_name}"),
            }
        }
        Ok(scenarios)
    }
}

/// Splits `<scenario_type>_<hex token>[.<ext>...]` into type and token.
///
/// ```
/// use sceneval_data::cache::parse_flat_file_name;
///
/// assert_eq!(
///     parse_flat_file_name("stopping_at_crosswalk_0a1b2c3d4e5f6789.npz"),
///     Some(("stopping_at_crosswalk", "0a1b2c3d4e5f6789")),
/// );
/// assert_eq!(parse_flat_file_name("README.md"), None);
/// ```
#[must_use]
pub fn parse_flat_file_name(file_name: &str) -> Option<(&str, &str)> {
    let stem = file_name.split('.').next()?;
    let (scenario_type, token) = stem.rsplit_once('_')?;
    if scenario_type.is_empty() || token.is_empty() || hex::decode(token).is_err() {
        return None;
    }
    Some((scenario_type, token))
}

/// Where to find the scenario type in a metadata CSV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataSpec {
    /// Column holding cached file paths.
    pub column: String,
    /// Index of the scenario type after splitting the path by `delimiter`.
    pub index: usize,
    pub delimiter: String,
}

impl Default for MetadataSpec {
    fn default() -> Self {
        Self {
            column: "file_name".to_owned(),
            index: 6,
            delimiter: "/".to_owned(),
        }
    }
}

/// Counts scenario types listed in a cache metadata CSV.
///
/// Rows are numbered from 1, excluding the header.
pub fn count_from_metadata_csv(
    path: &Path,
    spec: &MetadataSpec,
) -> Result<ScenarioTypeCounts, CacheError> {
    let to_err = |source| CacheError::Csv {
        path: path.to_owned(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(to_err)?;
    let column = reader
        .headers()
        .map_err(to_err)?
        .iter()
        .position(|header| header == spec.column)
        .ok_or_else(|| CacheError::MissingColumn {
            path: path.to_owned(),
            column: spec.column.clone(),
        })?;

    let mut counts = ScenarioTypeCounts::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(to_err)?;
        let value = record.get(column).unwrap_or_default();
        let scenario_type = value.split(spec.delimiter.as_str()).nth(spec.index).ok_or_else(|| {
            CacheError::ComponentOutOfRange {
                path: path.to_owned(),
                row: i + 1,
                index: spec.index,
                value: value.to_owned(),
            }
        })?;
        counts.add(scenario_type, 1);
    }
    Ok(counts)
}

/// Writes `scenario_type,count` rows, most frequent first.
pub fn save_counts_csv(counts: &ScenarioTypeCounts, path: &Path) -> Result<(), CacheError> {
    let to_err = |source| CacheError::Csv {
        path: path.to_owned(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(to_err)?;
    writer
        .write_record(["scenario_type", "count"])
        .map_err(to_err)?;
    for (scenario_type, count) in counts.sorted_by_count() {
        writer
            .write_record([scenario_type.to_owned(), count.to_string()])
            .map_err(to_err)?;
    }
    writer.flush().map_err(|source| CacheError::Csv {
        path: path.to_owned(),
        source: source.into(),
    })
}
