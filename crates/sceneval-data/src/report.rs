//! Runner and metric report merging
//!
//! A simulation run leaves a directory like this:
//!
//! ```text
//! <runner_report_dir>/
//! ├─ runner_report.parquet        one row per simulated scenario
//! └─ metrics/
//!    ├─ planner_miss_rate_within_bound.parquet
//!    └─ ...                       one file per metric
//! ```
//!
//! [`ReportProcessor::read_metric_reports`] selects the configured runner
//! columns, then left-joins every metric file on `scenario_name`. The
//! `metric_score` column of each metric file is renamed after the file, so the
//! merged table has one column per metric and exactly the runner-report rows.
//! A name already taken in the merged table gets a numeric suffix (`x_2`,
//! `x_3`, ...).

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::table::{Table, TableError};

pub const RUNNER_REPORT_FILE: &str = "runner_report.parquet";
pub const METRICS_DIR: &str = "metrics";
pub const SCENARIO_NAME_COLUMN: &str = "scenario_name";
pub const METRIC_SCORE_COLUMN: &str = "metric_score";

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum ReportError {
    #[display("{} does not exist", path.display())]
    NotFound { path: PathBuf },
    #[display("Failed to read report {}", path.display())]
    Table { path: PathBuf, source: TableError },
    #[display("Failed to merge metric report {}", path.display())]
    Merge { path: PathBuf, source: TableError },
    #[display("Failed to walk metric directory {}", path.display())]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[display("Failed to open config file {}", path.display())]
    OpenConfig { path: PathBuf, source: io::Error },
    #[display("Failed to parse config file {}", path.display())]
    ParseConfig {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

fn default_runner_columns() -> Vec<String> {
    ["scenario_type", "scenario_name", "log_name", "risk_score"]
        .map(String::from)
        .to_vec()
}

fn default_metric_columns() -> Vec<String> {
    [SCENARIO_NAME_COLUMN, METRIC_SCORE_COLUMN]
        .map(String::from)
        .to_vec()
}

fn default_post_score() -> String {
    "post_score".to_owned()
}

/// Report locations and column selection.
///
/// ```yaml
/// runner_report_dir: /data/simulation/run_0
/// runner_columns: [scenario_type, scenario_name, log_name, risk_score, logits]
/// post_score: logits
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default)]
    pub runner_report_dir: PathBuf,
    #[serde(default = "default_runner_columns")]
    pub runner_columns: Vec<String>,
    #[serde(default = "default_metric_columns")]
    pub metric_columns: Vec<String>,
    /// Column holding raw model outputs for post scoring.
    #[serde(default = "default_post_score")]
    pub post_score: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            runner_report_dir: PathBuf::new(),
            runner_columns: default_runner_columns(),
            metric_columns: default_metric_columns(),
            post_score: default_post_score(),
        }
    }
}

impl ReportConfig {
    pub fn load_yaml(path: &Path) -> Result<Self, ReportError> {
        let file = File::open(path).map_err(|source| ReportError::OpenConfig {
            path: path.to_owned(),
            source,
        })?;
        serde_yaml::from_reader(file).map_err(|source| ReportError::ParseConfig {
            path: path.to_owned(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReportProcessor {
    config: ReportConfig,
}

impl ReportProcessor {
    #[must_use]
    pub fn new(config: ReportConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    pub fn read_runner_report(&self) -> Result<Table, ReportError> {
        let path = self.config.runner_report_dir.join(RUNNER_REPORT_FILE);
        if !path.is_file() {
            return Err(ReportError::NotFound { path });
        }
        Table::read_parquet(&path, &self.config.runner_columns)
            .map_err(|source| ReportError::Table { path, source })
    }

    /// Metric report files under `<dir>/metrics`, sorted by path.
    pub fn metric_report_files(&self) -> Result<Vec<PathBuf>, ReportError> {
        let dir = self.config.runner_report_dir.join(METRICS_DIR);
        if !dir.is_dir() {
            return Err(ReportError::NotFound { path: dir });
        }
        let mut files = vec![];
        for entry in WalkDir::new(&dir).sort_by_file_name() {
            let entry = entry.map_err(|source| ReportError::Walk {
                path: dir.clone(),
                source,
            })?;
            if entry.file_type().is_file()
                && entry.path().extension().is_some_and(|ext| ext == "parquet")
            {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    /// Runner report with one column per metric file joined on `scenario_name`.
    pub fn read_metric_reports(&self) -> Result<Table, ReportError> {
        let mut merged = self.read_runner_report()?;
        for path in self.metric_report_files()? {
            info!("Merging {}", path.display());
            let mut metric = Table::read_parquet(&path, &self.config.metric_columns)
                .map_err(|source| ReportError::Table {
                    path: path.clone(),
                    source,
                })?;
            let merge_err = |source| ReportError::Merge {
                path: path.clone(),
                source,
            };
            if metric.column(METRIC_SCORE_COLUMN).is_some() {
                let name = unique_column_name(&metric_name(&path), &[&merged, &metric]);
                metric
                    .rename_column(METRIC_SCORE_COLUMN, &name)
                    .map_err(merge_err)?;
            }
            let clashes = metric
                .column_names()
                .filter(|name| *name != SCENARIO_NAME_COLUMN && merged.column(name).is_some())
                .map(str::to_owned)
                .collect::<Vec<_>>();
            for name in clashes {
                let renamed = unique_column_name(&name, &[&merged, &metric]);
                warn!(
                    "Column {name} of {} already merged, stored as {renamed}",
                    path.display()
                );
                metric.rename_column(&name, &renamed).map_err(merge_err)?;
            }
            merged = merged
                .left_join(&metric, SCENARIO_NAME_COLUMN)
                .map_err(merge_err)?;
        }
        Ok(merged)
    }
}

/// `base`, or `base_N` with the smallest `N >= 2` that no table uses yet.
fn unique_column_name(base: &str, tables: &[&Table]) -> String {
    let taken = |name: &str| tables.iter().any(|table| table.column(name).is_some());
    if !taken(base) {
        return base.to_owned();
    }
    let mut n = 2;
    loop {
        let name = format!("{base}_{n}");
        if !taken(&name) {
            return name;
        }
        n += 1;
    }
}

fn metric_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().replace(".parquet", ""))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::table::{
        Column,
        tests::{floats, strings, write_parquet},
    };

    fn runner_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_parquet(
            &dir.path().join(RUNNER_REPORT_FILE),
            vec![
                ("scenario_type", strings(&["on_carpark", "behind_bike", "on_carpark"])),
                ("scenario_name", strings(&["s1", "s2", "s3"])),
                ("log_name", strings(&["log_a", "log_a", "log_b"])),
                ("risk_score", floats(&[Some(0.1), Some(0.9), None])),
                ("planner_name", strings(&["p", "p", "p"])),
            ],
        );
        let metrics = dir.path().join(METRICS_DIR);
        fs::create_dir_all(metrics.join("nested")).unwrap();
        write_parquet(
            &metrics.join("planner_miss_rate_within_bound.parquet"),
            vec![
                ("scenario_name", strings(&["s3", "s1"])),
                ("metric_score", floats(&[Some(1.0), Some(0.0)])),
            ],
        );
        write_parquet(
            &metrics.join("nested").join("no_ego_at_fault_collisions.parquet"),
            vec![
                ("scenario_name", strings(&["s2"])),
                ("metric_score", floats(&[Some(0.5)])),
            ],
        );
        fs::write(metrics.join("README.txt"), "not a report").unwrap();
        dir
    }

    fn processor(dir: &Path) -> ReportProcessor {
        ReportProcessor::new(ReportConfig {
            runner_report_dir: dir.to_owned(),
            ..ReportConfig::default()
        })
    }

    #[test]
    fn test_read_runner_report_selects_columns() {
        let dir = runner_dir();
        let table = processor(dir.path()).read_runner_report().unwrap();
        assert_eq!(
            table.column_names().collect::<Vec<_>>(),
            ["scenario_type", "scenario_name", "log_name", "risk_score"]
        );
        assert_eq!(table.num_rows(), 3);
    }

    #[test]
    fn test_read_metric_reports_merges_every_file() {
        let dir = runner_dir();
        let table = processor(dir.path()).read_metric_reports().unwrap();
        assert_eq!(table.num_rows(), 3);
        assert_eq!(
            table.float_column("planner_miss_rate_within_bound").unwrap(),
            &[Some(0.0), None, Some(1.0)]
        );
        assert_eq!(
            table.column("no_ego_at_fault_collisions"),
            Some(&Column::Float(vec![None, Some(0.5), None]))
        );
        assert!(table.column("metric_score").is_none());
    }

    #[test]
    fn test_same_metric_name_in_two_directories() {
        let dir = runner_dir();
        let metrics = dir.path().join(METRICS_DIR);
        for (sub, score) in [("a", 0.25), ("b", 0.75)] {
            fs::create_dir_all(metrics.join(sub)).unwrap();
            write_parquet(
                &metrics.join(sub).join("x.parquet"),
                vec![
                    ("scenario_name", strings(&["s1"])),
                    ("metric_score", floats(&[Some(score)])),
                ],
            );
        }
        let table = processor(dir.path()).read_metric_reports().unwrap();
        assert_eq!(table.num_rows(), 3);
        assert_eq!(table.float_column("x").unwrap(), &[Some(0.25), None, None]);
        assert_eq!(table.float_column("x_2").unwrap(), &[Some(0.75), None, None]);
    }

    #[test]
    fn test_metric_named_like_runner_column() {
        let dir = runner_dir();
        write_parquet(
            &dir.path().join(METRICS_DIR).join("risk_score.parquet"),
            vec![
                ("scenario_name", strings(&["s2"])),
                ("metric_score", floats(&[Some(1.0)])),
            ],
        );
        let table = processor(dir.path()).read_metric_reports().unwrap();
        assert_eq!(
            table.float_column("risk_score").unwrap(),
            &[Some(0.1), Some(0.9), None]
        );
        assert_eq!(
            table.float_column("risk_score_2").unwrap(),
            &[None, Some(1.0), None]
        );
    }

    #[test]
    fn test_unique_column_name() {
        let mut table = Table::default();
        table.push_column("x", Column::Float(vec![])).unwrap();
        table.push_column("x_2", Column::Float(vec![])).unwrap();
        assert_eq!(unique_column_name("y", &[&table]), "y");
        assert_eq!(unique_column_name("x", &[&table]), "x_3");
    }

    #[test]
    fn test_missing_runner_report() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            processor(dir.path()).read_runner_report(),
            Err(ReportError::NotFound { .. })
        ));
    }

    #[test]
    fn test_missing_metrics_dir() {
        let dir = runner_dir();
        fs::remove_dir_all(dir.path().join(METRICS_DIR)).unwrap();
        assert!(matches!(
            processor(dir.path()).read_metric_reports(),
            Err(ReportError::NotFound { .. })
        ));
    }

    #[test]
    fn test_missing_runner_column() {
        let dir = runner_dir();
        let mut config = ReportConfig {
            runner_report_dir: dir.path().to_owned(),
            ..ReportConfig::default()
        };
        config.runner_columns.push("post_score".to_owned());
        let err = ReportProcessor::new(config).read_runner_report().unwrap_err();
        assert!(matches!(
            err,
            ReportError::Table {
                source: TableError::MissingColumns { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_config_defaults() {
        let config: ReportConfig = serde_yaml::from_str("runner_report_dir: /tmp/run").unwrap();
        assert_eq!(config.runner_report_dir, Path::new("/tmp/run"));
        assert_eq!(config.runner_columns, default_runner_columns());
        assert_eq!(config.metric_columns, ["scenario_name", "metric_score"]);
        assert_eq!(config.post_score, "post_score");
    }
}
