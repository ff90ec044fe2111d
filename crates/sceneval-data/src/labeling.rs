//! In-distribution labelling and risk analysis of merged report tables
//!
//! A scenario is in-distribution (InD) when its type appeared in the training
//! set, given either as a CSV with a `scenario_type` column or as a scenario
//! filter YAML. Risk is judged by the average of the planner-expert metrics:
//! `risk_label` is true when a scenario's average falls below the table mean.

use std::{
    collections::BTreeSet,
    fmt,
    ops::RangeInclusive,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::{
    counts::ScenarioTypeCounts,
    filter_config::{FilterConfigError, ScenarioFilterConfig},
    table::{Column, Table, TableError},
};

pub const SCENARIO_TYPE_COLUMN: &str = "scenario_type";
pub const DISTRIBUTION_COLUMN: &str = "scenario_distribution";
pub const METRIC_AVERAGE_COLUMN: &str = "metric_score_avg";
pub const RISK_LABEL_COLUMN: &str = "risk_label";

/// Metrics averaged into [`METRIC_AVERAGE_COLUMN`].
pub const DEFAULT_METRIC_COLUMNS: [&str; 5] = [
    "planner_expert_average_heading_error_within_bound",
    "planner_expert_average_l2_error_within_bound",
    "planner_expert_final_heading_error_within_bound",
    "planner_expert_final_l2_error_within_bound",
    "planner_miss_rate_within_bound",
];

/// Types commonly forced to one distribution label after labelling.
pub const RELABEL_SCENARIO_TYPES: [&str; 14] = [
    "stopping_at_stop_sign_without_lead",
    "starting_unprotected_noncross_turn",
    "starting_protected_cross_turn",
    "on_carpark",
    "on_pickup_dropoff",
    "on_intersection",
    "on_stopline_traffic_light",
    "stopping_at_crosswalk",
    "high_lateral_acceleration",
    "traversing_pickup_dropoff",
    "starting_protected_noncross_turn",
    "on_traffic_light_intersection",
    "following_lane_without_lead",
    "starting_straight_traffic_light_intersection_traversal",
];

pub const DEFAULT_SCORE_RANGE: RangeInclusive<f64> = 2.5..=3.5;

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum LabelingError {
    #[display("Failed to read CSV file {}", path.display())]
    Csv { path: PathBuf, source: csv::Error },
    #[display("Column '{column}' not found in {}", path.display())]
    MissingCsvColumn { path: PathBuf, column: String },
    #[display("Failed to load scenario filter")]
    Filter { source: FilterConfigError },
    #[display("Invalid table")]
    Table { source: TableError },
    #[display("Unknown scenario distribution '{label}' in row {row}")]
    UnknownDistribution { row: usize, label: String },
}

impl From<TableError> for LabelingError {
    fn from(source: TableError) -> Self {
        LabelingError::Table { source }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScenarioDistribution {
    #[serde(rename = "InD")]
    InD,
    #[serde(rename = "OOD")]
    Ood,
}

impl ScenarioDistribution {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ScenarioDistribution::InD => "InD",
            ScenarioDistribution::Ood => "OOD",
        }
    }

    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "InD" => Some(ScenarioDistribution::InD),
            "OOD" => Some(ScenarioDistribution::Ood),
            _ => None,
        }
    }
}

impl fmt::Display for ScenarioDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reads the `scenario_type` column of a CSV file.
pub fn load_ind_types_from_csv(path: &Path) -> Result<BTreeSet<String>, LabelingError> {
    let csv_err = |source| LabelingError::Csv {
        path: path.to_owned(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
    let index = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .position(|h| h == SCENARIO_TYPE_COLUMN)
        .ok_or_else(|| LabelingError::MissingCsvColumn {
            path: path.to_owned(),
            column: SCENARIO_TYPE_COLUMN.to_owned(),
        })?;

    let mut types = BTreeSet::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        if let Some(value) = record.get(index).filter(|v| !v.is_empty()) {
            types.insert(value.to_owned());
        }
    }
    Ok(types)
}

/// Reads the `scenario_types` list of a scenario filter YAML.
pub fn load_ind_types_from_filter(path: &Path) -> Result<BTreeSet<String>, LabelingError> {
    let config =
        ScenarioFilterConfig::load_yaml(path).map_err(|source| LabelingError::Filter { source })?;
    Ok(config.scenario_types.into_iter().collect())
}

fn distribution_column(table: &Table) -> Result<Vec<Option<ScenarioDistribution>>, LabelingError> {
    table
        .text_column(DISTRIBUTION_COLUMN)?
        .iter()
        .enumerate()
        .map(|(row, label)| match label {
            Some(label) => ScenarioDistribution::parse(label)
                .map(Some)
                .ok_or_else(|| LabelingError::UnknownDistribution {
                    row,
                    label: label.clone(),
                }),
            None => Ok(None),
        })
        .collect()
}

fn set_distribution_column(
    table: &mut Table,
    labels: &[Option<ScenarioDistribution>],
) -> Result<(), TableError> {
    let column = Column::Text(
        labels
            .iter()
            .map(|label| label.map(|l| l.as_str().to_owned()))
            .collect(),
    );
    table.set_column(DISTRIBUTION_COLUMN, column)
}

/// Adds `scenario_distribution`: InD for types in `ind_types`, OOD otherwise.
///
/// Rows without a scenario type stay null.
pub fn label_scenarios(table: &mut Table, ind_types: &BTreeSet<String>) -> Result<(), LabelingError> {
    let labels = table
        .text_column(SCENARIO_TYPE_COLUMN)?
        .iter()
        .map(|scenario_type| {
            scenario_type.as_ref().map(|t| {
                if ind_types.contains(t) {
                    ScenarioDistribution::InD
                } else {
                    ScenarioDistribution::Ood
                }
            })
        })
        .collect::<Vec<_>>();
    set_distribution_column(table, &labels)?;
    Ok(())
}

/// Overrides the distribution of every row whose type is in `scenario_types`.
pub fn relabel_scenarios<S>(
    table: &mut Table,
    scenario_types: &[S],
    label: ScenarioDistribution,
) -> Result<(), LabelingError>
where
    S: AsRef<str>,
{
    let mut labels = distribution_column(table)?;
    let types = table.text_column(SCENARIO_TYPE_COLUMN)?;
    for (current, scenario_type) in labels.iter_mut().zip(types) {
        if scenario_type
            .as_deref()
            .is_some_and(|t| scenario_types.iter().any(|s| s.as_ref() == t))
        {
            *current = Some(label);
        }
    }
    set_distribution_column(table, &labels)?;
    Ok(())
}

/// Adds `metric_score_avg`, the row mean of the non-null values in `columns`.
pub fn average_metric_score<S>(table: &mut Table, columns: &[S]) -> Result<(), LabelingError>
where
    S: AsRef<str>,
{
    let metrics = columns
        .iter()
        .map(|name| table.float_column(name.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    let averages = (0..table.num_rows())
        .map(|row| {
            let values = metrics.iter().filter_map(|m| m[row]).collect::<Vec<_>>();
            row_mean(&values)
        })
        .collect();
    table.set_column(METRIC_AVERAGE_COLUMN, Column::Float(averages))?;
    Ok(())
}

#[expect(clippy::cast_precision_loss)]
fn row_mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Adds `risk_label`: whether `metric_score_avg` is below its column mean.
///
/// Rows with a null average get a null label.
pub fn label_low_score(table: &mut Table) -> Result<(), LabelingError> {
    let averages = table.float_column(METRIC_AVERAGE_COLUMN)?;
    let present = averages.iter().flatten().copied().collect::<Vec<_>>();
    #[expect(clippy::cast_precision_loss)]
    let mean = present.iter().sum::<f64>() / present.len() as f64;
    let labels = averages
        .iter()
        .map(|avg| avg.map(|avg| avg < mean))
        .collect();
    table.set_column(RISK_LABEL_COLUMN, Column::Bool(labels))?;
    Ok(())
}

/// Row selection for [`count_types`]. `None` fields match every row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowFilter {
    pub risk: Option<bool>,
    pub distribution: Option<ScenarioDistribution>,
}

impl RowFilter {
    /// Rows labelled risky.
    #[must_use]
    pub fn high_risk() -> Self {
        Self {
            risk: Some(true),
            distribution: None,
        }
    }

    #[must_use]
    pub fn high_risk_ind() -> Self {
        Self {
            risk: Some(true),
            distribution: Some(ScenarioDistribution::InD),
        }
    }

    #[must_use]
    pub fn low_risk_ood() -> Self {
        Self {
            risk: Some(false),
            distribution: Some(ScenarioDistribution::Ood),
        }
    }
}

/// Scenario type counts over the rows matching `filter`.
pub fn count_types(table: &Table, filter: &RowFilter) -> Result<ScenarioTypeCounts, LabelingError> {
    let types = table.text_column(SCENARIO_TYPE_COLUMN)?;
    let risk = match filter.risk {
        Some(_) => Some(table.bool_column(RISK_LABEL_COLUMN)?),
        None => None,
    };
    let distribution = match filter.distribution {
        Some(_) => Some(distribution_column(table)?),
        None => None,
    };

    let mut counts = ScenarioTypeCounts::new();
    for (row, scenario_type) in types.iter().enumerate() {
        let Some(scenario_type) = scenario_type else {
            continue;
        };
        if let Some(wanted) = filter.risk
            && let Some(risk) = risk
            && risk[row] != Some(wanted)
        {
            continue;
        }
        if let Some(wanted) = filter.distribution
            && let Some(distribution) = &distribution
            && distribution[row] != Some(wanted)
        {
            continue;
        }
        counts.add(scenario_type.as_str(), 1);
    }
    Ok(counts)
}

/// Rows whose `column` value lies in `range`. Null values are dropped.
pub fn filter_by_score_range(
    table: &Table,
    column: &str,
    range: &RangeInclusive<f64>,
) -> Result<Table, LabelingError> {
    let mask = table
        .float_column(column)?
        .iter()
        .map(|v| v.is_some_and(|v| range.contains(&v)))
        .collect::<Vec<_>>();
    Ok(table.filter_rows(&mask))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn report() -> Table {
        Table::from_columns([
            (
                "scenario_type",
                Column::text(["on_carpark", "behind_bike", "on_carpark", "waiting_for_pedestrian"]),
            ),
            ("scenario_name", Column::text(["s1", "s2", "s3", "s4"])),
            (
                "planner_miss_rate_within_bound",
                Column::Float(vec![Some(1.0), Some(0.0), None, Some(1.0)]),
            ),
            (
                "planner_expert_final_l2_error_within_bound",
                Column::Float(vec![Some(0.5), Some(0.0), None, Some(1.0)]),
            ),
        ])
        .unwrap()
    }

    fn ind() -> BTreeSet<String> {
        ["on_carpark".to_owned()].into()
    }

    #[test]
    fn test_label_scenarios() {
        let mut table = report();
        label_scenarios(&mut table, &ind()).unwrap();
        assert_eq!(
            distribution_column(&table).unwrap(),
            [
                Some(ScenarioDistribution::InD),
                Some(ScenarioDistribution::Ood),
                Some(ScenarioDistribution::InD),
                Some(ScenarioDistribution::Ood),
            ]
        );
    }

    #[test]
    fn test_relabel_scenarios() {
        let mut table = report();
        label_scenarios(&mut table, &ind()).unwrap();
        relabel_scenarios(&mut table, &RELABEL_SCENARIO_TYPES, ScenarioDistribution::Ood).unwrap();
        let labels = distribution_column(&table).unwrap();
        assert_eq!(labels[0], Some(ScenarioDistribution::Ood));
        assert_eq!(labels[1], Some(ScenarioDistribution::Ood));
        assert_eq!(labels[2], Some(ScenarioDistribution::Ood));
    }

    #[test]
    fn test_relabel_requires_labels() {
        let mut table = report();
        assert!(matches!(
            relabel_scenarios(&mut table, &["on_carpark"], ScenarioDistribution::InD),
            Err(LabelingError::Table {
                source: TableError::MissingColumns { .. }
            })
        ));
    }

    #[test]
    fn test_average_and_risk_label() {
        let mut table = report();
        average_metric_score(
            &mut table,
            &[
                "planner_miss_rate_within_bound",
                "planner_expert_final_l2_error_within_bound",
            ],
        )
        .unwrap();
        assert_eq!(
            table.float_column(METRIC_AVERAGE_COLUMN).unwrap(),
            &[Some(0.75), Some(0.0), None, Some(1.0)]
        );
        label_low_score(&mut table).unwrap();
        // mean of present averages is 0.583..
        assert_eq!(
            table.bool_column(RISK_LABEL_COLUMN).unwrap(),
            &[Some(false), Some(true), None, Some(false)]
        );
    }

    #[test]
    fn test_count_types_with_filters() {
        let mut table = report();
        label_scenarios(&mut table, &ind()).unwrap();
        average_metric_score(&mut table, &["planner_miss_rate_within_bound"]).unwrap();
        label_low_score(&mut table).unwrap();

        let all = count_types(&table, &RowFilter::default()).unwrap();
        assert_eq!(all.get("on_carpark"), 2);
        assert_eq!(all.total(), 4);

        let risky = count_types(&table, &RowFilter::high_risk()).unwrap();
        assert_eq!(risky.iter().collect::<Vec<_>>(), [("behind_bike", 1)]);

        let risky_ind = count_types(&table, &RowFilter::high_risk_ind()).unwrap();
        assert!(risky_ind.is_empty());

        let safe_ood = count_types(&table, &RowFilter::low_risk_ood()).unwrap();
        assert_eq!(
            safe_ood.iter().collect::<Vec<_>>(),
            [("waiting_for_pedestrian", 1)]
        );
    }

    #[test]
    fn test_filter_by_score_range() {
        let table = Table::from_columns([
            ("scenario_name", Column::text(["a", "b", "c", "d"])),
            (
                "ood_score_avg",
                Column::Float(vec![Some(2.5), Some(3.6), None, Some(3.5)]),
            ),
        ])
        .unwrap();
        let filtered = filter_by_score_range(&table, "ood_score_avg", &DEFAULT_SCORE_RANGE).unwrap();
        assert_eq!(
            filtered.text_column("scenario_name").unwrap(),
            &[Some("a".to_owned()), Some("d".to_owned())]
        );
    }

    #[test]
    fn test_load_ind_types() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("ind.csv");
        fs::write(&csv_path, "count,scenario_type\n3,on_carpark\n1,behind_bike\n2,on_carpark\n").unwrap();
        assert_eq!(
            load_ind_types_from_csv(&csv_path).unwrap(),
            ["behind_bike".to_owned(), "on_carpark".to_owned()].into()
        );

        let yaml_path = dir.path().join("filter.yaml");
        fs::write(&yaml_path, "scenario_types:\n  - on_carpark\nlog_splits:\n  train: []\n").unwrap();
        assert_eq!(load_ind_types_from_filter(&yaml_path).unwrap(), ind());

        let bad = dir.path().join("bad.csv");
        fs::write(&bad, "type\non_carpark\n").unwrap();
        assert!(matches!(
            load_ind_types_from_csv(&bad),
            Err(LabelingError::MissingCsvColumn { .. })
        ));
    }
}
