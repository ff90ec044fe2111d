//! Simulation report commands
//!
//! Both commands start from the runner report merged with its metric reports.
//! `ood-scores` then labels every scenario as in-distribution or not, scores
//! the stored model outputs and compares the score distributions of the two
//! groups, optionally against a risk label derived from the metrics.

use std::{collections::BTreeSet, path::PathBuf};

use anyhow::Context;
use clap::Args;
use sceneval_data::{
    labeling::{
        self, DEFAULT_METRIC_COLUMNS, DEFAULT_SCORE_RANGE, DISTRIBUTION_COLUMN,
        RELABEL_SCENARIO_TYPES, RowFilter, ScenarioDistribution,
    },
    post_score::{self, PostScorer},
    report::{ReportConfig, ReportProcessor},
    table::Table,
};
use sceneval_stats::score::ScoreKind;
use tracing::info;

use crate::util;

const NUM_BINS: usize = 20;
const TOP_TYPES: usize = 20;

/// Where the reports are and which columns to read.
#[derive(Debug, Clone, Args)]
pub(crate) struct ReportSourceArg {
    /// YAML report configuration
    #[arg(long, conflicts_with = "report_dir")]
    pub config: Option<PathBuf>,

    /// Directory holding `runner_report.parquet` and `metrics/`
    #[arg(long, required_unless_present = "config")]
    pub report_dir: Option<PathBuf>,

    /// Runner report columns to read (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub runner_columns: Option<Vec<String>>,

    /// Column holding the raw model outputs
    #[arg(long)]
    pub post_score: Option<String>,
}

impl ReportSourceArg {
    fn load(&self) -> anyhow::Result<ReportConfig> {
        let mut config = match &self.config {
            Some(path) => ReportConfig::load_yaml(path)?,
            None => ReportConfig::default(),
        };
        if let Some(dir) = &self.report_dir {
            config.runner_report_dir.clone_from(dir);
        }
        if let Some(columns) = &self.runner_columns {
            config.runner_columns.clone_from(columns);
        }
        if let Some(column) = &self.post_score {
            config.post_score.clone_from(column);
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Args)]
pub(crate) struct MergeReportsArg {
    #[clap(flatten)]
    pub source: ReportSourceArg,

    /// Output CSV file
    #[arg(long)]
    pub output: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct OodScoresArg {
    #[clap(flatten)]
    pub source: ReportSourceArg,

    /// CSV whose `scenario_type` column lists the in-distribution types
    #[arg(long, conflicts_with = "ind_filter", required_unless_present = "ind_filter")]
    pub ind_csv: Option<PathBuf>,

    /// Scenario filter YAML listing the in-distribution types
    #[arg(long)]
    pub ind_filter: Option<PathBuf>,

    /// Force the distribution label of the known ambiguous scenario types
    #[arg(long, value_parser = parse_distribution)]
    pub relabel: Option<ScenarioDistribution>,

    /// Reduction applied to every output array
    #[arg(long, default_value_t = ScoreKind::Energy)]
    pub score: ScoreKind,

    /// Label risky scenarios by their metric average and count types per group
    #[arg(long)]
    pub risk: bool,

    /// Metric columns averaged for the risk label (comma-separated)
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_METRIC_COLUMNS.map(String::from))]
    pub metric_columns: Vec<String>,

    /// Keep only rows whose average score lies in [--score-min, --score-max]
    #[arg(long)]
    pub filter_score: bool,

    #[arg(long, default_value_t = *DEFAULT_SCORE_RANGE.start())]
    pub score_min: f64,

    #[arg(long, default_value_t = *DEFAULT_SCORE_RANGE.end())]
    pub score_max: f64,

    /// Save the scored table to this CSV file
    #[arg(long)]
    pub output: Option<PathBuf>,
}

fn parse_distribution(s: &str) -> Result<ScenarioDistribution, String> {
    ScenarioDistribution::parse(s).ok_or_else(|| format!("expected 'InD' or 'OOD', got '{s}'"))
}

fn merged_table(config: ReportConfig) -> anyhow::Result<Table> {
    let dir = config.runner_report_dir.clone();
    let processor = ReportProcessor::new(config);
    let table = processor
        .read_metric_reports()
        .with_context(|| format!("Failed to merge reports in {}", dir.display()))?;
    info!(
        "Merged {} rows, {} columns",
        table.num_rows(),
        table.num_columns()
    );
    Ok(table)
}

pub(crate) fn run_merge(arg: &MergeReportsArg) -> anyhow::Result<()> {
    let table = merged_table(arg.source.load()?)?;
    table.write_csv(&arg.output)?;
    info!("Saved merged report to {}", arg.output.display());
    Ok(())
}

/// Average scores of the InD and OOD rows. Rows missing either value are
/// left out.
fn scores_by_distribution(table: &Table) -> anyhow::Result<(Vec<f64>, Vec<f64>)> {
    let scores = table.float_column(post_score::AVG_COLUMN)?;
    let labels = table.text_column(DISTRIBUTION_COLUMN)?;
    let mut ind = vec![];
    let mut ood = vec![];
    for (score, label) in scores.iter().zip(labels) {
        let (Some(score), Some(label)) = (score, label) else {
            continue;
        };
        match ScenarioDistribution::parse(label) {
            Some(ScenarioDistribution::InD) => ind.push(*score),
            Some(ScenarioDistribution::Ood) => ood.push(*score),
            None => {}
        }
    }
    Ok((ind, ood))
}

fn print_score_distributions(table: &Table, kind: ScoreKind) -> anyhow::Result<()> {
    let (ind, ood) = scores_by_distribution(table)?;
    println!("OOD Score Distribution ({kind}, {})", post_score::AVG_COLUMN);
    println!("==========================================\n");
    let all = ind.iter().chain(&ood).copied().filter(|v| v.is_finite());
    let (min, max) = all.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if min > max {
        println!("No finite scores");
        return Ok(());
    }
    util::print_distribution("InD", &ind, NUM_BINS, min, max);
    println!();
    util::print_distribution("OOD", &ood, NUM_BINS, min, max);
    Ok(())
}

fn print_risk_counts(table: &Table) -> anyhow::Result<()> {
    let groups = [
        ("High-risk scenario types", RowFilter::high_risk()),
        ("High-risk InD scenario types", RowFilter::high_risk_ind()),
        ("Low-risk OOD scenario types", RowFilter::low_risk_ood()),
    ];
    for (title, filter) in groups {
        let counts = labeling::count_types(table, &filter)?;
        println!("{title} (top {TOP_TYPES} of {}):", counts.len());
        util::print_histogram(counts.sorted_by_count().into_iter().take(TOP_TYPES));
        println!();
    }
    Ok(())
}

pub(crate) fn run_ood_scores(arg: &OodScoresArg) -> anyhow::Result<()> {
    let config = arg.source.load()?;
    let scorer = PostScorer::new(config.post_score.clone(), arg.score);
    let mut table = merged_table(config)?;

    let ind_types: BTreeSet<String> = match (&arg.ind_csv, &arg.ind_filter) {
        (Some(path), _) => labeling::load_ind_types_from_csv(path)?,
        (None, Some(path)) => labeling::load_ind_types_from_filter(path)?,
        (None, None) => anyhow::bail!("Either --ind-csv or --ind-filter is required"),
    };
    labeling::label_scenarios(&mut table, &ind_types)?;
    if let Some(label) = arg.relabel {
        labeling::relabel_scenarios(&mut table, &RELABEL_SCENARIO_TYPES, label)?;
    }

    scorer
        .apply(&mut table)
        .with_context(|| format!("Failed to score column '{}'", scorer.column))?;
    print_score_distributions(&table, arg.score)?;
    println!();

    if arg.risk {
        labeling::average_metric_score(&mut table, &arg.metric_columns)?;
        labeling::label_low_score(&mut table)?;
        print_risk_counts(&table)?;
    }

    if arg.filter_score {
        let range = arg.score_min..=arg.score_max;
        table = labeling::filter_by_score_range(&table, post_score::AVG_COLUMN, &range)?;
        println!(
            "{} rows with {} in [{}, {}]",
            table.num_rows(),
            post_score::AVG_COLUMN,
            arg.score_min,
            arg.score_max
        );
    }

    if let Some(output) = &arg.output {
        table.write_csv(output)?;
        info!("Saved scored table to {}", output.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use sceneval_data::table::Column;

    use super::*;

    #[test]
    fn test_scores_by_distribution() {
        let table = Table::from_columns([
            (
                post_score::AVG_COLUMN,
                Column::Float(vec![Some(1.0), Some(2.0), None, Some(4.0)]),
            ),
            (
                DISTRIBUTION_COLUMN,
                Column::Text(vec![
                    Some("InD".to_owned()),
                    Some("OOD".to_owned()),
                    Some("InD".to_owned()),
                    None,
                ]),
            ),
        ])
        .unwrap();
        let (ind, ood) = scores_by_distribution(&table).unwrap();
        assert_eq!(ind, vec![1.0]);
        assert_eq!(ood, vec![2.0]);
    }

    #[test]
    fn test_parse_distribution() {
        assert_eq!(parse_distribution("OOD"), Ok(ScenarioDistribution::Ood));
        assert!(parse_distribution("ood").is_err());
    }
}
