use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use sceneval_data::{
    counts::ScenarioTypeCounts,
    db::{self, DEFAULT_MAX_PER_TYPE, RelocationPlan},
};
use tracing::info;

use crate::util;

/// Location of a dataset split.
#[derive(Debug, Clone, Args)]
pub(crate) struct SplitArg {
    /// Directory holding the `.db` files (overrides --data-root and --split)
    #[arg(long)]
    pub db_dir: Option<PathBuf>,

    /// nuPlan dataset root
    #[arg(long, env = "NUPLAN_DATA_ROOT")]
    pub data_root: Option<PathBuf>,

    /// Split directory under `<data-root>/nuplan-v1.1/`
    #[arg(long, default_value = "train")]
    pub split: String,
}

impl SplitArg {
    fn resolve(&self) -> anyhow::Result<PathBuf> {
        util::split_dir(
            self.db_dir.as_deref(),
            self.data_root.as_deref(),
            &self.split,
        )
    }
}

#[derive(Debug, Clone, Args)]
pub(crate) struct DbCountsArg {
    #[clap(flatten)]
    pub location: SplitArg,

    /// Save the counts to this YAML file
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Also print the counts as a bar chart
    #[arg(long)]
    pub histogram: bool,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct DbTokensArg {
    #[clap(flatten)]
    pub location: SplitArg,

    /// Output JSON file (defaults to stdout)
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct RelocateDbsArg {
    #[clap(flatten)]
    pub location: SplitArg,

    /// Directory the selected databases are moved to
    #[arg(long)]
    pub target_dir: PathBuf,

    /// YAML counts of the types already available elsewhere
    #[arg(long)]
    pub existing_counts: PathBuf,

    /// Maximum number of scenarios wanted per type
    #[arg(long, default_value_t = DEFAULT_MAX_PER_TYPE)]
    pub max_per_type: u64,

    /// Save the relocation report to this JSON file
    #[arg(long)]
    pub report: Option<PathBuf>,
}

pub(crate) fn print_counts(counts: &ScenarioTypeCounts) {
    println!("Aggregated Scenario Counts:");
    for (scenario_type, count) in counts.sorted_by_count() {
        println!("Scenario Type: {scenario_type}, Total Count: {count}");
    }
    println!("Total Scenario Count: {}", counts.total());
}

pub(crate) fn run_counts(arg: &DbCountsArg) -> anyhow::Result<()> {
    let dir = arg.location.resolve()?;
    let counts = db::aggregate_scenario_counts(&dir)
        .with_context(|| format!("Failed to count scenarios in {}", dir.display()))?;

    print_counts(&counts);
    if arg.histogram {
        println!();
        util::print_histogram(counts.sorted_by_count());
    }

    if let Some(output) = &arg.output {
        counts.save_yaml(output)?;
        info!("Saved scenario counts to {}", output.display());
    }
    Ok(())
}

pub(crate) fn run_tokens(arg: &DbTokensArg) -> anyhow::Result<()> {
    let dir = arg.location.resolve()?;
    let tokens = db::scenario_tokens_by_db(&dir)
        .with_context(|| format!("Failed to read scenario tokens in {}", dir.display()))?;
    util::save_json(&tokens, arg.output.as_deref())?;
    Ok(())
}

pub(crate) fn run_relocate(arg: &RelocateDbsArg) -> anyhow::Result<()> {
    let plan = RelocationPlan {
        source_dir: arg.location.resolve()?,
        target_dir: arg.target_dir.clone(),
        existing_counts: ScenarioTypeCounts::load_yaml(&arg.existing_counts)?,
        max_per_type: arg.max_per_type,
    };
    let report = db::relocate_databases(&plan).with_context(|| {
        format!(
            "Failed to relocate databases from {} to {}",
            plan.source_dir.display(),
            plan.target_dir.display()
        )
    })?;

    println!(
        "Moved {} databases, skipped {} already present in {}",
        report.moved.len(),
        report.skipped_existing.len(),
        plan.target_dir.display()
    );
    for (scenario_type, count) in report.moved_counts.sorted_by_count() {
        println!("  {scenario_type}: {count}");
    }

    if let Some(path) = &arg.report {
        util::save_json(&report, Some(path.as_path()))?;
    }
    Ok(())
}
