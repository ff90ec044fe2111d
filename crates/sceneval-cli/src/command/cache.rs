use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, ValueEnum};
use sceneval_data::{
    cache::{self, CacheCounter, CacheLayout, MetadataSpec},
    counts::ScenarioTypeCounts,
    filter_config::{self, ScenarioFilterConfig},
};
use tracing::info;

use super::db::print_counts;

/// Planner whose cache layout is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum Planner {
    /// `log_name/scenario_type/token/` directories
    Plantf,
    /// `<scenario_type>_<token>.<ext>` files
    Gameformer,
}

impl Planner {
    fn layout(self) -> CacheLayout {
        match self {
            Planner::Plantf => CacheLayout::Nested,
            Planner::Gameformer => CacheLayout::Flat,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub(crate) struct CacheCountsArg {
    /// Root of the feature cache
    #[arg(long)]
    pub cache_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = Planner::Plantf)]
    pub planner: Planner,

    /// Save the counts to this file (`.csv` or YAML)
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct MetadataCountsArg {
    /// Cache metadata CSV
    pub csv: PathBuf,

    /// Column holding the cached file paths
    #[arg(long, default_value = "file_name")]
    pub column: String,

    /// Index of the scenario type among the path components
    #[arg(long, default_value_t = 6)]
    pub index: usize,

    #[arg(long, default_value = "/")]
    pub delimiter: String,

    /// Output CSV of `scenario_type,count` rows
    #[arg(long)]
    pub output: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct ResampleArg {
    /// Scenario filter listing the in-distribution types
    #[arg(long)]
    pub filter: PathBuf,

    /// Root of the training feature cache
    #[arg(long)]
    pub cache_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = Planner::Plantf)]
    pub planner: Planner,

    /// Types cached fewer times than this are resampled
    #[arg(long, default_value_t = 1000)]
    pub threshold: u64,

    /// Scenario filter whose `scenario_types` are replaced
    #[arg(long)]
    pub template: PathBuf,

    /// Where the rewritten filter is written
    #[arg(long)]
    pub output: PathBuf,
}

fn save_counts(counts: &ScenarioTypeCounts, path: &Path) -> anyhow::Result<()> {
    if path.extension().is_some_and(|ext| ext == "csv") {
        cache::save_counts_csv(counts, path)?;
    } else {
        counts.save_yaml(path)?;
    }
    info!("Saved scenario counts to {}", path.display());
    Ok(())
}

pub(crate) fn run_counts(arg: &CacheCountsArg) -> anyhow::Result<()> {
    let counter = CacheCounter::new(&arg.cache_dir, arg.planner.layout());
    let counts = counter.scenario_type_counts().with_context(|| {
        format!(
            "Failed to count {} cache {}",
            counter.layout(),
            counter.root().display()
        )
    })?;
    print_counts(&counts);
    if let Some(output) = &arg.output {
        save_counts(&counts, output)?;
    }
    Ok(())
}

pub(crate) fn run_metadata(arg: &MetadataCountsArg) -> anyhow::Result<()> {
    let spec = MetadataSpec {
        column: arg.column.clone(),
        index: arg.index,
        delimiter: arg.delimiter.clone(),
    };
    let counts = cache::count_from_metadata_csv(&arg.csv, &spec)?;
    print_counts(&counts);
    save_counts(&counts, &arg.output)
}

/// Types to request: under-represented cached types plus filter types that
/// were never cached, sorted by name.
fn resample_types(
    filter_types: &[String],
    counts: &ScenarioTypeCounts,
    threshold: u64,
) -> Vec<(String, u64)> {
    let mut targets = counts.resample_targets(threshold);
    let diff = counts.diff_types(filter_types);
    for scenario_type in diff.in_filter_only {
        targets.entry(scenario_type).or_insert(threshold);
    }
    targets.into_iter().collect()
}

pub(crate) fn run_resample(arg: &ResampleArg) -> anyhow::Result<()> {
    let filter = ScenarioFilterConfig::load_yaml(&arg.filter)?;
    let counter = CacheCounter::new(&arg.cache_dir, arg.planner.layout());
    let counts = counter
        .scenario_type_counts()
        .with_context(|| format!("Failed to count cache {}", arg.cache_dir.display()))?;

    let diff = counts.diff_types(&filter.scenario_types);
    println!("In filter but not cached: {:?}", diff.in_filter_only);
    println!("Cached but not in filter: {:?}", diff.in_counts_only);

    let targets = resample_types(&filter.scenario_types, &counts, arg.threshold);
    println!();
    println!("Scenario types to resample (threshold {}):", arg.threshold);
    for (scenario_type, missing) in &targets {
        println!("  {scenario_type}: {missing}");
    }

    let types = targets.iter().map(|(t, _)| t.as_str()).collect::<Vec<_>>();
    filter_config::write_scenario_filter(&arg.template, &arg.output, &types)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_types() {
        let counts = [("following_lane", 1500), ("stopping", 300), ("waiting", 999)]
            .into_iter()
            .collect::<ScenarioTypeCounts>();
        let filter = ["stopping", "starting_left_turn", "following_lane"]
            .map(str::to_owned)
            .to_vec();
        assert_eq!(
            resample_types(&filter, &counts, 1000),
            vec![
                ("starting_left_turn".to_owned(), 1000),
                ("stopping".to_owned(), 700),
                ("waiting".to_owned(), 1),
            ]
        );
    }

    #[test]
    fn test_planner_layout() {
        assert_eq!(Planner::Plantf.layout(), CacheLayout::Nested);
        assert_eq!(Planner::Gameformer.layout(), CacheLayout::Flat);
    }
}
