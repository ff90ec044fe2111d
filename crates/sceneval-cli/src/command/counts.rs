use std::path::PathBuf;

use clap::Args;
use sceneval_data::counts::{
    CountBands, DEFAULT_BAND_UPPER_BOUNDS, DEFAULT_TOP_SHARE, ScenarioTypeCounts, SplitComparison,
};

use crate::util;

#[derive(Debug, Clone, Args)]
pub(crate) struct PlotCountsArg {
    /// YAML file of scenario type counts
    pub counts: PathBuf,

    /// Inclusive upper bounds of the count bands (comma-separated)
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_BAND_UPPER_BOUNDS)]
    pub bands: Vec<u64>,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct CompareSplitsArg {
    /// YAML counts of the training split
    pub train: PathBuf,

    /// YAML counts of the test split
    pub test: PathBuf,

    /// Cumulative share covered by the "top" types
    #[arg(long, default_value_t = DEFAULT_TOP_SHARE)]
    pub top_share: f64,

    /// Save the comparison to this JSON file
    #[arg(long)]
    pub output: Option<PathBuf>,
}

pub(crate) fn run_plot(arg: &PlotCountsArg) -> anyhow::Result<()> {
    let counts = ScenarioTypeCounts::load_yaml(&arg.counts)?;
    let bands = CountBands::new(&arg.bands)?;

    println!("Scenario Type Counts ({})", arg.counts.display());
    println!("==========================================\n");
    util::print_histogram(counts.sorted_by_count());
    println!();

    println!("{:<12} {:>6}  Scenario types", "Band", "Types");
    println!("{}", "-".repeat(40));
    for (band, types) in bands.categorize(&counts) {
        let names = types.iter().map(|(t, _)| *t).collect::<Vec<_>>();
        println!("{:<12} {:>6}  {}", band.to_string(), types.len(), names.join(", "));
    }
    Ok(())
}

fn print_top_share(name: &str, counts: &ScenarioTypeCounts, fraction: f64) {
    let top = counts.top_share(fraction);
    println!(
        "{name}: {} of {} types cover {:.0}% of scenarios ({} of {})",
        top.entries.len(),
        counts.len(),
        fraction * 100.0,
        top.total,
        counts.total()
    );
    for (scenario_type, count) in &top.entries {
        println!("  {scenario_type}: {count}");
    }
}

fn print_proportions(name: &str, counts: &ScenarioTypeCounts) {
    println!("{name} proportions:");
    for (scenario_type, count, share) in counts.proportions() {
        println!("  {scenario_type:<50} {count:>8} {:>7.2}%", share * 100.0);
    }
}

pub(crate) fn run_compare(arg: &CompareSplitsArg) -> anyhow::Result<()> {
    let train = ScenarioTypeCounts::load_yaml(&arg.train)?;
    let test = ScenarioTypeCounts::load_yaml(&arg.test)?;

    print_top_share("Train", &train, arg.top_share);
    println!();
    print_top_share("Test", &test, arg.top_share);
    println!();

    let comparison = SplitComparison::new(&train, &test);
    println!("Common scenario types: {}", comparison.common.len());
    println!("Train-only scenario types: {:?}", comparison.train_only);
    println!("Test-only scenario types: {:?}", comparison.test_only);
    println!(
        "Scenarios: train {} ({:.2}%), test {} ({:.2}%)",
        comparison.train_total,
        comparison.train_share() * 100.0,
        comparison.test_total,
        comparison.test_share() * 100.0
    );
    println!();

    print_proportions("Train", &train);
    println!();
    print_proportions("Test", &test);

    if let Some(output) = &arg.output {
        util::save_json(&comparison, Some(output.as_path()))?;
    }
    Ok(())
}
