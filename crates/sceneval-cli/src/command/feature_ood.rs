use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use sceneval_data::{
    encoder,
    ood::{self, FeatureOodAnalyzer, ScenarioDistance},
};
use sceneval_stats::{descriptive::DescriptiveStats, mixture::MixtureConfig};
use tracing::info;

use crate::util;

#[derive(Debug, Clone, Args)]
pub(crate) struct FeatureOodArg {
    /// planTF checkout holding the default feature directories
    #[arg(long, env = "PLANTF")]
    pub plantf: Option<PathBuf>,

    /// Reference `.npz` features (defaults to `<plantf>/inference_x`)
    #[arg(long)]
    pub reference_dir: Option<PathBuf>,

    /// Query `.npz` features (defaults to `<plantf>/encoder_features`)
    #[arg(long)]
    pub scenario_dir: Option<PathBuf>,

    /// Also fit a Gaussian mixture with this many components
    #[arg(long)]
    pub gmm_components: Option<usize>,

    /// Seed of the mixture initialization
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Output JSON file (defaults to stdout)
    #[arg(long)]
    pub output: Option<PathBuf>,
}

fn print_summary(scores: &[ScenarioDistance]) {
    let width = scores
        .iter()
        .map(|s| s.scenario.len())
        .max()
        .unwrap_or(0)
        .max("Scenario".len());
    eprintln!(
        "{:<width$} {:>6} {:>10} {:>10}",
        "Scenario", "Rows", "Mean", "Max"
    );
    for score in scores {
        let Some(stats) = DescriptiveStats::new(score.distances.iter().copied()) else {
            eprintln!("{:<width$} {:>6}", score.scenario, 0);
            continue;
        };
        eprintln!(
            "{:<width$} {:>6} {:>10.4} {:>10.4}",
            score.scenario, stats.count, stats.mean, stats.max
        );
    }
}

pub(crate) fn run(arg: &FeatureOodArg) -> anyhow::Result<()> {
    let reference_dir = util::plantf_dir(
        arg.reference_dir.as_deref(),
        arg.plantf.as_deref(),
        "inference_x",
    )?;
    let scenario_dir = util::plantf_dir(
        arg.scenario_dir.as_deref(),
        arg.plantf.as_deref(),
        "encoder_features",
    )?;

    let reference = encoder::load_scenario_features(&reference_dir).with_context(|| {
        format!(
            "Failed to load reference features from {}",
            reference_dir.display()
        )
    })?;
    let scenarios = encoder::load_scenario_features(&scenario_dir).with_context(|| {
        format!(
            "Failed to load scenario features from {}",
            scenario_dir.display()
        )
    })?;

    let mixture = arg.gmm_components.map(|n_components| MixtureConfig {
        n_components,
        seed: arg.seed,
        ..MixtureConfig::default()
    });
    let analyzer = FeatureOodAnalyzer::fit(&ood::reference_matrix(&reference)?, mixture.as_ref())
        .context("Failed to fit the reference distribution")?;
    info!(
        "Fitted {} reference scenarios ({} dimensions)",
        reference.len(),
        analyzer.dim()
    );

    let scores = analyzer.score_scenarios(&scenarios)?;
    print_summary(&scores);
    util::save_json(&scores, arg.output.as_deref())?;
    Ok(())
}
