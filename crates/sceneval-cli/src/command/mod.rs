use clap::{Parser, Subcommand};

use self::{
    cache::{CacheCountsArg, MetadataCountsArg, ResampleArg},
    counts::{CompareSplitsArg, PlotCountsArg},
    db::{DbCountsArg, DbTokensArg, RelocateDbsArg},
    feature_ood::FeatureOodArg,
    report::{MergeReportsArg, OodScoresArg},
};

mod cache;
mod counts;
mod db;
mod feature_ood;
mod report;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct CommandArgs {
    /// What to analyze
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Clone, Subcommand)]
enum Mode {
    /// Count scenario types over the log databases of a split
    DbCounts(#[clap(flatten)] DbCountsArg),
    /// Dump scenario tokens per database as JSON
    DbTokens(#[clap(flatten)] DbTokensArg),
    /// Move databases with under-represented scenario types to another directory
    RelocateDbs(#[clap(flatten)] RelocateDbsArg),
    /// Count scenario types in a planner feature cache
    CacheCounts(#[clap(flatten)] CacheCountsArg),
    /// Count scenario types listed in a cache metadata CSV
    MetadataCounts(#[clap(flatten)] MetadataCountsArg),
    /// Write a scenario filter that resamples under-represented types
    Resample(#[clap(flatten)] ResampleArg),
    /// Plot a scenario count file as a bar chart grouped by count bands
    PlotCounts(#[clap(flatten)] PlotCountsArg),
    /// Compare the scenario type distributions of a train and a test split
    CompareSplits(#[clap(flatten)] CompareSplitsArg),
    /// Merge a runner report with its metric reports into a CSV
    MergeReports(#[clap(flatten)] MergeReportsArg),
    /// Score stored model outputs and relate them to InD/OOD labels and risk
    OodScores(#[clap(flatten)] OodScoresArg),
    /// Score encoder embeddings against a reference set
    FeatureOod(#[clap(flatten)] FeatureOodArg),
}

pub fn run() -> anyhow::Result<()> {
    let args = CommandArgs::parse();
    match args.mode {
        Mode::DbCounts(arg) => db::run_counts(&arg)?,
        Mode::DbTokens(arg) => db::run_tokens(&arg)?,
        Mode::RelocateDbs(arg) => db::run_relocate(&arg)?,
        Mode::CacheCounts(arg) => cache::run_counts(&arg)?,
        Mode::MetadataCounts(arg) => cache::run_metadata(&arg)?,
        Mode::Resample(arg) => cache::run_resample(&arg)?,
        Mode::PlotCounts(arg) => counts::run_plot(&arg)?,
        Mode::CompareSplits(arg) => counts::run_compare(&arg)?,
        Mode::MergeReports(arg) => report::run_merge(&arg)?,
        Mode::OodScores(arg) => report::run_ood_scores(&arg)?,
        Mode::FeatureOod(arg) => feature_ood::run(&arg)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn test_command_args() {
        CommandArgs::command().debug_assert();
    }

    #[test]
    fn test_parse_resample() {
        let args = CommandArgs::try_parse_from([
            "sceneval",
            "resample",
            "--filter",
            "InD.yaml",
            "--cache-dir",
            "/cache",
            "--planner",
            "gameformer",
            "--template",
            "template.yaml",
            "--output",
            "out.yaml",
        ])
        .unwrap();
        let Mode::Resample(arg) = args.mode else {
            panic!("unexpected mode");
        };
        assert_eq!(arg.threshold, 1000);
    }
}
