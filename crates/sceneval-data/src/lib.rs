//! Data access and table logic for nuPlan scenario analysis
//!
//! This crate reads the artifacts a nuPlan planner-evaluation workflow leaves on
//! disk and turns them into counts, tables and scores.
//!
//! # Overview
//!
//! ## Scenario Count Workflow
//!
//! Find out which scenario types a dataset split or a feature cache contains:
//!
//! 1. **Read Log Databases** ([`db`]): scenario tags of per-log SQLite files
//! 2. **Or Walk a Cache Tree** ([`cache::CacheCounter`]): types recovered from the
//!    directory layout of a planner cache
//! 3. **Aggregate** ([`counts::ScenarioTypeCounts`]): merge, sort, band and compare
//!    counts, and compute resample targets
//! 4. **Rewrite the Filter** ([`filter_config::rewrite_scenario_types`]): write a
//!    scenario filter YAML that requests the under-represented types
//!
//! ## Report Analysis Workflow
//!
//! Relate simulation metrics to how familiar a scenario was to the planner:
//!
//! 1. **Merge Reports** ([`report::ReportProcessor`]): runner report left-joined
//!    with one column per metric file ([`table::Table`])
//! 2. **Label** ([`labeling`]): InD/OOD labels from the training scenario types,
//!    metric averages and risk labels
//! 3. **Post Scores** ([`post_score::PostScorer`]): OOD scores of stored model
//!    outputs with per-row aggregates
//!
//! ## Feature OOD Workflow
//!
//! Score scenarios by how far their encoder embeddings are from a reference set:
//!
//! 1. **Load Archives** ([`encoder::load_scenario_features`]): `.npz` encoder outputs
//! 2. **Fit** ([`ood::FeatureOodAnalyzer`]): scaler, Gaussian model and optional mixture
//! 3. **Score** ([`ood::FeatureOodAnalyzer::score_scenarios`]): Mahalanobis distance and
//!    mixture log-likelihood of every ego embedding
//!
//! # Examples
//!
//! ```no_run
//! use sceneval_data::{db, filter_config};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//!
//! let counts = db::aggregate_scenario_counts("/data/nuplan-v1.1/train".as_ref())?;
//! let targets = counts.resample_targets(1000);
//! let types = targets.keys().collect::<Vec<_>>();
//! filter_config::write_scenario_filter(
//!     "template.yaml".as_ref(),
//!     "resample.yaml".as_ref(),
//!     &types,
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod counts;
pub mod db;
pub mod encoder;
pub mod filter_config;
pub mod labeling;
pub mod ood;
pub mod post_score;
pub mod report;
pub mod table;
