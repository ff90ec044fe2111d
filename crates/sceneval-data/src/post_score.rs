//! Post-hoc OOD scores over stored model outputs
//!
//! Each row of the source column holds the raw output arrays of one scenario
//! (one array per evaluated step). [`PostScorer::apply`] reduces every array
//! with the selected [`ScoreKind`] and adds:
//!
//! - `score`: the per-array scores of the row
//! - `ood_score_avg`, `ood_score_max`, `ood_score_min`, `ood_score_std`,
//!   `ood_score_var`: aggregates of `score` within the row
//!
//! A row holding a single flat array is scored as a list of one array.

use sceneval_stats::score::{ScoreKind, ScoreSummary};

use crate::table::{Column, Table, TableError};

pub const SCORE_COLUMN: &str = "score";
pub const AVG_COLUMN: &str = "ood_score_avg";
pub const MAX_COLUMN: &str = "ood_score_max";
pub const MIN_COLUMN: &str = "ood_score_min";
pub const STD_COLUMN: &str = "ood_score_std";
pub const VAR_COLUMN: &str = "ood_score_var";

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum PostScoreError {
    #[display("Column '{column}' holds {actual}, expected lists of model outputs")]
    NotOutputs {
        column: String,
        actual: &'static str,
    },
    #[display("Failed to add score columns")]
    Table { source: TableError },
}

impl From<TableError> for PostScoreError {
    fn from(source: TableError) -> Self {
        PostScoreError::Table { source }
    }
}

#[derive(Debug, Clone)]
pub struct PostScorer {
    pub column: String,
    pub kind: ScoreKind,
}

impl PostScorer {
    pub fn new<S>(column: S, kind: ScoreKind) -> Self
    where
        S: Into<String>,
    {
        Self {
            column: column.into(),
            kind,
        }
    }

    #[must_use]
    pub fn score_row<A>(&self, arrays: &[A]) -> Vec<f64>
    where
        A: AsRef<[f64]>,
    {
        arrays
            .iter()
            .map(|array| self.kind.compute(array.as_ref()))
            .collect()
    }

    /// Adds the score and aggregate columns to `table`.
    pub fn apply(&self, table: &mut Table) -> Result<(), PostScoreError> {
        let scores = match table.require(&self.column)? {
            Column::FloatLists(rows) => rows
                .iter()
                .map(|row| row.as_ref().map(|arrays| self.score_row(arrays)))
                .collect::<Vec<_>>(),
            Column::FloatList(rows) => rows
                .iter()
                .map(|row| row.as_ref().map(|array| self.score_row(&[array])))
                .collect(),
            other => {
                return Err(PostScoreError::NotOutputs {
                    column: self.column.clone(),
                    actual: other.type_name(),
                });
            }
        };

        let summaries = scores
            .iter()
            .map(|row| row.as_deref().and_then(ScoreSummary::from_scores))
            .collect::<Vec<_>>();
        let aggregate = |f: fn(&ScoreSummary) -> f64| {
            Column::Float(summaries.iter().map(|s| s.as_ref().map(f)).collect())
        };

        table.set_column(AVG_COLUMN, aggregate(|s| s.avg))?;
        table.set_column(MAX_COLUMN, aggregate(|s| s.max))?;
        table.set_column(MIN_COLUMN, aggregate(|s| s.min))?;
        table.set_column(STD_COLUMN, aggregate(|s| s.std))?;
        table.set_column(VAR_COLUMN, aggregate(|s| s.var))?;
        table.set_column(SCORE_COLUMN, Column::FloatList(scores))?;
        Ok(())
    }
}
