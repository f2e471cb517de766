//! Gate errors

use stagehand_core::{CriteriaKind, StageId};
use stagehand_store::{LeaseError, StoreError};

/// Phase gate errors
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Stage is not in the gate table
    #[error("unknown stage: {0}")]
    UnknownStage(StageId),

    /// Criterion is not defined on that side of the stage
    #[error("unknown {kind} criterion {criterion} for stage {stage}")]
    UnknownCriterion {
        /// Stage
        stage: StageId,
        /// Entry or exit
        kind: CriteriaKind,
        /// Criterion id
        criterion: String,
    },

    /// A stage names a next stage that is not in the table
    #[error("stage {stage} points at unknown next stage {next}")]
    BrokenLink {
        /// Stage with the bad link
        stage: StageId,
        /// Missing target
        next: StageId,
    },

    /// The project state has no current stage
    #[error("project state has no current stage")]
    NoCurrentStage,

    /// Persistence failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Lease failure
    #[error(transparent)]
    Lease(#[from] LeaseError),
}

impl GateError {
    /// Check if the error names something that does not exist
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UnknownStage(_) | Self::UnknownCriterion { .. } | Self::NoCurrentStage
        ) || matches!(self, Self::Store(e) if e.is_missing())
    }
}
