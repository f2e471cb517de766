//! Lifecycle errors

use crate::status::AgentStatus;
use stagehand_core::UnitId;
use stagehand_store::{LeaseError, StoreError};
use std::path::PathBuf;

/// Agent lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// No unit type with that name
    #[error("unknown unit type: {unit_type} (available: {})", available.join(", "))]
    UnknownType {
        /// Requested type
        unit_type: String,
        /// Registered types
        available: Vec<String>,
    },

    /// No record with that id in the expected collection
    #[error("unit not found: {0}")]
    UnknownUnit(UnitId),

    /// The state machine does not allow the move
    #[error("illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        /// Unit id
        id: UnitId,
        /// Current status
        from: AgentStatus,
        /// Requested status
        to: AgentStatus,
    },

    /// The unit has used all of its retries
    #[error("retry budget exhausted for {id} ({retry_count}/{max_retries})")]
    RetryBudgetExhausted {
        /// Unit id
        id: UnitId,
        /// Retries used
        retry_count: u32,
        /// Retries allowed
        max_retries: u32,
    },

    /// The unit type's execution artifact does not exist
    #[error("execution artifact not found for {unit_type}: {}", path.display())]
    ArtifactMissing {
        /// Unit type
        unit_type: String,
        /// Resolved path
        path: PathBuf,
    },

    /// Persistence failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Lease failure
    #[error(transparent)]
    Lease(#[from] LeaseError),
}

impl LifecycleError {
    /// Check if the error names something that does not exist
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UnknownType { .. } | Self::UnknownUnit(_) | Self::ArtifactMissing { .. }
        )
    }

    /// Check if the error is a state conflict
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::IllegalTransition { .. }
                | Self::RetryBudgetExhausted { .. }
                | Self::Lease(LeaseError::Conflict { .. })
        )
    }
}
