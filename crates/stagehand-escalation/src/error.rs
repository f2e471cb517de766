//! Escalation errors

use stagehand_core::{EscalationId, EscalationStatus};
use stagehand_store::{LeaseError, StoreError};

/// Escalation engine errors
#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    /// No case with that id
    #[error("escalation not found: {0}")]
    NotFound(EscalationId),

    /// The case is already at the last level of its path
    #[error("escalation {id} is already at maximum level {level}")]
    AtMaxLevel {
        /// Case id
        id: EscalationId,
        /// Current level
        level: usize,
    },

    /// The case is resolved or rejected
    #[error("escalation {id} is closed ({status})")]
    Closed {
        /// Case id
        id: EscalationId,
        /// Terminal status
        status: EscalationStatus,
    },

    /// Persistence failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Lease failure
    #[error(transparent)]
    Lease(#[from] LeaseError),
}

impl EscalationError {
    /// Check if the error names something that does not exist
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_)) || matches!(self, Self::Store(e) if e.is_missing())
    }

    /// Check if the error is a state conflict
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AtMaxLevel { .. } | Self::Closed { .. } | Self::Lease(LeaseError::Conflict { .. })
        )
    }
}
