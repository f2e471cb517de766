//! Recovery errors

use stagehand_store::{LeaseError, StoreError};

/// Recovery manager errors
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// The rollback mechanism itself failed; automation should pause
    #[error("rollback failed: {reason}")]
    Rollback {
        /// Checkpoint that was targeted, if any
        reference: Option<String>,
        /// What went wrong
        reason: String,
    },

    /// Persistence failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Lease failure
    #[error(transparent)]
    Lease(#[from] LeaseError),
}

impl RecoveryError {
    /// Check if a human should take over
    #[inline]
    #[must_use]
    pub fn requires_human(&self) -> bool {
        matches!(self, Self::Rollback { .. })
    }
}
