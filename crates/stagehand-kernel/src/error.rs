//! Kernel errors

use serde::Serialize;
use stagehand_agents::{AgentStatus, LifecycleError};
use stagehand_escalation::EscalationError;
use stagehand_gate::{GateError, Transition};
use stagehand_recovery::RecoveryError;
use stagehand_store::{LeaseError, StoreError};
use std::fmt;
use std::path::PathBuf;

/// Error taxonomy shared by every kernel entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown unit, case, lease or stage
    NotFound,
    /// Lease held, case at max level, illegal transition
    Conflict,
    /// Unmet criteria or a failed validator
    Validation,
    /// The recovery mechanism itself failed
    Rollback,
    /// Persistence failure
    Storage,
    /// Bad configuration
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Validation => "validation",
            Self::Rollback => "rollback",
            Self::Storage => "storage",
            Self::Config => "config",
        })
    }
}

/// Kernel errors
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Configuration that does not parse or is inconsistent
    #[error("invalid configuration{}: {reason}", path.as_ref().map(|p| format!(" in {}", p.display())).unwrap_or_default())]
    Config {
        /// File the configuration came from
        path: Option<PathBuf>,
        /// What is wrong
        reason: String,
    },

    /// IO failure outside the document store
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// Path
        path: PathBuf,
        /// Source error
        #[source]
        source: std::io::Error,
    },

    /// The pause marker is present
    #[error("automation is paused until {} is removed", path.display())]
    Paused {
        /// Pause marker path
        path: PathBuf,
    },

    /// The gate refused to leave the current stage
    #[error("cannot leave {}: {}", transition.stage, transition.reason.as_deref().unwrap_or("transition refused"))]
    TransitionRefused {
        /// The refused transition
        transition: Box<Transition>,
        /// Case opened for the refusal, if any
        escalation: Option<stagehand_core::EscalationId>,
    },

    /// The unit was failed but the recovery chain stopped part way;
    /// `reclassify` finishes it
    #[error("unit {unit} failed but its recovery follow-up did not finish: {source}")]
    FollowUpIncomplete {
        /// Failed unit
        unit: stagehand_core::UnitId,
        /// What stopped the follow-up
        #[source]
        source: Box<KernelError>,
    },

    /// Only a failed unit has a recovery chain to finish
    #[error("unit {unit} is {status}, not failed")]
    NotFailed {
        /// Unit id
        unit: stagehand_core::UnitId,
        /// Its current status
        status: AgentStatus,
    },

    /// Phase gate failure
    #[error(transparent)]
    Gate(#[from] GateError),

    /// Escalation engine failure
    #[error(transparent)]
    Escalation(#[from] EscalationError),

    /// Recovery manager failure
    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    /// Lifecycle manager failure
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Persistence failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Lease failure
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// A result payload that does not serialize
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

impl KernelError {
    /// Classify into the shared taxonomy
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FollowUpIncomplete { source, .. } => source.kind(),
            Self::NotFailed { .. } => ErrorKind::Conflict,
            Self::Config { .. } | Self::Gate(GateError::BrokenLink { .. }) => ErrorKind::Config,
            Self::Io { .. } | Self::Store(_) | Self::Encode(_) => ErrorKind::Storage,
            Self::Paused { .. } => ErrorKind::Conflict,
            Self::TransitionRefused { .. } => ErrorKind::Validation,
            Self::Gate(e) if e.is_not_found() => ErrorKind::NotFound,
            Self::Gate(GateError::Lease(e)) | Self::Lease(e) => lease_kind(e),
            Self::Gate(_) => ErrorKind::Storage,
            Self::Escalation(e) if e.is_not_found() => ErrorKind::NotFound,
            Self::Escalation(e) if e.is_conflict() => ErrorKind::Conflict,
            Self::Escalation(_) => ErrorKind::Storage,
            Self::Recovery(RecoveryError::Rollback { .. }) => ErrorKind::Rollback,
            Self::Recovery(RecoveryError::Lease(e)) => lease_kind(e),
            Self::Recovery(_) => ErrorKind::Storage,
            Self::Lifecycle(e) if e.is_not_found() => ErrorKind::NotFound,
            Self::Lifecycle(e) if e.is_conflict() => ErrorKind::Conflict,
            Self::Lifecycle(_) => ErrorKind::Storage,
        }
    }

    /// Check if trying again later may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::FollowUpIncomplete { source, .. } => source.is_retryable(),
            Self::Lease(e) | Self::Gate(GateError::Lease(e)) | Self::Recovery(RecoveryError::Lease(e)) => {
                e.is_retryable()
            }
            Self::Escalation(EscalationError::Lease(e)) | Self::Lifecycle(LifecycleError::Lease(e)) => {
                e.is_retryable()
            }
            _ => false,
        }
    }

    /// Check if a human should take over
    #[inline]
    #[must_use]
    pub fn requires_human(&self) -> bool {
        match self {
            Self::Paused { .. } => true,
            Self::Recovery(e) => e.requires_human(),
            Self::FollowUpIncomplete { source, .. } => source.requires_human(),
            _ => false,
        }
    }
}

fn lease_kind(e: &LeaseError) -> ErrorKind {
    match e {
        LeaseError::NotHeld { .. } => ErrorKind::NotFound,
        LeaseError::Store(_) => ErrorKind::Storage,
        _ => ErrorKind::Conflict,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::{EscalationId, StageId, UnitId};

    #[test]
    fn component_errors_map_onto_the_taxonomy() {
        let missing: KernelError = LifecycleError::UnknownUnit(UnitId::new("coder-1")).into();
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let at_max: KernelError = EscalationError::AtMaxLevel {
            id: EscalationId::new("ESC-1"),
            level: 2,
        }
        .into();
        assert_eq!(at_max.kind(), ErrorKind::Conflict);

        let rollback: KernelError = RecoveryError::Rollback {
            reference: None,
            reason: "no checkpoint".into(),
        }
        .into();
        assert_eq!(rollback.kind(), ErrorKind::Rollback);
        assert!(rollback.requires_human());

        let stage: KernelError = GateError::UnknownStage(StageId::from("nope")).into();
        assert_eq!(stage.kind(), ErrorKind::NotFound);
        assert!(!stage.is_retryable());
    }

    #[test]
    fn incomplete_follow_up_inherits_its_cause() {
        let held: KernelError = RecoveryError::Lease(LeaseError::Conflict {
            key: "recovery".into(),
            holder: "other-process".into(),
            expires_at: chrono::Utc::now(),
        })
        .into();
        let err = KernelError::FollowUpIncomplete {
            unit: UnitId::new("coder-1"),
            source: Box::new(held),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("other-process"));
    }

    #[test]
    fn config_errors_name_their_file() {
        let err = KernelError::Config {
            path: Some(PathBuf::from("/p/config.yaml")),
            reason: "bad".into(),
        };
        assert_eq!(err.to_string(), "invalid configuration in /p/config.yaml: bad");
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
