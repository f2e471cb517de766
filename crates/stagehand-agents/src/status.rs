//! Agent state machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of an agent record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Record created, not yet persisted as running
    Spawning,
    /// Running with a live deadline
    Active,
    /// Failed, waiting for the retry to start
    Retrying,
    /// Finished successfully
    Completed,
    /// Failed with no retries left
    Failed,
    /// Deadline passed with no report
    Orphaned,
    /// Orphan closed by an operator
    Terminated,
}

impl AgentStatus {
    /// All statuses
    pub const ALL: [Self; 7] = [
        Self::Spawning,
        Self::Active,
        Self::Retrying,
        Self::Completed,
        Self::Failed,
        Self::Orphaned,
        Self::Terminated,
    ];

    /// Check if the record still has a deadline
    #[inline]
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::Retrying)
    }

    /// Check if no transition leaves this status
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        allowed_transitions(self).is_empty()
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Spawning => "spawning",
            Self::Active => "active",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Orphaned => "orphaned",
            Self::Terminated => "terminated",
        })
    }
}

/// Statuses reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: AgentStatus) -> &'static [AgentStatus] {
    use AgentStatus::{Active, Completed, Failed, Orphaned, Retrying, Spawning, Terminated};
    match from {
        Spawning => &[Active],
        Active => &[Completed, Failed, Retrying, Orphaned],
        Retrying => &[Active, Retrying, Completed, Failed, Orphaned],
        Orphaned => &[Active, Terminated],
        Completed | Failed | Terminated => &[],
    }
}

/// Whether `from -> to` is legal
#[inline]
#[must_use]
pub fn validate_transition(from: AgentStatus, to: AgentStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn happy_path_is_legal() {
        assert!(validate_transition(AgentStatus::Spawning, AgentStatus::Active));
        assert!(validate_transition(AgentStatus::Active, AgentStatus::Retrying));
        assert!(validate_transition(AgentStatus::Retrying, AgentStatus::Active));
        assert!(validate_transition(AgentStatus::Orphaned, AgentStatus::Terminated));
    }

    #[test]
    fn terminal_statuses_go_nowhere() {
        for status in [AgentStatus::Completed, AgentStatus::Failed, AgentStatus::Terminated] {
            assert!(status.is_terminal());
            assert!(!validate_transition(status, AgentStatus::Orphaned));
        }
        assert!(!AgentStatus::Orphaned.is_terminal());
    }

    fn status() -> impl Strategy<Value = AgentStatus> {
        proptest::sample::select(AgentStatus::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn walks_never_leave_a_terminal_status(steps in proptest::collection::vec(status(), 0..32)) {
            let mut current = AgentStatus::Spawning;
            for next in steps {
                if validate_transition(current, next) {
                    prop_assert!(!current.is_terminal());
                    current = next;
                }
            }
            if current.is_terminal() {
                prop_assert!(AgentStatus::ALL.iter().all(|s| !validate_transition(current, *s)));
            }
        }

        #[test]
        fn only_live_records_can_be_orphaned(from in status()) {
            prop_assert_eq!(
                validate_transition(from, AgentStatus::Orphaned),
                from.is_live()
            );
        }
    }
}
