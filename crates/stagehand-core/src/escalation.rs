//! Escalation case model
//!
//! Cases live inside the project-state document; the engine that drives
//! them is `stagehand-escalation`.

use crate::ids::{EscalationId, StageId};
use crate::project::Decision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Why a case was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// Gate criteria unmet at a transition attempt
    PhaseGateFailed,
    /// Explicit no-go decision
    GoNoGoNoGo,
    /// Approver did not act in time
    ApprovalTimeout,
    /// A blocker nobody could clear
    BlockerUnresolved,
    /// Required people or systems missing
    ResourceUnavailable,
    /// Security policy breach
    SecurityViolation,
    /// Compliance check failed
    ComplianceFailure,
}

impl EscalationReason {
    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PhaseGateFailed => "phase_gate_failed",
            Self::GoNoGoNoGo => "go_no_go_no_go",
            Self::ApprovalTimeout => "approval_timeout",
            Self::BlockerUnresolved => "blocker_unresolved",
            Self::ResourceUnavailable => "resource_unavailable",
            Self::SecurityViolation => "security_violation",
            Self::ComplianceFailure => "compliance_failure",
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscalationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "phase_gate_failed" => Self::PhaseGateFailed,
            "go_no_go_no_go" => Self::GoNoGoNoGo,
            "approval_timeout" => Self::ApprovalTimeout,
            "blocker_unresolved" => Self::BlockerUnresolved,
            "resource_unavailable" => Self::ResourceUnavailable,
            "security_violation" => Self::SecurityViolation,
            "compliance_failure" => Self::ComplianceFailure,
            other => return Err(format!("unknown escalation reason: {other}")),
        })
    }
}

/// Case status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    /// Newly opened
    Open,
    /// Seen by the current level
    Acknowledged,
    /// Moved up at least one level
    Escalated,
    /// Closed with a resolution
    Resolved,
    /// Closed without action
    Rejected,
}

impl EscalationStatus {
    /// Resolved or rejected
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Rejected)
    }

    /// Open or acknowledged; the states auto-escalation and go decisions act on
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Open | Self::Acknowledged)
    }
}

impl fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Acknowledged => "acknowledged",
            Self::Escalated => "escalated",
            Self::Resolved => "resolved",
            Self::Rejected => "rejected",
        })
    }
}

impl FromStr for EscalationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "open" => Self::Open,
            "acknowledged" => Self::Acknowledged,
            "escalated" => Self::Escalated,
            "resolved" => Self::Resolved,
            "rejected" => Self::Rejected,
            other => return Err(format!("unknown escalation status: {other}")),
        })
    }
}

/// What a timeline entry records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TimelineAction {
    /// Current level saw the case
    Acknowledged,
    /// Moved one level up the path
    Escalated {
        /// Role the case left
        from: String,
        /// Role the case reached
        to: String,
    },
    /// Closed with a resolution
    Resolved {
        /// Resolution text
        resolution: String,
        /// Decision the resolution produced
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_decision: Option<Decision>,
    },
    /// Closed without action
    Rejected {
        /// Why
        reason: String,
    },
}

/// One immutable timeline entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// The action
    #[serde(flatten)]
    pub action: TimelineAction,
    /// Who acted
    pub by: String,
    /// When
    pub at: DateTime<Utc>,
    /// Free-form comments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

/// An escalation case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    /// Case id
    pub id: EscalationId,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Status
    pub status: EscalationStatus,
    /// Why it was opened
    pub reason: EscalationReason,
    /// Stage it concerns
    pub stage: StageId,
    /// Decision that triggered it, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_decision: Option<Decision>,
    /// Who opened it
    pub requester: String,
    /// What happened
    pub description: String,
    /// Impact statement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
    /// Suggested way out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_resolution: Option<String>,
    /// Stage's primary approver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_approver: Option<String>,
    /// Ordered approval roles
    #[serde(default)]
    pub escalation_path: Vec<String>,
    /// Index into `escalation_path`
    #[serde(default)]
    pub current_level: usize,
    /// Inactivity window before auto-escalation, in hours
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_hours: Option<u64>,
    /// Whether inactivity triggers escalation
    #[serde(default)]
    pub auto_escalate: bool,
    /// Append-only action log
    #[serde(default)]
    pub timeline: Vec<TimelineEntry>,
    /// Resolution time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Resolver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    /// Resolution text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    /// Decision the resolution produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_decision: Option<Decision>,
    /// Rejection time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
    /// Rejecter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_by: Option<String>,
    /// Why it was rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl Escalation {
    /// Highest valid level index, `None` for an empty path
    #[inline]
    #[must_use]
    pub fn max_level(&self) -> Option<usize> {
        self.escalation_path.len().checked_sub(1)
    }

    /// Whether the case cannot go any higher
    #[inline]
    #[must_use]
    pub fn at_max_level(&self) -> bool {
        self.max_level().map_or(true, |max| self.current_level >= max)
    }

    /// Role currently holding the case
    #[inline]
    #[must_use]
    pub fn current_role(&self) -> Option<&str> {
        self.escalation_path
            .get(self.current_level)
            .map(String::as_str)
    }

    /// Time of the last recorded activity (creation when the timeline is empty)
    #[inline]
    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.timeline.last().map_or(self.created_at, |e| e.at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timeline_entries_flatten_the_action_tag() {
        let entry = TimelineEntry {
            action: TimelineAction::Escalated {
                from: "QA Lead".into(),
                to: "Tech Lead".into(),
            },
            by: "pm".into(),
            at: Utc::now(),
            comments: None,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["action"], json!("escalated"));
        assert_eq!(value["to"], json!("Tech Lead"));

        let back: TimelineEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn empty_path_is_always_at_max_level() {
        let case = Escalation {
            id: EscalationId::new("ESC-1"),
            created_at: Utc::now(),
            status: EscalationStatus::Open,
            reason: EscalationReason::BlockerUnresolved,
            stage: StageId::new("s"),
            original_decision: None,
            requester: "r".into(),
            description: "d".into(),
            impact: None,
            proposed_resolution: None,
            primary_approver: None,
            escalation_path: Vec::new(),
            current_level: 0,
            timeout_hours: None,
            auto_escalate: false,
            timeline: Vec::new(),
            resolved_at: None,
            resolved_by: None,
            resolution: None,
            new_decision: None,
            rejected_at: None,
            rejected_by: None,
            rejection_reason: None,
        };
        assert_eq!(case.max_level(), None);
        assert!(case.at_max_level());
        assert_eq!(case.current_role(), None);
    }
}
