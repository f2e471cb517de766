//! Project-state document
//!
//! The single shared document the phase gate, the escalation engine and
//! state sync all read and write. Fields this crate does not know about are
//! kept in [`ProjectState::extra`] so a read-modify-write never drops data
//! written by someone else.

use crate::escalation::Escalation;
use crate::ids::{EscalationId, StageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Workflow status of the current stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// No work recorded yet
    #[default]
    NotStarted,
    /// Work under way
    InProgress,
    /// Held by an escalation or a blocker
    Blocked,
    /// Go decision recorded
    ApprovedToProceed,
    /// Terminal stage finished
    Completed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::ApprovedToProceed => "approved_to_proceed",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Entry or exit side of a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriteriaKind {
    /// Must hold before a stage is entered
    Entry,
    /// Must hold before a stage is left
    Exit,
}

impl fmt::Display for CriteriaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
        })
    }
}

impl FromStr for CriteriaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" | "entry_criteria" => Ok(Self::Entry),
            "exit" | "exit_criteria" => Ok(Self::Exit),
            other => Err(format!("unknown criteria kind: {other}")),
        }
    }
}

/// Go/no-go decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    /// Proceed
    #[serde(rename = "go")]
    Go,
    /// Do not proceed
    #[serde(rename = "no-go")]
    NoGo,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Go => "go",
            Self::NoGo => "no-go",
        })
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "go" => Ok(Self::Go),
            "no-go" | "nogo" | "no_go" => Ok(Self::NoGo),
            other => Err(format!("unknown decision: {other}")),
        }
    }
}

/// Record that one criterion was satisfied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    /// Always true once recorded
    pub validated: bool,
    /// When it was recorded
    pub validated_at: DateTime<Utc>,
    /// Artifact offered as evidence, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

/// Per-stage validation records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageValidation {
    /// Entry criteria by criterion id
    #[serde(default)]
    pub entry: BTreeMap<String, ValidationRecord>,
    /// Exit criteria by criterion id
    #[serde(default)]
    pub exit: BTreeMap<String, ValidationRecord>,
}

impl StageValidation {
    /// Records for one side of the gate
    #[inline]
    #[must_use]
    pub fn side(&self, kind: CriteriaKind) -> &BTreeMap<String, ValidationRecord> {
        match kind {
            CriteriaKind::Entry => &self.entry,
            CriteriaKind::Exit => &self.exit,
        }
    }

    /// Mutable records for one side of the gate
    #[inline]
    pub fn side_mut(&mut self, kind: CriteriaKind) -> &mut BTreeMap<String, ValidationRecord> {
        match kind {
            CriteriaKind::Entry => &mut self.entry,
            CriteriaKind::Exit => &mut self.exit,
        }
    }
}

/// Registry entry written when an artifact is registered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Artifact kind (selects the validator)
    pub kind: String,
    /// Registration time
    pub registered_at: DateTime<Utc>,
    /// Who registered it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_by: Option<String>,
    /// Warnings the validator raised
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<crate::Issue>,
}

/// Unit backlog progress for iterative stages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backlog {
    /// Units planned
    pub total: u64,
    /// Units done
    pub completed: u64,
}

impl Backlog {
    /// `completed / total`, zero when nothing is planned
    #[inline]
    #[must_use]
    pub fn completion_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let ratio = self.completed as f64 / self.total as f64;
            ratio
        }
    }
}

/// A recorded go/no-go decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// The decision
    pub decision: Decision,
    /// Who made it
    pub approver: String,
    /// When
    pub at: DateTime<Utc>,
    /// Free-form comments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

/// Most recent go/no-go decision across all stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastDecision {
    /// Stage decided on
    pub stage: StageId,
    /// The decision
    pub decision: Decision,
    /// Who made it
    pub approver: String,
    /// When
    pub at: DateTime<Utc>,
}

/// The persisted project-state document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    /// Stage the workflow is in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<StageId>,

    /// Status of the current stage
    #[serde(default)]
    pub stage_status: StageStatus,

    /// Why the stage is blocked (escalation id or blocker source)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,

    /// Stages already left
    #[serde(default)]
    pub completed_stages: Vec<StageId>,

    /// Explicit criterion validations
    #[serde(default)]
    pub stage_validation: BTreeMap<StageId, StageValidation>,

    /// Artifact registry; any non-null, non-false value counts as present
    #[serde(default)]
    pub artifacts: BTreeMap<String, Value>,

    /// Backlog progress for iterative stages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlog: Option<Backlog>,

    /// Escalation cases
    #[serde(default)]
    pub escalations: Vec<Escalation>,

    /// Handoff records written by collaborators
    #[serde(default)]
    pub handoffs: Vec<Value>,

    /// Go/no-go decision log by stage
    #[serde(default)]
    pub go_no_go: BTreeMap<StageId, Vec<DecisionRecord>>,

    /// Latest go/no-go decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_go_no_go: Option<LastDecision>,

    /// Decisions mirrored from the memory document
    #[serde(default)]
    pub decisions: BTreeMap<String, Value>,

    /// Blockers mirrored from the memory document
    #[serde(default)]
    pub blockers: BTreeMap<String, Value>,

    /// Progress entries mirrored from the memory document
    #[serde(default)]
    pub memory_progress: BTreeMap<String, Value>,

    /// Last memory → project sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_memory_sync: Option<DateTime<Utc>>,

    /// Fields owned by other tools
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProjectState {
    /// Start a fresh document at `stage`
    #[inline]
    #[must_use]
    pub fn at_stage(stage: impl Into<StageId>) -> Self {
        Self {
            current_stage: Some(stage.into()),
            stage_status: StageStatus::InProgress,
            ..Self::default()
        }
    }

    /// Whether an artifact is present in the registry
    #[must_use]
    pub fn has_artifact(&self, id: &str) -> bool {
        match self.artifacts.get(id) {
            None | Some(Value::Null | Value::Bool(false)) => false,
            Some(_) => true,
        }
    }

    /// Whether a criterion was explicitly validated
    #[must_use]
    pub fn is_validated(&self, stage: &StageId, kind: CriteriaKind, criterion: &str) -> bool {
        self.stage_validation
            .get(stage)
            .and_then(|v| v.side(kind).get(criterion))
            .is_some_and(|r| r.validated)
    }

    /// Whether `stage` is the current stage
    #[inline]
    #[must_use]
    pub fn is_current(&self, stage: &StageId) -> bool {
        self.current_stage.as_ref() == Some(stage)
    }

    /// Escalation by id
    #[must_use]
    pub fn escalation(&self, id: &EscalationId) -> Option<&Escalation> {
        self.escalations.iter().find(|e| &e.id == id)
    }

    /// Mutable escalation by id
    pub fn escalation_mut(&mut self, id: &EscalationId) -> Option<&mut Escalation> {
        self.escalations.iter_mut().find(|e| &e.id == id)
    }

    /// Block the current stage
    pub fn block(&mut self, reason: impl Into<String>) {
        self.stage_status = StageStatus::Blocked;
        self.blocked_reason = Some(reason.into());
    }

    /// Lift a block and resume work
    pub fn unblock(&mut self) {
        self.stage_status = StageStatus::InProgress;
        self.blocked_reason = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn unknown_fields_survive_round_trip() {
        let raw = json!({
            "current_stage": "phase_01_vision_strategy",
            "stage_status": "in_progress",
            "owner_notes": {"written_by": "another-tool"}
        });
        let state: ProjectState = serde_json::from_value(raw).unwrap();
        assert_eq!(state.extra["owner_notes"]["written_by"], "another-tool");

        let back = serde_json::to_value(&state).unwrap();
        assert_eq!(back["owner_notes"]["written_by"], "another-tool");
    }

    #[test]
    fn artifact_presence_uses_truthiness() {
        let mut state = ProjectState::default();
        state.artifacts.insert("A".into(), json!(true));
        state.artifacts.insert("B".into(), json!(false));
        state.artifacts.insert("C".into(), Value::Null);
        state.artifacts.insert("D".into(), json!({"kind": "doc"}));

        assert!(state.has_artifact("A"));
        assert!(!state.has_artifact("B"));
        assert!(!state.has_artifact("C"));
        assert!(state.has_artifact("D"));
        assert!(!state.has_artifact("E"));
    }

    #[test]
    fn backlog_ratio_handles_empty_backlog() {
        assert_eq!(Backlog::default().completion_ratio(), 0.0);
        let backlog = Backlog {
            total: 20,
            completed: 19,
        };
        assert!((backlog.completion_ratio() - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn decision_parses_cli_spellings() {
        assert_eq!("go".parse::<Decision>().unwrap(), Decision::Go);
        assert_eq!("NO-GO".parse::<Decision>().unwrap(), Decision::NoGo);
        assert!("maybe".parse::<Decision>().is_err());
        assert_eq!(serde_json::to_string(&Decision::NoGo).unwrap(), "\"no-go\"");
    }
}
