//! Gate table
//!
//! Static configuration, not instance state: loaded once at startup and
//! shared behind an `Arc`.

use crate::error::GateError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use stagehand_core::{CriteriaKind, StageId};

/// One entry or exit criterion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    /// Criterion id, unique within its stage side
    pub id: String,
    /// What must hold
    pub description: String,
    /// Whether the criterion blocks when unmet
    #[serde(default = "default_required")]
    pub required: bool,
    /// Artifact whose registration satisfies the criterion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Resolvable only by a runtime check
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dynamic: bool,
}

fn default_required() -> bool {
    true
}

impl Criterion {
    /// Required criterion with no artifact
    #[must_use]
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            required: true,
            artifact: None,
            dynamic: false,
        }
    }

    /// Satisfied by registering `artifact`
    #[must_use]
    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    /// Mark as resolvable only at runtime
    #[must_use]
    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    /// Mark as informational
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Completion condition of an iterative stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionCondition {
    /// Minimum `completed / total` ratio of the backlog
    pub threshold: f64,
    /// Iterations expected before the stage may close
    #[serde(default)]
    pub min_iterations: u32,
    /// Iterations after which the stage should be reviewed
    #[serde(default)]
    pub max_iterations: u32,
    /// Iterations of stable velocity expected before exit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_velocity_iterations: Option<u32>,
}

/// How a long-running final stage is closed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosurePolicy {
    /// Events that start closure
    #[serde(default)]
    pub triggers: Vec<String>,
    /// What must be done before closure
    #[serde(default)]
    pub criteria: Vec<String>,
}

/// One stage of the table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageGate {
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Criteria checked before entering
    #[serde(default)]
    pub entry: Vec<Criterion>,
    /// Criteria checked before leaving
    #[serde(default)]
    pub exit: Vec<Criterion>,
    /// Role that approves leaving the stage
    pub approver: String,
    /// Following stage; `None` marks the terminal stage
    #[serde(default)]
    pub next: Option<StageId>,
    /// Extra exit check for iterative stages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionCondition>,
    /// Closure policy of the last working stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closure: Option<ClosurePolicy>,
}

impl StageGate {
    /// Criteria of one side
    #[inline]
    #[must_use]
    pub fn criteria(&self, kind: CriteriaKind) -> &[Criterion] {
        match kind {
            CriteriaKind::Entry => &self.entry,
            CriteriaKind::Exit => &self.exit,
        }
    }

    /// Criterion by id on one side
    #[must_use]
    pub fn criterion(&self, kind: CriteriaKind, id: &str) -> Option<&Criterion> {
        self.criteria(kind).iter().find(|c| c.id == id)
    }

    /// Whether no stage follows
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.next.is_none()
    }
}

/// Ordered stage table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GateTable {
    stages: IndexMap<StageId, StageGate>,
}

impl GateTable {
    /// Table from `(id, gate)` pairs in order
    #[must_use]
    pub fn new(stages: impl IntoIterator<Item = (StageId, StageGate)>) -> Self {
        Self {
            stages: stages.into_iter().collect(),
        }
    }

    /// Gate of `stage`
    ///
    /// # Errors
    /// `GateError::UnknownStage` if the stage is not in the table.
    pub fn stage(&self, stage: &StageId) -> Result<&StageGate, GateError> {
        self.stages
            .get(stage)
            .ok_or_else(|| GateError::UnknownStage(stage.clone()))
    }

    /// Whether `stage` is in the table
    #[inline]
    #[must_use]
    pub fn contains(&self, stage: &StageId) -> bool {
        self.stages.contains_key(stage)
    }

    /// All stages in declaration order
    pub fn stages(&self) -> impl Iterator<Item = (&StageId, &StageGate)> {
        self.stages.iter()
    }

    /// First declared stage
    #[must_use]
    pub fn first_stage(&self) -> Option<&StageId> {
        self.stages.keys().next()
    }

    /// Number of stages
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the table is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Check that every `next` link names a stage in the table
    ///
    /// # Errors
    /// `GateError::BrokenLink` for the first dangling link.
    pub fn check_links(&self) -> Result<(), GateError> {
        for (id, gate) in &self.stages {
            if let Some(next) = &gate.next {
                if !self.stages.contains_key(next) {
                    return Err(GateError::BrokenLink {
                        stage: id.clone(),
                        next: next.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_keeps_declaration_order() {
        let table = fixtures::table();
        let ids: Vec<_> = table.stages().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["s1", "s2", "s3"]);
        assert_eq!(table.first_stage().map(StageId::as_str), Some("s1"));
        assert!(table.stage(&"s3".into()).unwrap().is_terminal());
    }

    #[test]
    fn dangling_next_is_reported() {
        let mut table = fixtures::table();
        table.stages[2].next = Some("nowhere".into());
        assert!(matches!(
            table.check_links(),
            Err(GateError::BrokenLink { ref next, .. }) if next.as_str() == "nowhere"
        ));
        assert!(fixtures::table().check_links().is_ok());
    }

    #[test]
    fn criteria_deserialize_with_defaults() {
        let yaml = r#"{"id": "c1", "description": "Signed", "artifact": "A-1"}"#;
        let c: Criterion = serde_json::from_str(yaml).unwrap();
        assert!(c.required);
        assert!(!c.dynamic);
        assert_eq!(c.artifact.as_deref(), Some("A-1"));
    }

    #[test]
    fn unknown_stage_is_an_error() {
        assert!(matches!(
            fixtures::table().stage(&"s9".into()),
            Err(GateError::UnknownStage(_))
        ));
    }
}
